use crate::storage::{ReadableStorage, ReadableStorageExt, Storage, StorageError};

fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

fn align_up(value: u64, align: u64) -> u64 {
    align_down(value + align - 1, align)
}

/// Adapts arbitrary caller ranges to a storage whose reads must be aligned
/// to `ALIGN` bytes (a cipher block size).
///
/// The aligned core of a request is read straight into the caller's buffer;
/// the unaligned head and tail go through a stack scratch block and are
/// copied out. Writes perform read-modify-write on the unaligned blocks.
#[derive(Debug)]
pub struct AlignmentMatchingStorage<S, const ALIGN: usize> {
    base_storage: S,
}

impl<S: ReadableStorage, const ALIGN: usize> AlignmentMatchingStorage<S, ALIGN> {
    pub fn new(base_storage: S) -> Self {
        assert!(ALIGN.is_power_of_two());
        Self { base_storage }
    }

    fn read_base_block(&self, aligned_offset: u64, work_buf: &mut [u8]) -> Result<(), StorageError> {
        let base_size = self.base_storage.get_size();
        let block_len = std::cmp::min(ALIGN as u64, base_size - aligned_offset) as usize;
        self.base_storage
            .read_exact(aligned_offset, &mut work_buf[..block_len])
    }
}

impl<S: ReadableStorage, const ALIGN: usize> ReadableStorage for AlignmentMatchingStorage<S, ALIGN> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let align = ALIGN as u64;
        let size = self.get_size();
        if offset >= size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        let buf = &mut buf[..len];

        let mut work_buf = [0u8; ALIGN];

        // Determine the aligned core of the request.
        let offset_round_up_difference = (align_up(offset, align) - offset) as usize;
        let core_offset = align_up(offset, align);
        let core_size = if len < offset_round_up_difference {
            0
        } else {
            align_down((len - offset_round_up_difference) as u64, align) as usize
        };
        let covered_offset = if core_size > 0 { core_offset } else { offset };

        // Read the core portion directly into the destination.
        if core_size > 0 {
            self.base_storage.read_exact(
                core_offset,
                &mut buf[offset_round_up_difference..offset_round_up_difference + core_size],
            )?;
        }

        // Handle the head portion.
        if offset < covered_offset {
            let head_offset = align_down(offset, align);
            let head_size = (covered_offset - offset) as usize;
            let skip = (offset - head_offset) as usize;

            self.read_base_block(head_offset, &mut work_buf)?;
            buf[..head_size].copy_from_slice(&work_buf[skip..skip + head_size]);
        }

        // Handle the tail portion.
        let mut tail_offset = covered_offset + core_size as u64;
        let mut remaining_tail_size = (offset + len as u64 - tail_offset) as usize;
        while remaining_tail_size > 0 {
            let aligned_tail_offset = align_down(tail_offset, align);
            let cur_size = std::cmp::min(
                (aligned_tail_offset + align - tail_offset) as usize,
                remaining_tail_size,
            );

            self.read_base_block(aligned_tail_offset, &mut work_buf)?;

            let dst_start = (tail_offset - offset) as usize;
            let src_start = (tail_offset - aligned_tail_offset) as usize;
            buf[dst_start..dst_start + cur_size]
                .copy_from_slice(&work_buf[src_start..src_start + cur_size]);

            remaining_tail_size -= cur_size;
            tail_offset += cur_size as u64;
        }

        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.base_storage.get_size()
    }
}

impl<S: Storage, const ALIGN: usize> Storage for AlignmentMatchingStorage<S, ALIGN> {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let align = ALIGN as u64;
        if offset + buf.len() as u64 > self.get_size() {
            return Err(StorageError::OutOfBounds {});
        }

        let mut work_buf = [0u8; ALIGN];

        let offset_round_up_difference = (align_up(offset, align) - offset) as usize;
        let core_offset = align_up(offset, align);
        let core_size = if buf.len() < offset_round_up_difference {
            0
        } else {
            align_down((buf.len() - offset_round_up_difference) as u64, align) as usize
        };
        let covered_offset = if core_size > 0 { core_offset } else { offset };

        // Write the core portion.
        if core_size > 0 {
            self.base_storage.write(
                core_offset,
                &buf[offset_round_up_difference..offset_round_up_difference + core_size],
            )?;
        }

        // Read-modify-write the head block.
        if offset < covered_offset {
            let head_offset = align_down(offset, align);
            let head_size = (covered_offset - offset) as usize;
            let skip = (offset - head_offset) as usize;

            self.read_base_block(head_offset, &mut work_buf)?;
            work_buf[skip..skip + head_size].copy_from_slice(&buf[..head_size]);
            self.base_storage.write(head_offset, &work_buf)?;
        }

        // Read-modify-write the tail blocks.
        let mut tail_offset = covered_offset + core_size as u64;
        let mut remaining_tail_size = (offset + buf.len() as u64 - tail_offset) as usize;
        while remaining_tail_size > 0 {
            let aligned_tail_offset = align_down(tail_offset, align);
            let cur_size = std::cmp::min(
                (aligned_tail_offset + align - tail_offset) as usize,
                remaining_tail_size,
            );

            self.read_base_block(aligned_tail_offset, &mut work_buf)?;
            let src_start = (tail_offset - offset) as usize;
            let dst_start = (tail_offset - aligned_tail_offset) as usize;
            work_buf[dst_start..dst_start + cur_size]
                .copy_from_slice(&buf[src_start..src_start + cur_size]);
            self.base_storage.write(aligned_tail_offset, &work_buf)?;

            remaining_tail_size -= cur_size;
            tail_offset += cur_size as u64;
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.base_storage.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageError, VecStorage};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Fails any read whose offset or length is not `ALIGN`-aligned
    /// (except a final short block at EOF).
    #[derive(Debug)]
    struct AlignCheckedStorage<const ALIGN: usize> {
        inner: VecStorage,
        violated: AtomicBool,
    }

    impl<const ALIGN: usize> AlignCheckedStorage<ALIGN> {
        fn new(data: Vec<u8>) -> Self {
            Self {
                inner: VecStorage::new(data),
                violated: AtomicBool::new(false),
            }
        }
    }

    impl<const ALIGN: usize> ReadableStorage for AlignCheckedStorage<ALIGN> {
        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
            let aligned_offset = offset % ALIGN as u64 == 0;
            let aligned_end =
                buf.len() % ALIGN == 0 || offset + buf.len() as u64 == self.inner.get_size();
            if !aligned_offset || !aligned_end {
                self.violated.store(true, Ordering::Relaxed);
            }
            self.inner.read(offset, buf)
        }

        fn get_size(&self) -> u64 {
            self.inner.get_size()
        }
    }

    #[test]
    fn arbitrary_ranges_match_the_plain_bytes() {
        let data: Vec<u8> = (0..0x40u32).flat_map(|x| x.to_le_bytes()).collect();
        let storage: AlignmentMatchingStorage<_, 16> =
            AlignmentMatchingStorage::new(AlignCheckedStorage::<16>::new(data.clone()));

        for &(offset, size) in &[
            (0usize, 0x100usize),
            (1, 5),
            (7, 32),
            (15, 17),
            (16, 16),
            (0x20, 0x21),
            (0xff, 1),
            (0xf1, 0xf),
        ] {
            let mut buf = vec![0; size];
            storage.read_exact(offset as u64, &mut buf).unwrap();
            assert_eq!(&buf, &data[offset..offset + size], "range {offset:#x}+{size:#x}");
        }
        assert!(!storage.base_storage.violated.load(Ordering::Relaxed));
    }

    #[test]
    fn eof_crossing_returns_partial() {
        let data = vec![0xAB; 0x30];
        let storage: AlignmentMatchingStorage<_, 16> =
            AlignmentMatchingStorage::new(VecStorage::new(data));

        let mut buf = [0; 0x20];
        assert_eq!(storage.read(0x2f, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn unaligned_writes_read_modify_write() {
        let storage: AlignmentMatchingStorage<_, 16> =
            AlignmentMatchingStorage::new(VecStorage::new(vec![0u8; 0x40]));

        storage.write(3, &[0xEE; 0x1a]).unwrap();

        let mut buf = [0; 0x40];
        storage.read_exact(0, &mut buf).unwrap();
        assert_eq!(&buf[..3], &[0, 0, 0]);
        assert_eq!(&buf[3..0x1d], &[0xEE; 0x1a]);
        assert!(buf[0x1d..].iter().all(|&b| b == 0));
    }
}
