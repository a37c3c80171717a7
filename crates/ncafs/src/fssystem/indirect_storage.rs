use crate::fssystem::bucket_tree::{BucketTree, ContinuousReadingEntry, ContinuousReadingInfo};
use crate::storage::{ReadableStorage, ReadableStorageExt, StorageError, VirtualFile};
use binrw::BinRead;

/// Demuxes a virtual byte stream between two data storages (typically the
/// original content and its patch) through a bucket tree.
#[derive(Debug)]
pub struct IndirectStorage {
    table: BucketTree,
    data_storages: [Option<VirtualFile>; Self::STORAGE_COUNT],
}

/// One bucket-tree entry of an indirect storage: a virtual offset mapped to
/// `(storage_index, physical_offset)`.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct IndirectEntry {
    pub virt_offset: u64,
    pub phys_offset: u64,
    pub storage_index: i32,
}

#[derive(Debug, BinRead)]
#[br(little)]
struct IndirectCrEntry {
    virt_offset: u64,
    phys_offset: u64,
    storage_index: i32,
}

impl ContinuousReadingEntry for IndirectCrEntry {
    const FRAGMENT_SIZE_MAX: u64 = 4 * 1024;

    fn virtual_offset(&self) -> u64 {
        self.virt_offset
    }

    fn physical_offset(&self) -> u64 {
        self.phys_offset
    }

    fn is_fragment(&self) -> bool {
        self.storage_index != 0
    }
}

impl IndirectStorage {
    pub const STORAGE_COUNT: usize = 2;
    pub const NODE_SIZE: usize = 16 * 1024;
    pub const ENTRY_SIZE: usize = 0x14;

    pub fn query_node_storage_size(entry_count: i32) -> u64 {
        BucketTree::query_node_storage_size(Self::NODE_SIZE, Self::ENTRY_SIZE, entry_count)
    }

    pub fn query_entry_storage_size(entry_count: i32) -> u64 {
        BucketTree::query_entry_storage_size(Self::NODE_SIZE, Self::ENTRY_SIZE, entry_count)
    }

    pub fn new(
        node_storage: VirtualFile,
        entry_storage: VirtualFile,
        entry_count: i32,
    ) -> Result<Self, StorageError> {
        let table = BucketTree::new(
            node_storage,
            entry_storage,
            Self::NODE_SIZE,
            Self::ENTRY_SIZE,
            entry_count,
        )?;
        Ok(Self::with_table(table))
    }

    pub(crate) fn with_table(table: BucketTree) -> Self {
        Self {
            table,
            data_storages: [None, None],
        }
    }

    pub fn set_storage(&mut self, index: usize, storage: VirtualFile) {
        assert!(index < Self::STORAGE_COUNT);
        self.data_storages[index] = Some(storage);
    }

    pub(crate) fn table(&self) -> &BucketTree {
        &self.table
    }

    fn storage(&self, index: usize) -> Result<&VirtualFile, StorageError> {
        self.data_storages[index]
            .as_ref()
            .ok_or(StorageError::IndirectStorageCorrupted {})
    }

    /// Walks the entries covering `[offset, offset + size)` and invokes
    /// `f(storage, physical_offset, virtual_offset, size)` for each covered
    /// sub-range. With `continuous_check`, adjacent storage-0 entries whose
    /// physical placement is contiguous are merged into one call.
    pub(crate) fn operate_per_entry<F>(
        &self,
        offset: u64,
        size: u64,
        continuous_check: bool,
        range_check: bool,
        f: &mut F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(&VirtualFile, u64, u64, u64) -> Result<(), StorageError>,
    {
        if size == 0 {
            return Ok(());
        }

        let table_offsets = self.table.get_offsets();
        if !table_offsets.is_include_range(offset, size) {
            return Err(StorageError::OutOfRange {});
        }

        let mut visitor = self.table.find(offset)?;
        {
            let entry: IndirectEntry = visitor.get();
            if !table_offsets.is_include(entry.virt_offset) {
                return Err(StorageError::InvalidIndirectEntryOffset {});
            }
        }

        let mut cur_offset = offset;
        let end_offset = offset + size;
        let mut cr_info = ContinuousReadingInfo::default();

        while cur_offset < end_offset {
            let cur_entry: IndirectEntry = visitor.get();

            if cur_entry.virt_offset > cur_offset {
                return Err(StorageError::InvalidIndirectEntryOffset {});
            }
            if cur_entry.storage_index < 0 || cur_entry.storage_index >= Self::STORAGE_COUNT as i32
            {
                return Err(StorageError::InvalidIndirectEntryStorageIndex {});
            }

            if continuous_check {
                if cr_info.check_need_scan() {
                    cr_info = visitor.scan_continuous_reading::<IndirectCrEntry>(
                        cur_offset,
                        end_offset - cur_offset,
                    )?;
                }

                if cr_info.can_do() {
                    if cur_entry.storage_index != 0 {
                        return Err(StorageError::InvalidIndirectEntryStorageIndex {});
                    }

                    let data_offset = cur_offset - cur_entry.virt_offset;
                    let cur_size = cr_info.read_size();

                    if range_check {
                        let storage_size = self.storage(0)?.get_size();
                        if cur_entry.phys_offset > storage_size {
                            return Err(StorageError::InvalidIndirectEntryOffset {});
                        }
                        if cur_entry.phys_offset + data_offset + cur_size > storage_size {
                            return Err(StorageError::InvalidIndirectStorageSize {});
                        }
                    }

                    f(
                        self.storage(0)?,
                        cur_entry.phys_offset + data_offset,
                        cur_offset,
                        cur_size,
                    )?;

                    cr_info.done();
                }
            }

            let next_entry_offset = if visitor.can_move_next() {
                visitor.move_next()?;
                let next: IndirectEntry = visitor.get();
                if !table_offsets.is_include(next.virt_offset) {
                    return Err(StorageError::InvalidIndirectEntryOffset {});
                }
                next.virt_offset
            } else {
                table_offsets.end_offset
            };
            if cur_offset >= next_entry_offset {
                return Err(StorageError::InvalidIndirectEntryOffset {});
            }

            let data_offset = cur_offset - cur_entry.virt_offset;
            let data_size = next_entry_offset - cur_entry.virt_offset;
            let remaining_size = end_offset - cur_offset;
            let cur_size = std::cmp::min(remaining_size, data_size - data_offset);

            let needs_operate = if !continuous_check {
                true
            } else {
                !cr_info.is_done() || cur_entry.storage_index != 0
            };

            if needs_operate {
                let storage = self.storage(cur_entry.storage_index as usize)?;

                if range_check {
                    let storage_size = storage.get_size();
                    if cur_entry.phys_offset > storage_size
                        || cur_entry.phys_offset + data_offset + cur_size > storage_size
                    {
                        return Err(StorageError::IndirectStorageCorrupted {});
                    }
                }

                f(
                    storage,
                    cur_entry.phys_offset + data_offset,
                    cur_offset,
                    cur_size,
                )?;
            }

            cur_offset += cur_size;
        }

        Ok(())
    }
}

impl ReadableStorage for IndirectStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let size = self.get_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        let buf = &mut buf[..len];

        self.operate_per_entry(
            offset,
            len as u64,
            true,
            true,
            &mut |storage: &VirtualFile, phys_offset, cur_offset, cur_size| {
                let at = (cur_offset - offset) as usize;
                storage.read_exact(phys_offset, &mut buf[at..at + cur_size as usize])
            },
        )?;

        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.table.get_offsets().end_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fssystem::bucket_tree::test_fixture::build_tree_storages;
    use crate::storage::VecStorage;
    use std::sync::Arc;

    pub(crate) fn entry_bytes(virt: u64, phys: u64, storage_index: i32) -> Vec<u8> {
        let mut e = Vec::with_capacity(IndirectStorage::ENTRY_SIZE);
        e.extend_from_slice(&virt.to_le_bytes());
        e.extend_from_slice(&phys.to_le_bytes());
        e.extend_from_slice(&storage_index.to_le_bytes());
        e
    }

    fn make_indirect(
        entries: &[(u64, u64, i32)],
        end_offset: u64,
        storage0: Vec<u8>,
        storage1: Vec<u8>,
    ) -> IndirectStorage {
        let raw: Vec<Vec<u8>> = entries
            .iter()
            .map(|&(v, p, s)| entry_bytes(v, p, s))
            .collect();
        let (node_storage, entry_storage) = build_tree_storages(
            &raw,
            IndirectStorage::ENTRY_SIZE,
            IndirectStorage::NODE_SIZE,
            end_offset,
        );
        let mut storage =
            IndirectStorage::new(node_storage, entry_storage, entries.len() as i32).unwrap();
        storage.set_storage(0, Arc::new(VecStorage::new(storage0)));
        storage.set_storage(1, Arc::new(VecStorage::new(storage1)));
        storage
    }

    #[test]
    fn patch_overlay() {
        // first half original, second half patch, both reading from their
        // physical offset 0
        let storage = make_indirect(
            &[(0, 0, 0), (0x800, 0, 1)],
            0x2000,
            vec![b'A'; 0x2000],
            vec![b'B'; 0x2000],
        );

        assert_eq!(storage.get_size(), 0x2000);

        let mut buf = vec![0; 0x1000];
        storage.read_exact(0, &mut buf).unwrap();
        assert_eq!(&buf[..0x800], &vec![b'A'; 0x800][..]);
        assert_eq!(&buf[0x800..], &vec![b'B'; 0x800][..]);
    }

    #[test]
    fn all_storage_zero_entries_mirror_storage_zero() {
        let data: Vec<u8> = (0..0x2000u32).map(|x| (x % 251) as u8).collect();
        let storage = make_indirect(
            &[(0, 0, 0), (0x1000, 0x1000, 0)],
            0x2000,
            data.clone(),
            vec![0; 0x10],
        );

        assert_eq!(storage.read_all().unwrap(), data);

        // unaligned interior range
        let mut buf = vec![0; 0x333];
        storage.read_exact(0xFF0, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[0xFF0..0xFF0 + 0x333]);
    }

    #[test]
    fn physical_reads_are_checked_against_the_data_storage() {
        // entry maps past the end of storage 1
        let storage = make_indirect(
            &[(0, 0, 0), (0x800, 0x1000, 1)],
            0x2000,
            vec![b'A'; 0x2000],
            vec![b'B'; 0x800],
        );

        let mut buf = vec![0; 0x2000];
        assert!(matches!(
            storage.read(0, &mut buf),
            Err(StorageError::IndirectStorageCorrupted {})
        ));
    }

    #[test]
    fn out_of_range_reads_are_rejected() {
        let storage = make_indirect(&[(0, 0, 0)], 0x1000, vec![0; 0x1000], vec![]);

        // reads are clamped at the end per the virtual-file contract
        let mut buf = vec![0; 0x100];
        assert_eq!(storage.read(0xFC0, &mut buf).unwrap(), 0x40);

        // but operate_per_entry rejects ranges outside the table
        assert!(matches!(
            storage.operate_per_entry(0x1000, 1, false, true, &mut |_, _, _, _| Ok(())),
            Err(StorageError::OutOfRange {})
        ));
    }
}
