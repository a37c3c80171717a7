use crate::crypto::{add_counter, AesKey};
use crate::storage::{
    PooledBuffer, ReadableStorage, ReadableStorageExt, Storage, StorageError,
};

/// Transparent AES-128-CTR decryption over a base storage.
///
/// Callers must issue block-aligned reads; arbitrary ranges are adapted by
/// an [`AlignmentMatchingStorage`](crate::storage::AlignmentMatchingStorage)
/// stacked above. The write path encrypts through a pooled scratch buffer
/// and exists for build tooling; the read pipeline never uses it.
const IV_SIZE: usize = 0x10;

#[derive(Debug)]
pub struct AesCtrStorage<S> {
    base_storage: S,
    key: AesKey,
    iv: [u8; IV_SIZE],
}

impl<S> AesCtrStorage<S> {
    pub const BLOCK_SIZE: u64 = 0x10;
    pub const IV_SIZE: usize = IV_SIZE;

    /// Builds the CTR IV: big-endian upper half from the FS header, lower
    /// half the block index of `offset`.
    pub fn make_iv(upper: u64, offset: u64) -> [u8; IV_SIZE] {
        let mut iv = [0; IV_SIZE];
        iv[..8].copy_from_slice(&upper.to_be_bytes());
        iv[8..].copy_from_slice(&(offset / Self::BLOCK_SIZE).to_be_bytes());
        iv
    }

    pub fn new(base_storage: S, key: AesKey, iv: [u8; IV_SIZE]) -> Self {
        Self {
            base_storage,
            key,
            iv,
        }
    }
}

impl<S: ReadableStorage> ReadableStorage for AesCtrStorage<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.get_size();
        if offset >= size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        let buf = &mut buf[..len];

        if offset % Self::BLOCK_SIZE != 0 || len as u64 % Self::BLOCK_SIZE != 0 {
            return Err(StorageError::UnalignedAccess {});
        }

        // Read the ciphertext, then decrypt in place with the per-request
        // counter.
        self.base_storage.read_exact(offset, buf)?;

        let ctr = add_counter(&self.iv, offset / Self::BLOCK_SIZE);
        self.key.apply_ctr(buf, &ctr);

        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.base_storage.get_size()
    }
}

impl<S: Storage> Storage for AesCtrStorage<S> {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset % Self::BLOCK_SIZE != 0 || buf.len() as u64 % Self::BLOCK_SIZE != 0 {
            return Err(StorageError::UnalignedAccess {});
        }

        let mut pooled_buffer = PooledBuffer::new(buf.len(), Self::BLOCK_SIZE as usize);

        let mut ctr = add_counter(&self.iv, offset / Self::BLOCK_SIZE);

        let mut remaining = buf;
        let mut cur_offset = offset;
        while !remaining.is_empty() {
            let write_size = std::cmp::min(pooled_buffer.get_size(), remaining.len());
            let write_size = write_size - write_size % Self::BLOCK_SIZE as usize;
            let work = &mut pooled_buffer.get_buffer()[..write_size];

            work.copy_from_slice(&remaining[..write_size]);
            self.key.apply_ctr(work, &ctr);
            self.base_storage.write(cur_offset, work)?;

            cur_offset += write_size as u64;
            remaining = &remaining[write_size..];
            if !remaining.is_empty() {
                ctr = add_counter(&ctr, write_size as u64 / Self::BLOCK_SIZE);
            }
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
    use crate::storage::VecStorage;

    fn key() -> AesKey {
        "000102030405060708090a0b0c0d0e0f".parse().unwrap()
    }

    #[test]
    fn decrypts_one_block_with_the_offset_counter() {
        let upper = 0xAABBCCDDEEFF0011u64;
        let plaintext = *b"Hello, Switch!!\0";

        // ciphertext produced with counter upper || block index 2
        let mut ciphertext = plaintext;
        let iv = AesCtrStorage::<VecStorage>::make_iv(upper, 0x20);
        key().apply_ctr(&mut ciphertext, &iv);

        let mut backing = vec![0u8; 0x40];
        backing[0x20..0x30].copy_from_slice(&ciphertext);

        let storage = AesCtrStorage::new(
            VecStorage::new(backing),
            key(),
            AesCtrStorage::<VecStorage>::make_iv(upper, 0),
        );

        let mut buf = [0; 0x10];
        storage.read_exact(0x20, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn sequential_blocks_use_incrementing_counters() {
        let upper = 0x1122334455667788u64;
        let plaintext: Vec<u8> = (0..0x40).collect();

        let storage = AesCtrStorage::new(
            VecStorage::new(vec![0; 0x40]),
            key(),
            AesCtrStorage::<VecStorage>::make_iv(upper, 0),
        );
        storage.write(0, &plaintext).unwrap();

        // a full read round-trips
        let mut all = vec![0; 0x40];
        storage.read_exact(0, &mut all).unwrap();
        assert_eq!(all, plaintext);

        // and a read starting mid-stream sees the same bytes
        let mut tail = vec![0; 0x20];
        storage.read_exact(0x20, &mut tail).unwrap();
        assert_eq!(tail, &plaintext[0x20..]);
    }

    #[test]
    fn rejects_unaligned_access() {
        let storage = AesCtrStorage::new(
            VecStorage::new(vec![0; 0x40]),
            key(),
            [0; 0x10],
        );

        let mut buf = [0; 0x10];
        assert!(matches!(
            storage.read(0x8, &mut buf),
            Err(StorageError::UnalignedAccess {})
        ));
    }
}
