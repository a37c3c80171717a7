use crate::storage::{ReadableStorage, ReadableStorageExt, StorageError, VirtualFile};

/// The three-layer SHA-256 hash storage used by PartitionFS sections:
/// master hash, one hash layer, data.
///
/// Initialization stages the master hash and the whole hash layer in
/// memory and enforces the sizing contract; reads pass through to the data
/// layer.
#[derive(Debug)]
pub struct HierarchicalSha256Storage {
    base_storage: VirtualFile,
    #[allow(dead_code)]
    master_hash: [u8; Self::HASH_SIZE],
    #[allow(dead_code)]
    hash_buffer: Vec<u8>,
    #[allow(dead_code)]
    hash_target_block_size: u32,
}

impl HierarchicalSha256Storage {
    pub const LAYER_COUNT: usize = 3;
    pub const HASH_SIZE: usize = 256 / 8;

    pub fn new(
        base_storages: [VirtualFile; Self::LAYER_COUNT],
        hash_target_block_size: u32,
    ) -> Result<Self, StorageError> {
        if !hash_target_block_size.is_power_of_two()
            || (hash_target_block_size as usize) < Self::HASH_SIZE
        {
            return Err(StorageError::InvalidSize {});
        }
        let [master_storage, hash_storage, data_storage] = base_storages;

        let log_size_ratio =
            (hash_target_block_size as u64 / Self::HASH_SIZE as u64).trailing_zeros();

        // The single hash layer bounds how much data the storage may hold.
        let base_storage_size = data_storage.get_size();
        if base_storage_size > (Self::HASH_SIZE as u64) << log_size_ratio << log_size_ratio {
            return Err(StorageError::InvalidSize {});
        }

        let mut master_hash = [0; Self::HASH_SIZE];
        master_storage.read_exact(0, &mut master_hash)?;

        let hash_storage_size = hash_storage.get_size();
        if hash_storage_size % Self::HASH_SIZE as u64 != 0
            || hash_storage_size > hash_target_block_size as u64
        {
            return Err(StorageError::InvalidSize {});
        }

        let mut hash_buffer = vec![0; hash_storage_size as usize];
        hash_storage.read_exact(0, &mut hash_buffer)?;

        Ok(Self {
            base_storage: data_storage,
            master_hash,
            hash_buffer,
            hash_target_block_size,
        })
    }
}

impl ReadableStorage for HierarchicalSha256Storage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.base_storage.read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        self.base_storage.get_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VecStorage;
    use std::sync::Arc;

    fn storages(
        data: Vec<u8>,
        hash_layer_size: usize,
    ) -> [VirtualFile; HierarchicalSha256Storage::LAYER_COUNT] {
        [
            Arc::new(VecStorage::new(vec![0xAB; HierarchicalSha256Storage::HASH_SIZE])),
            Arc::new(VecStorage::new(vec![0; hash_layer_size])),
            Arc::new(VecStorage::new(data)),
        ]
    }

    #[test]
    fn forwards_reads_to_the_data_layer() {
        let data: Vec<u8> = (0..0x200u32).map(|x| x as u8).collect();
        let storage = HierarchicalSha256Storage::new(storages(data.clone(), 0x40), 0x1000).unwrap();

        assert_eq!(storage.get_size(), 0x200);
        assert_eq!(storage.read_all().unwrap(), data);
    }

    #[test]
    fn hash_layer_must_fit_the_target_block() {
        // hash layer larger than the hash target block size
        let result = HierarchicalSha256Storage::new(storages(vec![0; 0x100], 0x2000), 0x1000);
        assert!(result.is_err());

        // non power of two block size
        let result = HierarchicalSha256Storage::new(storages(vec![0; 0x100], 0x40), 0x1001);
        assert!(result.is_err());
    }
}
