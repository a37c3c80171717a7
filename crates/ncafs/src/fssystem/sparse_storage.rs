use crate::fssystem::bucket_tree::BucketTree;
use crate::fssystem::indirect_storage::IndirectStorage;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, StorageError, VirtualFile, ZeroStorage,
};
use std::sync::Arc;

/// An indirect storage whose second data storage is an infinite zero
/// source: ranges the table does not map read as zeros.
#[derive(Debug)]
pub struct SparseStorage {
    indirect: IndirectStorage,
}

impl SparseStorage {
    pub const NODE_SIZE: usize = IndirectStorage::NODE_SIZE;
    pub const ENTRY_SIZE: usize = IndirectStorage::ENTRY_SIZE;

    pub fn query_node_storage_size(entry_count: i32) -> u64 {
        IndirectStorage::query_node_storage_size(entry_count)
    }

    pub fn query_entry_storage_size(entry_count: i32) -> u64 {
        IndirectStorage::query_entry_storage_size(entry_count)
    }

    pub fn new(
        node_storage: VirtualFile,
        entry_storage: VirtualFile,
        entry_count: i32,
    ) -> Result<Self, StorageError> {
        let mut indirect = IndirectStorage::new(node_storage, entry_storage, entry_count)?;
        indirect.set_storage(1, Arc::new(ZeroStorage));
        Ok(Self { indirect })
    }

    /// A sparse storage with no table: `end_offset` bytes of zeros.
    pub fn new_empty(end_offset: u64) -> Self {
        let mut indirect = IndirectStorage::with_table(BucketTree::new_empty(end_offset));
        indirect.set_storage(1, Arc::new(ZeroStorage));
        Self { indirect }
    }

    /// Installs the physical data storage mapped by storage-index-0 entries.
    pub fn set_data_storage(&mut self, storage: VirtualFile) {
        self.indirect.set_storage(0, storage);
    }
}

impl ReadableStorage for SparseStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let size = self.get_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        let buf = &mut buf[..len];

        if self.indirect.table().is_empty() {
            buf.fill(0);
            return Ok(len);
        }

        self.indirect.operate_per_entry(
            offset,
            len as u64,
            false,
            true,
            &mut |storage: &VirtualFile, phys_offset, cur_offset, cur_size| {
                let at = (cur_offset - offset) as usize;
                storage.read_exact(phys_offset, &mut buf[at..at + cur_size as usize])
            },
        )?;

        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.indirect.table().get_offsets().end_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fssystem::bucket_tree::test_fixture::build_tree_storages;
    use crate::storage::{ReadableStorageExt, VecStorage};

    #[test]
    fn empty_table_reads_all_zeros() {
        let storage = SparseStorage::new_empty(0x1234);

        assert_eq!(storage.get_size(), 0x1234);
        let data = storage.read_all().unwrap();
        assert_eq!(data.len(), 0x1234);
        assert!(data.iter().all(|&b| b == 0));
    }

    fn entry_bytes(virt: u64, phys: u64, storage_index: i32) -> Vec<u8> {
        let mut e = Vec::with_capacity(SparseStorage::ENTRY_SIZE);
        e.extend_from_slice(&virt.to_le_bytes());
        e.extend_from_slice(&phys.to_le_bytes());
        e.extend_from_slice(&storage_index.to_le_bytes());
        e
    }

    #[test]
    fn unmapped_ranges_read_as_zeros() {
        // [0, 0x100) is data, [0x100, 0x200) is a hole, [0x200, 0x300) is
        // data again
        let entries = [
            entry_bytes(0, 0, 0),
            entry_bytes(0x100, 0, 1),
            entry_bytes(0x200, 0x100, 0),
        ];
        let (node_storage, entry_storage) = build_tree_storages(
            &entries,
            SparseStorage::ENTRY_SIZE,
            SparseStorage::NODE_SIZE,
            0x300,
        );
        let mut storage = SparseStorage::new(node_storage, entry_storage, 3).unwrap();
        storage.set_data_storage(Arc::new(VecStorage::new(vec![0xAA; 0x200])));

        let data = storage.read_all().unwrap();
        assert_eq!(&data[..0x100], &[0xAA; 0x100][..]);
        assert_eq!(&data[0x100..0x200], &[0; 0x100][..]);
        assert_eq!(&data[0x200..], &[0xAA; 0x100][..]);
    }
}
