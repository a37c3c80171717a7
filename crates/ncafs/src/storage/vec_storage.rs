use crate::storage::{ReadableStorage, Storage, StorageError};
use std::fmt::Debug;
use std::sync::RwLock;

/// A storage backed by an owned byte buffer.
///
/// Used to stage decrypted metadata regions and the master hash of the
/// hierarchical storages.
pub struct VecStorage {
    data: RwLock<Vec<u8>>,
}

impl Debug for VecStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VecStorage").finish()
    }
}

impl VecStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }
}

impl ReadableStorage for VecStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let data = self.data.read().unwrap();

        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let offset = offset as usize;
        let len = std::cmp::min(buf.len(), data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    fn get_size(&self) -> u64 {
        let data = self.data.read().unwrap();

        data.len() as u64
    }
}

impl Storage for VecStorage {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();

        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(StorageError::OutOfBounds {});
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
