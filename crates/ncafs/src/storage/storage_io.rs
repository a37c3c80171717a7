use crate::storage::{ReadableStorage, StorageError};
use std::io::{Read, Seek, SeekFrom};

/// Adapts a storage to `std::io::Read + Seek` so composed section files can
/// be streamed by ordinary IO consumers.
#[derive(Debug)]
pub struct StorageIo<S> {
    storage: S,
    position: u64,
}

impl<S: ReadableStorage> StorageIo<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            position: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

fn to_io_error(error: StorageError) -> std::io::Error {
    std::io::Error::other(error)
}

impl<S: ReadableStorage> Read for StorageIo<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self
            .storage
            .read(self.position, buf)
            .map_err(to_io_error)?;
        self.position += read as u64;
        Ok(read)
    }
}

impl<S: ReadableStorage> Seek for StorageIo<S> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let size = self.storage.get_size();
        let new_position = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => size.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };
        match new_position {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before the start of the storage",
            )),
        }
    }
}
