use snafu::Snafu;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

mod alignment_matching_storage;
mod io_storage;
mod pooled_buffer;
mod region_switch_storage;
mod shared_storage;
mod slice_storage;
mod storage_io;
mod vec_storage;
mod zero_storage;

pub use alignment_matching_storage::AlignmentMatchingStorage;
pub use io_storage::{FileRoStorage, FileRwStorage, RoIoStorage, RwIoStorage};
pub use pooled_buffer::{PooledBuffer, BUFFER_POOL_BLOCK_SIZE};
pub use region_switch_storage::{Region, RegionSwitchStorage};
pub use shared_storage::SharedStorage;
pub use slice_storage::{SliceStorage, SliceStorageError};
pub use storage_io::StorageIo;
pub use vec_storage::VecStorage;
pub use zero_storage::ZeroStorage;

/// A read-only random-access byte container.
///
/// The storage has a fixed size. Reads at any offset are allowed; a read
/// returns fewer bytes than requested only when it crosses end-of-file, and
/// a read starting at or past end-of-file returns 0 bytes. Reads are
/// idempotent.
pub trait ReadableStorage: Send + Sync + std::fmt::Debug {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many bytes
    /// were read.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Gets the size of the storage in bytes.
    fn get_size(&self) -> u64;
}

pub trait Storage: ReadableStorage {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

/// The dynamically-typed storage handle the NCA driver composes chains out
/// of. Layers share their inner files through this.
pub type VirtualFile = Arc<dyn ReadableStorage>;

impl<T: ReadableStorage + ?Sized> ReadableStorage for Arc<T> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        (**self).read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        (**self).get_size()
    }
}

impl<T: ReadableStorage + ?Sized> ReadableStorage for &T {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        (**self).read(offset, buf)
    }

    fn get_size(&self) -> u64 {
        (**self).get_size()
    }
}

pub trait ReadableStorageExt: ReadableStorage {
    /// Reads exactly `buf.len()` bytes at `offset`; a short read is an
    /// `OutOfBounds` error.
    fn read_exact(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let read = self.read(offset, buf)?;
        if read != buf.len() {
            return Err(StorageError::OutOfBounds {});
        }
        Ok(())
    }

    fn slice(self, offset: u64, size: u64) -> Result<SliceStorage<Self>, SliceStorageError>
    where
        Self: Sized,
    {
        SliceStorage::new(self, offset, size)
    }

    fn shared(self) -> SharedStorage<Self>
    where
        Self: Sized,
    {
        SharedStorage::new(self)
    }

    fn virtual_file(self) -> VirtualFile
    where
        Self: Sized + 'static,
    {
        Arc::new(self)
    }

    fn io(self) -> StorageIo<Self>
    where
        Self: Sized,
    {
        StorageIo::new(self)
    }

    fn buf_read(self) -> BufReader<StorageIo<Self>>
    where
        Self: Sized,
    {
        BufReader::new(self.io())
    }

    fn read_all(&self) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0; self.get_size() as usize];
        self.read_exact(0, &mut buf)?;
        Ok(buf)
    }

    fn copy_to<S: Storage>(&self, other: &S) -> Result<(), StorageError> {
        const BUFFER_SIZE: usize = 0x10000;
        let size = self.get_size();
        let mut buf = vec![0; BUFFER_SIZE];
        for offset in (0..size).step_by(BUFFER_SIZE) {
            let chunk_size = std::cmp::min(BUFFER_SIZE as u64, size - offset);
            self.read_exact(offset, &mut buf[..chunk_size as usize])?;
            other.write(offset, &buf[..chunk_size as usize])?;
        }
        other.flush()
    }

    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        self.copy_to(&FileRwStorage::create(path, self.get_size())?)
    }
}

impl<T: ReadableStorage + ?Sized> ReadableStorageExt for T {}

#[derive(Snafu, Debug)]
pub enum StorageError {
    #[snafu(display("IO error during {}: {}", operation, source))]
    Io {
        source: std::io::Error,
        operation: &'static str,
    },
    #[snafu(display("Attempt to write to a read-only storage"))]
    Readonly {},
    #[snafu(display("Attempt to read or write out of the storage bounds"))]
    OutOfBounds {},
    #[snafu(display("A storage requiring aligned access was accessed with an unaligned range"))]
    UnalignedAccess {},
    #[snafu(display("Read of a range not covered by the storage's tables"))]
    OutOfRange {},
    #[snafu(display("Invalid bucket tree signature"))]
    InvalidBucketTreeSignature {},
    #[snafu(display("Invalid bucket tree version"))]
    InvalidBucketTreeVersion {},
    #[snafu(display("Invalid bucket tree entry count"))]
    InvalidBucketTreeEntryCount {},
    #[snafu(display("Invalid bucket tree node index"))]
    InvalidBucketTreeNodeIndex {},
    #[snafu(display("Invalid bucket tree node entry count"))]
    InvalidBucketTreeNodeEntryCount {},
    #[snafu(display("Invalid bucket tree entry offset"))]
    InvalidBucketTreeEntryOffset {},
    #[snafu(display("Invalid bucket tree virtual offset"))]
    InvalidBucketTreeVirtualOffset {},
    #[snafu(display("Invalid indirect storage entry offset"))]
    InvalidIndirectEntryOffset {},
    #[snafu(display("Invalid indirect storage entry storage index"))]
    InvalidIndirectEntryStorageIndex {},
    #[snafu(display("Indirect storage read escapes its data storage"))]
    InvalidIndirectStorageSize {},
    #[snafu(display("Indirect storage entry table is corrupted"))]
    IndirectStorageCorrupted {},
    #[snafu(display("Invalid AES-CTR-Ex entry offset"))]
    InvalidAesCtrCounterExtendedEntryOffset {},
    #[snafu(display("Invalid compressed storage entry offset"))]
    InvalidCompressedEntryOffset {},
    #[snafu(display("Compressed storage entry table is corrupted"))]
    CompressedStorageCorrupted {},
    #[snafu(display("Invalid offset for a compressed entry access"))]
    InvalidOffset {},
    #[snafu(display("Invalid size for a compressed entry access"))]
    InvalidSize {},
    #[snafu(display("Compressed entry exceeds the maximum block size"))]
    InvalidCompressedEntrySize {},
    #[snafu(display("No decompressor available for compression type {}", type_value))]
    MissingDecompressor { type_value: u8 },
    #[snafu(display("Decompression failed"))]
    DecompressionFailed {},
}
