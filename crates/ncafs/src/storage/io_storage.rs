use snafu::ResultExt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use super::{IoSnafu, ReadableStorage, Storage, StorageError};

/// A read-only storage over any `Read + Seek` object.
#[derive(Debug)]
pub struct RoIoStorage<Io: Read + Seek + Send + std::fmt::Debug> {
    io: Mutex<Io>,
    size: u64,
}

impl<Io: Read + Seek + Send + std::fmt::Debug> RoIoStorage<Io> {
    pub fn new(mut io: Io) -> Result<Self, StorageError> {
        let size = io
            .seek(SeekFrom::End(0))
            .context(IoSnafu { operation: "seek" })?;
        io.seek(SeekFrom::Start(0))
            .context(IoSnafu { operation: "seek" })?;
        Ok(Self {
            io: Mutex::new(io),
            size,
        })
    }
}

impl<Io: Read + Seek + Send + std::fmt::Debug> ReadableStorage for RoIoStorage<Io> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, self.size - offset) as usize;

        let mut io = self.io.lock().unwrap();
        io.seek(SeekFrom::Start(offset))
            .context(IoSnafu { operation: "seek" })?;
        io.read_exact(&mut buf[..len])
            .context(IoSnafu { operation: "read" })?;
        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.size
    }
}

#[derive(Debug)]
struct RwIoStorageInner<Io> {
    io: Io,
    size: u64,
}

/// A storage over an IO object with read and write access.
#[derive(Debug)]
pub struct RwIoStorage<Io: Read + Write + Seek + Send + std::fmt::Debug>(Mutex<RwIoStorageInner<Io>>);

impl<Io: Read + Write + Seek + Send + std::fmt::Debug> RwIoStorage<Io> {
    pub fn new(mut io: Io) -> Result<Self, StorageError> {
        let size = io
            .seek(SeekFrom::End(0))
            .context(IoSnafu { operation: "seek" })?;
        io.seek(SeekFrom::Start(0))
            .context(IoSnafu { operation: "seek" })?;
        Ok(Self(Mutex::new(RwIoStorageInner { io, size })))
    }
}

impl<Io: Read + Write + Seek + Send + std::fmt::Debug> ReadableStorage for RwIoStorage<Io> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let mut inner = self.0.lock().unwrap();
        if offset >= inner.size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, inner.size - offset) as usize;

        inner
            .io
            .seek(SeekFrom::Start(offset))
            .context(IoSnafu { operation: "seek" })?;
        inner.io.read_exact(&mut buf[..len]).context(IoSnafu {
            operation: "read_exact",
        })?;
        Ok(len)
    }

    fn get_size(&self) -> u64 {
        let inner = self.0.lock().unwrap();
        inner.size
    }
}

impl<Io: Read + Write + Seek + Send + std::fmt::Debug> Storage for RwIoStorage<Io> {
    fn write(&self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        if offset + buf.len() as u64 > inner.size {
            return Err(StorageError::OutOfBounds {});
        }
        inner
            .io
            .seek(SeekFrom::Start(offset))
            .context(IoSnafu { operation: "seek" })?;
        inner.io.write_all(buf).context(IoSnafu {
            operation: "write_all",
        })?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.0.lock().unwrap();
        inner.io.flush().context(IoSnafu { operation: "flush" })?;
        Ok(())
    }
}

pub type FileRoStorage = RoIoStorage<File>;
pub type FileRwStorage = RwIoStorage<File>;

impl FileRoStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let io = File::open(path).context(IoSnafu { operation: "open" })?;
        Self::new(io)
    }
}

impl FileRwStorage {
    /// Creates (or truncates) a file of the given size.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self, StorageError> {
        let io = File::create(path).context(IoSnafu {
            operation: "create",
        })?;
        io.set_len(size).context(IoSnafu {
            operation: "set_len",
        })?;
        Self::new(io)
    }
}
