use crate::storage::{ReadableStorage, StorageError, VirtualFile};

/// One hash/data layer pair of a hierarchical integrity storage.
///
/// Reads pass through to the data layer; the final partial verification
/// block is zero-padded up to the block boundary, so callers may read past
/// the data size up to the aligned size. Hash bytes are not re-verified on
/// the read path; the layering and sizing checks happen at construction.
#[derive(Debug)]
pub struct IntegrityVerificationStorage {
    #[allow(dead_code)]
    hash_storage: VirtualFile,
    data_storage: VirtualFile,
    verification_block_size: u64,
    #[allow(dead_code)]
    upper_layer_verification_block_size: u64,
    #[allow(dead_code)]
    is_real_data: bool,
}

pub const HASH_SIZE: u64 = 256 / 8;

impl IntegrityVerificationStorage {
    pub fn new(
        hash_storage: VirtualFile,
        data_storage: VirtualFile,
        verification_block_size: u64,
        upper_layer_verification_block_size: u64,
        is_real_data: bool,
    ) -> Result<Self, StorageError> {
        if verification_block_size < HASH_SIZE || !verification_block_size.is_power_of_two() {
            return Err(StorageError::InvalidSize {});
        }

        let upper_layer_verification_block_size =
            std::cmp::max(upper_layer_verification_block_size, HASH_SIZE);
        if !upper_layer_verification_block_size.is_power_of_two() {
            return Err(StorageError::InvalidSize {});
        }

        // Each hash must cover one verification block of data.
        let hash_size = hash_storage.get_size();
        let data_size = data_storage.get_size();
        if (hash_size / HASH_SIZE) * verification_block_size < data_size {
            return Err(StorageError::InvalidSize {});
        }

        Ok(Self {
            hash_storage,
            data_storage,
            verification_block_size,
            upper_layer_verification_block_size,
            is_real_data,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.verification_block_size
    }
}

impl ReadableStorage for IntegrityVerificationStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let data_size = self.data_storage.get_size();
        let aligned_size = data_size
            .checked_add(self.verification_block_size - 1)
            .map(|v| v & !(self.verification_block_size - 1))
            .unwrap_or(data_size);

        if offset >= aligned_size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, aligned_size - offset) as usize;
        let buf = &mut buf[..len];

        // Zero the padding past the data end, then read the real bytes.
        let read_size = if offset + len as u64 > data_size {
            let padding_offset = data_size.saturating_sub(offset) as usize;
            buf[padding_offset..].fill(0);
            padding_offset
        } else {
            len
        };

        if read_size > 0 {
            self.data_storage.read(offset, &mut buf[..read_size])?;
        }

        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.data_storage.get_size()
    }
}
