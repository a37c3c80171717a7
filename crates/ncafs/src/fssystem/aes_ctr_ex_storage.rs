use crate::crypto::AesKey;
use crate::fssystem::aes_ctr_storage::AesCtrStorage;
use crate::fssystem::bucket_tree::BucketTree;
use crate::storage::{
    ReadableStorage, ReadableStorageExt, StorageError, VirtualFile,
};
use binrw::BinRead;

/// The 64-bit upper half of an NCA CTR IV: `{ generation, secure_value }`
/// in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead)]
#[br(little)]
pub struct AesCtrUpperIv {
    pub value: u64,
}

impl AesCtrUpperIv {
    pub fn new(generation: u32, secure_value: u32) -> Self {
        Self {
            value: (secure_value as u64) << 32 | generation as u64,
        }
    }

    pub fn generation(&self) -> u32 {
        self.value as u32
    }

    pub fn secure_value(&self) -> u32 {
        (self.value >> 32) as u32
    }

    pub fn with_generation(&self, generation: u32) -> Self {
        Self::new(generation, self.secure_value())
    }
}

/// AES-CTR decryption whose counter's upper word is patched per byte range
/// by a bucket tree ("generation"), used by update patches.
#[derive(Debug)]
pub struct AesCtrCounterExtendedStorage {
    table: BucketTree,
    data_storage: VirtualFile,
    key: AesKey,
    secure_value: u32,
    counter_offset: u64,
}

/// One table entry: the range starting at `offset` is encrypted (or not)
/// with the given generation.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct AesCtrExEntry {
    pub offset: u64,
    pub encryption_value: u8,
    pub reserved: [u8; 3],
    pub generation: i32,
}

impl AesCtrExEntry {
    pub const ENCRYPTED: u8 = 0;
    pub const NOT_ENCRYPTED: u8 = 1;

    pub fn is_encrypted(&self) -> bool {
        self.encryption_value == Self::ENCRYPTED
    }
}

impl AesCtrCounterExtendedStorage {
    pub const BLOCK_SIZE: u64 = 0x10;
    pub const NODE_SIZE: usize = 16 * 1024;
    pub const ENTRY_SIZE: usize = 0x10;

    pub fn query_node_storage_size(entry_count: i32) -> u64 {
        BucketTree::query_node_storage_size(Self::NODE_SIZE, Self::ENTRY_SIZE, entry_count)
    }

    pub fn query_entry_storage_size(entry_count: i32) -> u64 {
        BucketTree::query_entry_storage_size(Self::NODE_SIZE, Self::ENTRY_SIZE, entry_count)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: AesKey,
        secure_value: u32,
        counter_offset: u64,
        data_storage: VirtualFile,
        node_storage: VirtualFile,
        entry_storage: VirtualFile,
        entry_count: i32,
    ) -> Result<Self, StorageError> {
        let table = if entry_count > 0 {
            BucketTree::new(
                node_storage,
                entry_storage,
                Self::NODE_SIZE,
                Self::ENTRY_SIZE,
                entry_count,
            )?
        } else {
            BucketTree::new_empty(0)
        };

        Ok(Self {
            table,
            data_storage,
            key,
            secure_value,
            counter_offset,
        })
    }
}

impl ReadableStorage for AesCtrCounterExtendedStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let size = self.get_size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, size - offset) as usize;
        let buf = &mut buf[..len];

        if offset % Self::BLOCK_SIZE != 0 || len as u64 % Self::BLOCK_SIZE != 0 {
            return Err(StorageError::UnalignedAccess {});
        }

        let table_offsets = self.table.get_offsets();
        if !table_offsets.is_include_range(offset, len as u64) {
            return Err(StorageError::OutOfRange {});
        }

        // Read the ciphertext for the whole request.
        self.data_storage.read_exact(offset, buf)?;

        let mut visitor = self.table.find(offset)?;
        {
            let entry: AesCtrExEntry = visitor.get();
            if entry.offset % Self::BLOCK_SIZE != 0 || !table_offsets.is_include(entry.offset) {
                return Err(StorageError::InvalidAesCtrCounterExtendedEntryOffset {});
            }
        }

        let mut cur_offset = offset;
        let end_offset = offset + len as u64;
        let mut processed = 0usize;

        while cur_offset < end_offset {
            let cur_entry: AesCtrExEntry = visitor.get();

            let cur_entry_offset = cur_entry.offset;
            if cur_entry_offset > cur_offset {
                return Err(StorageError::InvalidAesCtrCounterExtendedEntryOffset {});
            }

            let next_entry_offset = if visitor.can_move_next() {
                visitor.move_next()?;
                let next: AesCtrExEntry = visitor.get();
                if next.offset % Self::BLOCK_SIZE != 0 || !table_offsets.is_include(next.offset) {
                    return Err(StorageError::InvalidAesCtrCounterExtendedEntryOffset {});
                }
                next.offset
            } else {
                table_offsets.end_offset
            };
            if cur_offset >= next_entry_offset {
                return Err(StorageError::InvalidAesCtrCounterExtendedEntryOffset {});
            }

            let data_offset = cur_offset - cur_entry_offset;
            let data_size = (next_entry_offset - cur_entry_offset) - data_offset;
            let remaining_size = end_offset - cur_offset;
            let cur_size = std::cmp::min(remaining_size, data_size) as usize;

            if cur_entry.is_encrypted() {
                // The per-entry generation feeds the counter's upper word.
                let upper_iv =
                    AesCtrUpperIv::new(cur_entry.generation as u32, self.secure_value);
                let counter_offset = self.counter_offset + cur_entry_offset + data_offset;
                let iv = AesCtrStorage::<VirtualFile>::make_iv(upper_iv.value, counter_offset);

                self.key
                    .apply_ctr(&mut buf[processed..processed + cur_size], &iv);
            }

            cur_offset += cur_size as u64;
            processed += cur_size;
        }

        Ok(len)
    }

    fn get_size(&self) -> u64 {
        self.table.get_offsets().end_offset
    }
}
