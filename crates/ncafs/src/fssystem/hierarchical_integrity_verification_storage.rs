use crate::fssystem::integrity_verification_storage::{IntegrityVerificationStorage, HASH_SIZE};
use crate::storage::{ReadableStorage, SliceStorage, StorageError, VecStorage, VirtualFile};
use binrw::BinRead;
use std::sync::Arc;

pub const INTEGRITY_MIN_LAYER_COUNT: u32 = 2;
pub const INTEGRITY_MAX_LAYER_COUNT: u32 = 7;

/// Extent and block order of one integrity layer.
#[derive(Debug, Clone, Copy, Default, BinRead)]
#[br(little)]
pub struct IntegrityLevelInformation {
    pub offset: u64,
    pub size: u64,
    pub block_order: i32,
    pub reserved: [u8; 4],
}

/// The layer table carried in an `IVFC`-style integrity meta info.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct HierarchicalIntegrityVerificationInformation {
    pub max_layers: u32,
    pub layers: [IntegrityLevelInformation; (INTEGRITY_MAX_LAYER_COUNT - 1) as usize],
    pub seed: [u8; 0x20],
}

impl HierarchicalIntegrityVerificationInformation {
    /// Offset of the data layer, which doubles as the total size of the
    /// hash layers preceding it.
    pub fn data_offset(&self) -> u64 {
        self.layers[self.max_layers as usize - 2].offset
    }

    pub fn data_size(&self) -> u64 {
        self.layers[self.max_layers as usize - 2].size
    }
}

/// One storage per layer plus the final data storage, in layer order:
/// master hash, hash layers 1..=5, data.
#[derive(Debug, Default)]
pub struct HierarchicalStorageInformation {
    storages: [Option<VirtualFile>; Self::STORAGE_COUNT],
}

impl HierarchicalStorageInformation {
    pub const MASTER_STORAGE: usize = 0;
    pub const DATA_STORAGE: usize = 6;
    const STORAGE_COUNT: usize = Self::DATA_STORAGE + 1;

    pub fn set_master_hash_storage(&mut self, storage: VirtualFile) {
        self.storages[Self::MASTER_STORAGE] = Some(storage);
    }

    pub fn set_layer_hash_storage(&mut self, layer: usize, storage: VirtualFile) {
        debug_assert!((1..Self::DATA_STORAGE).contains(&layer));
        self.storages[layer] = Some(storage);
    }

    pub fn set_data_storage(&mut self, storage: VirtualFile) {
        self.storages[Self::DATA_STORAGE] = Some(storage);
    }

    fn take(&mut self, index: usize) -> Result<VirtualFile, StorageError> {
        self.storages[index]
            .take()
            .ok_or(StorageError::OutOfBounds {})
    }
}

/// Stacked per-layer verification storages over an on-disk integrity tree
/// (2–7 layers). The outermost layer exposes the logical data.
#[derive(Debug)]
pub struct HierarchicalIntegrityVerificationStorage {
    top: VirtualFile,
    data_size: u64,
    max_layers: u32,
}

impl HierarchicalIntegrityVerificationStorage {
    pub fn new(
        info: &HierarchicalIntegrityVerificationInformation,
        mut storages: HierarchicalStorageInformation,
    ) -> Result<Self, StorageError> {
        if !(INTEGRITY_MIN_LAYER_COUNT..=INTEGRITY_MAX_LAYER_COUNT).contains(&info.max_layers) {
            return Err(StorageError::InvalidSize {});
        }
        let max_layers = info.max_layers;

        // Wire the top verification pair: the master hash over the first
        // layer below it (the data itself when there are only two layers).
        let top = Arc::new(IntegrityVerificationStorage::new(
            storages.take(HierarchicalStorageInformation::MASTER_STORAGE)?,
            if max_layers == INTEGRITY_MIN_LAYER_COUNT {
                storages.take(HierarchicalStorageInformation::DATA_STORAGE)?
            } else {
                storages.take(1)?
            },
            1u64 << info.layers[0].block_order,
            HASH_SIZE,
            max_layers == INTEGRITY_MIN_LAYER_COUNT,
        )?);
        let mut buffer_storage: VirtualFile = top;

        // Each further layer verifies against a window of the one above.
        for level in 0..max_layers as usize - 2 {
            let hash_storage: VirtualFile = Arc::new(
                SliceStorage::new(buffer_storage.clone(), 0, info.layers[level].size)
                    .map_err(|_| StorageError::OutOfBounds {})?,
            );
            let data_storage = if level == max_layers as usize - 3 {
                storages.take(HierarchicalStorageInformation::DATA_STORAGE)?
            } else {
                storages.take(level + 2)?
            };
            let is_real_data = level == max_layers as usize - 3;

            buffer_storage = Arc::new(IntegrityVerificationStorage::new(
                hash_storage,
                data_storage,
                1u64 << info.layers[level + 1].block_order,
                1u64 << info.layers[level].block_order,
                is_real_data,
            )?);
        }

        Ok(Self {
            top: buffer_storage,
            data_size: info.data_size(),
            max_layers,
        })
    }

    /// Wires the storage with its master hash staged in an in-memory file.
    pub fn with_master_hash(
        info: &HierarchicalIntegrityVerificationInformation,
        master_hash: [u8; HASH_SIZE as usize],
        mut storages: HierarchicalStorageInformation,
    ) -> Result<Self, StorageError> {
        storages.set_master_hash_storage(Arc::new(VecStorage::new(master_hash.to_vec())));
        Self::new(info, storages)
    }

    pub fn max_layers(&self) -> u32 {
        self.max_layers
    }
}

impl ReadableStorage for HierarchicalIntegrityVerificationStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        if offset >= self.data_size {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, self.data_size - offset) as usize;
        self.top.read(offset, &mut buf[..len])
    }

    fn get_size(&self) -> u64 {
        self.data_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ReadableStorageExt;

    /// Builds a three-layer tree: master hash, one hash layer, data.
    fn three_layer_fixture(data: Vec<u8>) -> HierarchicalIntegrityVerificationStorage {
        let block_order = 6; // 0x40-byte blocks
        let block_size = 1u64 << block_order;
        let data_size = data.len() as u64;
        let hash_layer_size = data_size.div_ceil(block_size) * HASH_SIZE;

        let mut info = HierarchicalIntegrityVerificationInformation {
            max_layers: 3,
            layers: Default::default(),
            seed: [0; 0x20],
        };
        info.layers[0] = IntegrityLevelInformation {
            offset: 0,
            size: hash_layer_size,
            block_order,
            reserved: [0; 4],
        };
        info.layers[1] = IntegrityLevelInformation {
            offset: hash_layer_size,
            size: data_size,
            block_order,
            reserved: [0; 4],
        };

        let mut storages = HierarchicalStorageInformation::default();
        storages.set_layer_hash_storage(
            1,
            Arc::new(VecStorage::new(vec![0; hash_layer_size as usize])),
        );
        storages.set_data_storage(Arc::new(VecStorage::new(data)));

        HierarchicalIntegrityVerificationStorage::with_master_hash(
            &info,
            [0; HASH_SIZE as usize],
            storages,
        )
        .unwrap()
    }

    #[test]
    fn exposes_the_data_layer() {
        let data: Vec<u8> = (0..0x150u32).map(|x| x as u8).collect();
        let storage = three_layer_fixture(data.clone());

        assert_eq!(storage.get_size(), 0x150);
        assert_eq!(storage.read_all().unwrap(), data);

        // reads are clamped at the logical data size
        let mut buf = vec![0; 0x100];
        assert_eq!(storage.read(0x100, &mut buf).unwrap(), 0x50);
        assert_eq!(&buf[..0x50], &data[0x100..]);
    }

    #[test]
    fn rejects_bad_layer_counts() {
        let info = HierarchicalIntegrityVerificationInformation {
            max_layers: 1,
            layers: Default::default(),
            seed: [0; 0x20],
        };
        let storages = HierarchicalStorageInformation::default();
        assert!(HierarchicalIntegrityVerificationStorage::new(&info, storages).is_err());
    }
}
