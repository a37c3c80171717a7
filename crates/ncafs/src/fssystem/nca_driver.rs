use crate::crypto::AesKey;
use crate::fssystem::aes_ctr_ex_storage::{AesCtrCounterExtendedStorage, AesCtrUpperIv};
use crate::fssystem::aes_ctr_storage::AesCtrStorage;
use crate::fssystem::aes_xts_storage::AesXtsStorage;
use crate::fssystem::bucket_tree::BucketTreeHeader;
use crate::fssystem::compressed_storage::CompressedStorage;
use crate::fssystem::hierarchical_integrity_verification_storage::{
    HierarchicalIntegrityVerificationStorage, HierarchicalStorageInformation,
    INTEGRITY_MAX_LAYER_COUNT, INTEGRITY_MIN_LAYER_COUNT,
};
use crate::fssystem::hierarchical_sha256_storage::HierarchicalSha256Storage;
use crate::fssystem::indirect_storage::IndirectStorage;
use crate::fssystem::nca_header::*;
use crate::fssystem::nca_reader::{NcaFsHeaderReader, NcaReader};
use crate::fssystem::sparse_storage::SparseStorage;
use crate::fssystem::{NcaError, StorageSnafu};
use crate::storage::{
    AlignmentMatchingStorage, ReadableStorage, ReadableStorageExt, RegionSwitchStorage,
    SliceStorage, VecStorage, VirtualFile,
};
use binrw::BinRead;
use snafu::ResultExt;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

const COMPRESSED_BLOCK_SIZE_MAX: usize = 64 * 1024;
const COMPRESSED_CONTINUOUS_READING_SIZE_MAX: usize = 640 * 1024;
const COMPRESSED_CACHE_SIZE_0: usize = 16 * 1024;
const COMPRESSED_CACHE_SIZE_1: usize = 16 * 1024;
const COMPRESSED_MAX_CACHE_ENTRIES: usize = 32;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn slice_of(
    storage: &VirtualFile,
    offset: u64,
    size: u64,
) -> Result<VirtualFile, NcaError> {
    Ok(Arc::new(
        SliceStorage::new(storage.clone(), offset, size)
            .map_err(|_| NcaError::NcaBaseStorageOutOfRange)?,
    ))
}

/// Composes the layered read pipeline for one FS section of an NCA.
///
/// For patch NCAs the driver may be constructed with the base title's
/// reader, which supplies the original data the indirect layer demuxes
/// against; alternatively an external original storage can be installed.
pub struct NcaFileSystemDriver {
    original_reader: Option<Arc<NcaReader>>,
    reader: Arc<NcaReader>,
    external_original_storage: Option<VirtualFile>,
}

impl NcaFileSystemDriver {
    pub fn new(reader: Arc<NcaReader>) -> Self {
        Self {
            original_reader: None,
            reader,
            external_original_storage: None,
        }
    }

    pub fn with_original(original_reader: Arc<NcaReader>, reader: Arc<NcaReader>) -> Self {
        Self {
            original_reader: Some(original_reader),
            reader,
            external_original_storage: None,
        }
    }

    pub fn set_external_original_storage(&mut self, storage: VirtualFile) {
        self.external_original_storage = Some(storage);
    }

    /// Opens the fully composed storage for a section: decryption, patch,
    /// hash and compression layers stacked per the FS header.
    pub fn open_storage(
        &self,
        fs_index: usize,
    ) -> Result<(VirtualFile, NcaFsHeaderReader), NcaError> {
        self.open_storage_impl(fs_index, false)
    }

    /// Opens the section storage without the hash and compression layers.
    pub fn open_raw_storage(
        &self,
        fs_index: usize,
    ) -> Result<(VirtualFile, NcaFsHeaderReader), NcaError> {
        self.open_storage_impl(fs_index, true)
    }

    fn open_storage_impl(
        &self,
        fs_index: usize,
        open_raw_storage: bool,
    ) -> Result<(VirtualFile, NcaFsHeaderReader), NcaError> {
        if fs_index >= FS_COUNT_MAX || !self.reader.has_fs_info(fs_index) {
            return Err(NcaError::PartitionNotFound { index: fs_index });
        }

        let header_reader = NcaFsHeaderReader::new(&self.reader, fs_index)?;

        // Innermost layer: the sparse expansion, or a plain slice of the
        // NCA body.
        let (mut storage, fs_data_offset) = if header_reader.exists_sparse_layer() {
            if header_reader.exists_sparse_meta_hash_layer() {
                self.create_sparse_storage_with_verification(fs_index, &header_reader)?
            } else {
                self.create_sparse_storage(fs_index, &header_reader)?
            }
        } else {
            let fs_offset = self.reader.get_fs_offset(fs_index);
            let fs_end_offset = self.reader.get_fs_end_offset(fs_index);
            if fs_end_offset <= fs_offset {
                return Err(NcaError::InvalidNcaHeader);
            }
            let data_size = fs_end_offset - fs_offset;
            (
                self.create_body_substorage(fs_offset, data_size)?,
                fs_offset,
            )
        };

        // The combined patch metadata region, when it is integrity
        // protected.
        let patch_info = *header_reader.get_patch_info();
        let mut patch_meta_aes_ctr_ex_meta: Option<VirtualFile> = None;
        let mut patch_meta_indirect_meta: Option<VirtualFile> = None;
        if header_reader.exists_patch_meta_hash_layer() {
            if header_reader.get_meta_data_hash_type() != MetaDataHashType::HierarchicalIntegrity {
                return Err(NcaError::InvalidPatchMetaDataHashType);
            }

            let (aes_ctr_ex_meta, indirect_meta) = self.create_patch_meta_storage(
                &storage,
                fs_data_offset,
                header_reader.get_aes_ctr_upper_iv(),
                &patch_info,
                header_reader.get_meta_data_hash_data_info(),
            )?;
            patch_meta_aes_ctr_ex_meta = Some(aes_ctr_ex_meta);
            patch_meta_indirect_meta = Some(indirect_meta);
        }

        if patch_info.has_aes_ctr_ex_table() {
            debug_assert!(matches!(
                header_reader.get_encryption_type(),
                NcaFsHeaderEncryptionType::None
                    | NcaFsHeaderEncryptionType::AesCtrEx
                    | NcaFsHeaderEncryptionType::AesCtrExSkipLayerHash
            ));

            let meta_storage = match patch_meta_aes_ctr_ex_meta {
                Some(meta) => meta,
                None => self.create_aes_ctr_ex_meta_storage(
                    &storage,
                    fs_data_offset,
                    header_reader.get_encryption_type(),
                    header_reader.get_aes_ctr_upper_iv(),
                    &patch_info,
                )?,
            };

            storage = self.create_aes_ctr_ex_storage(
                storage,
                meta_storage,
                fs_data_offset,
                header_reader.get_aes_ctr_upper_iv(),
                &patch_info,
            )?;
        } else {
            storage = match header_reader.get_encryption_type() {
                NcaFsHeaderEncryptionType::None => storage,
                NcaFsHeaderEncryptionType::AesXts => {
                    self.create_aes_xts_storage(storage, fs_data_offset)?
                }
                NcaFsHeaderEncryptionType::AesCtr => self.create_aes_ctr_storage(
                    storage,
                    fs_data_offset,
                    header_reader.get_aes_ctr_upper_iv(),
                )?,
                NcaFsHeaderEncryptionType::AesCtrSkipLayerHash => {
                    // Only the hash-target data is encrypted; the hash
                    // layers in front of it read from the plain storage.
                    let aes_ctr_storage = self.create_aes_ctr_storage(
                        storage.clone(),
                        fs_data_offset,
                        header_reader.get_aes_ctr_upper_iv(),
                    )?;
                    self.create_region_switch_storage(&header_reader, storage, aes_ctr_storage)?
                }
                _ => return Err(NcaError::InvalidNcaFsHeaderEncryptionType),
            };
        }

        if patch_info.has_indirect_table() {
            let meta_storage = match patch_meta_indirect_meta {
                Some(meta) => meta,
                None => self.create_indirect_storage_meta_storage(&storage, &patch_info)?,
            };

            // The original indirectable storage: the base NCA's section,
            // an externally supplied image, or an empty placeholder.
            let original_storage = match &self.original_reader {
                Some(original_reader) if original_reader.has_fs_info(fs_index) => {
                    let original_driver = NcaFileSystemDriver::new(original_reader.clone());
                    let original_header_reader =
                        NcaFsHeaderReader::new(original_reader, fs_index)?;
                    original_driver
                        .open_indirectable_storage_as_original(&original_header_reader)?
                }
                _ => match &self.external_original_storage {
                    Some(storage) => storage.clone(),
                    None => Arc::new(VecStorage::new(Vec::new())),
                },
            };

            storage =
                self.create_indirect_storage(storage, original_storage, meta_storage, &patch_info)?;
        }

        // Sparse sections and raw requests stop before the hash layer.
        if header_reader.exists_sparse_layer() || open_raw_storage {
            return Ok((storage, header_reader));
        }

        let storage = self.create_storage_by_raw_storage(storage, &header_reader)?;

        Ok((storage, header_reader))
    }

    fn create_storage_by_raw_storage(
        &self,
        raw_storage: VirtualFile,
        header_reader: &NcaFsHeaderReader,
    ) -> Result<VirtualFile, NcaError> {
        let mut storage = match (header_reader.get_hash_type(), header_reader.get_hash_data()) {
            (
                NcaFsHeaderHashType::HierarchicalSha256Hash,
                HashData::HierarchicalSha256(sha256_data),
            ) => self.create_sha256_storage(raw_storage, sha256_data)?,
            (NcaFsHeaderHashType::HierarchicalIntegrityHash, HashData::Integrity(meta_info)) => {
                self.create_integrity_verification_storage(raw_storage, meta_info)?
            }
            _ => return Err(NcaError::InvalidNcaFsHeaderHashType),
        };

        if header_reader.exists_compression_layer() {
            storage =
                self.create_compressed_storage(storage, header_reader.get_compression_info())?;
        }

        Ok(storage)
    }

    /// Opens the storage an indirect layer reads its "original" bytes
    /// from: the sparse-or-body layer plus plain decryption, nothing else.
    fn open_indirectable_storage_as_original(
        &self,
        header_reader: &NcaFsHeaderReader,
    ) -> Result<VirtualFile, NcaError> {
        let fs_index = header_reader.get_fs_index();

        let (storage, fs_data_offset) = if header_reader.exists_sparse_layer() {
            if header_reader.exists_sparse_meta_hash_layer() {
                self.create_sparse_storage_with_verification(fs_index, header_reader)?
            } else {
                self.create_sparse_storage(fs_index, header_reader)?
            }
        } else {
            let fs_offset = self.reader.get_fs_offset(fs_index);
            let fs_end_offset = self.reader.get_fs_end_offset(fs_index);
            if fs_end_offset <= fs_offset {
                return Err(NcaError::InvalidNcaHeader);
            }
            (
                self.create_body_substorage(fs_offset, fs_end_offset - fs_offset)?,
                fs_offset,
            )
        };

        match header_reader.get_encryption_type() {
            NcaFsHeaderEncryptionType::None => Ok(storage),
            NcaFsHeaderEncryptionType::AesXts => self.create_aes_xts_storage(storage, fs_data_offset),
            NcaFsHeaderEncryptionType::AesCtr => self.create_aes_ctr_storage(
                storage,
                fs_data_offset,
                header_reader.get_aes_ctr_upper_iv(),
            ),
            _ => Err(NcaError::InvalidNcaFsHeaderEncryptionType),
        }
    }

    fn create_body_substorage(&self, offset: u64, size: u64) -> Result<VirtualFile, NcaError> {
        let body_storage = self.reader.get_shared_body_storage();

        if offset + size > body_storage.get_size() {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        slice_of(&body_storage, offset, size)
    }

    fn get_ctr_decryption_key(&self) -> AesKey {
        if self.reader.has_external_decryption_key() {
            self.reader.get_external_decryption_key()
        } else {
            self.reader.get_decryption_key(DecryptionKey::AesCtr)
        }
    }

    fn create_aes_ctr_storage(
        &self,
        base_storage: VirtualFile,
        offset: u64,
        upper_iv: AesCtrUpperIv,
    ) -> Result<VirtualFile, NcaError> {
        let iv = AesCtrStorage::<VirtualFile>::make_iv(upper_iv.value, offset);
        let aes_ctr_storage =
            AesCtrStorage::new(base_storage, self.get_ctr_decryption_key(), iv);

        Ok(Arc::new(
            AlignmentMatchingStorage::<_, { CTR_BLOCK_SIZE as usize }>::new(aes_ctr_storage),
        ))
    }

    fn create_aes_xts_storage(
        &self,
        base_storage: VirtualFile,
        offset: u64,
    ) -> Result<VirtualFile, NcaError> {
        let key1 = self.reader.get_decryption_key(DecryptionKey::AesXts1);
        let key2 = self.reader.get_decryption_key(DecryptionKey::AesXts2);
        let key = crate::crypto::AesXtsKey::from_halves(key1, key2);

        let xts_storage = AesXtsStorage::new(
            base_storage,
            key,
            HEADER_XTS_BLOCK_SIZE,
            offset / HEADER_XTS_BLOCK_SIZE as u64,
        );

        Ok(Arc::new(
            AlignmentMatchingStorage::<_, HEADER_XTS_BLOCK_SIZE>::new(xts_storage),
        ))
    }

    fn create_sparse_storage_meta_storage(
        &self,
        base_storage: &VirtualFile,
        offset: u64,
        upper_iv: AesCtrUpperIv,
        sparse_info: &NcaSparseInfo,
    ) -> Result<VirtualFile, NcaError> {
        let base_size = base_storage.get_size();
        let meta_offset = sparse_info.bucket.offset;
        let meta_size = sparse_info.bucket.size;
        if meta_offset + meta_size > base_size {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let enc_storage = slice_of(base_storage, meta_offset, meta_size)?;

        let decrypted_storage = self.create_aes_ctr_storage(
            enc_storage,
            offset + meta_offset,
            sparse_info.make_aes_ctr_upper_iv(upper_iv),
        )?;

        // The table is consulted on every read; keep a decrypted copy.
        let meta_data = decrypted_storage.read_all().context(StorageSnafu)?;
        Ok(Arc::new(VecStorage::new(meta_data)))
    }

    fn create_sparse_storage_core(
        &self,
        base_storage: &VirtualFile,
        base_size: u64,
        meta_storage: VirtualFile,
        sparse_info: &NcaSparseInfo,
    ) -> Result<VirtualFile, NcaError> {
        let header =
            BucketTreeHeader::parse(&sparse_info.bucket.header.0).context(StorageSnafu)?;

        let node_size = SparseStorage::query_node_storage_size(header.entry_count);
        let entry_size = SparseStorage::query_entry_storage_size(header.entry_count);

        let mut sparse_storage = SparseStorage::new(
            slice_of(&meta_storage, 0, node_size)?,
            slice_of(&meta_storage, node_size, entry_size)?,
            header.entry_count,
        )
        .context(StorageSnafu)?;

        sparse_storage.set_data_storage(slice_of(base_storage, 0, base_size)?);

        Ok(Arc::new(sparse_storage))
    }

    fn create_sparse_storage(
        &self,
        fs_index: usize,
        header_reader: &NcaFsHeaderReader,
    ) -> Result<(VirtualFile, u64), NcaError> {
        let sparse_info = *header_reader.get_sparse_info();
        if sparse_info.generation == 0 {
            return Err(NcaError::InvalidNcaHeader);
        }

        let header =
            BucketTreeHeader::parse(&sparse_info.bucket.header.0).context(StorageSnafu)?;

        let fs_offset = self.reader.get_fs_offset(fs_index);
        let fs_size = self.reader.get_fs_size(fs_index);

        let storage: VirtualFile = if header.entry_count != 0 {
            let body_substorage = self.create_body_substorage(
                sparse_info.physical_offset,
                sparse_info.get_physical_size(),
            )?;

            let meta_storage = self.create_sparse_storage_meta_storage(
                &body_substorage,
                sparse_info.physical_offset,
                header_reader.get_aes_ctr_upper_iv(),
                &sparse_info,
            )?;

            self.create_sparse_storage_core(
                &body_substorage,
                sparse_info.get_physical_size(),
                meta_storage,
                &sparse_info,
            )?
        } else {
            Arc::new(SparseStorage::new_empty(fs_size))
        };

        debug!(fs_index, "composed sparse storage");
        Ok((storage, fs_offset))
    }

    fn create_sparse_storage_meta_storage_with_verification(
        &self,
        base_storage: &VirtualFile,
        offset: u64,
        upper_iv: AesCtrUpperIv,
        sparse_info: &NcaSparseInfo,
        meta_data_hash_data_info: &NcaMetaDataHashDataInfo,
    ) -> Result<VirtualFile, NcaError> {
        let base_size = base_storage.get_size();
        let meta_offset = sparse_info.bucket.offset;
        let meta_size = sparse_info.bucket.size;
        if meta_offset + meta_size > base_size {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let hash_data_offset = meta_data_hash_data_info.offset;
        let hash_data_size = align_up(meta_data_hash_data_info.size, CTR_BLOCK_SIZE);
        if hash_data_offset + hash_data_size > base_size {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        // The table must precede its hash data, and both sit CTR aligned.
        if meta_offset + meta_size > hash_data_offset {
            return Err(NcaError::InvalidSparseMetaDataHashDataOffset);
        }
        if hash_data_offset % CTR_BLOCK_SIZE != 0 {
            return Err(NcaError::InvalidSparseMetaDataHashDataOffset);
        }
        if meta_offset % CTR_BLOCK_SIZE != 0 {
            return Err(NcaError::InvalidNcaFsHeader);
        }

        let enc_storage = slice_of(
            base_storage,
            meta_offset,
            hash_data_offset + hash_data_size - meta_offset,
        )?;

        let decrypted_storage = self.create_aes_ctr_storage(
            enc_storage,
            offset + meta_offset,
            sparse_info.make_aes_ctr_upper_iv(upper_iv),
        )?;

        let integrity_storage = self
            .create_integrity_verification_storage_for_meta(
                &decrypted_storage,
                meta_offset,
                meta_data_hash_data_info,
            )
            .map_err(|err| match err {
                NcaError::InvalidNcaMetaDataHashDataSize => {
                    NcaError::InvalidSparseMetaDataHashDataSize
                }
                NcaError::InvalidNcaMetaDataHashDataHash => {
                    NcaError::InvalidSparseMetaDataHashDataHash
                }
                other => other,
            })?;

        slice_of(&integrity_storage, 0, meta_size)
    }

    fn create_sparse_storage_with_verification(
        &self,
        fs_index: usize,
        header_reader: &NcaFsHeaderReader,
    ) -> Result<(VirtualFile, u64), NcaError> {
        let sparse_info = *header_reader.get_sparse_info();
        let meta_data_hash_data_info = *header_reader.get_meta_data_hash_data_info();

        if sparse_info.generation == 0 {
            return Err(NcaError::InvalidNcaHeader);
        }

        let header =
            BucketTreeHeader::parse(&sparse_info.bucket.header.0).context(StorageSnafu)?;

        let fs_offset = self.reader.get_fs_offset(fs_index);
        let fs_size = self.reader.get_fs_size(fs_index);

        let storage: VirtualFile = if header.entry_count != 0 {
            if header_reader.get_meta_data_hash_type() != MetaDataHashType::HierarchicalIntegrity {
                return Err(NcaError::InvalidSparseMetaDataHashType);
            }

            let body_substorage = self.create_body_substorage(
                sparse_info.physical_offset,
                align_up(
                    meta_data_hash_data_info.offset + meta_data_hash_data_info.size,
                    CTR_BLOCK_SIZE,
                ),
            )?;

            let meta_storage = self.create_sparse_storage_meta_storage_with_verification(
                &body_substorage,
                sparse_info.physical_offset,
                header_reader.get_aes_ctr_upper_iv(),
                &sparse_info,
                &meta_data_hash_data_info,
            )?;

            self.create_sparse_storage_core(
                &body_substorage,
                sparse_info.get_physical_size(),
                meta_storage,
                &sparse_info,
            )?
        } else {
            Arc::new(SparseStorage::new_empty(fs_size))
        };

        Ok((storage, fs_offset))
    }

    fn create_aes_ctr_ex_meta_storage(
        &self,
        base_storage: &VirtualFile,
        offset: u64,
        encryption_type: NcaFsHeaderEncryptionType,
        upper_iv: AesCtrUpperIv,
        patch_info: &NcaPatchInfo,
    ) -> Result<VirtualFile, NcaError> {
        debug_assert!(patch_info.has_aes_ctr_ex_table());

        if patch_info.indirect_size == 0 {
            return Err(NcaError::InvalidNcaPatchInfoIndirectSize);
        }
        if patch_info.aes_ctr_ex_size == 0 {
            return Err(NcaError::InvalidNcaPatchInfoAesCtrExSize);
        }
        if patch_info.indirect_offset + patch_info.indirect_size > patch_info.aes_ctr_ex_offset {
            return Err(NcaError::InvalidNcaPatchInfoAesCtrExOffset);
        }

        let base_size = base_storage.get_size();
        let meta_offset = patch_info.aes_ctr_ex_offset;
        let meta_size = align_up(patch_info.aes_ctr_ex_size, HEADER_XTS_BLOCK_SIZE as u64);
        if meta_offset + meta_size > base_size {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let enc_storage = slice_of(base_storage, meta_offset, meta_size)?;

        let decrypted_storage = if encryption_type != NcaFsHeaderEncryptionType::None {
            self.create_aes_ctr_storage(enc_storage, offset + meta_offset, upper_iv)?
        } else {
            enc_storage
        };

        let meta_data = decrypted_storage.read_all().context(StorageSnafu)?;
        Ok(Arc::new(VecStorage::new(meta_data)))
    }

    fn create_aes_ctr_ex_storage(
        &self,
        base_storage: VirtualFile,
        meta_storage: VirtualFile,
        counter_offset: u64,
        upper_iv: AesCtrUpperIv,
        patch_info: &NcaPatchInfo,
    ) -> Result<VirtualFile, NcaError> {
        debug_assert!(patch_info.has_aes_ctr_ex_table());

        let header =
            BucketTreeHeader::parse(&patch_info.aes_ctr_ex_header.0).context(StorageSnafu)?;
        let entry_count = header.entry_count;

        let node_size = AesCtrCounterExtendedStorage::query_node_storage_size(entry_count);
        let entry_size = AesCtrCounterExtendedStorage::query_entry_storage_size(entry_count);

        let data_storage = slice_of(&base_storage, 0, patch_info.aes_ctr_ex_offset)?;
        let node_storage = slice_of(&meta_storage, 0, node_size)?;
        let entry_storage = slice_of(&meta_storage, node_size, entry_size)?;

        let storage = AesCtrCounterExtendedStorage::new(
            self.get_ctr_decryption_key(),
            upper_iv.secure_value(),
            counter_offset,
            data_storage,
            node_storage,
            entry_storage,
            entry_count,
        )
        .context(StorageSnafu)?;

        Ok(Arc::new(
            AlignmentMatchingStorage::<_, { CTR_BLOCK_SIZE as usize }>::new(storage),
        ))
    }

    fn create_indirect_storage_meta_storage(
        &self,
        base_storage: &VirtualFile,
        patch_info: &NcaPatchInfo,
    ) -> Result<VirtualFile, NcaError> {
        debug_assert!(patch_info.has_indirect_table());

        if patch_info.indirect_offset + patch_info.indirect_size > base_storage.get_size() {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let meta_storage =
            slice_of(base_storage, patch_info.indirect_offset, patch_info.indirect_size)?;
        let meta_data = meta_storage.read_all().context(StorageSnafu)?;
        Ok(Arc::new(VecStorage::new(meta_data)))
    }

    fn create_indirect_storage(
        &self,
        base_storage: VirtualFile,
        original_data_storage: VirtualFile,
        meta_storage: VirtualFile,
        patch_info: &NcaPatchInfo,
    ) -> Result<VirtualFile, NcaError> {
        debug_assert!(patch_info.has_indirect_table());

        let header =
            BucketTreeHeader::parse(&patch_info.indirect_header.0).context(StorageSnafu)?;

        let node_size = IndirectStorage::query_node_storage_size(header.entry_count);
        let entry_size = IndirectStorage::query_entry_storage_size(header.entry_count);
        if node_size + entry_size > patch_info.indirect_size {
            return Err(NcaError::InvalidNcaIndirectStorageOutOfRange);
        }

        // Everything before the table is the patch data the table's
        // storage-1 entries point into.
        let indirect_data_size = patch_info.indirect_offset;
        let indirect_data_storage = slice_of(&base_storage, 0, indirect_data_size)?;

        let mut indirect_storage = IndirectStorage::new(
            slice_of(&meta_storage, 0, node_size)?,
            slice_of(&meta_storage, node_size, entry_size)?,
            header.entry_count,
        )
        .context(StorageSnafu)?;

        indirect_storage.set_storage(0, original_data_storage);
        indirect_storage.set_storage(1, indirect_data_storage);

        Ok(Arc::new(indirect_storage))
    }

    fn create_patch_meta_storage(
        &self,
        base_storage: &VirtualFile,
        offset: u64,
        upper_iv: AesCtrUpperIv,
        patch_info: &NcaPatchInfo,
        meta_data_hash_data_info: &NcaMetaDataHashDataInfo,
    ) -> Result<(VirtualFile, VirtualFile), NcaError> {
        debug_assert!(patch_info.has_aes_ctr_ex_table());
        debug_assert!(patch_info.has_indirect_table());

        if patch_info.indirect_size == 0 {
            return Err(NcaError::InvalidNcaPatchInfoIndirectSize);
        }
        if patch_info.indirect_offset + patch_info.indirect_size > patch_info.aes_ctr_ex_offset {
            return Err(NcaError::InvalidNcaPatchInfoAesCtrExOffset);
        }
        if patch_info.aes_ctr_ex_offset + patch_info.aes_ctr_ex_size
            > meta_data_hash_data_info.offset
        {
            return Err(NcaError::InvalidPatchMetaDataHashDataOffset);
        }

        let base_size = base_storage.get_size();
        if patch_info.indirect_offset + patch_info.indirect_size > base_size
            || patch_info.aes_ctr_ex_offset + patch_info.aes_ctr_ex_size > base_size
        {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let hash_data_offset = meta_data_hash_data_info.offset;
        let hash_data_size = align_up(meta_data_hash_data_info.size, CTR_BLOCK_SIZE);
        if hash_data_offset + hash_data_size > base_size {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let enc_storage = slice_of(
            base_storage,
            patch_info.indirect_offset,
            hash_data_offset + hash_data_size - patch_info.indirect_offset,
        )?;

        let decrypted_storage = self.create_aes_ctr_storage(
            enc_storage,
            offset + patch_info.indirect_offset,
            upper_iv,
        )?;

        let integrity_storage = self
            .create_integrity_verification_storage_for_meta(
                &decrypted_storage,
                patch_info.indirect_offset,
                meta_data_hash_data_info,
            )
            .map_err(|err| match err {
                NcaError::InvalidNcaMetaDataHashDataSize => {
                    NcaError::InvalidPatchMetaDataHashDataSize
                }
                NcaError::InvalidNcaMetaDataHashDataHash => {
                    NcaError::InvalidPatchMetaDataHashDataHash
                }
                other => other,
            })?;

        let indirect_meta = slice_of(&integrity_storage, 0, patch_info.indirect_size)?;
        let aes_ctr_ex_meta = slice_of(
            &integrity_storage,
            patch_info.aes_ctr_ex_offset - patch_info.indirect_offset,
            patch_info.aes_ctr_ex_size,
        )?;

        Ok((aes_ctr_ex_meta, indirect_meta))
    }

    fn create_integrity_verification_storage_for_meta(
        &self,
        base_storage: &VirtualFile,
        offset: u64,
        meta_data_hash_data_info: &NcaMetaDataHashDataInfo,
    ) -> Result<VirtualFile, NcaError> {
        if meta_data_hash_data_info.size != META_DATA_HASH_DATA_SIZE {
            return Err(NcaError::InvalidNcaMetaDataHashDataSize);
        }

        // Read and authenticate the hash data region.
        let mut raw = [0u8; META_DATA_HASH_DATA_SIZE as usize];
        base_storage
            .read_exact(meta_data_hash_data_info.offset - offset, &mut raw)
            .context(StorageSnafu)?;
        if meta_data_hash_data_info.hash.verify(&raw).is_err() {
            return Err(NcaError::InvalidNcaMetaDataHashDataHash);
        }

        let meta_data_hash_data = NcaMetaDataHashData::read(&mut Cursor::new(&raw[..]))
            .map_err(|_| NcaError::InvalidNcaMetaDataHashDataSize)?;

        let meta_storage = slice_of(base_storage, 0, meta_data_hash_data_info.offset - offset)?;

        self.create_integrity_verification_storage_impl(
            &meta_storage,
            &meta_data_hash_data.integrity_meta_info,
            meta_data_hash_data.layer_info_offset - offset,
        )
    }

    fn create_sha256_storage(
        &self,
        base_storage: VirtualFile,
        sha256_data: &HierarchicalSha256Data,
    ) -> Result<VirtualFile, NcaError> {
        if sha256_data.hash_block_size <= 0
            || !(sha256_data.hash_block_size as u32).is_power_of_two()
        {
            return Err(NcaError::InvalidHierarchicalSha256BlockSize);
        }
        if sha256_data.hash_layer_count as usize != HierarchicalSha256Storage::LAYER_COUNT - 1 {
            return Err(NcaError::InvalidHierarchicalSha256LayerCount);
        }

        let hash_region = sha256_data.hash_layer_region[0];
        let data_region = sha256_data.hash_layer_region[1];

        let base_size = base_storage.get_size();
        if hash_region.offset + hash_region.size > base_size
            || data_region.offset + data_region.size > base_size
        {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }

        let master_hash_storage: VirtualFile = Arc::new(VecStorage::new(
            sha256_data.fs_data_master_hash.0 .0.to_vec(),
        ));

        let storage = HierarchicalSha256Storage::new(
            [
                master_hash_storage,
                slice_of(&base_storage, hash_region.offset, hash_region.size)?,
                slice_of(&base_storage, data_region.offset, data_region.size)?,
            ],
            sha256_data.hash_block_size as u32,
        )
        .context(StorageSnafu)?;

        Ok(Arc::new(storage))
    }

    fn create_integrity_verification_storage(
        &self,
        base_storage: VirtualFile,
        meta_info: &IntegrityMetaInfo,
    ) -> Result<VirtualFile, NcaError> {
        self.create_integrity_verification_storage_impl(&base_storage, meta_info, 0)
    }

    fn create_integrity_verification_storage_impl(
        &self,
        base_storage: &VirtualFile,
        meta_info: &IntegrityMetaInfo,
        layer_info_offset: u64,
    ) -> Result<VirtualFile, NcaError> {
        let level_hash_info = &meta_info.level_hash_info;

        if !(INTEGRITY_MIN_LAYER_COUNT..=INTEGRITY_MAX_LAYER_COUNT)
            .contains(&level_hash_info.max_layers)
        {
            return Err(NcaError::InvalidNcaHierarchicalIntegrityVerificationLayerCount);
        }

        let base_storage_size = base_storage.get_size();
        let mut storage_info = HierarchicalStorageInformation::default();

        for i in 0..level_hash_info.max_layers as usize - 2 {
            let layer_info = level_hash_info.layers[i];
            if layer_info_offset + layer_info.offset + layer_info.size > base_storage_size {
                return Err(NcaError::NcaBaseStorageOutOfRange);
            }

            storage_info.set_layer_hash_storage(
                i + 1,
                slice_of(
                    base_storage,
                    layer_info_offset + layer_info.offset,
                    layer_info.size,
                )?,
            );
        }

        // The data layer sits at the front when the layer info region was
        // relocated (the patch/sparse meta case).
        let layer_info = level_hash_info.layers[level_hash_info.max_layers as usize - 2];
        let last_layer_info_offset = if layer_info_offset > 0 {
            0
        } else {
            layer_info.offset
        };
        if last_layer_info_offset + layer_info.size > base_storage_size {
            return Err(NcaError::NcaBaseStorageOutOfRange);
        }
        if layer_info_offset > 0 && last_layer_info_offset + layer_info.size > layer_info_offset {
            return Err(NcaError::InvalidIntegrityLayerInfoOffset);
        }
        storage_info.set_data_storage(slice_of(
            base_storage,
            last_layer_info_offset,
            layer_info.size,
        )?);

        let storage = HierarchicalIntegrityVerificationStorage::with_master_hash(
            level_hash_info,
            meta_info.master_hash.0 .0,
            storage_info,
        )
        .context(StorageSnafu)?;

        Ok(Arc::new(storage))
    }

    fn create_region_switch_storage(
        &self,
        header_reader: &NcaFsHeaderReader,
        inside_storage: VirtualFile,
        outside_storage: VirtualFile,
    ) -> Result<VirtualFile, NcaError> {
        // Skip-layer-hash encryption leaves the hash layers (everything in
        // front of the hash target) in the clear.
        let region = crate::storage::Region {
            offset: 0,
            size: header_reader.get_hash_target_offset()?,
        };

        Ok(Arc::new(RegionSwitchStorage::new(
            inside_storage,
            outside_storage,
            region,
        )))
    }

    fn create_compressed_storage(
        &self,
        base_storage: VirtualFile,
        compression_info: &NcaCompressionInfo,
    ) -> Result<VirtualFile, NcaError> {
        let header =
            BucketTreeHeader::parse(&compression_info.bucket.header.0).context(StorageSnafu)?;

        let table_offset = compression_info.bucket.offset;
        let table_size = compression_info.bucket.size;
        let node_size = CompressedStorage::query_node_storage_size(header.entry_count);
        let entry_size = CompressedStorage::query_entry_storage_size(header.entry_count);
        if node_size + entry_size > table_size {
            return Err(NcaError::InvalidCompressedStorageSize);
        }

        let storage = CompressedStorage::new(
            slice_of(&base_storage, 0, table_offset)?,
            slice_of(&base_storage, table_offset, node_size)?,
            slice_of(&base_storage, table_offset + node_size, entry_size)?,
            header.entry_count,
            COMPRESSED_BLOCK_SIZE_MAX,
            COMPRESSED_CONTINUOUS_READING_SIZE_MAX,
            self.reader.get_decompressor(),
            COMPRESSED_CACHE_SIZE_0,
            COMPRESSED_CACHE_SIZE_1,
            COMPRESSED_MAX_CACHE_ENTRIES,
        )
        .context(StorageSnafu)?;

        Ok(Arc::new(storage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keyset::{KeyAreaKeyIndex, KeySet};
    use crate::crypto::EncryptedAesKey;
    use crate::fssystem::bucket_tree::test_fixture::build_tree_bytes;
    use crate::fssystem::nca_reader::NcaReader;
    use crate::storage::{ReadableStorage, VecStorage};
    use digest::Digest;

    const SECTION_START: usize = 0x1000;
    const SECTION_START_SECTOR: u32 = 8;

    fn test_key_set() -> KeySet {
        KeySet::from_file_contents(
            "header_key = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\n\
             key_area_key_application_00 = 00112233445566778899aabbccddeeff\n",
            "",
        )
        .unwrap()
    }

    /// The CTR key the reader will derive from an all-zero key area.
    fn derived_ctr_key() -> AesKey {
        test_key_set()
            .key_area_key(0, KeyAreaKeyIndex::Application)
            .unwrap()
            .decrypt_key(EncryptedAesKey::default())
    }

    /// Builds a plaintext-header NCA3 whose section 0 holds `body`, with
    /// the FS header customized by `edit_fs_header`.
    fn build_nca(body: &[u8], edit_fs_header: impl FnOnce(&mut [u8])) -> Vec<u8> {
        assert_eq!(body.len() % 0x200, 0);
        let mut image = vec![0u8; SECTION_START + body.len()];

        {
            let fs = &mut image[NCA_HEADER_SIZE..NCA_HEADER_SIZE + FS_HEADER_SIZE];
            fs[0..2].copy_from_slice(&2u16.to_le_bytes());
            fs[2] = 0; // RomFs
            fs[3] = 1; // hash None
            fs[4] = 1; // encryption None
            edit_fs_header(fs);
        }
        let fs_header_hash: [u8; 0x20] =
            sha2::Sha256::digest(&image[NCA_HEADER_SIZE..NCA_HEADER_SIZE + FS_HEADER_SIZE]).into();

        {
            let header = &mut image[..NCA_HEADER_SIZE];
            header[0x200..0x204].copy_from_slice(b"NCA3");
            header[0x205] = 4; // Data content
            header[0x21C..0x220].copy_from_slice(&0x000B0000u32.to_le_bytes());
            header[0x240..0x244].copy_from_slice(&SECTION_START_SECTOR.to_le_bytes());
            let end_sector = SECTION_START_SECTOR + (body.len() as u32 / 0x200);
            header[0x244..0x248].copy_from_slice(&end_sector.to_le_bytes());
            header[0x280..0x2A0].copy_from_slice(&fs_header_hash);
        }

        image[SECTION_START..].copy_from_slice(body);
        image
    }

    fn driver_for(image: Vec<u8>) -> NcaFileSystemDriver {
        let reader =
            NcaReader::new(Arc::new(VecStorage::new(image)), &test_key_set()).unwrap();
        NcaFileSystemDriver::new(Arc::new(reader))
    }

    fn write_sha256_hash_data(fs: &mut [u8], data_offset: u64, data_size: u64) {
        fs[3] = 2; // HierarchicalSha256Hash
        fs[0x28..0x2C].copy_from_slice(&0x1000i32.to_le_bytes());
        fs[0x2C..0x30].copy_from_slice(&2i32.to_le_bytes());
        // hash layer region
        fs[0x30..0x38].copy_from_slice(&0u64.to_le_bytes());
        fs[0x38..0x40].copy_from_slice(&0x20u64.to_le_bytes());
        // data layer region
        fs[0x40..0x48].copy_from_slice(&data_offset.to_le_bytes());
        fs[0x48..0x50].copy_from_slice(&data_size.to_le_bytes());
    }

    #[test]
    fn raw_storage_of_a_plain_section() {
        let body: Vec<u8> = (0..0x400u32).flat_map(|x| (x as u16).to_le_bytes()).collect();
        let driver = driver_for(build_nca(&body, |_| {}));

        let (storage, header_reader) = driver.open_raw_storage(0).unwrap();
        assert_eq!(header_reader.get_fs_type(), FsType::RomFs);
        assert_eq!(storage.get_size(), body.len() as u64);
        assert_eq!(storage.read_all().unwrap(), body);
    }

    #[test]
    fn plain_hash_type_cannot_compose_a_full_storage() {
        let driver = driver_for(build_nca(&[0; 0x400], |_| {}));
        assert!(matches!(
            driver.open_storage(0),
            Err(NcaError::InvalidNcaFsHeaderHashType)
        ));
    }

    #[test]
    fn missing_sections_report_partition_not_found() {
        let driver = driver_for(build_nca(&[0; 0x200], |_| {}));
        assert!(matches!(
            driver.open_storage(1),
            Err(NcaError::PartitionNotFound { index: 1 })
        ));
    }

    #[test]
    fn sha256_section_exposes_the_data_region() {
        // section: one hash at [0, 0x20), data at [0x1000, 0x1200)
        let mut body = vec![0u8; 0x1200];
        let data: Vec<u8> = (0..0x200u32).map(|x| (x % 251) as u8).collect();
        body[0x1000..].copy_from_slice(&data);

        let driver = driver_for(build_nca(&body, |fs| {
            write_sha256_hash_data(fs, 0x1000, 0x200);
        }));

        let (storage, _) = driver.open_storage(0).unwrap();
        assert_eq!(storage.get_size(), 0x200);
        assert_eq!(storage.read_all().unwrap(), data);
    }

    #[test]
    fn aes_ctr_section_decrypts_through_the_composed_chain() {
        let upper_iv = 0x00000001_00000002u64;

        let mut body = vec![0u8; 0x1200];
        let data: Vec<u8> = (0..0x200u32).map(|x| (x * 3) as u8).collect();
        body[0x1000..].copy_from_slice(&data);

        // encrypt the whole section with the key the reader will derive
        let iv = AesCtrStorage::<VirtualFile>::make_iv(upper_iv, SECTION_START as u64);
        derived_ctr_key().apply_ctr(&mut body, &iv);

        let driver = driver_for(build_nca(&body, |fs| {
            fs[4] = 3; // AesCtr
            fs[0x140..0x148].copy_from_slice(&upper_iv.to_le_bytes());
            write_sha256_hash_data(fs, 0x1000, 0x200);
        }));

        let (storage, _) = driver.open_storage(0).unwrap();
        assert_eq!(storage.read_all().unwrap(), data);

        // an unaligned read goes through the alignment-matching shim
        let mut buf = [0; 7];
        storage.read_exact(0x33, &mut buf).unwrap();
        assert_eq!(&buf, &data[0x33..0x3A]);
    }

    #[test]
    fn empty_sparse_section_reads_as_zeros() {
        let driver = driver_for(build_nca(&[0xAA; 0x400], |fs| {
            // sparse bucket header: BKTR v1 with no entries
            fs[0x158..0x15C].copy_from_slice(b"BKTR");
            fs[0x15C..0x160].copy_from_slice(&1u32.to_le_bytes());
            // generation marks the sparse layer as present
            fs[0x170..0x172].copy_from_slice(&1u16.to_le_bytes());
        }));

        let (storage, header_reader) = driver.open_storage(0).unwrap();
        assert!(header_reader.exists_sparse_layer());
        assert_eq!(storage.get_size(), 0x400);
        assert!(storage.read_all().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn indirect_section_overlays_patch_data_onto_the_original() {
        // section: patch bytes at [0, 0x800), indirect table at 0x800
        let entries = [
            {
                let mut e = Vec::new();
                e.extend_from_slice(&0u64.to_le_bytes());
                e.extend_from_slice(&0u64.to_le_bytes());
                e.extend_from_slice(&0i32.to_le_bytes());
                e
            },
            {
                let mut e = Vec::new();
                e.extend_from_slice(&0x800u64.to_le_bytes());
                e.extend_from_slice(&0u64.to_le_bytes());
                e.extend_from_slice(&1i32.to_le_bytes());
                e
            },
        ];
        let (node_bytes, entry_bytes) = build_tree_bytes(
            &entries,
            IndirectStorage::ENTRY_SIZE,
            IndirectStorage::NODE_SIZE,
            0x1000,
        );

        let indirect_offset = 0x800u64;
        let indirect_size = (node_bytes.len() + entry_bytes.len()) as u64;

        let mut body = vec![0u8; (indirect_offset as usize + node_bytes.len() + entry_bytes.len())
            .next_multiple_of(0x200)];
        body[..0x800].fill(b'B');
        body[0x800..0x800 + node_bytes.len()].copy_from_slice(&node_bytes);
        body[0x800 + node_bytes.len()..0x800 + node_bytes.len() + entry_bytes.len()]
            .copy_from_slice(&entry_bytes);

        let image = build_nca(&body, |fs| {
            fs[0x100..0x108].copy_from_slice(&indirect_offset.to_le_bytes());
            fs[0x108..0x110].copy_from_slice(&indirect_size.to_le_bytes());
            fs[0x110..0x114].copy_from_slice(b"BKTR");
            fs[0x114..0x118].copy_from_slice(&1u32.to_le_bytes());
            fs[0x118..0x11C].copy_from_slice(&2i32.to_le_bytes());
        });

        let reader =
            NcaReader::new(Arc::new(VecStorage::new(image)), &test_key_set()).unwrap();
        let mut driver = NcaFileSystemDriver::new(Arc::new(reader));
        driver.set_external_original_storage(Arc::new(VecStorage::new(vec![b'A'; 0x1000])));

        let (storage, _) = driver.open_raw_storage(0).unwrap();
        assert_eq!(storage.get_size(), 0x1000);

        let mut buf = vec![0; 0x1000];
        storage.read_exact(0, &mut buf).unwrap();
        assert_eq!(&buf[..0x800], &vec![b'A'; 0x800][..]);
        assert_eq!(&buf[0x800..], &vec![b'B'; 0x800][..]);
    }
}
