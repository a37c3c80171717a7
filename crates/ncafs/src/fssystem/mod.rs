//! The NCA read pipeline: header parsing, key derivation, and the layered
//! storages (decryption, sparse, indirect, hash, compression) composed over
//! a raw content archive.

mod aes_ctr_ex_storage;
mod aes_ctr_storage;
mod aes_xts_storage;
pub mod bucket_tree;
mod compressed_storage;
pub mod compression;
mod hierarchical_integrity_verification_storage;
mod hierarchical_sha256_storage;
mod indirect_storage;
mod integrity_verification_storage;
mod nca_driver;
pub mod nca_header;
mod nca_reader;
mod sparse_storage;

pub use aes_ctr_ex_storage::{AesCtrCounterExtendedStorage, AesCtrExEntry, AesCtrUpperIv};
pub use aes_ctr_storage::AesCtrStorage;
pub use aes_xts_storage::AesXtsStorage;
pub use compressed_storage::{CompressedEntry, CompressedStorage};
pub use hierarchical_integrity_verification_storage::{
    HierarchicalIntegrityVerificationInformation, HierarchicalIntegrityVerificationStorage,
    HierarchicalStorageInformation, IntegrityLevelInformation, INTEGRITY_MAX_LAYER_COUNT,
    INTEGRITY_MIN_LAYER_COUNT,
};
pub use hierarchical_sha256_storage::HierarchicalSha256Storage;
pub use indirect_storage::{IndirectEntry, IndirectStorage};
pub use integrity_verification_storage::IntegrityVerificationStorage;
pub use nca_driver::NcaFileSystemDriver;
pub use nca_reader::{
    HeaderEncryptionType, NcaCryptoConfiguration, NcaFsHeaderReader, NcaReader, VerifySign1Fn,
};
pub use sparse_storage::SparseStorage;

use crate::crypto::keyset::{MissingKeyError, MissingTitleKeyError};
use crate::storage::StorageError;
use snafu::Snafu;

/// Errors produced while opening an NCA or composing a section storage.
#[derive(Snafu, Debug)]
pub enum NcaError {
    /// NCA: failed to read from the base storage
    Storage { source: StorageError },
    /// NCA: the header magic is not a supported NCA magic
    InvalidNcaSignature,
    /// NCA: the header is structurally invalid
    InvalidNcaHeader,
    /// NCA: failed to parse the NCA header
    NcaHeaderParsing { source: binrw::Error },
    /// NCA: the NCA version or SDK version is unsupported
    UnsupportedSdkVersion,
    /// NCA: invalid key area encryption key index {index}
    InvalidNcaKeyIndex { index: u8 },
    /// NCA: missing a key from the key manager
    MissingKey { source: MissingKeyError },
    /// NCA: missing the title key for a rights id
    MissingTitleKey { source: MissingTitleKeyError },
    /// NCA: section {index} does not exist
    PartitionNotFound { index: usize },
    /// NCA: failed to parse the FS header for section {index}
    FsHeaderParsing { index: usize, source: binrw::Error },
    /// NCA: FS header hash mismatch for section {index}
    FsHeaderHashMismatch { index: usize },
    /// NCA: the FS header is structurally invalid
    InvalidNcaFsHeader,
    /// NCA: unsupported FS header encryption type
    InvalidNcaFsHeaderEncryptionType,
    /// NCA: unsupported FS header hash type
    InvalidNcaFsHeaderHashType,
    /// NCA: a section extent escapes the base storage
    NcaBaseStorageOutOfRange,
    /// NCA: invalid patch info indirect table size
    InvalidNcaPatchInfoIndirectSize,
    /// NCA: invalid patch info AES-CTR-Ex table size
    InvalidNcaPatchInfoAesCtrExSize,
    /// NCA: invalid patch info AES-CTR-Ex table offset
    InvalidNcaPatchInfoAesCtrExOffset,
    /// NCA: the indirect table escapes its patch info extent
    InvalidNcaIndirectStorageOutOfRange,
    /// NCA: invalid hierarchical sha256 hash block size
    InvalidHierarchicalSha256BlockSize,
    /// NCA: invalid hierarchical sha256 layer count
    InvalidHierarchicalSha256LayerCount,
    /// NCA: invalid hierarchical integrity verification layer count
    InvalidNcaHierarchicalIntegrityVerificationLayerCount,
    /// NCA: invalid meta data hash data size
    InvalidNcaMetaDataHashDataSize,
    /// NCA: meta data hash data hash mismatch
    InvalidNcaMetaDataHashDataHash,
    /// NCA: invalid patch meta data hash type
    InvalidPatchMetaDataHashType,
    /// NCA: invalid patch meta data hash data size
    InvalidPatchMetaDataHashDataSize,
    /// NCA: patch meta data hash data hash mismatch
    InvalidPatchMetaDataHashDataHash,
    /// NCA: invalid patch meta data hash data offset
    InvalidPatchMetaDataHashDataOffset,
    /// NCA: invalid sparse meta data hash type
    InvalidSparseMetaDataHashType,
    /// NCA: invalid sparse meta data hash data size
    InvalidSparseMetaDataHashDataSize,
    /// NCA: sparse meta data hash data hash mismatch
    InvalidSparseMetaDataHashDataHash,
    /// NCA: invalid sparse meta data hash data offset
    InvalidSparseMetaDataHashDataOffset,
    /// NCA: invalid integrity layer info offset
    InvalidIntegrityLayerInfoOffset,
    /// NCA: the compression table escapes its bucket extent
    InvalidCompressedStorageSize,
}
