use crate::crypto::keyset::{KeyAreaKeyIndex, KeySet};
use crate::crypto::{AesKey, AesXtsKey};
use crate::fssystem::aes_xts_storage::AesXtsStorage;
use crate::fssystem::compression::GetDecompressorFunction;
use crate::fssystem::nca_header::*;
use crate::fssystem::{
    FsHeaderHashMismatchSnafu, FsHeaderParsingSnafu, MissingKeySnafu, NcaError,
    NcaHeaderParsingSnafu, StorageSnafu,
};
use crate::ids::{ProgramId, RightsId};
use crate::storage::{
    ReadableStorage, ReadableStorageExt, SliceStorage, StorageError, VirtualFile,
};
use binrw::BinRead;
use snafu::ResultExt;
use std::io::Cursor;
use std::sync::Arc;
use tracing::warn;

const SDK_ADDON_VERSION_MIN: u32 = 0x000B_0000;
const KEY_AREA_KEY_INDEX_ZERO_KEY: u8 = 0xFF;
const AES_128_KEY_SIZE: usize = 0x10;

/// Callback verifying the fixed-key header signature:
/// `(signature, signed_message, key_generation) -> valid`.
pub type VerifySign1Fn = fn(&[u8], &[u8], u8) -> bool;

/// Hooks controlling how the reader handles header crypto.
#[derive(Clone, Copy)]
pub struct NcaCryptoConfiguration {
    /// Optional header-signature check. An invalid signature is recorded
    /// and logged but never aborts loading.
    pub verify_sign1: Option<VerifySign1Fn>,
    /// Accept NCAs whose header (and sections) are already decrypted.
    pub is_plaintext_header_available: bool,
    pub is_available_sw_key: bool,
}

impl Default for NcaCryptoConfiguration {
    fn default() -> Self {
        Self {
            verify_sign1: None,
            is_plaintext_header_available: true,
            is_available_sw_key: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncryptionType {
    AesXts,
    None,
}

fn check_nca_magic(magic: [u8; 4]) -> Result<(), NcaError> {
    // The deprecated formats get their own error.
    if magic == NCA0_MAGIC || magic == NCA1_MAGIC || magic == NCA2_MAGIC {
        return Err(NcaError::UnsupportedSdkVersion);
    }
    if magic != NCA3_MAGIC {
        return Err(NcaError::InvalidNcaSignature);
    }
    Ok(())
}

/// Parses the 1 KiB NCA header, derives the per-section decryption keys,
/// and hands out the decrypted header and shared body storages.
pub struct NcaReader {
    header: NcaHeader,
    decryption_keys: [AesKey; DECRYPTION_KEY_COUNT],
    body_storage: VirtualFile,
    header_storage: VirtualFile,
    external_decryption_key: AesKey,
    is_available_sw_key: bool,
    header_encryption_type: HeaderEncryptionType,
    is_header_sign1_valid: bool,
    get_decompressor: GetDecompressorFunction,
}

impl NcaReader {
    /// Opens an NCA with the standard crypto configuration and the
    /// standard decompressor registry.
    pub fn new(
        base_storage: VirtualFile,
        key_set: &KeySet,
    ) -> Result<Self, NcaError> {
        Self::with_configuration(
            base_storage,
            key_set,
            &NcaCryptoConfiguration::default(),
            crate::fssystem::compression::standard_get_decompressor,
        )
    }

    pub fn with_configuration(
        base_storage: VirtualFile,
        key_set: &KeySet,
        crypto_cfg: &NcaCryptoConfiguration,
        get_decompressor: GetDecompressorFunction,
    ) -> Result<Self, NcaError> {
        let header_key = match key_set.header_key() {
            Ok(key) => Some(key),
            Err(_) if crypto_cfg.is_plaintext_header_available => None,
            Err(source) => return Err(NcaError::MissingKey { source }),
        };

        // Read the header through the XTS layer, falling back to a
        // plaintext header when the magic does not come out right.
        let mut header_encryption_type = HeaderEncryptionType::AesXts;
        let mut raw_header = [0; NCA_HEADER_SIZE];

        let decrypted_magic = if let Some(header_key) = header_key {
            let header_storage = Self::make_header_storage(&base_storage, header_key)?;
            header_storage
                .read_exact(0, &mut raw_header)
                .context(StorageSnafu)?;
            let magic: [u8; 4] = raw_header[0x200..0x204].try_into().unwrap();
            check_nca_magic(magic)
        } else {
            Err(NcaError::InvalidNcaSignature)
        };

        if let Err(magic_error) = decrypted_magic {
            if !crypto_cfg.is_plaintext_header_available {
                return Err(magic_error);
            }

            base_storage
                .read_exact(0, &mut raw_header)
                .context(StorageSnafu)?;
            let magic: [u8; 4] = raw_header[0x200..0x204].try_into().unwrap();
            match check_nca_magic(magic) {
                Ok(()) => {}
                // a deprecated magic in the plaintext bytes names the
                // real problem better than the garbage decryption did
                Err(NcaError::UnsupportedSdkVersion) => {
                    return Err(NcaError::UnsupportedSdkVersion)
                }
                Err(_) => return Err(magic_error),
            }

            header_encryption_type = HeaderEncryptionType::None;
        }

        let header =
            NcaHeader::read(&mut Cursor::new(&raw_header[..])).context(NcaHeaderParsingSnafu)?;

        // Verify header sign1 when a verifier is configured; the result is
        // recorded but does not abort loading.
        let mut is_header_sign1_valid = true;
        if let Some(verify_sign1) = crypto_cfg.verify_sign1 {
            let signed_message = &raw_header[2 * HEADER_SIGN_SIZE..];
            is_header_sign1_valid = verify_sign1(
                &header.header_sign_1.0 .0,
                signed_message,
                header.header1_signature_key_generation,
            );
            if !is_header_sign1_valid {
                warn!("invalid NCA header sign1");
            }
        }

        if header.sdk_addon_version < SDK_ADDON_VERSION_MIN {
            return Err(NcaError::UnsupportedSdkVersion);
        }

        if header.key_index >= crate::crypto::keyset::KEY_AREA_ENCRYPTION_KEY_INDEX_COUNT
            && header.key_index != KEY_AREA_KEY_INDEX_ZERO_KEY
        {
            return Err(NcaError::InvalidNcaKeyIndex {
                index: header.key_index,
            });
        }

        // Without a rights id the section keys come from the key area;
        // otherwise they stay zero until an external key is installed.
        let mut decryption_keys = [AesKey::default(); DECRYPTION_KEY_COUNT];
        if header.rights_id.is_empty() && header.key_index != KEY_AREA_KEY_INDEX_ZERO_KEY {
            let master_key_id = std::cmp::max(header.proper_key_generation(), 1) - 1;
            let key_index = KeyAreaKeyIndex::from_raw(header.key_index)
                .expect("BUG: key index validated above");
            let key_area_key = key_set
                .key_area_key(master_key_id, key_index)
                .context(MissingKeySnafu)?;

            for slot in [
                DecryptionKey::AesXts1,
                DecryptionKey::AesXts2,
                DecryptionKey::AesCtr,
                DecryptionKey::AesCtrEx,
            ] {
                let at = slot as usize * AES_128_KEY_SIZE;
                let encrypted: [u8; AES_128_KEY_SIZE] =
                    header.encrypted_key_area.0[at..at + AES_128_KEY_SIZE]
                        .try_into()
                        .unwrap();
                decryption_keys[slot as usize] = key_area_key.decrypt_key(encrypted.into());
            }

            // The hardware-speed-emulation key is carried unwrapped.
            let at = DecryptionKey::AesCtrHw as usize * AES_128_KEY_SIZE;
            let hw_key: [u8; AES_128_KEY_SIZE] = header.encrypted_key_area.0
                [at..at + AES_128_KEY_SIZE]
                .try_into()
                .unwrap();
            decryption_keys[DecryptionKey::AesCtrHw as usize] = hw_key.into();
        }

        let header_storage: VirtualFile = match header_encryption_type {
            HeaderEncryptionType::AesXts => Self::make_header_storage(
                &base_storage,
                header_key.expect("BUG: encrypted header without a header key"),
            )?,
            HeaderEncryptionType::None => base_storage.clone(),
        };

        Ok(Self {
            header,
            decryption_keys,
            body_storage: base_storage,
            header_storage,
            external_decryption_key: AesKey::default(),
            is_available_sw_key: crypto_cfg.is_available_sw_key,
            header_encryption_type,
            is_header_sign1_valid,
            get_decompressor,
        })
    }

    fn make_header_storage(
        base_storage: &VirtualFile,
        header_key: AesXtsKey,
    ) -> Result<VirtualFile, NcaError> {
        let header_region = std::cmp::min(ALL_HEADERS_SIZE as u64, base_storage.get_size());
        let slice = SliceStorage::new(base_storage.clone(), 0, header_region)
            .map_err(|_| NcaError::InvalidNcaHeader)?;
        Ok(Arc::new(AesXtsStorage::new(
            slice,
            header_key,
            HEADER_XTS_BLOCK_SIZE,
            0,
        )))
    }

    /// The raw NCA body, shared by every section derived from this reader.
    pub fn get_shared_body_storage(&self) -> VirtualFile {
        self.body_storage.clone()
    }

    pub fn get_magic(&self) -> [u8; 4] {
        self.header.magic
    }

    pub fn get_distribution_type(&self) -> DistributionType {
        self.header.distribution_type
    }

    pub fn get_content_type(&self) -> NcaContentType {
        self.header.content_type
    }

    pub fn get_header_sign1_key_generation(&self) -> u8 {
        self.header.header1_signature_key_generation
    }

    pub fn get_key_generation(&self) -> u8 {
        self.header.proper_key_generation()
    }

    pub fn get_key_index(&self) -> u8 {
        self.header.key_index
    }

    pub fn get_content_size(&self) -> u64 {
        self.header.content_size
    }

    pub fn get_program_id(&self) -> ProgramId {
        self.header.program_id
    }

    pub fn get_content_index(&self) -> u32 {
        self.header.content_index
    }

    pub fn get_sdk_addon_version(&self) -> u32 {
        self.header.sdk_addon_version
    }

    pub fn get_rights_id(&self) -> RightsId {
        self.header.rights_id
    }

    pub fn has_fs_info(&self, index: usize) -> bool {
        debug_assert!(index < FS_COUNT_MAX);
        self.header.fs_info[index].start_sector != 0 || self.header.fs_info[index].end_sector != 0
    }

    pub fn get_fs_count(&self) -> usize {
        (0..FS_COUNT_MAX)
            .find(|&i| !self.has_fs_info(i))
            .unwrap_or(FS_COUNT_MAX)
    }

    pub fn get_fs_header_hash(&self, index: usize) -> Sha256Hash {
        debug_assert!(index < FS_COUNT_MAX);
        self.header.fs_header_hash[index]
    }

    pub fn get_fs_info(&self, index: usize) -> FsInfo {
        debug_assert!(index < FS_COUNT_MAX);
        self.header.fs_info[index]
    }

    pub fn get_fs_offset(&self, index: usize) -> u64 {
        sector_to_byte(self.header.fs_info[index].start_sector)
    }

    pub fn get_fs_end_offset(&self, index: usize) -> u64 {
        sector_to_byte(self.header.fs_info[index].end_sector)
    }

    pub fn get_fs_size(&self, index: usize) -> u64 {
        self.get_fs_end_offset(index) - self.get_fs_offset(index)
    }

    pub fn get_encrypted_key_area(&self) -> &[u8] {
        &self.header.encrypted_key_area.0
    }

    pub fn get_decryption_key(&self, key: DecryptionKey) -> AesKey {
        self.decryption_keys[key as usize]
    }

    pub fn has_valid_internal_key(&self) -> bool {
        self.header
            .encrypted_key_area
            .0
            .chunks_exact(AES_128_KEY_SIZE)
            .take(DECRYPTION_KEY_COUNT)
            .any(|chunk| chunk.iter().any(|&b| b != 0))
    }

    pub fn has_internal_decryption_key_for_aes_hw(&self) -> bool {
        !self.decryption_keys[DecryptionKey::AesCtrHw as usize].is_zero()
    }

    pub fn is_available_sw_key(&self) -> bool {
        self.is_available_sw_key
    }

    pub fn has_external_decryption_key(&self) -> bool {
        !self.external_decryption_key.is_zero()
    }

    pub fn get_external_decryption_key(&self) -> AesKey {
        self.external_decryption_key
    }

    /// Installs the unwrapped titlekey for a rights-id NCA. Must happen
    /// before section storages are opened.
    pub fn set_external_decryption_key(&mut self, key: AesKey) {
        self.external_decryption_key = key;
    }

    pub fn get_header_encryption_type(&self) -> HeaderEncryptionType {
        self.header_encryption_type
    }

    pub fn get_header_sign1_valid(&self) -> bool {
        self.is_header_sign1_valid
    }

    pub fn get_header_sign2(&self) -> &[u8] {
        &self.header.header_sign_2.0 .0
    }

    pub fn get_decompressor(&self) -> GetDecompressorFunction {
        self.get_decompressor
    }

    /// Reads the raw (decrypted) FS header bytes for a section.
    fn read_fs_header_bytes(&self, index: usize) -> Result<[u8; FS_HEADER_SIZE], StorageError> {
        let mut raw = [0; FS_HEADER_SIZE];
        let offset = NCA_HEADER_SIZE as u64 + (FS_HEADER_SIZE * index) as u64;
        self.header_storage.read_exact(offset, &mut raw)?;
        Ok(raw)
    }
}

/// Caches one section's FS header and exposes its composition predicates.
#[derive(Debug)]
pub struct NcaFsHeaderReader {
    data: NcaFsHeader,
    fs_index: usize,
}

impl NcaFsHeaderReader {
    pub fn new(reader: &NcaReader, index: usize) -> Result<Self, NcaError> {
        debug_assert!(index < FS_COUNT_MAX);

        let raw = reader.read_fs_header_bytes(index).context(StorageSnafu)?;

        // The NCA header pins each FS header with a SHA-256.
        reader
            .get_fs_header_hash(index)
            .verify(&raw)
            .map_err(|_| FsHeaderHashMismatchSnafu { index }.build())?;

        let data = NcaFsHeader::read(&mut Cursor::new(&raw[..]))
            .context(FsHeaderParsingSnafu { index })?;

        Ok(Self {
            data,
            fs_index: index,
        })
    }

    pub fn get_fs_index(&self) -> usize {
        self.fs_index
    }

    pub fn get_version(&self) -> u16 {
        self.data.version
    }

    pub fn get_fs_type(&self) -> FsType {
        self.data.fs_type
    }

    pub fn get_hash_type(&self) -> NcaFsHeaderHashType {
        self.data.hash_type
    }

    pub fn get_encryption_type(&self) -> NcaFsHeaderEncryptionType {
        self.data.encryption_type
    }

    pub fn get_hash_data(&self) -> &HashData {
        &self.data.hash_data
    }

    pub fn get_patch_info(&self) -> &NcaPatchInfo {
        &self.data.patch_info
    }

    pub fn get_aes_ctr_upper_iv(&self) -> crate::fssystem::AesCtrUpperIv {
        self.data.aes_ctr_upper_iv
    }

    pub fn is_skip_layer_hash_encryption(&self) -> bool {
        self.data.is_skip_layer_hash_encryption()
    }

    pub fn get_hash_target_offset(&self) -> Result<u64, NcaError> {
        self.data
            .get_hash_target_offset()
            .ok_or(NcaError::InvalidNcaFsHeader)
    }

    pub fn exists_sparse_layer(&self) -> bool {
        self.data.sparse_info.generation != 0
    }

    pub fn get_sparse_info(&self) -> &NcaSparseInfo {
        &self.data.sparse_info
    }

    pub fn exists_compression_layer(&self) -> bool {
        self.data.compression_info.bucket.offset != 0 && self.data.compression_info.bucket.size != 0
    }

    pub fn get_compression_info(&self) -> &NcaCompressionInfo {
        &self.data.compression_info
    }

    pub fn exists_patch_meta_hash_layer(&self) -> bool {
        self.data.meta_data_hash_data_info.size != 0 && self.data.patch_info.has_indirect_table()
    }

    pub fn exists_sparse_meta_hash_layer(&self) -> bool {
        self.data.meta_data_hash_data_info.size != 0 && self.exists_sparse_layer()
    }

    pub fn get_meta_data_hash_type(&self) -> MetaDataHashType {
        self.data.meta_data_hash_type
    }

    pub fn get_meta_data_hash_data_info(&self) -> &NcaMetaDataHashDataInfo {
        &self.data.meta_data_hash_data_info
    }
}

#[cfg(test)]
pub(crate) mod test_fixture {
    use super::*;
    use crate::storage::VecStorage;
    use digest::Digest;

    /// A minimal plaintext NCA3 image: header, one RomFs/AesCtr section
    /// descriptor, and a body. The FS-header hash is filled in.
    pub fn build_plaintext_nca(body: &[u8]) -> Vec<u8> {
        let body_start_sector = 8u32; // 0x1000
        let mut image = vec![0u8; 0x1000 + body.len()];

        // FS header for section 0
        let fs_header_at = NCA_HEADER_SIZE;
        {
            let fs = &mut image[fs_header_at..fs_header_at + FS_HEADER_SIZE];
            fs[0..2].copy_from_slice(&2u16.to_le_bytes());
            fs[2] = 0; // RomFs
            fs[3] = 1; // hash type None
            fs[4] = 1; // encryption None
        }
        let fs_header_hash: [u8; 0x20] =
            sha2::Sha256::digest(&image[fs_header_at..fs_header_at + FS_HEADER_SIZE]).into();

        {
            let header = &mut image[..NCA_HEADER_SIZE];
            header[0x200..0x204].copy_from_slice(b"NCA3");
            header[0x205] = 4; // Data content
            header[0x207] = 0; // application key area
            header[0x21C..0x220].copy_from_slice(&SDK_ADDON_VERSION_MIN.to_le_bytes());
            // section 0 sectors
            header[0x240..0x244].copy_from_slice(&body_start_sector.to_le_bytes());
            let end_sector = body_start_sector + (body.len() as u32).div_ceil(0x200);
            header[0x244..0x248].copy_from_slice(&end_sector.to_le_bytes());
            header[0x280..0x2A0].copy_from_slice(&fs_header_hash);
        }

        image[0x1000..].copy_from_slice(body);
        image
    }

    pub fn storage_of(image: Vec<u8>) -> VirtualFile {
        Arc::new(VecStorage::new(image))
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixture::{build_plaintext_nca, storage_of};
    use super::*;

    fn test_key_set() -> KeySet {
        KeySet::from_file_contents(
            "header_key = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\n\
             key_area_key_application_00 = 00112233445566778899aabbccddeeff\n",
            "",
        )
        .unwrap()
    }

    #[test]
    fn accepts_a_plaintext_nca3() {
        let image = build_plaintext_nca(&[0xAB; 0x400]);
        let reader = NcaReader::new(storage_of(image), &test_key_set()).unwrap();

        assert_eq!(reader.get_magic(), *b"NCA3");
        assert_eq!(
            reader.get_header_encryption_type(),
            HeaderEncryptionType::None
        );
        assert_eq!(reader.get_content_type(), NcaContentType::Data);
        assert_eq!(reader.get_fs_count(), 1);
        assert!(reader.has_fs_info(0));
        assert!(!reader.has_fs_info(1));
        assert_eq!(reader.get_fs_offset(0), 0x1000);
        assert_eq!(reader.get_fs_size(0), 0x400);
        assert!(reader.get_rights_id().is_empty());

        let fs_header = NcaFsHeaderReader::new(&reader, 0).unwrap();
        assert_eq!(fs_header.get_fs_type(), FsType::RomFs);
        assert_eq!(fs_header.get_hash_type(), NcaFsHeaderHashType::None);
        assert!(!fs_header.exists_sparse_layer());
        assert!(!fs_header.exists_compression_layer());
    }

    #[test]
    fn accepts_an_xts_encrypted_header() {
        let key_set = test_key_set();
        let mut image = build_plaintext_nca(&[0; 0x200]);

        // encrypt the 0xC00 header region in place
        key_set
            .header_key()
            .unwrap()
            .encrypt(&mut image[..ALL_HEADERS_SIZE], 0, HEADER_XTS_BLOCK_SIZE);

        let reader = NcaReader::new(storage_of(image), &key_set).unwrap();
        assert_eq!(
            reader.get_header_encryption_type(),
            HeaderEncryptionType::AesXts
        );
        assert_eq!(reader.get_magic(), *b"NCA3");

        // the FS header comes out of the decrypted header storage intact
        let fs_header = NcaFsHeaderReader::new(&reader, 0).unwrap();
        assert_eq!(fs_header.get_version(), 2);
    }

    #[test]
    fn rejects_deprecated_magic_as_unsupported() {
        let mut image = build_plaintext_nca(&[0; 0x200]);
        image[0x200..0x204].copy_from_slice(b"NCA2");
        assert!(matches!(
            NcaReader::new(storage_of(image), &test_key_set()),
            Err(NcaError::UnsupportedSdkVersion)
        ));
    }

    #[test]
    fn rejects_garbage_magic_as_invalid_signature() {
        let mut image = build_plaintext_nca(&[0; 0x200]);
        image[0x200..0x204].copy_from_slice(b"XXXX");
        assert!(matches!(
            NcaReader::new(storage_of(image), &test_key_set()),
            Err(NcaError::InvalidNcaSignature)
        ));
    }

    #[test]
    fn rejects_old_sdk_versions() {
        let mut image = build_plaintext_nca(&[0; 0x200]);
        image[0x21C..0x220].copy_from_slice(&0x000A0000u32.to_le_bytes());
        assert!(matches!(
            NcaReader::new(storage_of(image), &test_key_set()),
            Err(NcaError::UnsupportedSdkVersion)
        ));
    }

    #[test]
    fn rejects_bad_key_indices() {
        let mut image = build_plaintext_nca(&[0; 0x200]);
        image[0x207] = 4;
        assert!(matches!(
            NcaReader::new(storage_of(image), &test_key_set()),
            Err(NcaError::InvalidNcaKeyIndex { index: 4 })
        ));
    }

    #[test]
    fn derives_key_area_keys() {
        let key_set = test_key_set();
        let mut image = build_plaintext_nca(&[0; 0x200]);
        // fill the first five key slots with recognizable bytes
        for slot in 0..5u8 {
            let at = 0x300 + slot as usize * 0x10;
            image[at..at + 0x10].fill(slot + 1);
        }
        let reader = NcaReader::new(storage_of(image), &key_set).unwrap();

        let key_area_key = key_set
            .key_area_key(0, KeyAreaKeyIndex::Application)
            .unwrap();
        let expected_ctr = key_area_key.decrypt_key([3u8; 0x10].into());
        assert_eq!(reader.get_decryption_key(DecryptionKey::AesCtr), expected_ctr);

        // the hardware key slot is copied verbatim
        assert_eq!(
            reader.get_decryption_key(DecryptionKey::AesCtrHw),
            [5u8; 0x10].into()
        );
        assert!(reader.has_valid_internal_key());
        assert!(reader.has_internal_decryption_key_for_aes_hw());
    }

    #[test]
    fn rights_id_leaves_keys_zero_until_external_key_installed() {
        let mut image = build_plaintext_nca(&[0; 0x200]);
        image[0x230..0x240].fill(0x77);
        let mut reader = NcaReader::new(storage_of(image), &test_key_set()).unwrap();

        assert!(!reader.get_rights_id().is_empty());
        assert!(reader.get_decryption_key(DecryptionKey::AesCtr).is_zero());
        assert!(!reader.has_external_decryption_key());

        reader.set_external_decryption_key("000102030405060708090a0b0c0d0e0f".parse().unwrap());
        assert!(reader.has_external_decryption_key());
    }

    #[test]
    fn fs_header_hash_mismatch_is_detected() {
        let mut image = build_plaintext_nca(&[0; 0x200]);
        image[NCA_HEADER_SIZE] ^= 0xFF; // corrupt the FS header
        let reader = NcaReader::new(storage_of(image), &test_key_set()).unwrap();
        assert!(matches!(
            NcaFsHeaderReader::new(&reader, 0),
            Err(NcaError::FsHeaderHashMismatch { index: 0 })
        ));
    }

    #[test]
    fn sign1_verification_is_recorded_not_fatal() {
        let image = build_plaintext_nca(&[0; 0x200]);
        let cfg = NcaCryptoConfiguration {
            verify_sign1: Some(|_sig, _msg, _gen| false),
            ..Default::default()
        };
        let reader = NcaReader::with_configuration(
            storage_of(image),
            &test_key_set(),
            &cfg,
            crate::fssystem::compression::standard_get_decompressor,
        )
        .unwrap();
        assert!(!reader.get_header_sign1_valid());
    }

    #[test]
    fn plaintext_header_fallback_can_be_disabled() {
        let image = build_plaintext_nca(&[0; 0x200]);
        let cfg = NcaCryptoConfiguration {
            is_plaintext_header_available: false,
            ..Default::default()
        };
        // the plaintext image does not decrypt to a valid magic
        assert!(matches!(
            NcaReader::with_configuration(
                storage_of(image),
                &test_key_set(),
                &cfg,
                crate::fssystem::compression::standard_get_decompressor,
            ),
            Err(NcaError::InvalidNcaSignature)
        ));
    }

    #[test]
    fn absent_sections_fail_the_fs_header_hash() {
        let image = build_plaintext_nca(&[0; 0x200]);
        let reader = NcaReader::new(storage_of(image), &test_key_set()).unwrap();
        // section 1 has no fs info; its header region is zero filled and
        // cannot match its (zero) recorded hash
        assert!(!reader.has_fs_info(1));
        assert!(NcaFsHeaderReader::new(&reader, 1).is_err());
    }
}
