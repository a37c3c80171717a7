use crate::fssystem::aes_ctr_ex_storage::AesCtrUpperIv;
use crate::fssystem::hierarchical_integrity_verification_storage::HierarchicalIntegrityVerificationInformation;
use crate::hexstring::HexData;
use crate::ids::{ProgramId, RightsId};
use binrw::BinRead;
use std::fmt::Debug;

pub const NCA_HEADER_SIZE: usize = 0x400;
pub const FS_HEADER_SIZE: usize = 0x200;
pub const ALL_HEADERS_SIZE: usize = 0xC00;
pub const FS_COUNT_MAX: usize = 4;
pub const HEADER_SIGN_SIZE: usize = 0x100;
pub const ENCRYPTED_KEY_AREA_SIZE: usize = 0x100;
pub const SECTOR_SIZE: u64 = 0x200;
pub const RIGHTS_ID_SIZE: usize = 0x10;

/// XTS sector size of the encrypted NCA header.
pub const HEADER_XTS_BLOCK_SIZE: usize = 0x200;
/// AES block size of the CTR section ciphers.
pub const CTR_BLOCK_SIZE: u64 = 0x10;

pub const NCA0_MAGIC: [u8; 4] = *b"NCA0";
pub const NCA1_MAGIC: [u8; 4] = *b"NCA1";
pub const NCA2_MAGIC: [u8; 4] = *b"NCA2";
pub const NCA3_MAGIC: [u8; 4] = *b"NCA3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum DistributionType {
    Download = 0,
    GameCard = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum NcaContentType {
    Program = 0,
    Meta = 1,
    Control = 2,
    Manual = 3,
    Data = 4,
    PublicData = 5,
}

/// Positions of the per-section keys inside the decrypted key area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionKey {
    AesXts1 = 0,
    AesXts2 = 1,
    AesCtr = 2,
    AesCtrEx = 3,
    AesCtrHw = 4,
}

pub const DECRYPTION_KEY_COUNT: usize = 5;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead)]
pub struct Sha256Hash(pub HexData<0x20>);

impl Sha256Hash {
    pub fn verify(&self, data: &[u8]) -> Result<(), ()> {
        use digest::Digest;
        let mut hasher = sha2::Sha256::default();
        hasher.update(data);
        let hash = hasher.finalize();
        (hash.as_slice() == self.0 .0).then_some(()).ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
pub struct NcaSignature(pub HexData<0x100>);

/// Sector extents of one FS section inside the NCA body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct FsInfo {
    pub start_sector: u32,
    pub end_sector: u32,
    pub hash_sectors: u32,
    pub reserved: u32,
}

pub const fn sector_to_byte(sector: u32) -> u64 {
    (sector as u64) << 9
}

/// The first 0x400 bytes of a decrypted NCA.
#[derive(Debug, Clone, Copy, PartialEq, BinRead)]
#[br(little)]
pub struct NcaHeader {
    pub header_sign_1: NcaSignature,
    pub header_sign_2: NcaSignature,
    pub magic: [u8; 4],
    pub distribution_type: DistributionType,
    pub content_type: NcaContentType,
    pub key_generation: u8,
    pub key_index: u8,
    pub content_size: u64,
    pub program_id: ProgramId,
    pub content_index: u32,
    pub sdk_addon_version: u32,
    pub key_generation_2: u8,
    pub header1_signature_key_generation: u8,
    pub reserved: [u8; 0xE],
    pub rights_id: RightsId,
    pub fs_info: [FsInfo; FS_COUNT_MAX],
    pub fs_header_hash: [Sha256Hash; FS_COUNT_MAX],
    pub encrypted_key_area: HexData<0x100>,
}

impl NcaHeader {
    /// The effective key generation: the maximum of the two generation
    /// bytes.
    pub fn proper_key_generation(&self) -> u8 {
        std::cmp::max(self.key_generation, self.key_generation_2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum FsType {
    RomFs = 0,
    PartitionFs = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum NcaFsHeaderHashType {
    Auto = 0,
    None = 1,
    HierarchicalSha256Hash = 2,
    HierarchicalIntegrityHash = 3,
    AutoSha3 = 4,
    HierarchicalSha3256Hash = 5,
    HierarchicalIntegritySha3Hash = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum NcaFsHeaderEncryptionType {
    Auto = 0,
    None = 1,
    AesXts = 2,
    AesCtr = 3,
    AesCtrEx = 4,
    AesCtrSkipLayerHash = 5,
    AesCtrExSkipLayerHash = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(repr = u8)]
pub enum MetaDataHashType {
    None = 0,
    HierarchicalIntegrity = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, BinRead)]
#[br(little)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

pub const SHA256_HASH_LAYER_COUNT_MAX: usize = 5;

/// Hash data of a `HierarchicalSha256Hash` section.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct HierarchicalSha256Data {
    pub fs_data_master_hash: Sha256Hash,
    pub hash_block_size: i32,
    pub hash_layer_count: i32,
    pub hash_layer_region: [Region; SHA256_HASH_LAYER_COUNT_MAX],
}

/// Hash data of a `HierarchicalIntegrityHash` section.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct IntegrityMetaInfo {
    pub magic: [u8; 4],
    pub version: u32,
    pub master_hash_size: u32,
    pub level_hash_info: HierarchicalIntegrityVerificationInformation,
    pub master_hash: Sha256Hash,
}

/// The tagged 0xF0-byte hash-data union of an FS header, discriminated by
/// the header's hash type.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little, import(hash_type: NcaFsHeaderHashType))]
pub enum HashData {
    #[br(pre_assert(matches!(
        hash_type,
        NcaFsHeaderHashType::HierarchicalSha256Hash | NcaFsHeaderHashType::HierarchicalSha3256Hash
    )))]
    HierarchicalSha256(HierarchicalSha256Data),
    #[br(pre_assert(matches!(
        hash_type,
        NcaFsHeaderHashType::HierarchicalIntegrityHash
            | NcaFsHeaderHashType::HierarchicalIntegritySha3Hash
    )))]
    Integrity(IntegrityMetaInfo),
    Raw([u8; 0xF8]),
}

/// Extent and inline header of one bucket-tree table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaBucketInfo {
    pub offset: u64,
    pub size: u64,
    pub header: HexData<0x10>,
}

/// The indirect and AES-CTR-Ex table extents of a patch section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaPatchInfo {
    pub indirect_offset: u64,
    pub indirect_size: u64,
    pub indirect_header: HexData<0x10>,
    pub aes_ctr_ex_offset: u64,
    pub aes_ctr_ex_size: u64,
    pub aes_ctr_ex_header: HexData<0x10>,
}

impl NcaPatchInfo {
    pub fn has_indirect_table(&self) -> bool {
        self.indirect_size != 0
    }

    pub fn has_aes_ctr_ex_table(&self) -> bool {
        self.aes_ctr_ex_size != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaSparseInfo {
    pub bucket: NcaBucketInfo,
    pub physical_offset: u64,
    pub generation: u16,
    pub reserved: [u8; 6],
}

impl NcaSparseInfo {
    pub fn get_physical_size(&self) -> u64 {
        self.bucket.offset + self.bucket.size
    }

    pub fn get_generation(&self) -> u32 {
        (self.generation as u32) << 16
    }

    /// The sparse meta tables are encrypted under the sparse generation
    /// rather than the section's own.
    pub fn make_aes_ctr_upper_iv(&self, upper_iv: AesCtrUpperIv) -> AesCtrUpperIv {
        upper_iv.with_generation(self.get_generation())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaCompressionInfo {
    pub bucket: NcaBucketInfo,
    pub reserved: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead)]
#[br(little)]
pub struct NcaMetaDataHashDataInfo {
    pub offset: u64,
    pub size: u64,
    pub hash: Sha256Hash,
}

/// The region the patch/sparse meta-data hash covers: a layer-info offset
/// followed by an integrity meta info.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct NcaMetaDataHashData {
    pub layer_info_offset: u64,
    pub integrity_meta_info: IntegrityMetaInfo,
}

pub const META_DATA_HASH_DATA_SIZE: u64 = 0xE8;

/// One 0x200-byte FS header; four follow the NCA header.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct NcaFsHeader {
    pub version: u16,
    pub fs_type: FsType,
    pub hash_type: NcaFsHeaderHashType,
    pub encryption_type: NcaFsHeaderEncryptionType,
    pub meta_data_hash_type: MetaDataHashType,
    pub reserved: [u8; 2],
    #[br(args(hash_type), pad_size_to = 0xF8)]
    pub hash_data: HashData,
    pub patch_info: NcaPatchInfo,
    pub aes_ctr_upper_iv: AesCtrUpperIv,
    pub sparse_info: NcaSparseInfo,
    pub compression_info: NcaCompressionInfo,
    pub meta_data_hash_data_info: NcaMetaDataHashDataInfo,
    pub pad: [u8; 0x30],
}

impl NcaFsHeader {
    pub fn is_skip_layer_hash_encryption(&self) -> bool {
        matches!(
            self.encryption_type,
            NcaFsHeaderEncryptionType::AesCtrSkipLayerHash
                | NcaFsHeaderEncryptionType::AesCtrExSkipLayerHash
        )
    }

    /// The offset of the byte range the hash layer covers; bytes past it
    /// are hash metadata rather than section data.
    pub fn get_hash_target_offset(&self) -> Option<u64> {
        match (&self.hash_data, self.hash_type) {
            (
                HashData::Integrity(meta),
                NcaFsHeaderHashType::HierarchicalIntegrityHash
                | NcaFsHeaderHashType::HierarchicalIntegritySha3Hash,
            ) => {
                let layers = &meta.level_hash_info;
                if !(2..=7).contains(&layers.max_layers) {
                    return None;
                }
                Some(layers.layers[layers.max_layers as usize - 2].offset)
            }
            (
                HashData::HierarchicalSha256(data),
                NcaFsHeaderHashType::HierarchicalSha256Hash
                | NcaFsHeaderHashType::HierarchicalSha3256Hash,
            ) => {
                if !(1..=SHA256_HASH_LAYER_COUNT_MAX as i32).contains(&data.hash_layer_count) {
                    return None;
                }
                Some(data.hash_layer_region[data.hash_layer_count as usize - 1].offset)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn nca_header_parses_at_the_documented_offsets() {
        let mut raw = vec![0u8; NCA_HEADER_SIZE];
        raw[0x200..0x204].copy_from_slice(b"NCA3");
        raw[0x204] = 1; // GameCard
        raw[0x205] = 2; // Control
        raw[0x206] = 3; // key_generation
        raw[0x207] = 0; // key_index
        raw[0x208..0x210].copy_from_slice(&0x123456u64.to_le_bytes());
        raw[0x210..0x218].copy_from_slice(&0x0100ABCD00000000u64.to_le_bytes());
        raw[0x21C..0x220].copy_from_slice(&0x000B0000u32.to_le_bytes());
        raw[0x220] = 5; // key_generation_2
        raw[0x230] = 0xAA; // rights id first byte
        // section 0: sectors [2, 10)
        raw[0x240..0x244].copy_from_slice(&2u32.to_le_bytes());
        raw[0x244..0x248].copy_from_slice(&10u32.to_le_bytes());

        let header = NcaHeader::read(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(header.magic, NCA3_MAGIC);
        assert_eq!(header.distribution_type, DistributionType::GameCard);
        assert_eq!(header.content_type, NcaContentType::Control);
        assert_eq!(header.content_size, 0x123456);
        assert_eq!(header.sdk_addon_version, 0x000B0000);
        assert_eq!(header.proper_key_generation(), 5);
        assert!(!header.rights_id.is_empty());
        assert_eq!(sector_to_byte(header.fs_info[0].start_sector), 0x400);
        assert_eq!(sector_to_byte(header.fs_info[0].end_sector), 0x1400);
    }

    fn fs_header_bytes(hash_type: u8) -> Vec<u8> {
        let mut raw = vec![0u8; FS_HEADER_SIZE];
        raw[0..2].copy_from_slice(&2u16.to_le_bytes());
        raw[2] = 0; // RomFs
        raw[3] = hash_type;
        raw[4] = 3; // AesCtr
        raw[5] = 0; // no meta hash
        raw
    }

    #[test]
    fn fs_header_field_offsets() {
        let mut raw = fs_header_bytes(3);
        // IntegrityMetaInfo at 0x8
        raw[0x8..0xC].copy_from_slice(b"IVFC");
        raw[0x14..0x18].copy_from_slice(&7u32.to_le_bytes()); // max_layers
        // patch info at 0x100
        raw[0x108..0x110].copy_from_slice(&0x4000u64.to_le_bytes()); // indirect_size
        // upper iv at 0x140
        raw[0x140..0x148].copy_from_slice(&0xAABBCCDD11223344u64.to_le_bytes());
        // sparse info at 0x148, generation at +0x28
        raw[0x170..0x172].copy_from_slice(&9u16.to_le_bytes());
        // compression info at 0x178
        raw[0x178..0x180].copy_from_slice(&0x8000u64.to_le_bytes());
        raw[0x180..0x188].copy_from_slice(&0x100u64.to_le_bytes());
        // meta data hash data info at 0x1A0
        raw[0x1A8..0x1B0].copy_from_slice(&0xE8u64.to_le_bytes());

        let header = NcaFsHeader::read(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.fs_type, FsType::RomFs);
        assert_eq!(header.hash_type, NcaFsHeaderHashType::HierarchicalIntegrityHash);
        assert_eq!(header.encryption_type, NcaFsHeaderEncryptionType::AesCtr);
        assert!(matches!(header.hash_data, HashData::Integrity(_)));
        if let HashData::Integrity(meta) = &header.hash_data {
            assert_eq!(meta.magic, *b"IVFC");
            assert_eq!(meta.level_hash_info.max_layers, 7);
        }
        assert!(header.patch_info.has_indirect_table());
        assert!(!header.patch_info.has_aes_ctr_ex_table());
        assert_eq!(header.aes_ctr_upper_iv.value, 0xAABBCCDD11223344);
        assert_eq!(header.sparse_info.generation, 9);
        assert_eq!(header.compression_info.bucket.offset, 0x8000);
        assert_eq!(header.compression_info.bucket.size, 0x100);
        assert_eq!(header.meta_data_hash_data_info.size, 0xE8);
    }

    #[test]
    fn sha256_hash_data_variant() {
        let mut raw = fs_header_bytes(2);
        // master hash at 0x8, block size at 0x28, layer count at 0x2C
        raw[0x28..0x2C].copy_from_slice(&0x1000i32.to_le_bytes());
        raw[0x2C..0x30].copy_from_slice(&2i32.to_le_bytes());
        // layer regions at 0x30
        raw[0x30..0x38].copy_from_slice(&0u64.to_le_bytes());
        raw[0x38..0x40].copy_from_slice(&0x20u64.to_le_bytes());
        raw[0x40..0x48].copy_from_slice(&0x1000u64.to_le_bytes());
        raw[0x48..0x50].copy_from_slice(&0x8000u64.to_le_bytes());

        let header = NcaFsHeader::read(&mut Cursor::new(&raw)).unwrap();
        let HashData::HierarchicalSha256(data) = &header.hash_data else {
            panic!("expected sha256 hash data");
        };
        assert_eq!(data.hash_block_size, 0x1000);
        assert_eq!(data.hash_layer_count, 2);
        assert_eq!(data.hash_layer_region[1].offset, 0x1000);
        assert_eq!(data.hash_layer_region[1].size, 0x8000);
        assert_eq!(header.get_hash_target_offset(), Some(0x1000));
    }

    #[test]
    fn hash_verification() {
        let data = b"some bytes";
        use digest::Digest;
        let digest: [u8; 0x20] = sha2::Sha256::digest(data).into();
        let hash = Sha256Hash(HexData(digest));
        assert!(hash.verify(data).is_ok());
        assert!(hash.verify(b"other bytes").is_err());
    }
}
