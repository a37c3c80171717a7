use crate::storage::StorageError;

/// Per-entry compression choice of a compressed storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zeros,
    Two,
    Lz4,
    Unknown(u8),
}

impl CompressionType {
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Zeros,
            2 => Self::Two,
            3 => Self::Lz4,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zeros => 1,
            Self::Two => 2,
            Self::Lz4 => 3,
            Self::Unknown(other) => other,
        }
    }

    /// Entries of this type must sit block-aligned in the data storage.
    pub fn is_block_alignment_required(self) -> bool {
        !matches!(self, Self::None | Self::Zeros)
    }

    /// Entries of this type carry bytes in the data storage.
    pub fn is_data_storage_access_required(self) -> bool {
        !matches!(self, Self::Zeros)
    }

    /// Entries of this type can be read at an arbitrary inner offset.
    pub fn is_random_accessible(self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

pub const COMPRESSION_BLOCK_ALIGNMENT: u64 = 0x10;

/// Decompresses `src` into exactly `dst.len()` bytes.
pub type DecompressorFunction = fn(&mut [u8], &[u8]) -> Result<(), StorageError>;

/// Resolves the decompressor for a compression type; `None` means the type
/// is not supported.
pub type GetDecompressorFunction = fn(CompressionType) -> Option<DecompressorFunction>;

/// LZ4 block decompression with a known output size.
pub fn lz4_decompressor(dst: &mut [u8], src: &[u8]) -> Result<(), StorageError> {
    let written = lz4_flex::block::decompress_into(src, dst)
        .map_err(|_| StorageError::DecompressionFailed {})?;
    if written != dst.len() {
        return Err(StorageError::DecompressionFailed {});
    }
    Ok(())
}

/// The standard registry: LZ4 is the only compressed type with a software
/// decompressor; None and Zeros are handled inline by the storage.
pub fn standard_get_decompressor(compression_type: CompressionType) -> Option<DecompressorFunction> {
    match compression_type {
        CompressionType::Lz4 => Some(lz4_decompressor),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_predicates() {
        assert!(!CompressionType::None.is_block_alignment_required());
        assert!(!CompressionType::Zeros.is_block_alignment_required());
        assert!(CompressionType::Lz4.is_block_alignment_required());

        assert!(CompressionType::None.is_data_storage_access_required());
        assert!(!CompressionType::Zeros.is_data_storage_access_required());
        assert!(CompressionType::Lz4.is_data_storage_access_required());

        assert!(CompressionType::None.is_random_accessible());
        assert!(!CompressionType::Lz4.is_random_accessible());

        assert!(CompressionType::from_raw(9).is_unknown());
        assert_eq!(CompressionType::from_raw(3), CompressionType::Lz4);
    }

    #[test]
    fn lz4_round_trip() {
        let plaintext: Vec<u8> = b"the quick brown fox jumps over the lazy dog"
            .iter()
            .cycle()
            .take(0x400)
            .copied()
            .collect();
        let compressed = lz4_flex::block::compress(&plaintext);

        let mut dst = vec![0; plaintext.len()];
        lz4_decompressor(&mut dst, &compressed).unwrap();
        assert_eq!(dst, plaintext);

        // wrong output size is an error
        let mut dst = vec![0; plaintext.len() + 1];
        assert!(lz4_decompressor(&mut dst, &compressed).is_err());
    }

    #[test]
    fn registry_only_knows_lz4() {
        assert!(standard_get_decompressor(CompressionType::Lz4).is_some());
        assert!(standard_get_decompressor(CompressionType::None).is_none());
        assert!(standard_get_decompressor(CompressionType::Zeros).is_none());
        assert!(standard_get_decompressor(CompressionType::from_raw(7)).is_none());
    }
}
