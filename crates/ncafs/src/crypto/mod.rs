use crate::hexstring::HexData;
use aes::Aes128;
use binrw::{BinRead, BinWrite};
use cipher::generic_array::GenericArray;
use ctr::Ctr128BE;
use hex::FromHexError;
use snafu::Snafu;
use std::str::FromStr;
use xts_mode::Xts128;

pub mod keyset;

#[derive(Snafu, Debug)]
pub enum KeyParseError {
    InvalidLength { expected: usize, actual: usize },
    InvalidChar { char: char, index: usize },
}

/// An AES-128 key slice of an NCA key area, still wrapped with the key-area
/// encryption key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, BinRead, BinWrite)]
pub struct EncryptedAesKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, BinRead, BinWrite)]
pub struct EncryptedAesXtsKey(pub HexData<0x20>);

/// An AES-128 title key wrapped with a titlekek.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TitleKey(HexData<0x10>);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct AesKey(pub HexData<0x10>);
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct AesXtsKey(pub HexData<0x20>);

fn parse_key(s: &str, result: &mut [u8]) -> Result<(), KeyParseError> {
    hex::decode_to_slice(s, result).map_err(|e| match e {
        FromHexError::InvalidHexCharacter { c, index } => {
            KeyParseError::InvalidChar { char: c, index }
        }
        FromHexError::OddLength | FromHexError::InvalidStringLength => {
            KeyParseError::InvalidLength {
                expected: result.len() * 2,
                actual: s.len(),
            }
        }
    })?;
    Ok(())
}

impl FromStr for AesKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| AesKey(HexData(result)))
    }
}

impl FromStr for AesXtsKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x20];
        parse_key(s, &mut result).map(|_| AesXtsKey(HexData(result)))
    }
}

impl FromStr for TitleKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = [0; 0x10];
        parse_key(s, &mut result).map(|_| TitleKey(HexData(result)))
    }
}

impl TitleKey {
    /// Unwraps the title key with the matching titlekek.
    pub fn decrypt(&self, title_kek: AesKey) -> AesKey {
        title_kek.derive_key(&self.0 .0)
    }
}

impl From<[u8; 0x10]> for TitleKey {
    fn from(data: [u8; 0x10]) -> Self {
        TitleKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for AesKey {
    fn from(data: [u8; 0x10]) -> Self {
        AesKey(HexData(data))
    }
}

impl From<[u8; 0x10]> for EncryptedAesKey {
    fn from(data: [u8; 0x10]) -> Self {
        EncryptedAesKey(HexData(data))
    }
}

impl AesKey {
    pub fn is_zero(&self) -> bool {
        self.0 .0.iter().all(|&x| x == 0)
    }

    fn derive_key(&self, source: &[u8; 0x10]) -> AesKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        AesKey(HexData(newkey))
    }

    /// Unwraps one 16-byte key-area slice (AES-128-ECB decrypt).
    pub fn decrypt_key(&self, source: EncryptedAesKey) -> AesKey {
        self.derive_key(&source.0 .0)
    }

    fn derive_xts_key(&self, source: &[u8; 0x20]) -> AesXtsKey {
        use cipher::{BlockDecrypt, KeyInit};
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0 .0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x00..0x10]));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x10..0x20]));

        AesXtsKey(HexData(newkey))
    }

    pub fn decrypt_xts_key(&self, source: EncryptedAesXtsKey) -> AesXtsKey {
        self.derive_xts_key(&source.0 .0)
    }

    /// Applies the CTR keystream for the given full IV. Decryption and
    /// encryption are the same operation.
    pub fn apply_ctr(&self, buf: &mut [u8], ctr: &[u8; 0x10]) {
        use cipher::{KeyIvInit, StreamCipher};

        assert!(buf.len() % 16 == 0, "length must be a multiple of the AES block");

        let key = GenericArray::from_slice(&self.0 .0);
        let iv = GenericArray::from_slice(ctr);
        let mut crypter = Ctr128BE::<Aes128>::new(key, iv);
        crypter.apply_keystream(buf);
    }
}

/// The non-standard big-endian XTS sector tweak the NCA format uses.
fn get_tweak(mut sector: u64) -> [u8; 0x10] {
    let mut tweak = [0; 0x10];
    for tweak in tweak.iter_mut().rev() {
        *tweak = (sector & 0xFF) as u8;
        sector >>= 8;
    }
    tweak
}

impl AesXtsKey {
    pub fn from_halves(key1: AesKey, key2: AesKey) -> Self {
        let mut key = [0; 0x20];
        key[..0x10].copy_from_slice(&key1.0 .0);
        key[0x10..].copy_from_slice(&key2.0 .0);
        AesXtsKey(HexData(key))
    }

    #[inline]
    fn to_crypter(self) -> Xts128<Aes128> {
        use cipher::KeyInit;

        let key1 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x00..0x10]));
        let key2 = Aes128::new(GenericArray::from_slice(&self.0 .0[0x10..0x20]));
        Xts128::<Aes128>::new(key1, key2)
    }

    pub fn decrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        assert!(
            data.len() % sector_size == 0,
            "length must be a multiple of the sector size"
        );

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            crypter.decrypt_sector(&mut data[i..i + sector_size], get_tweak(sector));
            sector += 1;
        }
    }

    pub fn encrypt(&self, data: &mut [u8], mut sector: u64, sector_size: usize) {
        assert!(
            data.len() % sector_size == 0,
            "length must be a multiple of the sector size"
        );

        let crypter = self.to_crypter();

        for i in (0..data.len()).step_by(sector_size) {
            crypter.encrypt_sector(&mut data[i..i + sector_size], get_tweak(sector));
            sector += 1;
        }
    }
}

/// Adds `value` to a 128-bit big-endian counter, wrapping modulo 2^128.
pub fn add_counter(counter: &[u8; 0x10], value: u64) -> [u8; 0x10] {
    u128::from_be_bytes(*counter)
        .wrapping_add(value as u128)
        .to_be_bytes()
}
