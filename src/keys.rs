//! Fixed key table used by the ES encrypt/decrypt commands.
//!
//! The table is placeholder material, not a secret store: only the SD key
//! slot carries real bytes, everything else is zero-filled. It is immutable
//! for the process lifetime and reproduced verbatim so guest-visible crypto
//! output stays bit-exact.

/// Key slots, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum KeyType {
    EccPrivateKey = 0,
    ConsoleId = 1,
    NandAesKey = 2,
    NandHmac = 3,
    CommonKey = 4,
    PrngSeed = 5,
    SdKey = 6,
    Unknown7 = 7,
    Unknown8 = 8,
    Unknown9 = 9,
    Unknown10 = 10,
}

impl KeyType {
    pub fn from_index(index: u32) -> Option<KeyType> {
        match index {
            0 => Some(KeyType::EccPrivateKey),
            1 => Some(KeyType::ConsoleId),
            2 => Some(KeyType::NandAesKey),
            3 => Some(KeyType::NandHmac),
            4 => Some(KeyType::CommonKey),
            5 => Some(KeyType::PrngSeed),
            6 => Some(KeyType::SdKey),
            7 => Some(KeyType::Unknown7),
            8 => Some(KeyType::Unknown8),
            9 => Some(KeyType::Unknown9),
            10 => Some(KeyType::Unknown10),
            _ => None,
        }
    }
}

/// Number of slots in the key table.
pub const KEY_TABLE_LEN: usize = 11;

const KEY_SD: [u8; 16] = [
    0xab, 0x01, 0xb9, 0xd8, 0xe1, 0x62, 0x2b, 0x08, 0xaf, 0xba, 0xd8, 0x4d, 0xbf, 0xc2, 0xa5,
    0x5d,
];

// The ECC slot is 30 bytes of key material ending in 0x01; it is not an AES
// key and is never used by the CBC paths.
const KEY_ECC: [u8; 30] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
];

const KEY_EMPTY: [u8; 16] = [0; 16];

/// The compiled-in key table.
#[derive(Debug, Default)]
pub struct KeyTable;

impl KeyTable {
    /// Key material for a slot. Slices are 16 bytes except for the 30-byte
    /// ECC slot.
    pub fn get(&self, key: KeyType) -> &'static [u8] {
        match key {
            KeyType::EccPrivateKey => &KEY_ECC,
            KeyType::SdKey => &KEY_SD,
            _ => &KEY_EMPTY,
        }
    }

    /// The first 16 bytes of a slot, as an AES-128 key.
    pub fn aes_key(&self, key: KeyType) -> [u8; 16] {
        let mut out = [0; 16];
        out.copy_from_slice(&self.get(key)[..16]);
        out
    }
}
