//! AES-128-CBC primitives for content and title-key crypto.
//!
//! All title content, export streams, and the ES encrypt/decrypt commands use
//! AES-128-CBC with a caller-supplied 16-byte IV.
//!
//! One legacy oddity is preserved on purpose: the guest-facing commands
//! return a "new IV" output vector that is a plain copy of the *input* IV,
//! not the CBC chaining state. Genuine chaining across calls only happens on
//! the export path, where the per-stream IV buffer is updated from the last
//! ciphertext block.

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::{Error, Result};
use crate::keys::{KeyTable, KeyType};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// The IV for per-title content crypto is the big-endian content index,
/// zero-extended to 16 bytes.
pub fn content_iv(index: u16) -> [u8; 16] {
    let mut iv = [0; 16];
    iv[0] = (index >> 8) as u8;
    iv[1] = (index & 0xff) as u8;
    iv
}

fn check_aligned(len: usize) -> Result<()> {
    if len % BLOCK_SIZE != 0 {
        return Err(Error::BlockAlignment(len));
    }
    Ok(())
}

/// CBC-encrypt `input` with `key` and `iv`. The input length must be a
/// multiple of the block size; no padding is applied.
pub fn encrypt(key: &[u8; 16], iv: &[u8; 16], input: &[u8]) -> Result<Vec<u8>> {
    check_aligned(input.len())?;
    let cipher = Aes128CbcEnc::new(key.into(), iv.into());
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(input))
}

/// CBC-decrypt `input` with `key` and `iv`. The input length must be a
/// multiple of the block size.
pub fn decrypt(key: &[u8; 16], iv: &[u8; 16], input: &[u8]) -> Result<Vec<u8>> {
    check_aligned(input.len())?;
    let cipher = Aes128CbcDec::new(key.into(), iv.into());
    cipher
        .decrypt_padded_vec_mut::<NoPadding>(input)
        .map_err(|_| Error::BlockAlignment(input.len()))
}

/// Encrypt while carrying the CBC chaining state forward: `iv` is updated to
/// the last ciphertext block so a subsequent call continues the stream.
pub fn encrypt_chained(key: &[u8; 16], iv: &mut [u8; 16], input: &[u8]) -> Result<Vec<u8>> {
    let output = encrypt(key, iv, input)?;
    if let Some(last) = output.chunks_exact(BLOCK_SIZE).last() {
        iv.copy_from_slice(last);
    }
    Ok(output)
}

/// Guest-facing encrypt: key comes from the fixed key table, and the returned
/// IV is a copy of the input IV (legacy contract, see module docs).
pub fn encrypt_with_key_index(
    table: &KeyTable,
    key: KeyType,
    iv: &[u8; 16],
    input: &[u8],
) -> Result<(Vec<u8>, [u8; 16])> {
    let output = encrypt(&table.aes_key(key), iv, input)?;
    Ok((output, *iv))
}

/// Guest-facing decrypt counterpart of [`encrypt_with_key_index`].
pub fn decrypt_with_key_index(
    table: &KeyTable,
    key: KeyType,
    iv: &[u8; 16],
    input: &[u8],
) -> Result<(Vec<u8>, [u8; 16])> {
    let output = decrypt(&table.aes_key(key), iv, input)?;
    Ok((output, *iv))
}
