//! Record codec: seals one JSON value into a `"{iv}:{ciphertext}:{checksum}"` token.
//!
//! - `iv`: 16 random bytes, lowercase hex, fresh on every seal
//! - `ciphertext`: AES-256-CBC with PKCS7 padding, standard base64
//! - `checksum`: SHA-256 over `"{iv}:{ciphertext}"`, lowercase hex
//!
//! The checksum covers the IV as well as the ciphertext, so tampering with
//! either segment is caught before any cipher work is done. A token that
//! fails the checksum is reported as [`CryptoError::Integrity`]; a token
//! that passes it but cannot be opened is [`CryptoError::Decryption`].

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Size of the CBC initialization vector in bytes.
pub const IV_SIZE: usize = 16;

pub const CIPHER_ALGORITHM: &str = "AES-256-CBC";
pub const CHECKSUM_ALGORITHM: &str = "SHA-256";

const SEPARATOR: char = ':';
const SEGMENT_COUNT: usize = 3;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// The three segments of a serialized record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedToken {
    pub iv: String,
    pub ciphertext: String,
    pub checksum: String,
}

impl SealedToken {
    /// Splits a serialized token. Anything but three non-empty segments is corruption.
    pub fn parse(token: &str) -> CryptoResult<Self> {
        let segments: Vec<&str> = token.split(SEPARATOR).collect();
        if segments.len() != SEGMENT_COUNT {
            return Err(CryptoError::Integrity(format!(
                "expected {SEGMENT_COUNT} segments, found {}",
                segments.len()
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CryptoError::Integrity("empty token segment".into()));
        }
        Ok(Self {
            iv: segments[0].to_string(),
            ciphertext: segments[1].to_string(),
            checksum: segments[2].to_string(),
        })
    }

    /// Recomputes the digest of the first two segments and compares it.
    pub fn verify_checksum(&self) -> CryptoResult<()> {
        if compute_checksum(&self.iv, &self.ciphertext) != self.checksum {
            return Err(CryptoError::Integrity("checksum mismatch".into()));
        }
        Ok(())
    }
}

impl fmt::Display for SealedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.iv, self.ciphertext, self.checksum
        )
    }
}

fn compute_checksum(iv: &str, ciphertext: &str) -> String {
    hex::encode(Sha256::digest(format!("{iv}{SEPARATOR}{ciphertext}").as_bytes()))
}

/// Seals a JSON value under `key`.
///
/// `null` is rejected; empty strings, arrays and objects are valid values.
pub fn encrypt_value(key: &DerivedKey, value: &Value) -> CryptoResult<String> {
    if value.is_null() {
        return Err(CryptoError::Encryption("cannot encrypt a null value".into()));
    }
    let plaintext = serde_json::to_vec(value)
        .map_err(|e| CryptoError::Encryption(format!("value serialization failed: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::Encryption(format!("cipher init failed: {e}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

    let iv = hex::encode(iv);
    let ciphertext = BASE64.encode(ciphertext);
    let checksum = compute_checksum(&iv, &ciphertext);

    Ok(SealedToken {
        iv,
        ciphertext,
        checksum,
    }
    .to_string())
}

/// Opens a token produced by [`encrypt_value`].
pub fn decrypt_value(key: &DerivedKey, token: &str) -> CryptoResult<Value> {
    let sealed = SealedToken::parse(token)?;
    sealed.verify_checksum()?;

    let iv = hex::decode(&sealed.iv)
        .map_err(|e| CryptoError::Decryption(format!("iv is not hex: {e}")))?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::Decryption(format!(
            "iv must be {IV_SIZE} bytes, got {}",
            iv.len()
        )));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|e| CryptoError::Decryption(format!("ciphertext is not base64: {e}")))?;

    let plaintext = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::Decryption(format!("cipher init failed: {e}")))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| {
            CryptoError::Decryption("cipher decode failed (wrong key or damaged payload)".into())
        })?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| CryptoError::Decryption(format!("payload is not valid JSON: {e}")))
}
