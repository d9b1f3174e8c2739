//! Symmetric encryption and hashing helpers.
//!
//! AES-GCM with the IV generated per message and bound into the nonce; the IV travels
//! with the ciphertext in [`Sealed`]. Both 96-bit and 128-bit IVs are supported, the
//! latter being the default.

use std::fmt::Write as _;

use aes_gcm::{
    aead::{
        consts::{U12, U16},
        generic_array::GenericArray,
        rand_core::RngCore,
        Aead, KeyInit, OsRng,
    },
    aes::{Aes128, Aes256},
    AesGcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

const SALT_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },
    #[error("unsupported IV length {0}; use 12 or 16")]
    IvLength(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed sealed payload")]
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Aes128Gcm,
    Aes256Gcm,
}

impl Algorithm {
    pub fn key_len(self) -> usize {
        match self {
            Algorithm::Aes128Gcm => 16,
            Algorithm::Aes256Gcm => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherConfig {
    pub algorithm: Algorithm,
    pub iv_len: usize,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Aes256Gcm,
            iv_len: 16,
        }
    }
}

enum Inner {
    Aes128Iv12(AesGcm<Aes128, U12>),
    Aes128Iv16(AesGcm<Aes128, U16>),
    Aes256Iv12(AesGcm<Aes256, U12>),
    Aes256Iv16(AesGcm<Aes256, U16>),
}

macro_rules! with_inner {
    ($inner:expr, $c:ident => $body:expr) => {
        match $inner {
            Inner::Aes128Iv12($c) => $body,
            Inner::Aes128Iv16($c) => $body,
            Inner::Aes256Iv12($c) => $body,
            Inner::Aes256Iv16($c) => $body,
        }
    };
}

/// IV plus ciphertext-with-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// `base64(iv):base64(ciphertext)`
    pub fn encode(&self) -> String {
        format!("{}:{}", BASE64.encode(&self.iv), BASE64.encode(&self.ciphertext))
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let (iv, ct) = s.split_once(':').ok_or(CryptoError::Malformed)?;
        Ok(Self {
            iv: BASE64.decode(iv).map_err(|_| CryptoError::Malformed)?,
            ciphertext: BASE64.decode(ct).map_err(|_| CryptoError::Malformed)?,
        })
    }
}

pub struct Cipher {
    inner: Inner,
    config: CipherConfig,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("config", &self.config).finish()
    }
}

impl Cipher {
    pub fn new(config: CipherConfig, key: &[u8]) -> Result<Self, CryptoError> {
        let expected = config.algorithm.key_len();
        if key.len() != expected {
            return Err(CryptoError::KeyLength {
                expected,
                actual: key.len(),
            });
        }
        let bad_key = |_| CryptoError::KeyLength {
            expected,
            actual: key.len(),
        };
        let inner = match (config.algorithm, config.iv_len) {
            (Algorithm::Aes128Gcm, 12) => Inner::Aes128Iv12(AesGcm::new_from_slice(key).map_err(bad_key)?),
            (Algorithm::Aes128Gcm, 16) => Inner::Aes128Iv16(AesGcm::new_from_slice(key).map_err(bad_key)?),
            (Algorithm::Aes256Gcm, 12) => Inner::Aes256Iv12(AesGcm::new_from_slice(key).map_err(bad_key)?),
            (Algorithm::Aes256Gcm, 16) => Inner::Aes256Iv16(AesGcm::new_from_slice(key).map_err(bad_key)?),
            (_, n) => return Err(CryptoError::IvLength(n)),
        };
        Ok(Self { inner, config })
    }

    /// Build the process cipher from the configured key, or an ephemeral one.
    pub fn from_config_key(raw: Option<&str>) -> Result<Self, CryptoError> {
        let config = CipherConfig::default();
        let key = match raw {
            Some(raw) => key_from_secret(raw, config.algorithm),
            None => {
                warn!(
                    target: "gateway",
                    "ENCRYPTION_KEY not set; using an ephemeral key for this process"
                );
                generate_key(config.algorithm.key_len())
            }
        };
        Self::new(config, &key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let mut iv = vec![0u8; self.config.iv_len];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = with_inner!(&self.inner, c => c
            .encrypt(GenericArray::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encrypt)?);
        Ok(Sealed { iv, ciphertext })
    }

    pub fn decrypt(&self, sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
        if sealed.iv.len() != self.config.iv_len {
            return Err(CryptoError::Malformed);
        }
        with_inner!(&self.inner, c => c
            .decrypt(GenericArray::from_slice(&sealed.iv), sealed.ciphertext.as_slice())
            .map_err(|_| CryptoError::Decrypt))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt(plaintext.as_bytes()).map(|s| s.encode())
    }

    pub fn decrypt_str(&self, encoded: &str) -> Result<String, CryptoError> {
        let bytes = self.decrypt(&Sealed::decode(encoded)?)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Malformed)
    }
}

/// Hex or base64 key of the right length is used as is; anything else is treated as a
/// passphrase and stretched with SHA-256.
pub fn key_from_secret(raw: &str, algorithm: Algorithm) -> Vec<u8> {
    let want = algorithm.key_len();
    let trimmed = raw.trim();
    if let Some(bytes) = from_hex(trimmed).filter(|b| b.len() == want) {
        return bytes;
    }
    if let Ok(bytes) = BASE64.decode(trimmed) {
        if bytes.len() == want {
            return bytes;
        }
    }
    let digest = Sha256::digest(raw.as_bytes());
    digest[..want].to_vec()
}

pub fn generate_key(len: usize) -> Vec<u8> {
    let mut key = vec![0u8; len];
    OsRng.fill_bytes(&mut key);
    key
}

/// Hex token of `bytes` random bytes.
pub fn generate_token(bytes: usize) -> String {
    to_hex(&generate_key(bytes))
}

/// Salted SHA-256, stored as `hex(salt)$hex(digest)`.
pub fn hash_secret(data: &str) -> String {
    let salt = generate_key(SALT_LEN);
    format!("{}${}", to_hex(&salt), to_hex(&salted_digest(&salt, data)))
}

pub fn verify_secret(data: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Some(salt) = from_hex(salt_hex) else {
        return false;
    };
    let computed = to_hex(&salted_digest(&salt, data));
    constant_time_eq(computed.as_bytes(), digest_hex.as_bytes())
}

fn salted_digest(salt: &[u8], data: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data.as_bytes());
    hasher.finalize().to_vec()
}

/// Compare without an early exit on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
