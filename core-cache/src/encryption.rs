//! AES-256-GCM encryption for cache values

use crate::error::{CacheError, Result};
use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Per-user cache encryption key.
#[derive(Clone)]
pub struct EncryptionKey {
    key_bytes: Vec<u8>,
}

impl EncryptionKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            key_bytes: key.to_vec(),
        }
    }

    /// Create from existing key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CacheError::KeyMaterial(format!(
                "Invalid key length {}. Expected {} bytes for AES-256.",
                bytes.len(),
                KEY_LEN
            )));
        }

        Ok(Self { key_bytes: bytes })
    }

    /// Raw bytes, for persisting in the secure store.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.key_bytes)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CacheError::KeyMaterial(format!("Invalid hex key: {}", e)))?;

        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_bytes", &"[REDACTED]")
            .finish()
    }
}

/// Cache value encryptor.
///
/// Output layout is `nonce (12 bytes) || ciphertext || tag`, base64 encoded
/// for the string-only storage provider. The storage key is bound as
/// associated data, so a ciphertext copied under another key fails to
/// decrypt.
pub struct CacheEncryptor {
    cipher: Aes256Gcm,
}

impl CacheEncryptor {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| CacheError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CacheError::Encryption(
                "Invalid ciphertext: too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| CacheError::Encryption(format!("Decryption failed: {}", e)))
    }

    /// Encrypt and base64 encode.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<String> {
        Ok(STANDARD.encode(self.encrypt(plaintext, aad)?))
    }

    /// Base64 decode and decrypt.
    pub fn open(&self, sealed: &str, aad: &[u8]) -> Result<Vec<u8>> {
        let bytes = STANDARD
            .decode(sealed)
            .map_err(|e| CacheError::Encryption(format!("Invalid ciphertext encoding: {}", e)))?;
        self.decrypt(&bytes, aad)
    }
}

impl fmt::Debug for CacheEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEncryptor").finish_non_exhaustive()
    }
}
