//! At-rest sealing for private key material and serialized sessions.
//!
//! Sealed layout: `nonce (12 bytes) || AES-256-GCM(ciphertext || tag)`.
//! The sealing key comes from `KEY_SEALING_KEY` and never touches the
//! database. A fresh random nonce is drawn for every call.

// TODO: Upgrade to aes-gcm 0.11 when stable (uses hybrid-array instead of generic-array)
#[allow(deprecated)]
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use crate::CryptoError;

const NONCE_LEN: usize = 12;

/// Key used to seal stored key material
///
/// SECURITY: This key MUST be:
/// - Generated using a CSPRNG
/// - Stored outside the database it protects
/// - Never logged
#[derive(Clone)]
pub struct SealingKey([u8; 32]);

impl SealingKey {
    /// Parse a 64-char hex string, e.g. the output of `openssl rand -hex 32`
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let mut key_bytes = hex::decode(key_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid hex key: {}", e)))?;

        if key_bytes.len() != 32 {
            key_bytes.zeroize();
            return Err(CryptoError::InvalidKey(
                "key must be 32 bytes (64 hex chars)".into(),
            ));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        key_bytes.zeroize();
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Random key for ephemeral deployments and tests
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; 32];
        OsRng.try_fill_bytes(&mut key).map_err(|_| CryptoError::Rng)?;
        Ok(Self(key))
    }
}

impl Drop for SealingKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey([REDACTED])")
    }
}

/// Seal `plaintext` under `key`, returning `nonce || ciphertext`
pub fn seal(key: &SealingKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::Encryption)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| CryptoError::Rng)?;
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a blob produced by [`seal`]
pub fn open(key: &SealingKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| CryptoError::Decryption)?;
    cipher
        .decrypt(GenericArray::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}
