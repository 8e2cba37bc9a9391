//! Shared crypto helpers for Nova messaging services
//!
//! - `jwt`: HS256 access-token validation for the secure messaging surface
//! - `seal`: AES-256-GCM sealing of key material and session state at rest

pub mod jwt;
pub mod seal;

pub use seal::{open, seal, SealingKey};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("rng failure")]
    Rng,
}
