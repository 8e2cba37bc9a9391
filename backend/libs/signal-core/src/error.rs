use thiserror::Error;

use crate::ratchet::Direction;

/// Failures surfaced by the key agreement and session engine
///
/// Messages name the failure kind only; no key material or plaintext is
/// ever formatted into an error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("entropy source failure")]
    Entropy,

    #[error("key derivation failed")]
    Kdf,

    #[error("invalid key material")]
    InvalidKey,

    #[error("prekey signature verification failed")]
    InvalidSignature,

    #[error("{0} chain not initialized")]
    DirectionNotInitialized(Direction),

    #[error("message key not found for old counter")]
    StaleMessage,

    #[error("MAC verification failed")]
    Authentication,

    #[error("decryption failed")]
    Decryption,

    #[error("encryption failed")]
    Encryption,

    #[error("counter jump of {gap} exceeds limit of {max}")]
    TooManySkippedMessages { gap: u32, max: u32 },

    #[error("message counter exhausted")]
    CounterExhausted,

    #[error("malformed message")]
    MalformedMessage,
}
