//! Signal-style key agreement and session engine
//!
//! - `keys`: Curve25519 key pairs, identity keys and signed prekeys
//! - `kdf`: HKDF secret derivation and the HMAC chain step
//! - `x3dh`: initiator and responder halves of the X3DH handshake
//! - `ratchet`: per-peer session state with a symmetric-key ratchet
//! - `message`: the encrypted wire unit and its base64 envelope
//!
//! The ratchet advances chain keys per message but performs no
//! Diffie-Hellman ratchet step, so it offers forward secrecy without
//! post-compromise recovery.
//!
//! Each chain started by X3DH authenticates `IK_A || IK_B` as AEAD
//! associated data, so a message only opens for the identity pair that
//! ran the handshake.

mod encoding;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod message;
pub mod ratchet;
pub mod x3dh;

pub use error::SignalError;
pub use kdf::derive_secret;
pub use keys::{
    combine_dh, generate_key_pair, generate_prekeys, IdentityKey, IdentityKeyPair, KeyPair,
    Prekey, PrekeyBundle, PublicPrekey,
};
pub use message::{EncryptedMessage, MessageType};
pub use ratchet::{Direction, Session, MAX_SKIP, MAX_SKIPPED_KEYS};
