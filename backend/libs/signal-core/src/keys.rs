use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding::b64;
use crate::SignalError;

fn random_bytes() -> Result<[u8; 32], SignalError> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| SignalError::Entropy)?;
    Ok(bytes)
}

/// X25519 scalar multiplication of `private` with `public`
pub fn combine_dh(private: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    x25519_dalek::x25519(*private, *public)
}

/// 32 random bytes as the private scalar, base-point multiplication for the public half
pub fn generate_key_pair() -> Result<KeyPair, SignalError> {
    KeyPair::generate()
}

/// A Curve25519 key pair
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[serde(with = "b64")]
    public: [u8; 32],
    #[serde(with = "b64")]
    private: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Result<Self, SignalError> {
        Ok(Self::from_private(random_bytes()?))
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let public = x25519_dalek::x25519(private, x25519_dalek::X25519_BASEPOINT_BYTES);
        Self { public, private }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        combine_dh(&self.private, their_public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Public half of a user's identity: the DH key peers agree against and
/// the Ed25519 key that signs their prekeys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    #[serde(with = "b64")]
    pub dh_public: [u8; 32],
    #[serde(with = "b64")]
    pub signing_public: [u8; 32],
}

impl IdentityKey {
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), SignalError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.signing_public).map_err(|_| SignalError::InvalidKey)?;
        verifying_key
            .verify_strict(message, &Signature::from_bytes(signature))
            .map_err(|_| SignalError::InvalidSignature)
    }
}

/// Long-term identity; the private halves never leave the owner's key store
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    dh: KeyPair,
    #[serde(with = "b64")]
    signing_seed: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self, SignalError> {
        Ok(Self {
            dh: KeyPair::generate()?,
            signing_seed: random_bytes()?,
        })
    }

    pub fn public(&self) -> IdentityKey {
        IdentityKey {
            dh_public: *self.dh.public(),
            signing_public: SigningKey::from_bytes(&self.signing_seed)
                .verifying_key()
                .to_bytes(),
        }
    }

    pub fn dh(&self) -> &KeyPair {
        &self.dh
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.signing_seed)
            .sign(message)
            .to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// A prekey as held by its owner: key pair plus the identity's signature
/// over the public bytes
///
/// Used both for the medium-term signed prekey and for one-time prekeys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prekey {
    pub key_id: u32,
    pub key_pair: KeyPair,
    #[serde(with = "b64")]
    pub signature: [u8; 64],
}

impl Prekey {
    pub fn generate(key_id: u32, identity: &IdentityKeyPair) -> Result<Self, SignalError> {
        let key_pair = KeyPair::generate()?;
        let signature = identity.sign(key_pair.public());
        Ok(Self {
            key_id,
            key_pair,
            signature,
        })
    }

    pub fn public(&self) -> PublicPrekey {
        PublicPrekey {
            key_id: self.key_id,
            public_key: *self.key_pair.public(),
            signature: self.signature,
        }
    }
}

/// Generate `count` one-time prekeys with consecutive ids starting at `start_id`
pub fn generate_prekeys(
    identity: &IdentityKeyPair,
    start_id: u32,
    count: u32,
) -> Result<Vec<Prekey>, SignalError> {
    (0..count)
        .map(|offset| {
            let key_id = start_id.checked_add(offset).ok_or(SignalError::InvalidKey)?;
            Prekey::generate(key_id, identity)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPrekey {
    pub key_id: u32,
    #[serde(with = "b64")]
    pub public_key: [u8; 32],
    #[serde(with = "b64")]
    pub signature: [u8; 64],
}

impl PublicPrekey {
    pub fn verify(&self, identity: &IdentityKey) -> Result<(), SignalError> {
        identity.verify(&self.public_key, &self.signature)
    }
}

/// Everything an initiator needs to run X3DH against a recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundle {
    pub identity_key: IdentityKey,
    pub signed_prekey: PublicPrekey,
    pub one_time_prekey: Option<PublicPrekey>,
}
