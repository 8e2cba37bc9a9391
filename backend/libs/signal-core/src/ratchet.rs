//! Per-peer session state and the symmetric-key ratchet
//!
//! Each direction is initialized independently from an X3DH shared secret:
//! a session created with `sending = true` can only encrypt until its
//! receiving direction is initialized as well, and vice versa.
//!
//! Message keys come from a one-way HMAC chain, so a compromised chain key
//! exposes future messages of that chain but never earlier ones. There is
//! no Diffie-Hellman ratchet step; ratchet keys are generated per direction
//! and carried on the wire, but are not mixed back into the root key.
//!
//! A direction may carry associated data (the X3DH `IK_A || IK_B`), which
//! is authenticated by the AEAD of every message on that chain.

// TODO: Upgrade to aes-gcm 0.11 when stable (uses hybrid-array instead of generic-array)
#[allow(deprecated)]
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use zeroize::Zeroize;

use crate::kdf::{self, CHAIN_LABEL, ROOT_LABEL};
use crate::keys::KeyPair;
use crate::message::{EncryptedMessage, MessageType};
use crate::SignalError;

/// Largest counter jump accepted in a single message
pub const MAX_SKIP: u32 = 1000;

/// Upper bound on cached skipped-message keys per session
pub const MAX_SKIPPED_KEYS: usize = 2000;

const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sending,
    Receiving,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sending => f.write_str("sending"),
            Direction::Receiving => f.write_str("receiving"),
        }
    }
}

/// Mutable cryptographic state for one (user, peer) pair
///
/// Not safe for concurrent use: callers serialize encrypt/decrypt per pair
/// and persist the session after every call that returns it mutated.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    root_key: [u8; 32],
    sending_chain_key: Option<[u8; 32]>,
    receiving_chain_key: Option<[u8; 32]>,
    sending_ratchet_key: Option<KeyPair>,
    receiving_ratchet_key: Option<KeyPair>,
    send_counter: u32,
    receive_counter: u32,
    previous_counter: u32,
    skipped_messages: BTreeMap<u32, [u8; 32]>,
    #[serde(default)]
    sending_ad: Vec<u8>,
    #[serde(default)]
    receiving_ad: Vec<u8>,
}

impl Session {
    fn empty() -> Self {
        Self {
            root_key: [0u8; 32],
            sending_chain_key: None,
            receiving_chain_key: None,
            sending_ratchet_key: None,
            receiving_ratchet_key: None,
            send_counter: 0,
            receive_counter: 0,
            previous_counter: 0,
            skipped_messages: BTreeMap::new(),
            sending_ad: Vec::new(),
            receiving_ad: Vec::new(),
        }
    }

    /// Create a session with one direction derived from `shared_secret`
    ///
    /// Derivation is deterministic, so both peers feeding the same secret
    /// (one with `sending = true`, the other with `false`) end up with
    /// matching chain keys. The secret must be unique per peer pair.
    pub fn initialize(shared_secret: &[u8; 32], sending: bool) -> Result<Self, SignalError> {
        Self::initialize_with_ad(shared_secret, &[], sending)
    }

    /// Like `initialize`, binding `associated_data` into every message of
    /// the new direction
    pub fn initialize_with_ad(
        shared_secret: &[u8; 32],
        associated_data: &[u8],
        sending: bool,
    ) -> Result<Self, SignalError> {
        let mut session = Self::empty();
        session.initialize_direction_with_ad(shared_secret, associated_data, sending)?;
        Ok(session)
    }

    /// (Re)initialize one direction, leaving the other untouched
    pub fn initialize_direction(
        &mut self,
        shared_secret: &[u8; 32],
        sending: bool,
    ) -> Result<(), SignalError> {
        self.initialize_direction_with_ad(shared_secret, &[], sending)
    }

    /// (Re)initialize one direction with associated data; both peers must
    /// pass the same bytes or every message on the chain fails to open
    pub fn initialize_direction_with_ad(
        &mut self,
        shared_secret: &[u8; 32],
        associated_data: &[u8],
        sending: bool,
    ) -> Result<(), SignalError> {
        let root_key = kdf::derive_secret(&[shared_secret], ROOT_LABEL)?;
        let chain_key = kdf::derive_secret(&[shared_secret], CHAIN_LABEL)?;
        let ratchet_key = KeyPair::generate()?;

        self.root_key.zeroize();
        self.root_key = root_key;

        if sending {
            self.sending_chain_key.zeroize();
            self.sending_chain_key = Some(chain_key);
            self.sending_ratchet_key = Some(ratchet_key);
            self.sending_ad = associated_data.to_vec();
            self.previous_counter = self.send_counter;
            self.send_counter = 0;
        } else {
            self.receiving_chain_key.zeroize();
            self.receiving_chain_key = Some(chain_key);
            self.receiving_ratchet_key = Some(ratchet_key);
            self.receiving_ad = associated_data.to_vec();
            self.receive_counter = 0;
            self.clear_skipped();
        }

        Ok(())
    }

    pub fn is_sending_capable(&self) -> bool {
        self.sending_chain_key.is_some()
    }

    pub fn is_receiving_capable(&self) -> bool {
        self.receiving_chain_key.is_some()
    }

    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }

    pub fn receive_counter(&self) -> u32 {
        self.receive_counter
    }

    /// Length of the sending chain before its last re-initialization
    pub fn previous_counter(&self) -> u32 {
        self.previous_counter
    }

    pub fn skipped_message_count(&self) -> usize {
        self.skipped_messages.len()
    }

    pub fn sending_ratchet_public(&self) -> Option<&[u8; 32]> {
        self.sending_ratchet_key.as_ref().map(KeyPair::public)
    }

    /// Encrypt `plaintext` and advance the sending chain
    ///
    /// The session is only mutated once encryption has succeeded.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, SignalError> {
        let chain_key = self
            .sending_chain_key
            .ok_or(SignalError::DirectionNotInitialized(Direction::Sending))?;
        let ratchet_key = *self
            .sending_ratchet_public()
            .ok_or(SignalError::DirectionNotInitialized(Direction::Sending))?;
        let next_counter = self
            .send_counter
            .checked_add(1)
            .ok_or(SignalError::CounterExhausted)?;

        let (mut message_key, next_chain_key) = kdf::chain_step(&chain_key)?;
        let sealed = seal(&message_key, &self.sending_ad, plaintext).and_then(|ciphertext| {
            let mac = kdf::hmac_sha256(&message_key, &ciphertext)?;
            Ok((ciphertext, mac))
        });
        message_key.zeroize();
        let (ciphertext, mac) = sealed?;

        let counter = self.send_counter;
        self.sending_chain_key = Some(next_chain_key);
        self.send_counter = next_counter;

        Ok(EncryptedMessage {
            ciphertext,
            mac,
            counter,
            ratchet_key,
            message_type: if counter == 0 {
                MessageType::Prekey
            } else {
                MessageType::Message
            },
        })
    }

    /// Decrypt `message`, advancing the receiving chain
    ///
    /// Messages behind the receive position are served from the skipped
    /// key cache. Messages ahead of it first cache the keys of every
    /// counter in between; those keys stay cached even when the target
    /// message then fails verification, so the skipped messages remain
    /// decryptable.
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, SignalError> {
        let mut chain_key = self
            .receiving_chain_key
            .ok_or(SignalError::DirectionNotInitialized(Direction::Receiving))?;

        if message.counter < self.receive_counter {
            let message_key = self
                .skipped_messages
                .get(&message.counter)
                .ok_or(SignalError::StaleMessage)?;
            let plaintext = open(message_key, &self.receiving_ad, message)?;
            if let Some(mut used) = self.skipped_messages.remove(&message.counter) {
                used.zeroize();
            }
            return Ok(plaintext);
        }

        let gap = message.counter - self.receive_counter;
        if gap > MAX_SKIP {
            return Err(SignalError::TooManySkippedMessages { gap, max: MAX_SKIP });
        }
        let next_counter = message
            .counter
            .checked_add(1)
            .ok_or(SignalError::CounterExhausted)?;

        while self.receive_counter < message.counter {
            let (message_key, next_chain_key) = kdf::chain_step(&chain_key)?;
            self.skipped_messages.insert(self.receive_counter, message_key);
            chain_key = next_chain_key;
            self.receiving_chain_key = Some(chain_key);
            self.receive_counter += 1;
        }
        self.evict_oldest_skipped();

        let (mut message_key, next_chain_key) = kdf::chain_step(&chain_key)?;
        let opened = open(&message_key, &self.receiving_ad, message);
        message_key.zeroize();
        let plaintext = opened?;

        self.receiving_chain_key = Some(next_chain_key);
        self.receive_counter = next_counter;
        Ok(plaintext)
    }

    fn evict_oldest_skipped(&mut self) {
        while self.skipped_messages.len() > MAX_SKIPPED_KEYS {
            if let Some((_, mut key)) = self.skipped_messages.pop_first() {
                key.zeroize();
            }
        }
    }

    fn clear_skipped(&mut self) {
        for key in self.skipped_messages.values_mut() {
            key.zeroize();
        }
        self.skipped_messages.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.sending_chain_key.zeroize();
        self.receiving_chain_key.zeroize();
        self.clear_skipped();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sending", &self.is_sending_capable())
            .field("receiving", &self.is_receiving_capable())
            .field("send_counter", &self.send_counter)
            .field("receive_counter", &self.receive_counter)
            .field("previous_counter", &self.previous_counter)
            .field("skipped_messages", &self.skipped_messages.len())
            .finish_non_exhaustive()
    }
}

/// AES-256-GCM with a random nonce, output `nonce || ciphertext || tag`
fn seal(message_key: &[u8; 32], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SignalError> {
    let cipher = Aes256Gcm::new_from_slice(message_key).map_err(|_| SignalError::InvalidKey)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| SignalError::Entropy)?;

    let ciphertext = cipher
        .encrypt(
            GenericArray::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| SignalError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Verify the MAC, then open the AES-GCM payload
fn open(
    message_key: &[u8; 32],
    aad: &[u8],
    message: &EncryptedMessage,
) -> Result<Vec<u8>, SignalError> {
    kdf::verify_hmac_sha256(message_key, &message.ciphertext, &message.mac)?;

    if message.ciphertext.len() < NONCE_LEN + GCM_TAG_LEN {
        return Err(SignalError::Decryption);
    }
    let (nonce, ciphertext) = message.ciphertext.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(message_key).map_err(|_| SignalError::InvalidKey)?;
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SignalError::Decryption)
}
