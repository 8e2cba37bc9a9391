//! Session-oriented message service
//!
//! Owns the read-modify-write cycle around a ratchet session: load, run
//! X3DH when the sending direction is missing, encrypt or decrypt, persist.
//! Every cycle for a user pair runs under that pair's lock, so two
//! messages between the same users can never interleave their session
//! updates.

use dashmap::DashMap;
use serde::Serialize;
use signal_core::x3dh;
use signal_core::{
    generate_prekeys, EncryptedMessage, IdentityKey, IdentityKeyPair, Prekey, PrekeyBundle,
    PublicPrekey, Session, SignalError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::store::{NewMessage, Store, StoreError, StoredMessage};

/// Largest batch a single replenish call may generate
pub const MAX_PREKEY_BATCH: u32 = 1000;

const SIGNED_PREKEY_ID: u32 = 1;

#[derive(Debug, Error)]
pub enum MessageServiceError {
    #[error("no session between {user_id} and {peer_id}: handshake required")]
    SessionNotFound { user_id: Uuid, peer_id: Uuid },

    #[error("no identity key for user {0}")]
    IdentityNotFound(Uuid),

    #[error("no signed prekey for user {0}")]
    SignedPrekeyNotFound(Uuid),

    #[error("prekey count {requested} outside 1..={max}")]
    InvalidPrekeyCount { requested: u32, max: u32 },

    #[error("decrypted content is not valid UTF-8")]
    InvalidUtf8,

    #[error("sender and recipient must differ")]
    SelfAddressed,

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServiceResult<T> = Result<T, MessageServiceError>;

/// Public keys a peer needs to recognize a user
#[derive(Debug, Clone, Serialize)]
pub struct PublicKeys {
    pub user_id: Uuid,
    pub identity_key: IdentityKey,
    pub signed_prekey: PublicPrekey,
    pub one_time_prekeys_remaining: u32,
}

/// One entry of a pending-message fetch
#[derive(Debug, Clone, Serialize)]
pub struct FetchedMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub counter: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Plaintext when decryption succeeded
    pub content: Option<String>,
    /// Error kind when it did not
    pub error: Option<String>,
}

type PairLocks = DashMap<(Uuid, Uuid), Arc<Mutex<()>>>;

/// Held pair lock; the map entry is dropped with the last holder
struct PairGuard<'a> {
    locks: &'a PairLocks,
    key: (Uuid, Uuid),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // waiters hold their own clone, so a count of 1 means nobody is queued
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct MessageService {
    store: Arc<dyn Store>,
    pair_locks: PairLocks,
    prekey_batch_size: u32,
}

impl MessageService {
    pub fn new(store: Arc<dyn Store>, prekey_batch_size: u32) -> Self {
        Self {
            store,
            pair_locks: DashMap::new(),
            prekey_batch_size: prekey_batch_size.clamp(1, MAX_PREKEY_BATCH),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Lock covering both directions of a user pair
    ///
    /// `(user, user)` never carries messages and serializes provisioning.
    async fn lock_pair(&self, a: Uuid, b: Uuid) -> PairGuard<'_> {
        let key = if a <= b { (a, b) } else { (b, a) };
        let lock = self
            .pair_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        PairGuard {
            locks: &self.pair_locks,
            key,
            guard: Some(guard),
        }
    }

    // ========================================================================
    // Key provisioning
    // ========================================================================

    /// Create the caller's identity, signed prekey and first prekey batch
    ///
    /// Idempotent: an existing identity is kept and its public keys returned.
    /// Concurrent calls agree on one identity; only the call whose identity
    /// was stored writes the signed prekey and the first batch.
    #[instrument(skip(self))]
    pub async fn provision_keys(&self, user_id: Uuid) -> ServiceResult<PublicKeys> {
        let _guard = self.lock_pair(user_id, user_id).await;

        if self.store.get_identity_key(user_id).await?.is_none() {
            let identity = IdentityKeyPair::generate()?;

            if self.store.store_identity_key(user_id, &identity).await? {
                let signed = Prekey::generate(SIGNED_PREKEY_ID, &identity)?;
                self.store.store_signed_prekey(user_id, &signed).await?;
                self.generate_and_store(user_id, &identity, self.prekey_batch_size)
                    .await?;

                info!(user_id = %user_id, batch = self.prekey_batch_size, "Provisioned identity keys");
            } else {
                debug!(user_id = %user_id, "Identity stored by another writer, keeping it");
            }
        }

        self.public_keys(user_id).await
    }

    /// Generate `count` more one-time prekeys, returning the new total
    #[instrument(skip(self))]
    pub async fn replenish_prekeys(&self, user_id: Uuid, count: u32) -> ServiceResult<u32> {
        if count == 0 || count > MAX_PREKEY_BATCH {
            return Err(MessageServiceError::InvalidPrekeyCount {
                requested: count,
                max: MAX_PREKEY_BATCH,
            });
        }

        let identity = self
            .store
            .get_identity_key(user_id)
            .await?
            .ok_or(MessageServiceError::IdentityNotFound(user_id))?;

        self.generate_and_store(user_id, &identity, count).await?;
        let total = self.store.prekey_count(user_id).await?;
        debug!(user_id = %user_id, count, total, "Replenished one-time prekeys");
        Ok(total)
    }

    async fn generate_and_store(
        &self,
        user_id: Uuid,
        identity: &IdentityKeyPair,
        count: u32,
    ) -> ServiceResult<()> {
        let start_id = self.store.next_prekey_id(user_id).await?;
        let prekeys = generate_prekeys(identity, start_id, count)?;
        self.store.store_prekeys(user_id, &prekeys).await?;
        Ok(())
    }

    /// Public identity, signed prekey and remaining one-time prekey count
    ///
    /// Read-only: no prekey is consumed.
    pub async fn public_keys(&self, user_id: Uuid) -> ServiceResult<PublicKeys> {
        let identity = self
            .store
            .get_identity_key(user_id)
            .await?
            .ok_or(MessageServiceError::IdentityNotFound(user_id))?;
        let signed = self
            .store
            .get_signed_prekey(user_id)
            .await?
            .ok_or(MessageServiceError::SignedPrekeyNotFound(user_id))?;
        let remaining = self.store.prekey_count(user_id).await?;

        Ok(PublicKeys {
            user_id,
            identity_key: identity.public(),
            signed_prekey: signed.public(),
            one_time_prekeys_remaining: remaining,
        })
    }

    // ========================================================================
    // Encrypt / decrypt
    // ========================================================================

    /// Encrypt `plaintext` from `sender_id` to `recipient_id`
    ///
    /// Returns the base64 wire envelope. When the sender has no sending chain
    /// for this peer, a full X3DH handshake against the recipient's bundle
    /// runs first and both ends of the new chain are persisted.
    #[instrument(skip(self, plaintext), fields(sender_id = %sender_id, recipient_id = %recipient_id))]
    pub async fn encrypt_message(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        plaintext: &[u8],
    ) -> ServiceResult<String> {
        if sender_id == recipient_id {
            return Err(MessageServiceError::SelfAddressed);
        }
        let _guard = self.lock_pair(sender_id, recipient_id).await;

        let (message, _) = self
            .encrypt_locked(sender_id, recipient_id, plaintext)
            .await?;
        Ok(message.to_wire()?)
    }

    async fn encrypt_locked(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        plaintext: &[u8],
    ) -> ServiceResult<(EncryptedMessage, Session)> {
        let mut session = match self.store.get_session(sender_id, recipient_id).await? {
            Some(session) if session.is_sending_capable() => session,
            existing => {
                self.establish_sending_chain(sender_id, recipient_id, existing)
                    .await?
            }
        };

        let message = session.encrypt(plaintext)?;
        self.store
            .update_session(sender_id, recipient_id, &session)
            .await?;

        debug!(counter = message.counter, message_type = message.message_type.as_str(), "Encrypted message");
        Ok((message, session))
    }

    /// Run X3DH for `sender -> recipient` and persist both resulting chains
    async fn establish_sending_chain(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        existing: Option<Session>,
    ) -> ServiceResult<Session> {
        let sender_identity = self
            .store
            .get_identity_key(sender_id)
            .await?
            .ok_or(MessageServiceError::IdentityNotFound(sender_id))?;
        let recipient_identity = self
            .store
            .get_identity_key(recipient_id)
            .await?
            .ok_or(MessageServiceError::IdentityNotFound(recipient_id))?;
        let signed = self
            .store
            .get_signed_prekey(recipient_id)
            .await?
            .ok_or(MessageServiceError::SignedPrekeyNotFound(recipient_id))?;

        let one_time = self.store.claim_prekey(recipient_id).await?;
        if one_time.is_none() {
            warn!(recipient_id = %recipient_id, "One-time prekeys exhausted, handshake without DH4");
        }

        let bundle = PrekeyBundle {
            identity_key: recipient_identity.public(),
            signed_prekey: signed.public(),
            one_time_prekey: one_time.as_ref().map(Prekey::public),
        };

        let handshake = x3dh::initiate(&sender_identity, &bundle)?;
        let associated_data =
            x3dh::associated_data(&sender_identity.public(), &recipient_identity.public());
        let responder_secret = x3dh::respond(
            &recipient_identity,
            &signed,
            one_time.as_ref(),
            &sender_identity.public(),
            &handshake.ephemeral_public,
        )?;

        let recipient_session = match self.store.get_session(recipient_id, sender_id).await? {
            Some(mut session) => {
                session.initialize_direction_with_ad(&responder_secret, &associated_data, false)?;
                session
            }
            None => Session::initialize_with_ad(&responder_secret, &associated_data, false)?,
        };

        let sender_session = match existing {
            Some(mut session) => {
                session.initialize_direction_with_ad(
                    &handshake.shared_secret,
                    &associated_data,
                    true,
                )?;
                session
            }
            None => Session::initialize_with_ad(&handshake.shared_secret, &associated_data, true)?,
        };

        self.store
            .store_session(recipient_id, sender_id, &recipient_session)
            .await?;
        self.store
            .store_session(sender_id, recipient_id, &sender_session)
            .await?;

        info!(
            signed_prekey_id = handshake.signed_prekey_id,
            one_time_prekey_id = ?handshake.one_time_prekey_id,
            "Established sending chain via X3DH"
        );
        Ok(sender_session)
    }

    /// Decrypt a wire envelope `recipient_id` received from `sender_id`
    ///
    /// The session is written back whenever the ratchet moved, including a
    /// failed decrypt that first cached skipped keys.
    #[instrument(skip(self, wire), fields(recipient_id = %recipient_id, sender_id = %sender_id))]
    pub async fn decrypt_message(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
        wire: &str,
    ) -> ServiceResult<Vec<u8>> {
        let _guard = self.lock_pair(recipient_id, sender_id).await;

        let mut session = self.load_receiving(recipient_id, sender_id).await?;
        let message = EncryptedMessage::from_wire(wire)?;
        let (result, moved) = ratchet_decrypt(&mut session, &message);
        if moved {
            self.store
                .update_session(recipient_id, sender_id, &session)
                .await?;
        }

        report_decrypt(recipient_id, sender_id, &message, result)
    }

    async fn load_receiving(&self, recipient_id: Uuid, sender_id: Uuid) -> ServiceResult<Session> {
        self.store
            .get_session(recipient_id, sender_id)
            .await?
            .ok_or(MessageServiceError::SessionNotFound {
                user_id: recipient_id,
                peer_id: sender_id,
            })
    }

    // ========================================================================
    // Durable messaging
    // ========================================================================

    /// Encrypt and durably store a message for later delivery
    #[instrument(skip(self, content), fields(sender_id = %sender_id, recipient_id = %recipient_id))]
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        content: &str,
    ) -> ServiceResult<StoredMessage> {
        if sender_id == recipient_id {
            return Err(MessageServiceError::SelfAddressed);
        }
        let _guard = self.lock_pair(sender_id, recipient_id).await;

        let (message, _) = self
            .encrypt_locked(sender_id, recipient_id, content.as_bytes())
            .await?;

        // stored under the same lock so storage order matches counter order
        let stored = self
            .store
            .store_message(NewMessage {
                sender_id,
                recipient_id,
                content: message.to_wire()?,
                message_type: message.message_type,
                counter: message.counter,
            })
            .await?;

        info!(message_id = %stored.id, counter = stored.counter, "Stored encrypted message");
        Ok(stored)
    }

    /// Decrypt every undelivered message from `sender_id`, oldest first
    ///
    /// The whole fetch holds the pair lock. Each decrypted message is marked
    /// delivered before the advanced session is written back, so a store
    /// failure can leave at most a redundant skipped key, never a pending
    /// message whose key is gone. Messages that fail to decrypt stay pending
    /// and are reported by error kind only. After a store failure the
    /// remaining messages are reported as `storage_error`, untouched.
    #[instrument(skip(self), fields(recipient_id = %recipient_id, sender_id = %sender_id))]
    pub async fn fetch_pending(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
    ) -> ServiceResult<Vec<FetchedMessage>> {
        let _guard = self.lock_pair(recipient_id, sender_id).await;

        let pending = self
            .store
            .pending_messages(recipient_id, sender_id)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut session = match self.load_receiving(recipient_id, sender_id).await {
            Ok(session) => Some(session),
            Err(MessageServiceError::Store(e)) => return Err(e.into()),
            Err(e) => {
                let kind = error_kind(&e);
                return Ok(pending
                    .iter()
                    .map(|m| FetchedMessage::failed(m, kind))
                    .collect());
            }
        };

        let mut fetched = Vec::with_capacity(pending.len());
        for message in &pending {
            let Some(current) = session.as_mut() else {
                fetched.push(FetchedMessage::failed(message, "storage_error"));
                continue;
            };

            let outcome = self
                .fetch_one(recipient_id, sender_id, current, message)
                .await;
            match outcome {
                Ok(content) => fetched.push(FetchedMessage::decrypted(message, content)),
                Err(FetchFailure::Rejected(e)) => {
                    fetched.push(FetchedMessage::failed(message, error_kind(&e)))
                }
                Err(FetchFailure::Store { error, content }) => {
                    warn!(message_id = %message.id, error = %error, "Store failed during fetch, stopping");
                    fetched.push(match content {
                        Some(content) => FetchedMessage::decrypted(message, content),
                        None => FetchedMessage::failed(message, "storage_error"),
                    });
                    session = None;
                }
            }
        }

        Ok(fetched)
    }

    /// Decrypt one pending message against the in-memory session and
    /// persist the outcome
    async fn fetch_one(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
        session: &mut Session,
        message: &StoredMessage,
    ) -> Result<String, FetchFailure> {
        let wire = EncryptedMessage::from_wire(&message.content)
            .map_err(|e| FetchFailure::Rejected(e.into()))?;

        let mut attempt = session.clone();
        let (result, moved) = ratchet_decrypt(&mut attempt, &wire);
        let decrypted = report_decrypt(recipient_id, sender_id, &wire, result).and_then(|bytes| {
            String::from_utf8(bytes).map_err(|_| MessageServiceError::InvalidUtf8)
        });

        if decrypted.is_ok() {
            if let Err(error) = self.store.mark_delivered(&[message.id]).await {
                return Err(FetchFailure::Store {
                    error,
                    content: None,
                });
            }
        }

        if moved {
            if let Err(error) = self
                .store
                .update_session(recipient_id, sender_id, &attempt)
                .await
            {
                return Err(FetchFailure::Store {
                    error,
                    content: decrypted.ok(),
                });
            }
        }

        *session = attempt;
        decrypted.map_err(FetchFailure::Rejected)
    }
}

enum FetchFailure {
    /// Decrypt failed; whatever the ratchet cached is persisted
    Rejected(MessageServiceError),
    /// A store write failed; `content` is set when the message was already
    /// marked delivered
    Store {
        error: StoreError,
        content: Option<String>,
    },
}

impl FetchedMessage {
    fn decrypted(message: &StoredMessage, content: String) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            counter: message.counter,
            created_at: message.created_at,
            content: Some(content),
            error: None,
        }
    }

    fn failed(message: &StoredMessage, kind: &str) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            counter: message.counter,
            created_at: message.created_at,
            content: None,
            error: Some(kind.to_string()),
        }
    }
}

/// Run the ratchet, reporting whether the session state moved
fn ratchet_decrypt(
    session: &mut Session,
    message: &EncryptedMessage,
) -> (Result<Vec<u8>, SignalError>, bool) {
    let before = (session.receive_counter(), session.skipped_message_count());
    let result = session.decrypt(message);
    let after = (session.receive_counter(), session.skipped_message_count());
    (result, after != before)
}

fn report_decrypt(
    recipient_id: Uuid,
    sender_id: Uuid,
    message: &EncryptedMessage,
    result: Result<Vec<u8>, SignalError>,
) -> ServiceResult<Vec<u8>> {
    match result {
        Ok(plaintext) => Ok(plaintext),
        Err(SignalError::Authentication) => {
            warn!(
                target: "security",
                recipient_id = %recipient_id,
                sender_id = %sender_id,
                counter = message.counter,
                "MAC verification failed"
            );
            Err(SignalError::Authentication.into())
        }
        Err(e) => {
            debug!(counter = message.counter, error = %e, "Decrypt failed");
            Err(e.into())
        }
    }
}

/// Stable, key-free label for a failure
pub fn error_kind(err: &MessageServiceError) -> &'static str {
    match err {
        MessageServiceError::SessionNotFound { .. } => "session_not_found",
        MessageServiceError::IdentityNotFound(_) => "identity_not_found",
        MessageServiceError::SignedPrekeyNotFound(_) => "signed_prekey_not_found",
        MessageServiceError::InvalidPrekeyCount { .. } => "invalid_prekey_count",
        MessageServiceError::InvalidUtf8 => "invalid_utf8",
        MessageServiceError::SelfAddressed => "self_addressed",
        MessageServiceError::Signal(SignalError::StaleMessage) => "stale_message",
        MessageServiceError::Signal(SignalError::Authentication) => "authentication_failed",
        MessageServiceError::Signal(SignalError::MalformedMessage) => "malformed_message",
        MessageServiceError::Signal(SignalError::TooManySkippedMessages { .. }) => {
            "too_many_skipped_messages"
        }
        MessageServiceError::Signal(_) => "decryption_failed",
        MessageServiceError::Store(_) => "storage_error",
    }
}
