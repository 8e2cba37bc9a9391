//! Persistence contracts for keys, sessions, messages and conversation
//! membership
//!
//! Every implementation must make `claim_prekey` atomic: a one-time prekey
//! handed out once is never handed out again, even under concurrent claims.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signal_core::{IdentityKeyPair, MessageType, Prekey, Session};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("sealed record could not be opened: {0}")]
    Sealing(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert the identity unless the user already has one
    ///
    /// Returns `false` when an existing identity was kept; it is never
    /// replaced.
    async fn store_identity_key(
        &self,
        user_id: Uuid,
        identity: &IdentityKeyPair,
    ) -> StoreResult<bool>;

    async fn get_identity_key(&self, user_id: Uuid) -> StoreResult<Option<IdentityKeyPair>>;

    /// Insert or replace the user's signed prekey
    async fn store_signed_prekey(&self, user_id: Uuid, prekey: &Prekey) -> StoreResult<()>;

    async fn get_signed_prekey(&self, user_id: Uuid) -> StoreResult<Option<Prekey>>;

    /// Add one-time prekeys; a key id already present is a `Conflict`
    async fn store_prekeys(&self, user_id: Uuid, prekeys: &[Prekey]) -> StoreResult<()>;

    /// Atomically remove and return the oldest unused one-time prekey
    async fn claim_prekey(&self, user_id: Uuid) -> StoreResult<Option<Prekey>>;

    async fn prekey_count(&self, user_id: Uuid) -> StoreResult<u32>;

    /// First key id not yet issued to this user
    async fn next_prekey_id(&self, user_id: Uuid) -> StoreResult<u32>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the session for `(user_id, peer_id)`
    async fn store_session(&self, user_id: Uuid, peer_id: Uuid, session: &Session)
        -> StoreResult<()>;

    async fn get_session(&self, user_id: Uuid, peer_id: Uuid) -> StoreResult<Option<Session>>;

    /// Replace an existing session; `NotFound` when there is none
    async fn update_session(
        &self,
        user_id: Uuid,
        peer_id: Uuid,
        session: &Session,
    ) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    /// Base64 wire envelope
    pub content: String,
    pub message_type: MessageType,
    pub counter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub counter: u32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store_message(&self, message: NewMessage) -> StoreResult<StoredMessage>;

    /// Undelivered messages from `sender_id` to `recipient_id`, oldest first
    async fn pending_messages(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
    ) -> StoreResult<Vec<StoredMessage>>;

    /// Take messages out of the pending set; unknown ids are ignored
    async fn mark_delivered(&self, message_ids: &[Uuid]) -> StoreResult<()>;
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn participants(&self, conversation_id: Uuid) -> StoreResult<Vec<Uuid>>;
}

/// Everything the service needs from a single backend
pub trait Store: KeyStore + SessionStore + MessageStore + ConversationDirectory {}

impl<T> Store for T where T: KeyStore + SessionStore + MessageStore + ConversationDirectory {}
