//! In-process store for tests and single-node development
//!
//! Nothing is persisted; state lives as long as the process. Delivered
//! messages are dropped rather than kept with a timestamp.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use signal_core::{IdentityKeyPair, Prekey, Session};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ConversationDirectory, KeyStore, MessageStore, NewMessage, SessionStore, StoreError,
    StoreResult, StoredMessage,
};

#[derive(Default)]
struct PrekeyPool {
    available: BTreeMap<u32, Prekey>,
    next_id: u32,
}

#[derive(Default)]
pub struct MemoryStore {
    identities: DashMap<Uuid, IdentityKeyPair>,
    signed_prekeys: DashMap<Uuid, Prekey>,
    prekeys: DashMap<Uuid, PrekeyPool>,
    sessions: DashMap<(Uuid, Uuid), Session>,
    messages: RwLock<Vec<StoredMessage>>,
    conversations: DashMap<Uuid, HashSet<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register conversation membership for the realtime hub
    pub fn add_participants(&self, conversation_id: Uuid, user_ids: &[Uuid]) {
        self.conversations
            .entry(conversation_id)
            .or_default()
            .extend(user_ids.iter().copied());
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn store_identity_key(
        &self,
        user_id: Uuid,
        identity: &IdentityKeyPair,
    ) -> StoreResult<bool> {
        match self.identities.entry(user_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(identity.clone());
                Ok(true)
            }
        }
    }

    async fn get_identity_key(&self, user_id: Uuid) -> StoreResult<Option<IdentityKeyPair>> {
        Ok(self.identities.get(&user_id).map(|entry| entry.clone()))
    }

    async fn store_signed_prekey(&self, user_id: Uuid, prekey: &Prekey) -> StoreResult<()> {
        self.signed_prekeys.insert(user_id, prekey.clone());
        Ok(())
    }

    async fn get_signed_prekey(&self, user_id: Uuid) -> StoreResult<Option<Prekey>> {
        Ok(self.signed_prekeys.get(&user_id).map(|entry| entry.clone()))
    }

    async fn store_prekeys(&self, user_id: Uuid, prekeys: &[Prekey]) -> StoreResult<()> {
        let mut pool = self.prekeys.entry(user_id).or_default();

        if let Some(dup) = prekeys
            .iter()
            .find(|p| p.key_id < pool.next_id || pool.available.contains_key(&p.key_id))
        {
            return Err(StoreError::Conflict(format!(
                "prekey {} already issued",
                dup.key_id
            )));
        }

        for prekey in prekeys {
            pool.next_id = pool.next_id.max(prekey.key_id.saturating_add(1));
            pool.available.insert(prekey.key_id, prekey.clone());
        }
        Ok(())
    }

    async fn claim_prekey(&self, user_id: Uuid) -> StoreResult<Option<Prekey>> {
        // the shard lock held by get_mut makes pop + return one step
        Ok(self
            .prekeys
            .get_mut(&user_id)
            .and_then(|mut pool| pool.available.pop_first().map(|(_, prekey)| prekey)))
    }

    async fn prekey_count(&self, user_id: Uuid) -> StoreResult<u32> {
        Ok(self
            .prekeys
            .get(&user_id)
            .map(|pool| pool.available.len() as u32)
            .unwrap_or(0))
    }

    async fn next_prekey_id(&self, user_id: Uuid) -> StoreResult<u32> {
        Ok(self
            .prekeys
            .get(&user_id)
            .map(|pool| pool.next_id)
            .unwrap_or(0))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn store_session(
        &self,
        user_id: Uuid,
        peer_id: Uuid,
        session: &Session,
    ) -> StoreResult<()> {
        self.sessions.insert((user_id, peer_id), session.clone());
        Ok(())
    }

    async fn get_session(&self, user_id: Uuid, peer_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self
            .sessions
            .get(&(user_id, peer_id))
            .map(|entry| entry.clone()))
    }

    async fn update_session(
        &self,
        user_id: Uuid,
        peer_id: Uuid,
        session: &Session,
    ) -> StoreResult<()> {
        match self.sessions.get_mut(&(user_id, peer_id)) {
            Some(mut entry) => {
                *entry = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store_message(&self, message: NewMessage) -> StoreResult<StoredMessage> {
        let stored = StoredMessage {
            id: Uuid::new_v4(),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            message_type: message.message_type,
            counter: message.counter,
            created_at: Utc::now(),
            delivered_at: None,
        };
        self.messages.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn pending_messages(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
    ) -> StoreResult<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.recipient_id == recipient_id && m.sender_id == sender_id)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, message_ids: &[Uuid]) -> StoreResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.messages
            .write()
            .await
            .retain(|m| !message_ids.contains(&m.id));
        Ok(())
    }
}

#[async_trait]
impl ConversationDirectory for MemoryStore {
    async fn participants(&self, conversation_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .conversations
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::{generate_prekeys, MessageType};
    use std::sync::Arc;

    fn prekeys(start: u32, count: u32) -> Vec<Prekey> {
        let identity = IdentityKeyPair::generate().unwrap();
        generate_prekeys(&identity, start, count).unwrap()
    }

    #[tokio::test]
    async fn test_claim_prekey_oldest_first_and_removed() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.store_prekeys(user, &prekeys(0, 3)).await.unwrap();

        assert_eq!(store.claim_prekey(user).await.unwrap().unwrap().key_id, 0);
        assert_eq!(store.claim_prekey(user).await.unwrap().unwrap().key_id, 1);
        assert_eq!(store.prekey_count(user).await.unwrap(), 1);
        assert_eq!(store.claim_prekey(user).await.unwrap().unwrap().key_id, 2);
        assert!(store.claim_prekey(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claimed_id_cannot_be_reissued() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.store_prekeys(user, &prekeys(0, 2)).await.unwrap();
        store.claim_prekey(user).await.unwrap();

        let err = store.store_prekeys(user, &prekeys(0, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.next_prekey_id(user).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_repeat() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.store_prekeys(user, &prekeys(0, 50)).await.unwrap();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_prekey(user).await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            if let Some(prekey) = task.await.unwrap() {
                ids.push(prekey.key_id);
            }
        }
        let unique: HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[tokio::test]
    async fn test_update_missing_session_is_not_found() {
        let store = MemoryStore::new();
        let session = Session::initialize(&[1u8; 32], true).unwrap();
        let err = store
            .update_session(Uuid::new_v4(), Uuid::new_v4(), &session)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_pending_and_mark_delivered() {
        let store = MemoryStore::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let new = |counter| NewMessage {
            sender_id: alice,
            recipient_id: bob,
            content: format!("wire-{counter}"),
            message_type: MessageType::Message,
            counter,
        };
        let first = store.store_message(new(0)).await.unwrap();
        store.store_message(new(1)).await.unwrap();

        let pending = store.pending_messages(bob, alice).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].counter, 0);

        store.mark_delivered(&[first.id]).await.unwrap();
        let pending = store.pending_messages(bob, alice).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].counter, 1);
        assert!(store.pending_messages(alice, bob).await.unwrap().is_empty());
        assert_eq!(store.messages.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_identity_is_never_replaced() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let first = IdentityKeyPair::generate().unwrap();
        let second = IdentityKeyPair::generate().unwrap();

        assert!(store.store_identity_key(user, &first).await.unwrap());
        assert!(!store.store_identity_key(user, &second).await.unwrap());

        let stored = store.get_identity_key(user).await.unwrap().unwrap();
        assert_eq!(stored.public(), first.public());
    }
}
