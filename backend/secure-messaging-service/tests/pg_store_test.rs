//! PostgreSQL store tests
//!
//! Run with `DATABASE_URL` pointing at a scratch database:
//! `cargo test --test pg_store_test -- --ignored`

use crypto_core::SealingKey;
use secure_messaging_service::db;
use secure_messaging_service::store::{KeyStore, MessageStore, NewMessage, PgStore, SessionStore, StoreError};
use signal_core::{generate_prekeys, IdentityKeyPair, MessageType, Prekey, Session};
use sqlx::postgres::PgPoolOptions;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

async fn store() -> PgStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect");
    db::run_migrations(&pool).await.expect("migrations");
    PgStore::new(pool, SealingKey::generate().expect("sealing key"))
}

async fn provisioned(store: &PgStore) -> (Uuid, IdentityKeyPair) {
    let user = Uuid::new_v4();
    let identity = IdentityKeyPair::generate().unwrap();
    store.store_identity_key(user, &identity).await.unwrap();
    store
        .store_signed_prekey(user, &Prekey::generate(1, &identity).unwrap())
        .await
        .unwrap();
    (user, identity)
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_identity_round_trips_sealed() {
    let store = store().await;
    let (user, identity) = provisioned(&store).await;

    let loaded = store.get_identity_key(user).await.unwrap().unwrap();
    assert_eq!(loaded.public(), identity.public());

    let raw: Vec<u8> = sqlx::query_scalar("SELECT sealed_private FROM identity_keys WHERE user_id = $1")
        .bind(user)
        .fetch_one(store.pool())
        .await
        .unwrap();
    let plain = serde_json::to_vec(&identity).unwrap();
    assert_ne!(raw, plain);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_identity_insert_keeps_existing() {
    let store = store().await;
    let (user, identity) = provisioned(&store).await;

    let other = IdentityKeyPair::generate().unwrap();
    assert!(!store.store_identity_key(user, &other).await.unwrap());
    let loaded = store.get_identity_key(user).await.unwrap().unwrap();
    assert_eq!(loaded.public(), identity.public());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires PostgreSQL database"]
async fn test_concurrent_claims_never_repeat() {
    let store = Arc::new(store().await);
    let (user, identity) = provisioned(&store).await;
    store
        .store_prekeys(user, &generate_prekeys(&identity, 0, 20).unwrap())
        .await
        .unwrap();

    let tasks: Vec<_> = (0..32)
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
    assert_eq!(ids.len(), 20);
    assert_eq!(unique.len(), 20);
    assert_eq!(store.prekey_count(user).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_claimed_ids_not_reissued() {
    let store = store().await;
    let (user, identity) = provisioned(&store).await;
    store
        .store_prekeys(user, &generate_prekeys(&identity, 0, 2).unwrap())
        .await
        .unwrap();
    store.claim_prekey(user).await.unwrap();

    let err = store
        .store_prekeys(user, &generate_prekeys(&identity, 0, 1).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert_eq!(store.next_prekey_id(user).await.unwrap(), 2);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_session_update_requires_existing_row() {
    let store = store().await;
    let (alice, _) = provisioned(&store).await;
    let bob = Uuid::new_v4();
    let mut session = Session::initialize(&[7u8; 32], true).unwrap();

    let err = store.update_session(alice, bob, &session).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));

    store.store_session(alice, bob, &session).await.unwrap();
    session.encrypt(b"x").unwrap();
    store.update_session(alice, bob, &session).await.unwrap();
    let loaded = store.get_session(alice, bob).await.unwrap().unwrap();
    assert_eq!(loaded.send_counter(), 1);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_pending_messages_in_order() {
    let store = store().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let mut ids = Vec::new();
    for counter in 0..3 {
        let stored = store
            .store_message(NewMessage {
                sender_id: alice,
                recipient_id: bob,
                content: format!("wire-{counter}"),
                message_type: MessageType::Message,
                counter,
            })
            .await
            .unwrap();
        ids.push(stored.id);
    }

    store.mark_delivered(&ids[..1]).await.unwrap();
    let pending = store.pending_messages(bob, alice).await.unwrap();
    let counters: Vec<u32> = pending.iter().map(|m| m.counter).collect();
    assert_eq!(counters, vec![1, 2]);
}
