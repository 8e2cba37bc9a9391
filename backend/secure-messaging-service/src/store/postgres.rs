//! PostgreSQL store
//!
//! Private key material and session state are serialized to JSON and
//! sealed with the service's `SealingKey` before they reach the database;
//! only public keys and signatures are stored in the clear.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crypto_core::SealingKey;
use serde::{de::DeserializeOwned, Serialize};
use signal_core::{IdentityKeyPair, MessageType, Prekey, Session};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ConversationDirectory, KeyStore, MessageStore, NewMessage, SessionStore, StoreError,
    StoreResult, StoredMessage,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    sealing_key: SealingKey,
}

impl PgStore {
    pub fn new(pool: PgPool, sealing_key: SealingKey) -> Self {
        Self { pool, sealing_key }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn seal_json<T: Serialize>(&self, value: &T) -> StoreResult<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        crypto_core::seal(&self.sealing_key, &json).map_err(|e| StoreError::Sealing(e.to_string()))
    }

    fn open_json<T: DeserializeOwned>(&self, sealed: &[u8]) -> StoreResult<T> {
        let json = crypto_core::open(&self.sealing_key, sealed)
            .map_err(|e| StoreError::Sealing(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Add conversation membership rows consulted by the realtime hub
    pub async fn add_participants(
        &self,
        conversation_id: Uuid,
        user_ids: &[Uuid],
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(user_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn key_id_from_db(raw: i64) -> StoreResult<u32> {
    u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("key id {raw} out of range")))
}

fn message_type_from_db(raw: &str) -> StoreResult<MessageType> {
    match raw {
        "prekey" => Ok(MessageType::Prekey),
        "message" => Ok(MessageType::Message),
        other => Err(StoreError::Corrupt(format!("unknown message type {other}"))),
    }
}

type MessageRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    String,
    i64,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn message_from_row(row: MessageRow) -> StoreResult<StoredMessage> {
    let (id, sender_id, recipient_id, content, message_type, counter, created_at, delivered_at) =
        row;
    Ok(StoredMessage {
        id,
        sender_id,
        recipient_id,
        content,
        message_type: message_type_from_db(&message_type)?,
        counter: u32::try_from(counter)
            .map_err(|_| StoreError::Corrupt(format!("counter {counter} out of range")))?,
        created_at,
        delivered_at,
    })
}

#[async_trait]
impl KeyStore for PgStore {
    async fn store_identity_key(
        &self,
        user_id: Uuid,
        identity: &IdentityKeyPair,
    ) -> StoreResult<bool> {
        let public = identity.public();
        let sealed = self.seal_json(identity)?;

        let result = sqlx::query(
            r#"
            INSERT INTO identity_keys (user_id, dh_public, signing_public, sealed_private)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(public.dh_public.as_slice())
        .bind(public.signing_public.as_slice())
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_identity_key(&self, user_id: Uuid) -> StoreResult<Option<IdentityKeyPair>> {
        let sealed: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT sealed_private FROM identity_keys WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        sealed.map(|s| self.open_json(&s)).transpose()
    }

    async fn store_signed_prekey(&self, user_id: Uuid, prekey: &Prekey) -> StoreResult<()> {
        let sealed = self.seal_json(prekey)?;

        sqlx::query(
            r#"
            INSERT INTO signed_prekeys (user_id, key_id, public_key, signature, sealed_private)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET key_id = EXCLUDED.key_id,
                public_key = EXCLUDED.public_key,
                signature = EXCLUDED.signature,
                sealed_private = EXCLUDED.sealed_private,
                created_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(i64::from(prekey.key_id))
        .bind(prekey.key_pair.public().as_slice())
        .bind(prekey.signature.as_slice())
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_signed_prekey(&self, user_id: Uuid) -> StoreResult<Option<Prekey>> {
        let sealed: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT sealed_private FROM signed_prekeys WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        sealed.map(|s| self.open_json(&s)).transpose()
    }

    async fn store_prekeys(&self, user_id: Uuid, prekeys: &[Prekey]) -> StoreResult<()> {
        let Some(max_id) = prekeys.iter().map(|p| p.key_id).max() else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        let next_id: Option<i64> = sqlx::query_scalar(
            "SELECT next_prekey_id FROM identity_keys WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let next_id = next_id.ok_or(StoreError::NotFound)?;

        if let Some(dup) = prekeys.iter().find(|p| i64::from(p.key_id) < next_id) {
            return Err(StoreError::Conflict(format!(
                "prekey {} already issued",
                dup.key_id
            )));
        }

        for prekey in prekeys {
            let sealed = self.seal_json(prekey)?;
            sqlx::query(
                r#"
                INSERT INTO one_time_prekeys (user_id, key_id, public_key, signature, sealed_private)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(user_id)
            .bind(i64::from(prekey.key_id))
            .bind(prekey.key_pair.public().as_slice())
            .bind(prekey.signature.as_slice())
            .bind(sealed)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE identity_keys SET next_prekey_id = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(i64::from(max_id) + 1)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim_prekey(&self, user_id: Uuid) -> StoreResult<Option<Prekey>> {
        // Claim and delete in one statement; concurrent claimers skip the locked row
        let sealed: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            WITH claimed AS (
                SELECT user_id, key_id
                FROM one_time_prekeys
                WHERE user_id = $1
                ORDER BY key_id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            DELETE FROM one_time_prekeys p
            USING claimed c
            WHERE p.user_id = c.user_id AND p.key_id = c.key_id
            RETURNING p.sealed_private
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        sealed.map(|s| self.open_json(&s)).transpose()
    }

    async fn prekey_count(&self, user_id: Uuid) -> StoreResult<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn next_prekey_id(&self, user_id: Uuid) -> StoreResult<u32> {
        let next: Option<i64> =
            sqlx::query_scalar("SELECT next_prekey_id FROM identity_keys WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        next.map(key_id_from_db).transpose().map(|id| id.unwrap_or(0))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn store_session(
        &self,
        user_id: Uuid,
        peer_id: Uuid,
        session: &Session,
    ) -> StoreResult<()> {
        let sealed = self.seal_json(session)?;

        sqlx::query(
            r#"
            INSERT INTO ratchet_sessions (user_id, peer_id, sealed_state)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, peer_id) DO UPDATE
            SET sealed_state = EXCLUDED.sealed_state,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(peer_id)
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, user_id: Uuid, peer_id: Uuid) -> StoreResult<Option<Session>> {
        let sealed: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT sealed_state FROM ratchet_sessions WHERE user_id = $1 AND peer_id = $2",
        )
        .bind(user_id)
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?;

        sealed.map(|s| self.open_json(&s)).transpose()
    }

    async fn update_session(
        &self,
        user_id: Uuid,
        peer_id: Uuid,
        session: &Session,
    ) -> StoreResult<()> {
        let sealed = self.seal_json(session)?;

        let result = sqlx::query(
            r#"
            UPDATE ratchet_sessions
            SET sealed_state = $3, updated_at = NOW()
            WHERE user_id = $1 AND peer_id = $2
            "#,
        )
        .bind(user_id)
        .bind(peer_id)
        .bind(sealed)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn store_message(&self, message: NewMessage) -> StoreResult<StoredMessage> {
        let row: MessageRow = sqlx::query_as(
            r#"
            INSERT INTO encrypted_messages (id, sender_id, recipient_id, content, message_type, counter)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, sender_id, recipient_id, content, message_type, counter, created_at, delivered_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message.sender_id)
        .bind(message.recipient_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(i64::from(message.counter))
        .fetch_one(&self.pool)
        .await?;

        message_from_row(row)
    }

    async fn pending_messages(
        &self,
        recipient_id: Uuid,
        sender_id: Uuid,
    ) -> StoreResult<Vec<StoredMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, sender_id, recipient_id, content, message_type, counter, created_at, delivered_at
            FROM encrypted_messages
            WHERE recipient_id = $1 AND sender_id = $2 AND delivered_at IS NULL
            ORDER BY seq ASC
            "#,
        )
        .bind(recipient_id)
        .bind(sender_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn mark_delivered(&self, message_ids: &[Uuid]) -> StoreResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE encrypted_messages
            SET delivered_at = NOW()
            WHERE id = ANY($1) AND delivered_at IS NULL
            "#,
        )
        .bind(message_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationDirectory for PgStore {
    async fn participants(&self, conversation_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let users: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}
