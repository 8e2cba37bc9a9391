use crypto_core::SealingKey;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Seals private key material and session state before it is written
    pub sealing_key: SealingKey,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub ping_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    /// `None` runs the service on the in-memory store
    pub database: Option<DatabaseConfig>,
    pub websocket: WebSocketConfig,
    pub prekey_batch_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(8085);

        let jwt_secret =
            get("JWT_SECRET").ok_or_else(|| AppError::Config("JWT_SECRET missing".into()))?;

        let database = match get("DATABASE_URL") {
            Some(url) => {
                let sealing_hex = get("KEY_SEALING_KEY").ok_or_else(|| {
                    AppError::Config("KEY_SEALING_KEY is required when DATABASE_URL is set".into())
                })?;
                let sealing_key = SealingKey::from_hex(sealing_hex.trim())
                    .map_err(|e| AppError::Config(format!("KEY_SEALING_KEY invalid: {e}")))?;
                let max_connections = get("DB_MAX_CONNECTIONS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10);
                Some(DatabaseConfig {
                    url,
                    max_connections,
                    sealing_key,
                })
            }
            None => None,
        };

        let defaults = WebSocketConfig::default();
        let ping_interval = get("WS_PING_INTERVAL_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.ping_interval);
        let client_timeout = get("WS_CLIENT_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.client_timeout);
        if client_timeout <= ping_interval {
            return Err(AppError::Config(
                "WS_CLIENT_TIMEOUT_SECS must exceed WS_PING_INTERVAL_SECS".into(),
            ));
        }

        let prekey_batch_size = get("PREKEY_BATCH_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        Ok(Self {
            port,
            jwt_secret,
            database,
            websocket: WebSocketConfig {
                ping_interval,
                client_timeout,
            },
            prekey_batch_size,
        })
    }
}
