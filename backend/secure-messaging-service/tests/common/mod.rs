#![allow(dead_code)]

use secure_messaging_service::config::Config;
use secure_messaging_service::state::AppState;
use secure_messaging_service::store::MemoryStore;
use std::sync::{Arc, Once};
use uuid::Uuid;

pub const TEST_SECRET: &str = "test-secret-key-min-32-chars-long!!!";

pub fn init_jwt() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        crypto_core::jwt::initialize_jwt_secret(TEST_SECRET)
            .expect("Failed to initialize test secret");
    });
}

pub fn test_config() -> Arc<Config> {
    let config = Config::from_lookup(|key| match key {
        "JWT_SECRET" => Some(TEST_SECRET.to_string()),
        "PREKEY_BATCH_SIZE" => Some("10".to_string()),
        _ => None,
    })
    .expect("test config");
    Arc::new(config)
}

/// App state over a fresh in-memory store; call from inside a runtime
pub fn test_state() -> (AppState, Arc<MemoryStore>) {
    init_jwt();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::build(test_config(), store.clone());
    (state, store)
}

pub fn bearer(user_id: Uuid) -> (&'static str, String) {
    init_jwt();
    let token = crypto_core::jwt::generate_access_token(user_id).expect("token");
    ("Authorization", format!("Bearer {token}"))
}
