/// Integration tests for crypto-core JWT validation
use crypto_core::jwt::{
    generate_access_token, get_user_id_from_token, initialize_jwt_secret, validate_token, Claims,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use std::sync::Once;
use uuid::Uuid;

const TEST_SECRET: &str = "test-secret-key-min-32-chars-long!!!";

fn init_test_keys() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        initialize_jwt_secret(TEST_SECRET).expect("Failed to initialize test secret");
    });
}

fn sign_with(secret: &str, claims: &Claims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("Failed to encode JWT")
}

#[test]
fn test_generate_and_validate_access_token() {
    init_test_keys();
    let user_id = Uuid::new_v4();

    let token = generate_access_token(user_id).unwrap();
    let data = validate_token(&token).unwrap();

    assert_eq!(data.claims.sub, user_id.to_string());
    assert_eq!(data.claims.token_type, "access");
    assert_eq!(get_user_id_from_token(&token).unwrap(), user_id);
}

#[test]
fn test_expired_token_rejected() {
    init_test_keys();
    let now = chrono::Utc::now().timestamp();
    let token = sign_with(
        TEST_SECRET,
        &Claims {
            sub: Uuid::new_v4().to_string(),
            iat: now - 7200,
            exp: now - 3600,
            token_type: "access".into(),
        },
    );

    assert!(validate_token(&token).is_err());
}

#[test]
fn test_wrong_secret_rejected() {
    init_test_keys();
    let now = chrono::Utc::now().timestamp();
    let token = sign_with(
        "another-secret-key-that-is-long-enough",
        &Claims {
            sub: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + 3600,
            token_type: "access".into(),
        },
    );

    assert!(validate_token(&token).is_err());
}

#[test]
fn test_refresh_token_rejected() {
    init_test_keys();
    let now = chrono::Utc::now().timestamp();
    let token = sign_with(
        TEST_SECRET,
        &Claims {
            sub: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + 3600,
            token_type: "refresh".into(),
        },
    );

    assert!(validate_token(&token).is_err());
}

#[test]
fn test_malformed_subject_rejected() {
    init_test_keys();
    let now = chrono::Utc::now().timestamp();
    let token = sign_with(
        TEST_SECRET,
        &Claims {
            sub: "user-42".into(),
            iat: now,
            exp: now + 3600,
            token_type: "access".into(),
        },
    );

    assert!(validate_token(&token).is_ok());
    assert!(get_user_id_from_token(&token).is_err());
}

#[test]
fn test_short_secret_rejected() {
    assert!(initialize_jwt_secret("short").is_err());
}
