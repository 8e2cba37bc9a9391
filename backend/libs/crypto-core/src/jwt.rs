/// JWT validation for the secure messaging surface
///
/// Tokens are issued by the identity service and signed with a shared
/// HS256 secret (`JWT_SECRET`). This service only needs the user id in
/// `sub`; the WebSocket hub and the REST routes trust that id once the
/// token validates.
///
/// ## Usage
///
/// ```rust,no_run
/// use crypto_core::jwt;
///
/// let secret = std::env::var("JWT_SECRET").unwrap_or_default();
/// jwt::initialize_jwt_secret(&secret).expect("Failed to initialize JWT secret");
/// ```
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 1;
const MIN_SECRET_LEN: usize = 32;
const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Token type: "access" or "refresh"
    pub token_type: String,
}

// ============================================================================
// Key Storage
// ============================================================================

struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

static JWT_KEYS: OnceCell<JwtKeys> = OnceCell::new();

/// Initialize the shared HS256 secret
///
/// MUST be called once during startup. Secrets shorter than 32 bytes are
/// rejected.
pub fn initialize_jwt_secret(secret: &str) -> Result<()> {
    if secret.len() < MIN_SECRET_LEN {
        return Err(anyhow!(
            "JWT secret must be at least {MIN_SECRET_LEN} bytes"
        ));
    }

    JWT_KEYS
        .set(JwtKeys {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
        .map_err(|_| anyhow!("JWT secret already initialized"))
}

fn keys() -> Result<&'static JwtKeys> {
    JWT_KEYS.get().ok_or_else(|| {
        anyhow!("JWT secret not initialized. Call initialize_jwt_secret() during startup.")
    })
}

// ============================================================================
// Token Generation
// ============================================================================

/// Generate an access token for `user_id`
///
/// Used by tooling and tests; production tokens come from the identity service.
pub fn generate_access_token(user_id: Uuid) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::hours(ACCESS_TOKEN_EXPIRY_HOURS)).timestamp(),
        token_type: "access".to_string(),
    };

    encode(&Header::new(JWT_ALGORITHM), &claims, &keys()?.encoding)
        .map_err(|e| anyhow!("Failed to encode token: {e}"))
}

// ============================================================================
// Token Validation
// ============================================================================

/// Validate signature and expiry, returning the decoded claims
pub fn validate_token(token: &str) -> Result<TokenData<Claims>> {
    let mut validation = Validation::new(JWT_ALGORITHM);
    validation.validate_exp = true;

    let data = decode::<Claims>(token, &keys()?.decoding, &validation)
        .map_err(|e| anyhow!("Token validation failed: {e}"))?;

    if data.claims.token_type != "access" {
        return Err(anyhow!("Token is not an access token"));
    }

    Ok(data)
}

/// Validate and parse the subject as a user id
pub fn get_user_id_from_token(token: &str) -> Result<Uuid> {
    let data = validate_token(token)?;
    Uuid::parse_str(&data.claims.sub).map_err(|e| anyhow!("Invalid user ID in token: {e}"))
}
