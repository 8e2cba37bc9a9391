//! Identity and prekey endpoints
//!
//! Key pairs are generated server-side and sealed at rest; only public
//! halves and signatures ever leave these handlers.

use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use signal_core::IdentityKey;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::User;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IdentityResponse {
    pub user_id: Uuid,
    pub identity_key: IdentityKey,
}

#[derive(Debug, Deserialize)]
pub struct UploadPrekeysRequest {
    /// Number of one-time prekeys to generate
    pub count: u32,
}

#[derive(Debug, Serialize)]
pub struct UploadPrekeysResponse {
    pub uploaded_count: u32,
    pub total_count: u32,
}

/// POST /keys/identity - create the caller's identity and signed prekey
#[post("/keys/identity")]
#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn provision_identity(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let keys = state.messages.provision_keys(user.id).await?;
    Ok(HttpResponse::Ok().json(keys))
}

/// GET /keys/identity/{user_id}
#[get("/keys/identity/{user_id}")]
#[instrument(skip(state, _user))]
pub async fn get_identity(
    state: web::Data<AppState>,
    _user: User,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let keys = state.messages.public_keys(user_id).await?;
    Ok(HttpResponse::Ok().json(IdentityResponse {
        user_id,
        identity_key: keys.identity_key,
    }))
}

/// POST /keys/prekeys - generate another batch of one-time prekeys
#[post("/keys/prekeys")]
#[instrument(skip(state), fields(user_id = %user.id, count = body.count))]
pub async fn upload_prekeys(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<UploadPrekeysRequest>,
) -> Result<HttpResponse, AppError> {
    let total_count = state.messages.replenish_prekeys(user.id, body.count).await?;
    info!(total_count, "One-time prekeys replenished");

    Ok(HttpResponse::Ok().json(UploadPrekeysResponse {
        uploaded_count: body.count,
        total_count,
    }))
}

/// GET /keys/prekeys/{user_id} - public bundle preview
///
/// Reports the remaining one-time prekey count without claiming one.
#[get("/keys/prekeys/{user_id}")]
#[instrument(skip(state, _user))]
pub async fn get_prekey_bundle(
    state: web::Data<AppState>,
    _user: User,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let keys = state.messages.public_keys(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(keys))
}
