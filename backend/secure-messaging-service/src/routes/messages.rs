use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::User;
use crate::services::FetchedMessage;
use crate::state::AppState;
use crate::store::StoredMessage;
use crate::websocket::WsFrame;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub recipient_id: Uuid,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: StoredMessage,
    /// Whether the recipient had a live connection to push to
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PendingMessagesResponse {
    pub messages: Vec<FetchedMessage>,
}

/// POST /messages - encrypt, store, and push to the recipient if online
#[post("/messages")]
#[instrument(skip(state, body), fields(sender_id = %user.id, recipient_id = %body.recipient_id))]
pub async fn send_message(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    if body.content.is_empty() {
        return Err(AppError::BadRequest("content must not be empty".into()));
    }

    let stored = state
        .messages
        .send_message(user.id, body.recipient_id, &body.content)
        .await?;

    // the stored copy stays pending either way; this is best-effort push
    let push = state
        .hub
        .send_to_user(body.recipient_id, WsFrame::message(&stored).to_text())
        .await;
    if let Err(e) = &push {
        debug!(error = %e, "Recipient not reachable in realtime");
    }

    Ok(HttpResponse::Created().json(SendMessageResponse {
        message: stored,
        delivered: push.is_ok(),
        delivery_error: push.err().map(|e| e.to_string()),
    }))
}

/// GET /messages/{peer_id} - decrypt and drain pending messages from a peer
#[get("/messages/{peer_id}")]
#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn get_pending_messages(
    state: web::Data<AppState>,
    user: User,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let messages = state
        .messages
        .fetch_pending(user.id, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(PendingMessagesResponse { messages }))
}
