use crate::middleware::error_handling;
use crate::services::message_service::MessageServiceError;
use crate::store::StoreError;
use crate::websocket::HubError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use signal_core::SignalError;
use thiserror::Error;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cannot decrypt, handshake required")]
    SessionNotFound,

    #[error("message key not found for old counter")]
    StaleMessage,

    #[error("MAC verification failed")]
    Authentication,

    #[error("message could not be decrypted")]
    Undecryptable,

    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    /// Returns HTTP status code
    pub fn status(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::NotFound(_) => 404,
            AppError::Conflict(_) | AppError::SessionNotFound => 409,
            AppError::StaleMessage => 410,
            AppError::Authentication | AppError::Undecryptable => 422,
            AppError::Database(_) | AppError::Internal => 500,
            AppError::Config(_) | AppError::StartServer(_) => 500,
        }
    }

    /// Returns whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Internal)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound("record not found".into()),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            other => {
                tracing::error!(error = %other, "store failure");
                AppError::Database(other.to_string())
            }
        }
    }
}

impl From<SignalError> for AppError {
    fn from(e: SignalError) -> Self {
        match e {
            SignalError::StaleMessage => AppError::StaleMessage,
            SignalError::Authentication => AppError::Authentication,
            SignalError::MalformedMessage => AppError::BadRequest("malformed message".into()),
            SignalError::Decryption | SignalError::TooManySkippedMessages { .. } => {
                AppError::Undecryptable
            }
            other => {
                tracing::error!(error = %other, "signal engine failure");
                AppError::Internal
            }
        }
    }
}

impl From<MessageServiceError> for AppError {
    fn from(e: MessageServiceError) -> Self {
        match e {
            MessageServiceError::SessionNotFound { .. } => AppError::SessionNotFound,
            MessageServiceError::IdentityNotFound(user_id) => {
                AppError::NotFound(format!("no identity key for user {user_id}"))
            }
            MessageServiceError::SignedPrekeyNotFound(user_id) => {
                AppError::NotFound(format!("no signed prekey for user {user_id}"))
            }
            MessageServiceError::InvalidPrekeyCount { requested, max } => AppError::BadRequest(
                format!("prekey count must be between 1 and {max}, got {requested}"),
            ),
            MessageServiceError::InvalidUtf8 => AppError::Undecryptable,
            MessageServiceError::SelfAddressed => {
                AppError::BadRequest("cannot send a message to yourself".into())
            }
            MessageServiceError::Signal(e) => e.into(),
            MessageServiceError::Store(e) => e.into(),
        }
    }
}

impl From<HubError> for AppError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::UserNotConnected => AppError::NotFound(e.to_string()),
            HubError::SendBufferFull | HubError::HubClosed => AppError::Internal,
        }
    }
}
