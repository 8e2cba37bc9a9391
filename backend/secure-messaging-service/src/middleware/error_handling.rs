use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};

/// JSON error body shared by every route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

// map domain errors to HTTP responses
pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (error_type, code) = match err {
        AppError::BadRequest(_) => ("validation_error", "INVALID_REQUEST"),
        AppError::Unauthorized => ("authentication_error", "INVALID_CREDENTIALS"),
        AppError::NotFound(_) => ("not_found_error", "NOT_FOUND"),
        AppError::Conflict(_) => ("conflict_error", "CONFLICT"),
        AppError::SessionNotFound => ("crypto_error", "SESSION_NOT_FOUND"),
        AppError::StaleMessage => ("crypto_error", "STALE_MESSAGE"),
        AppError::Authentication => ("crypto_error", "MAC_VERIFICATION_FAILED"),
        AppError::Undecryptable => ("crypto_error", "DECRYPTION_FAILED"),
        AppError::Database(_) => ("server_error", "DATABASE_ERROR"),
        AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
            ("server_error", "INTERNAL_SERVER_ERROR")
        }
    };

    // infrastructure details stay in the logs
    let message = match err {
        AppError::Database(_) => "database error".to_string(),
        AppError::Config(_) | AppError::StartServer(_) => "internal server error".to_string(),
        other => other.to_string(),
    };

    let response = ErrorResponse {
        error: status
            .canonical_reason()
            .unwrap_or("Error")
            .to_string(),
        message,
        status: status.as_u16(),
        error_type: error_type.to_string(),
        code: code.to_string(),
    };

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, response) = map_error(err);
    HttpResponse::build(status).json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_stale_message() {
        let (status, body) = map_error(&AppError::StaleMessage);
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body.code, "STALE_MESSAGE");
        assert_eq!(body.error, "Gone");
    }

    #[test]
    fn test_database_detail_not_exposed() {
        let (status, body) = map_error(&AppError::Database("relation sessions missing".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "database error");
    }

    #[test]
    fn test_body_uses_type_field() {
        let (_, body) = map_error(&AppError::BadRequest("count".into()));
        let json = serde_json::to_value(body).unwrap();
        assert_eq!(json["type"], "validation_error");
        assert_eq!(json["status"], 400);
    }
}
