//! Request guards for authenticated routes

use std::future::{ready, Ready};
use uuid::Uuid;

use crate::error::AppError;
use actix_middleware::UserId;
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};

/// Authenticated caller, populated by `JwtAuthMiddleware`
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

impl FromRequest for User {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let user_id = req.extensions().get::<UserId>().map(|u| u.0);
        ready(
            user_id
                .map(|id| User { id })
                .ok_or_else(|| AppError::Unauthorized.into()),
        )
    }
}
