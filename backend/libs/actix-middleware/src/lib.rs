//! # Actix Middleware Library
//!
//! Middleware shared by the messaging service's HTTP and WebSocket routes
//!
//! ## Modules
//! - `jwt_auth`: HS256 bearer-token authentication
//! - `logging`: per-request tracing span and request id

pub mod jwt_auth;
pub mod logging;

pub use jwt_auth::{extract_token, JwtAuthMiddleware, UserId};
pub use logging::{Logging, RequestId};
