use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::{ready, Ready};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use uuid::Uuid;

/// Authenticated user, inserted into request extensions by [`JwtAuthMiddleware`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

/// Pull a bearer token from the request
///
/// Browsers cannot set headers on a WebSocket upgrade, so a `token` query
/// parameter is accepted when no `Authorization` header is present.
pub fn extract_token(req: &ServiceRequest) -> Result<String, &'static str> {
    if let Some(header) = req.headers().get("Authorization") {
        let value = header
            .to_str()
            .map_err(|_| "Invalid Authorization header format")?;
        return value
            .strip_prefix("Bearer ")
            .map(|t| t.trim().to_string())
            .ok_or("Invalid Authorization header format");
    }

    req.query_string()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .ok_or("Missing Authorization header")
}

/// Validates an HS256 access token and records the caller's [`UserId`]
pub struct JwtAuthMiddleware;

impl<S, B> Transform<S, ServiceRequest> for JwtAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = JwtAuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct JwtAuthMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for JwtAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move {
            let token = extract_token(&req).map_err(actix_web::error::ErrorUnauthorized)?;

            let user_id = crypto_core::jwt::get_user_id_from_token(&token).map_err(|e| {
                tracing::warn!(path = %req.path(), "JWT validation failed: {}", e);
                actix_web::error::ErrorUnauthorized("Invalid token")
            })?;

            req.extensions_mut().insert(UserId(user_id));

            service.call(req).await
        })
    }
}

impl actix_web::FromRequest for UserId {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        match req.extensions().get::<UserId>() {
            Some(user_id) => ready(Ok(*user_id)),
            None => ready(Err(actix_web::error::ErrorUnauthorized(
                "User not authenticated",
            ))),
        }
    }
}
