use actix_middleware::JwtAuthMiddleware;
use actix_web::{get, web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

pub mod keys;
pub mod messages;
pub mod wsroute;

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "connected_clients": state.hub.connected_count().await,
    }))
}

/// Register every route; all but `/health` require a valid access token
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health).service(
        web::scope("")
            .wrap(JwtAuthMiddleware)
            .service(keys::provision_identity)
            .service(keys::get_identity)
            .service(keys::upload_prekeys)
            .service(keys::get_prekey_bundle)
            .service(messages::send_message)
            .service(messages::get_pending_messages)
            .service(wsroute::ws_handler),
    );
}
