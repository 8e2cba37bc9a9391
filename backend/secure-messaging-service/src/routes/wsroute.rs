use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

use crate::middleware::User;
use crate::state::AppState;
use crate::websocket::session::WsSession;
use crate::websocket::ClientHandle;

/// GET /ws - upgrade an authenticated caller to a realtime connection
///
/// The token may come from `Authorization: Bearer` or `?token=`, since
/// browsers cannot set headers on a WebSocket handshake.
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, Error> {
    let (client, queue) = ClientHandle::new(user.id);
    let connection_id = client.connection_id;

    let session = WsSession::new(
        user.id,
        connection_id,
        queue,
        state.hub.clone(),
        state.messages.clone(),
        state.config.websocket.clone(),
    );
    let response = ws::start(session, &req, stream)?;

    state.hub.register(client).map_err(crate::error::AppError::from)?;
    tracing::debug!(user_id = %user.id, connection_id = %connection_id, "WebSocket upgraded");
    Ok(response)
}
