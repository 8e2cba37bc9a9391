use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web_actors::ws;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::message_types::{self, SendPayload, WsFrame};
use super::{parse_frame, HubHandle};
use crate::config::WebSocketConfig;
use crate::services::message_service::{error_kind, MessageService};

// text produced off the actor, e.g. after an async send completes
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Outbound(String);

/// One authenticated WebSocket connection
///
/// Frames queued by the hub arrive through `queue`; when the hub drops the
/// sending half (replacement or overflow) the stream ends and the actor
/// stops.
pub struct WsSession {
    user_id: Uuid,
    connection_id: Uuid,
    hub: HubHandle,
    messages: Arc<MessageService>,
    queue: Option<mpsc::Receiver<String>>,
    settings: WebSocketConfig,
    hb: Instant,
}

impl WsSession {
    pub fn new(
        user_id: Uuid,
        connection_id: Uuid,
        queue: mpsc::Receiver<String>,
        hub: HubHandle,
        messages: Arc<MessageService>,
        settings: WebSocketConfig,
    ) -> Self {
        Self {
            user_id,
            connection_id,
            hub,
            messages,
            queue: Some(queue),
            settings,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.settings.client_timeout;
        ctx.run_interval(self.settings.ping_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                tracing::warn!(user_id = %act.user_id, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(frame) = parse_frame(text) else {
            tracing::warn!(user_id = %self.user_id, "Failed to parse WS frame");
            ctx.text(WsFrame::error("invalid_frame", "expected {\"type\", \"payload\"}").to_text());
            return;
        };

        if frame.frame_type == message_types::MESSAGE {
            self.handle_send(frame, ctx);
            return;
        }

        if let Err(e) = self.hub.dispatch(self.user_id, frame) {
            tracing::warn!(user_id = %self.user_id, error = %e, "Inbound frame dropped");
        }
    }

    /// Encrypt, persist and route a chat message
    fn handle_send(&mut self, frame: WsFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let payload: SendPayload = match serde_json::from_value(frame.payload) {
            Ok(payload) => payload,
            Err(_) => {
                ctx.text(
                    WsFrame::error("invalid_frame", "message needs recipient_id and content")
                        .to_text(),
                );
                return;
            }
        };

        let sender_id = self.user_id;
        let messages = self.messages.clone();
        let hub = self.hub.clone();
        let addr = ctx.address();

        actix::spawn(async move {
            match messages
                .send_message(sender_id, payload.recipient_id, &payload.content)
                .await
            {
                Ok(stored) => {
                    let ack = WsFrame::new(
                        message_types::SENT,
                        json!({
                            "id": stored.id,
                            "recipient_id": stored.recipient_id,
                            "counter": stored.counter,
                            "created_at": stored.created_at,
                        }),
                    );
                    addr.do_send(Outbound(ack.to_text()));

                    if let Err(e) = hub.dispatch(sender_id, WsFrame::message(&stored)) {
                        tracing::warn!(message_id = %stored.id, error = %e, "Realtime push skipped");
                    }
                }
                Err(e) => {
                    tracing::warn!(sender_id = %sender_id, error = %e, "WebSocket send failed");
                    addr.do_send(Outbound(WsFrame::error(error_kind(&e), e.to_string()).to_text()));
                }
            }
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session started"
        );

        self.hb(ctx);
        if let Some(queue) = self.queue.take() {
            ctx.add_stream(ReceiverStream::new(queue));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session stopped"
        );
        self.hub.unregister(self.user_id, self.connection_id);
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Frames queued by the hub
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, text: String, ctx: &mut Self::Context) {
        ctx.text(text);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(user_id = %self.user_id, "Hub queue closed");
        ctx.close(None);
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(user_id = %self.user_id, ?reason, "WebSocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(user_id = %self.user_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::websocket::{ClientHandle, Hub};
    use actix_web::error::PayloadError;
    use tokio::task::JoinHandle;
    use actix_web::web::Bytes;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_stream::StreamExt;

    // masked client pong with an empty body
    const PONG_FRAME: [u8; 6] = [0x8A, 0x80, 0x00, 0x00, 0x00, 0x00];

    type ClientInput = mpsc::UnboundedSender<Result<Bytes, PayloadError>>;

    fn timings(client_timeout: Duration) -> WebSocketConfig {
        WebSocketConfig {
            ping_interval: Duration::from_millis(20),
            client_timeout,
        }
    }

    /// Start a session actor the way `ws_handler` does and drive its output;
    /// the returned task finishes when the actor stops
    fn open(hub: &HubHandle, user_id: Uuid, settings: WebSocketConfig) -> (ClientInput, JoinHandle<()>) {
        let (client, queue) = ClientHandle::new(user_id);
        let messages = Arc::new(MessageService::new(Arc::new(MemoryStore::new()), 1));
        let session = WsSession::new(
            user_id,
            client.connection_id,
            queue,
            hub.clone(),
            messages,
            settings,
        );

        let (input, input_rx) = mpsc::unbounded_channel();
        let output = ws::WebsocketContext::create(session, UnboundedReceiverStream::new(input_rx));
        hub.register(client).unwrap();

        let driver = actix_web::rt::spawn(async move {
            let mut output = Box::pin(output);
            while output.next().await.is_some() {}
        });
        (input, driver)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> WsFrame {
        let text = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        serde_json::from_str(&text).unwrap()
    }

    #[actix_web::test]
    async fn test_unresponsive_client_dropped_and_offline_broadcast() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()));
        let (watcher, mut watcher_rx) = ClientHandle::new(Uuid::new_v4());
        hub.register(watcher).unwrap();

        let user = Uuid::new_v4();
        let (_input, driver) = open(&hub, user, timings(Duration::from_millis(100)));
        assert_eq!(next_frame(&mut watcher_rx).await, WsFrame::presence(user, true));

        timeout(Duration::from_secs(2), driver)
            .await
            .expect("session outlived its heartbeat deadline")
            .unwrap();
        assert_eq!(next_frame(&mut watcher_rx).await, WsFrame::presence(user, false));
        assert!(!hub.is_online(user).await);
    }

    #[actix_web::test]
    async fn test_pong_refreshes_heartbeat() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()));
        let user = Uuid::new_v4();
        let (input, driver) = open(&hub, user, timings(Duration::from_millis(100)));

        for _ in 0..15 {
            input.send(Ok(Bytes::from_static(&PONG_FRAME))).unwrap();
            sleep(Duration::from_millis(20)).await;
        }
        assert!(!driver.is_finished());
        assert!(hub.is_online(user).await);

        // silence from here on
        timeout(Duration::from_secs(2), driver)
            .await
            .expect("session ignored the missed pongs")
            .unwrap();
        assert!(!hub.is_online(user).await);
    }

    #[actix_web::test]
    async fn test_replaced_connection_stops_without_unregistering_successor() {
        let hub = Hub::spawn(Arc::new(MemoryStore::new()));
        let user = Uuid::new_v4();
        let (_input, first) = open(&hub, user, timings(Duration::from_secs(30)));

        let (second, mut second_rx) = ClientHandle::new(user);
        hub.register(second).unwrap();

        timeout(Duration::from_secs(2), first)
            .await
            .expect("closed hub queue did not stop the session")
            .unwrap();

        hub.send_to_user(user, WsFrame::presence(Uuid::new_v4(), true).to_text())
            .await
            .unwrap();
        assert_eq!(next_frame(&mut second_rx).await.frame_type, message_types::PRESENCE);
        assert!(hub.is_online(user).await);
    }
}
