//! Realtime connection hub
//!
//! One tokio task owns the client registry and is the only writer to it.
//! Connections reach the task through three channels: register, unregister
//! and inbound frames. Senders anywhere in the service look clients up
//! under the registry's read lock and enqueue with `try_send`, so a slow
//! consumer is disconnected instead of stalling everyone else.
//!
//! Only one connection per user is tracked; a newer connection replaces
//! the older one. Presence is broadcast to every connected client without
//! contact filtering.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::ConversationDirectory;

pub mod message_types;
pub mod session;

pub use message_types::WsFrame;

/// Outbound frames buffered per client before it counts as too slow
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

const INBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("user not connected")]
    UserNotConnected,

    #[error("send buffer full")]
    SendBufferFull,

    #[error("hub is not running")]
    HubClosed,
}

/// Registry entry for one live connection
pub struct ClientHandle {
    pub user_id: Uuid,
    pub connection_id: Uuid,
    sender: mpsc::Sender<String>,
}

impl ClientHandle {
    pub fn new(user_id: Uuid) -> (Self, mpsc::Receiver<String>) {
        Self::with_capacity(user_id, CLIENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(user_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = Self {
            user_id,
            connection_id: Uuid::new_v4(),
            sender,
        };
        (handle, receiver)
    }
}

type Registry = Arc<RwLock<HashMap<Uuid, ClientHandle>>>;

struct Inbound {
    sender_id: Uuid,
    frame: WsFrame,
}

/// Read side of the registry plus the way back into the hub loop
#[derive(Clone)]
struct Router {
    clients: Registry,
    unregister_tx: UnboundedSender<(Uuid, Uuid)>,
}

impl Router {
    async fn send_to_user(&self, user_id: Uuid, text: String) -> Result<(), HubError> {
        let clients = self.clients.read().await;
        deliver(&clients, &self.unregister_tx, user_id, text)
    }
}

/// Enqueue without blocking; a full or closed queue schedules the client
/// for unregistration
fn deliver(
    clients: &HashMap<Uuid, ClientHandle>,
    unregister_tx: &UnboundedSender<(Uuid, Uuid)>,
    user_id: Uuid,
    text: String,
) -> Result<(), HubError> {
    let client = clients.get(&user_id).ok_or(HubError::UserNotConnected)?;

    match client.sender.try_send(text) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => {
            tracing::warn!(user_id = %user_id, "Client send buffer full, disconnecting");
            let _ = unregister_tx.send((user_id, client.connection_id));
            Err(HubError::SendBufferFull)
        }
        Err(TrySendError::Closed(_)) => {
            let _ = unregister_tx.send((user_id, client.connection_id));
            Err(HubError::UserNotConnected)
        }
    }
}

/// Cloneable handle used by routes and connection actors
#[derive(Clone)]
pub struct HubHandle {
    router: Router,
    register_tx: UnboundedSender<ClientHandle>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl HubHandle {
    pub fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.register_tx
            .send(client)
            .map_err(|_| HubError::HubClosed)
    }

    pub fn unregister(&self, user_id: Uuid, connection_id: Uuid) {
        let _ = self.router.unregister_tx.send((user_id, connection_id));
    }

    /// Queue a raw text frame for one user
    pub async fn send_to_user(&self, user_id: Uuid, text: String) -> Result<(), HubError> {
        self.router.send_to_user(user_id, text).await
    }

    /// Hand an inbound client frame to the hub loop for routing
    pub fn dispatch(&self, sender_id: Uuid, frame: WsFrame) -> Result<(), HubError> {
        self.inbound_tx
            .try_send(Inbound { sender_id, frame })
            .map_err(|e| match e {
                TrySendError::Full(_) => HubError::SendBufferFull,
                TrySendError::Closed(_) => HubError::HubClosed,
            })
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.router.clients.read().await.contains_key(&user_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.router.clients.read().await.len()
    }
}

pub struct Hub {
    router: Router,
    directory: Arc<dyn ConversationDirectory>,
    register_rx: UnboundedReceiver<ClientHandle>,
    unregister_rx: UnboundedReceiver<(Uuid, Uuid)>,
    inbound_rx: mpsc::Receiver<Inbound>,
}

impl Hub {
    /// Start the hub loop on the current runtime
    ///
    /// The loop exits once every `HubHandle` is dropped.
    pub fn spawn(directory: Arc<dyn ConversationDirectory>) -> HubHandle {
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let router = Router {
            clients: Arc::new(RwLock::new(HashMap::new())),
            unregister_tx,
        };

        let hub = Hub {
            router: router.clone(),
            directory,
            register_rx,
            unregister_rx,
            inbound_rx,
        };
        tokio::spawn(hub.run());

        HubHandle {
            router,
            register_tx,
            inbound_tx,
        }
    }

    async fn run(mut self) {
        tracing::info!("Realtime hub started");
        loop {
            // registers first: an unregister must never overtake its register
            tokio::select! {
                biased;
                client = self.register_rx.recv() => match client {
                    Some(client) => self.on_register(client).await,
                    None => break,
                },
                Some((user_id, connection_id)) = self.unregister_rx.recv() => {
                    self.on_unregister(user_id, connection_id).await;
                }
                Some(inbound) = self.inbound_rx.recv() => {
                    self.on_inbound(inbound).await;
                }
            }
        }
        tracing::info!("Realtime hub stopped");
    }

    async fn on_register(&mut self, client: ClientHandle) {
        let user_id = client.user_id;
        let connection_id = client.connection_id;

        let replaced = self.router.clients.write().await.insert(user_id, client);
        if let Some(old) = replaced {
            // dropping the old handle closes its queue and ends that connection
            tracing::info!(
                user_id = %user_id,
                old_connection = %old.connection_id,
                "Replaced existing connection"
            );
        }

        tracing::debug!(user_id = %user_id, connection_id = %connection_id, "Client registered");
        self.broadcast_presence(user_id, true).await;
    }

    async fn on_unregister(&mut self, user_id: Uuid, connection_id: Uuid) {
        let removed = {
            let mut clients = self.router.clients.write().await;
            match clients.get(&user_id) {
                Some(client) if client.connection_id == connection_id => clients.remove(&user_id),
                _ => None,
            }
        };

        if removed.is_some() {
            tracing::debug!(user_id = %user_id, connection_id = %connection_id, "Client unregistered");
            self.broadcast_presence(user_id, false).await;
        }
    }

    async fn broadcast_presence(&self, user_id: Uuid, online: bool) {
        let text = WsFrame::presence(user_id, online).to_text();
        let clients = self.router.clients.read().await;
        for other in clients.keys().filter(|id| **id != user_id) {
            let _ = deliver(&clients, &self.router.unregister_tx, *other, text.clone());
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        let Inbound { sender_id, frame } = inbound;
        let frame = frame.with_sender(sender_id);

        match frame.frame_type.as_str() {
            message_types::MESSAGE => {
                let Some(recipient_id) = frame.payload_uuid("recipient_id") else {
                    tracing::warn!(sender_id = %sender_id, "Message frame without recipient_id");
                    return;
                };
                if let Err(e) = self
                    .router
                    .send_to_user(recipient_id, frame.to_text())
                    .await
                {
                    tracing::debug!(recipient_id = %recipient_id, error = %e, "Realtime delivery skipped");
                }
            }
            message_types::TYPING | message_types::READ | message_types::DELIVERED => {
                let Some(conversation_id) = frame.payload_uuid("conversation_id") else {
                    tracing::warn!(sender_id = %sender_id, frame_type = %frame.frame_type, "Frame without conversation_id");
                    return;
                };
                // membership lookup may hit the database; keep it off the loop
                tokio::spawn(fan_out(
                    self.router.clone(),
                    self.directory.clone(),
                    conversation_id,
                    sender_id,
                    frame,
                ));
            }
            other => {
                tracing::warn!(sender_id = %sender_id, frame_type = %other, "Unknown frame type dropped");
            }
        }
    }
}

async fn fan_out(
    router: Router,
    directory: Arc<dyn ConversationDirectory>,
    conversation_id: Uuid,
    sender_id: Uuid,
    frame: WsFrame,
) {
    let participants = match directory.participants(conversation_id).await {
        Ok(participants) => participants,
        Err(e) => {
            tracing::error!(conversation_id = %conversation_id, error = %e, "Participant lookup failed");
            return;
        }
    };

    if !participants.contains(&sender_id) {
        tracing::warn!(
            conversation_id = %conversation_id,
            sender_id = %sender_id,
            "Frame from non-participant dropped"
        );
        return;
    }

    let text = frame.to_text();
    for participant in participants.into_iter().filter(|id| *id != sender_id) {
        let _ = router.send_to_user(participant, text.clone()).await;
    }
}

/// Parse a client text frame; anything that is not a JSON object with a
/// string `type` is rejected
pub fn parse_frame(text: &str) -> Option<WsFrame> {
    let frame: WsFrame = serde_json::from_str(text).ok()?;
    match frame.payload {
        Value::Object(_) | Value::Null => Some(frame),
        _ => None,
    }
}
