use std::sync::Arc;

use crate::config::Config;
use crate::services::MessageService;
use crate::store::{ConversationDirectory, Store};
use crate::websocket::{Hub, HubHandle};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub messages: Arc<MessageService>,
    pub hub: HubHandle,
}

impl AppState {
    /// Wire the message service and realtime hub around one backend
    ///
    /// Must run inside a tokio runtime: the hub loop is spawned here.
    pub fn build<S>(config: Arc<Config>, store: Arc<S>) -> Self
    where
        S: Store + 'static,
    {
        let directory: Arc<dyn ConversationDirectory> = store.clone();
        let store: Arc<dyn Store> = store;

        let messages = Arc::new(MessageService::new(
            store.clone(),
            config.prekey_batch_size,
        ));
        let hub = Hub::spawn(directory);

        Self {
            config,
            store,
            messages,
            hub,
        }
    }
}
