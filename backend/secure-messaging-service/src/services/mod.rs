pub mod message_service;

pub use message_service::{FetchedMessage, MessageService, MessageServiceError, PublicKeys};
