use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::encoding::b64;
use crate::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// First message of a sending chain
    Prekey,
    Message,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Prekey => "prekey",
            MessageType::Message => "message",
        }
    }
}

/// A single ratchet output as carried between peers
///
/// `ciphertext` is the AES-GCM nonce followed by the sealed payload;
/// `mac` is HMAC-SHA256 over `ciphertext` under the same message key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub mac: [u8; 32],
    pub counter: u32,
    #[serde(with = "b64")]
    pub ratchet_key: [u8; 32],
    pub message_type: MessageType,
}

impl EncryptedMessage {
    /// Opaque transport form: base64 of the JSON encoding
    pub fn to_wire(&self) -> Result<String, SignalError> {
        let json = serde_json::to_vec(self).map_err(|_| SignalError::MalformedMessage)?;
        Ok(STANDARD.encode(json))
    }

    pub fn from_wire(wire: &str) -> Result<Self, SignalError> {
        let json = STANDARD
            .decode(wire.trim())
            .map_err(|_| SignalError::MalformedMessage)?;
        serde_json::from_slice(&json).map_err(|_| SignalError::MalformedMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedMessage {
        EncryptedMessage {
            ciphertext: vec![1, 2, 3, 4],
            mac: [5u8; 32],
            counter: 3,
            ratchet_key: [6u8; 32],
            message_type: MessageType::Message,
        }
    }

    #[test]
    fn test_wire_form_is_opaque_base64() {
        let wire = sample().to_wire().unwrap();
        assert!(!wire.contains('{'));
        assert_eq!(EncryptedMessage::from_wire(&wire).unwrap(), sample());
    }

    #[test]
    fn test_message_type_serializes_lowercase() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["message_type"], "message");
        assert_eq!(MessageType::Prekey.as_str(), "prekey");
    }

    #[test]
    fn test_from_wire_rejects_garbage() {
        assert_eq!(
            EncryptedMessage::from_wire("not base64!!"),
            Err(SignalError::MalformedMessage)
        );
        let not_json = STANDARD.encode(b"plain text");
        assert_eq!(
            EncryptedMessage::from_wire(&not_json),
            Err(SignalError::MalformedMessage)
        );
    }

    #[test]
    fn test_from_wire_rejects_short_mac() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["mac"] = serde_json::Value::String(STANDARD.encode([1u8; 16]));
        let wire = STANDARD.encode(serde_json::to_vec(&json).unwrap());
        assert_eq!(
            EncryptedMessage::from_wire(&wire),
            Err(SignalError::MalformedMessage)
        );
    }
}
