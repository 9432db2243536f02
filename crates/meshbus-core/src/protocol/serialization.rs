//! Envelope codec.

use super::message::Message;
use crate::error::{MeshbusError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// How a peer encodes envelopes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationProtocol {
    /// The transport carries raw application payloads and cannot carry
    /// envelopes.
    #[default]
    None,
    Json,
}

impl std::fmt::Display for SerializationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerializationProtocol::None => write!(f, "none"),
            SerializationProtocol::Json => write!(f, "json"),
        }
    }
}

pub fn serialize_message(message: &Message, protocol: SerializationProtocol) -> Result<Bytes> {
    match protocol {
        SerializationProtocol::Json => Ok(Bytes::from(serde_json::to_vec(message)?)),
        SerializationProtocol::None => Err(MeshbusError::Protocol(
            "Cannot serialize an envelope without a serialization protocol".to_string(),
        )),
    }
}

/// Decode an envelope, rejecting a `message_type` that disagrees with the body.
pub fn deserialize_message(raw: &[u8], protocol: SerializationProtocol) -> Result<Message> {
    let message: Message = match protocol {
        SerializationProtocol::Json => serde_json::from_slice(raw)
            .map_err(|e| MeshbusError::Protocol(format!("Malformed envelope: {}", e)))?,
        SerializationProtocol::None => {
            return Err(MeshbusError::Protocol(
                "Cannot deserialize an envelope without a serialization protocol".to_string(),
            ))
        }
    };
    if message.message_type != message.body_union.message_type() {
        return Err(MeshbusError::Protocol(format!(
            "Message type {:?} does not match its body",
            message.message_type
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{Hello, MessageType, Response};

    #[test]
    fn test_json_envelope() {
        let message = Message::response(3, Response::ok(Bytes::from_static(b"ok")));
        let raw = serialize_message(&message, SerializationProtocol::Json).unwrap();
        assert_eq!(
            deserialize_message(&raw, SerializationProtocol::Json).unwrap(),
            message
        );
    }

    #[test]
    fn test_mismatched_type_is_a_protocol_error() {
        let mut message = Message::hello(0, Hello::new("hub"));
        message.message_type = MessageType::Request;
        let raw = serde_json::to_vec(&message).unwrap();
        assert!(matches!(
            deserialize_message(&raw, SerializationProtocol::Json),
            Err(MeshbusError::Protocol(_))
        ));
    }

    #[test]
    fn test_none_protocol_cannot_carry_envelopes() {
        let message = Message::hello(0, Hello::new("hub"));
        assert!(serialize_message(&message, SerializationProtocol::None).is_err());
        assert!(deserialize_message(b"{}", SerializationProtocol::None).is_err());
        assert!(deserialize_message(b"not json", SerializationProtocol::Json).is_err());
    }
}
