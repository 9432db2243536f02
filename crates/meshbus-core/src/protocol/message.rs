//! Envelope types exchanged by [`super::MultiplexedRpcPeer`].
//!
//! Byte payloads are hex strings in the JSON form of the envelope so that the
//! args and results of a call stay opaque to the envelope codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hello,
    Request,
    Response,
}

/// Protocol status codes carried by every [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    NoError,
    AuthorizationValidationError,
    BadArgsError,
    ConnectionError,
    ConsistencyError,
    DoesNotExistError,
    PermissionError,
    Timeout,
    ProtocolError,
    SetRequestError,
    UartCommunicationError,
    GeneralError,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// Identity of one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Hello {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default, with = "hex_bytes")]
    pub args_serialized: Bytes,
    #[serde(default)]
    pub is_oneway: bool,
}

impl Request {
    pub fn new(command: impl Into<String>, args_serialized: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            args_serialized: args_serialized.into(),
            is_oneway: false,
        }
    }

    pub fn oneway(command: impl Into<String>, args_serialized: impl Into<Bytes>) -> Self {
        Self {
            is_oneway: true,
            ..Self::new(command, args_serialized)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status_code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status_code: StatusCode::NoError,
            error_msg: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusResponse,
    #[serde(default, with = "hex_bytes")]
    pub result_serialized: Bytes,
}

impl Response {
    pub fn ok(result_serialized: impl Into<Bytes>) -> Self {
        Self {
            status: StatusResponse::success(),
            result_serialized: result_serialized.into(),
        }
    }

    pub fn error(status_code: StatusCode, error_msg: impl Into<String>) -> Self {
        Self {
            status: StatusResponse {
                status_code,
                error_msg: Some(error_msg.into()),
            },
            result_serialized: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.status_code == StatusCode::NoError
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    Hello(Hello),
    Request(Request),
    Response(Response),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Hello(_) => MessageType::Hello,
            MessageBody::Request(_) => MessageType::Request,
            MessageBody::Response(_) => MessageType::Response,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    pub sequence_number: u64,
    pub body_union: MessageBody,
}

impl Message {
    pub fn new(sequence_number: u64, body: MessageBody) -> Self {
        Self {
            message_type: body.message_type(),
            sequence_number,
            body_union: body,
        }
    }

    pub fn hello(sequence_number: u64, hello: Hello) -> Self {
        Self::new(sequence_number, MessageBody::Hello(hello))
    }

    pub fn request(sequence_number: u64, request: Request) -> Self {
        Self::new(sequence_number, MessageBody::Request(request))
    }

    pub fn response(sequence_number: u64, response: Response) -> Self {
        Self::new(sequence_number, MessageBody::Response(response))
    }
}

mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let message = Message::request(7, Request::new("echo", Bytes::from_static(b"hi")));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "message_type": "REQUEST",
                "sequence_number": 7,
                "body_union": {
                    "request": {"command": "echo", "args_serialized": "6869", "is_oneway": false}
                }
            })
        );
    }

    #[test]
    fn test_hello_defaults() {
        let hello: Hello = serde_json::from_value(json!({"name": "hub"})).unwrap();
        assert_eq!(hello, Hello::new("hub"));

        let hello = Hello::new("hub").with_domain("home").with_aliases(["*"]);
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value, json!({"name": "hub", "domain": "home", "aliases": ["*"]}));
    }

    #[test]
    fn test_response_without_result() {
        let response: Response = serde_json::from_value(json!({
            "status": {"status_code": "BAD_ARGS_ERROR", "error_msg": "Unknown command"}
        }))
        .unwrap();
        assert!(!response.is_success());
        assert!(response.result_serialized.is_empty());
        assert_eq!(response.status.status_code.to_string(), "BAD_ARGS_ERROR");
    }

    #[test]
    fn test_invalid_hex_is_rejected() {
        let result = serde_json::from_value::<Request>(json!({
            "command": "echo",
            "args_serialized": "zz"
        }));
        assert!(result.is_err());
    }
}
