//! Envelope protocol: message types, codec, status mapping, the RPC
//! multiplexer and command routing.

mod context;
mod message;
mod rpc_peer;
mod serialization;
mod service;
mod status;

pub use context::{RequestContext, TlsInfo};
pub use message::{Hello, Message, MessageBody, MessageType, Request, Response, StatusCode, StatusResponse};
pub use rpc_peer::{
    ConnectionLostCallback, MultiplexedRpcPeer, MultiplexedRpcPeerBuilder, PendingResponse,
    RequestHandler, UpdatedHelloCallback,
};
pub use serialization::{deserialize_message, serialize_message, SerializationProtocol};
pub(crate) use service::{encode_payload, parse_payload};
pub use service::{ApiVersionTranslator, Service, ServiceBuilder};
pub use status::{error_for_status, error_response, status_for_error};
