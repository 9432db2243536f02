//! Transport layer: address grammar, the peer contract and the built-in
//! transports.

pub mod address;
pub mod auth;
mod json_rpc;
mod newline;
mod peer;
mod process_local;
mod stream;

pub use address::{
    format_address, parse_address, AddressFamily, AddressSpec, ConnectionArgs, MessagingProtocol,
    NetworkArgs, ParsedAddress,
};
pub use auth::{AuthenticationMethod, AuthenticationPolicy, Authenticator};
pub use json_rpc::JsonRpcTransport;
pub use newline::NewlineTransport;
pub(crate) use peer::ClosedNotifier;
pub use peer::{
    ClosedPeer, ConnectionClosedCallback, IncomingMessages, Listener, NewPeerCallback, Peer,
    PeerId, Transport, TransportOptions,
};
pub use process_local::{ProcessLocalPeer, ProcessLocalTransport};
pub use stream::StreamPeer;
