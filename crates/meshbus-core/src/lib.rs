//! Meshbus Core - peer connections, multiplexed RPC and retrying work queues.
//!
//! Processes on a device talk to each other (and to the outside world) over
//! long-lived connections. This crate owns those connections: it listens and
//! dials with automatic reconnection, exchanges a Hello identity on every
//! link, multiplexes request/response traffic over it and routes calls to
//! peers by name.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshbus_core::{MultiPeerProcessor, ProcessorConfig, Service};
//!
//! #[tokio::main]
//! async fn main() -> meshbus_core::Result<()> {
//!     let service = Service::builder()
//!         .route("ping", |_: (), _ctx| async { Ok("pong") })
//!         .build();
//!     let hub = MultiPeerProcessor::new(
//!         ["unix:///run/hub.sock"],
//!         ProcessorConfig::new("hub").with_domain("home"),
//!         service,
//!     )?;
//!     hub.start().await?;
//!
//!     if let Some(lamp) = hub.get_client("lamp", None) {
//!         let state: String = lamp.call("state", &()).await?;
//!         println!("lamp is {}", state);
//!     }
//!
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod networking;
pub mod processor;
pub mod protocol;
pub mod queueing;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use connection::{BackoffConfig, OutboundConnectionHandle, PeerConnectionManager};
pub use error::{ErrorKind, MeshbusError, Result};
pub use logging::ThrottledLogger;
pub use networking::{format_address, parse_address, AddressSpec, MessagingProtocol, ParsedAddress};
pub use processor::{Client, MultiPeerProcessor, ProcessorConfig, SinglePeerProcessor};
pub use protocol::{
    ApiVersionTranslator, Hello, MultiplexedRpcPeer, Request, RequestContext, Response, Service,
    StatusCode,
};
pub use queueing::{
    CancellationReason, JobHandle, KeyedSingletonWorkQueue, RetryPolicy, SingletonJobWorkQueue,
    WorkQueue, WorkQueueConfig,
};
