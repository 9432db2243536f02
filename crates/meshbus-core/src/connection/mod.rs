//! Connection lifecycle: listeners, outbound connect loops, admission and
//! reconnection.

mod backoff;
mod handle;
mod manager;

pub use backoff::BackoffConfig;
pub use handle::OutboundConnectionHandle;
pub use manager::{ConnectionManagerConfig, PeerConnectionManager};
