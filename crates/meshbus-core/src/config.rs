//! Centralized configuration for the meshbus transport.
//!
//! Constants used by the RPC layer, the connection manager, the built-in
//! transports and the work queues.

use std::time::Duration;

/// RPC protocol configuration.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Default deadline for a request and for a handler invocation.
    pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a new connection may take to exchange Hello messages.
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
    /// Number of recently timed-out sequence numbers remembered per peer.
    pub const TIMED_OUT_HISTORY: usize = 20;
    /// Default wildcard alias used for fallback client lookup.
    pub const WILDCARD_ALIAS: &'static str = "*";
}

/// Connection manager configuration.
pub struct ConnectionConfig;

impl ConnectionConfig {
    pub const MAX_CONCURRENT_PEER_STARTS: usize = 1024;

    // Outbound backoff
    pub const BACKOFF_STEP: Duration = Duration::from_secs(5);
    pub const RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_secs(10);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(180);
    pub const JITTER_RATIO: f64 = 0.2;
    /// (window, max attempts inside the window)
    pub const RATE_WINDOWS: [(Duration, usize); 3] = [
        (Duration::from_secs(60), 2),
        (Duration::from_secs(5 * 60), 5),
        (Duration::from_secs(10 * 60), 7),
    ];
}

/// Built-in transport configuration.
pub struct TransportConfig;

impl TransportConfig {
    pub const NEWLINE_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB
    pub const OUTBOX_BACKLOG: usize = 100;
    pub const JSON_RPC_MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB
    pub const JSON_RPC_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Work queue configuration.
pub struct QueueConfig;

impl QueueConfig {
    pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);
    pub const THROTTLED_LOG_BASE: u64 = 10;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_windows_are_increasing() {
        let windows = ConnectionConfig::RATE_WINDOWS;
        assert!(windows.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 < w[1].1));
    }

    #[test]
    fn test_backoff_cap_exceeds_reconnect_delay() {
        assert!(ConnectionConfig::MAX_BACKOFF > ConnectionConfig::RECONNECT_INITIAL_BACKOFF);
    }
}
