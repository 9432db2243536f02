//! Transport-level peer and transport contracts.
//!
//! A [`Peer`] is a connected byte-message endpoint. A [`Transport`] opens
//! outbound peers and runs listeners that hand accepted peers to a
//! [`NewPeerCallback`].

use super::auth::Authenticator;
use crate::error::Result;
use crate::protocol::SerializationProtocol;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Process-unique identifier of a peer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        PeerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Delivered to connection-closed callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedPeer {
    pub id: PeerId,
    /// `None` for inbound peers.
    pub remote_address: Option<String>,
    /// True when the local side asked for the shutdown.
    pub was_requested: bool,
}

pub type ConnectionClosedCallback = Box<dyn FnOnce(ClosedPeer) + Send>;

/// Stream of raw inbound messages. Ends when the connection closes.
#[derive(Debug)]
pub struct IncomingMessages {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl IncomingMessages {
    pub fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// A connected endpoint.
#[async_trait]
pub trait Peer: Send + Sync + 'static {
    fn id(&self) -> PeerId;

    /// Address this peer was opened with; `None` when accepted by a listener.
    fn remote_address(&self) -> Option<&str>;

    fn serialization_protocol(&self) -> SerializationProtocol;

    fn negotiated_api_version(&self) -> Option<u32> {
        None
    }

    /// Begin exchanging messages, performing any transport handshake.
    async fn start(&self) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn shutdown(&self);

    /// Queue a message for delivery without waiting for it to be written.
    fn enqueue_message(&self, message: Bytes) -> Result<()>;

    /// Take the inbound message stream. Only the first call returns it.
    fn incoming_messages(&self) -> Option<IncomingMessages>;

    /// Run `callback` once when the connection closes. Runs immediately if it
    /// already has.
    fn register_connection_closed_callback(&self, callback: ConnectionClosedCallback);

    fn peer_common_name(&self) -> Option<String> {
        None
    }

    /// DER encoded certificate presented by the remote side.
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    fn peer_connection_parameters(&self) -> Option<HashMap<String, String>> {
        None
    }

    fn is_validated(&self) -> bool {
        false
    }
}

/// One-shot fan-out of the connection-closed event.
#[derive(Default)]
pub(crate) struct ClosedNotifier {
    state: Mutex<ClosedState>,
}

#[derive(Default)]
struct ClosedState {
    closed: Option<ClosedPeer>,
    callbacks: Vec<ConnectionClosedCallback>,
}

impl ClosedNotifier {
    pub(crate) fn register(&self, callback: ConnectionClosedCallback) {
        let mut state = self.state.lock();
        match state.closed.clone() {
            Some(closed) => {
                drop(state);
                callback(closed);
            }
            None => state.callbacks.push(callback),
        }
    }

    /// Fire every callback. Returns false if already fired.
    pub(crate) fn notify(&self, closed: ClosedPeer) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(closed.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(closed.clone());
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }
}

/// Invoked for every peer accepted by a listener.
pub type NewPeerCallback = Arc<dyn Fn(Arc<dyn Peer>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Options passed to [`Transport::start_server`] and [`Transport::open_connection`].
#[derive(Clone, Default)]
pub struct TransportOptions {
    pub params: Option<HashMap<String, String>>,
    pub timeout: Option<Duration>,
    pub authenticator: Option<Arc<Authenticator>>,
    pub supported_api_versions: Option<Vec<u32>>,
    pub reuse_port: bool,
    pub cert_file_directory: Option<PathBuf>,
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("params", &self.params)
            .field("timeout", &self.timeout)
            .field("authenticator", &self.authenticator.is_some())
            .field("supported_api_versions", &self.supported_api_versions)
            .field("reuse_port", &self.reuse_port)
            .field("cert_file_directory", &self.cert_file_directory)
            .finish()
    }
}

impl TransportOptions {
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_supported_api_versions(mut self, versions: Vec<u32>) -> Self {
        self.supported_api_versions = Some(versions);
        self
    }

    pub fn with_reuse_port(mut self, reuse_port: bool) -> Self {
        self.reuse_port = reuse_port;
        self
    }

    /// Fail with `Unsupported` for any option a plain transport cannot honour.
    pub(crate) fn reject_extensions(&self, transport: &str, server: bool) -> Result<()> {
        use crate::error::MeshbusError;
        let unsupported = |what: &str| {
            Err(MeshbusError::Unsupported(format!(
                "{} support in {} not implemented",
                what, transport
            )))
        };
        if self.params.is_some() {
            return unsupported("Params");
        }
        if self.authenticator.is_some() {
            return unsupported("Authenticator");
        }
        if self.supported_api_versions.is_some() {
            return unsupported("Supported API versions");
        }
        if server && self.reuse_port {
            return unsupported("reuse_port");
        }
        if !server && self.cert_file_directory.is_some() {
            return unsupported("Certificate file directory");
        }
        if server && self.timeout.is_some() {
            tracing::warn!("timeout parameter is ignored by {} server", transport);
        }
        Ok(())
    }
}

/// A running accept loop.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address a client can connect to, with any OS-assigned port filled in.
    fn local_address(&self) -> String;

    /// Filesystem path to unlink when the listener is closed.
    fn unix_socket_path(&self) -> Option<PathBuf> {
        None
    }

    /// Stop accepting connections. Already accepted peers are unaffected.
    async fn close(&self);
}

/// A pluggable wire transport selected by [`super::MessagingProtocol`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_server(
        &self,
        listen_address: &str,
        on_new_peer: NewPeerCallback,
        options: TransportOptions,
    ) -> Result<Box<dyn Listener>>;

    async fn open_connection(
        &self,
        remote_address: &str,
        options: TransportOptions,
    ) -> Result<Arc<dyn Peer>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn closed(was_requested: bool) -> ClosedPeer {
        ClosedPeer {
            id: PeerId::next(),
            remote_address: None,
            was_requested,
        }
    }

    #[test]
    fn test_peer_ids_are_unique() {
        assert_ne!(PeerId::next(), PeerId::next());
    }

    #[test]
    fn test_closed_notifier_fires_once() {
        let notifier = ClosedNotifier::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        notifier.register(Box::new(move |peer| {
            assert!(!peer.was_requested);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(notifier.notify(closed(false)));
        assert!(!notifier.notify(closed(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(notifier.is_closed());
    }

    #[test]
    fn test_late_registration_runs_immediately() {
        let notifier = ClosedNotifier::default();
        notifier.notify(closed(true));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        notifier.register(Box::new(move |peer| {
            assert!(peer.was_requested);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plain_transport_rejects_extensions() {
        let options = TransportOptions::default().with_supported_api_versions(vec![1]);
        assert!(options.reject_extensions("test", false).is_err());
        assert!(TransportOptions::default()
            .with_reuse_port(true)
            .reject_extensions("test", true)
            .is_err());
        assert!(TransportOptions::default()
            .with_timeout(Duration::from_secs(1))
            .reject_extensions("test", true)
            .is_ok());
    }
}
