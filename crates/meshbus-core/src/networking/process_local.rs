//! In-process transport (`local://`).
//!
//! Connecting creates a pair of peers whose inboxes feed each other. The
//! receiving half is handed to the server callback through a one-worker
//! [`WorkQueue`] so a slow callback never blocks `open_connection`.

use super::address::{parse_address, MessagingProtocol};
use super::peer::{
    ClosedNotifier, ClosedPeer, ConnectionClosedCallback, IncomingMessages, Listener,
    NewPeerCallback, Peer, PeerId, Transport, TransportOptions,
};
use crate::error::{MeshbusError, Result};
use crate::protocol::SerializationProtocol;
use crate::queueing::{WorkQueue, WorkQueueConfig};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::mpsc;
use tracing::debug;

pub struct ProcessLocalPeer {
    id: PeerId,
    remote_address: Option<String>,
    remote: Mutex<Option<Weak<ProcessLocalPeer>>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    closed: ClosedNotifier,
}

impl ProcessLocalPeer {
    fn new(remote_address: Option<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: PeerId::next(),
            remote_address,
            remote: Mutex::new(None),
            inbox_tx: Mutex::new(Some(tx)),
            inbox_rx: Mutex::new(Some(rx)),
            closed: ClosedNotifier::default(),
        })
    }

    /// Create a connected (initiating, receiving) pair.
    pub fn pair(remote_address: impl Into<String>) -> (Arc<Self>, Arc<Self>) {
        let initiating = Self::new(Some(remote_address.into()));
        let receiving = Self::new(None);
        *initiating.remote.lock() = Some(Arc::downgrade(&receiving));
        *receiving.remote.lock() = Some(Arc::downgrade(&initiating));
        (initiating, receiving)
    }

    fn remote(&self) -> Option<Arc<ProcessLocalPeer>> {
        self.remote.lock().as_ref().and_then(Weak::upgrade)
    }

    fn deliver(&self, message: Bytes) -> Result<()> {
        match self.inbox_tx.lock().as_ref() {
            Some(tx) if tx.send(message).is_ok() => Ok(()),
            _ => Err(MeshbusError::NoConnection(
                "Connection to peer has been lost".to_string(),
            )),
        }
    }

    fn close(&self, was_requested: bool) {
        // Taking the partner first keeps the pair from closing each other twice.
        let Some(remote) = self.remote.lock().take() else {
            return;
        };
        if let Some(remote) = remote.upgrade() {
            remote.close(false);
        }
        self.inbox_tx.lock().take();
        self.closed.notify(ClosedPeer {
            id: self.id,
            remote_address: self.remote_address.clone(),
            was_requested,
        });
    }
}

impl Drop for ProcessLocalPeer {
    fn drop(&mut self) {
        if let Some(remote) = self.remote.get_mut().take().and_then(|w| w.upgrade()) {
            remote.close(false);
        }
    }
}

#[async_trait]
impl Peer for ProcessLocalPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// Envelopes cross the pair as serialized JSON.
    fn serialization_protocol(&self) -> SerializationProtocol {
        SerializationProtocol::Json
    }

    async fn start(&self) -> Result<()> {
        if self.remote().is_none() {
            return Err(MeshbusError::NoConnection(
                "Connection to peer has been lost".to_string(),
            ));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.close(true);
    }

    fn enqueue_message(&self, message: Bytes) -> Result<()> {
        let remote = self.remote().ok_or_else(|| {
            MeshbusError::NoConnection("Connection to peer has been lost".to_string())
        })?;
        remote.deliver(message)
    }

    fn incoming_messages(&self) -> Option<IncomingMessages> {
        self.inbox_rx.lock().take().map(IncomingMessages::new)
    }

    fn register_connection_closed_callback(&self, callback: ConnectionClosedCallback) {
        self.closed.register(callback);
    }
}

impl std::fmt::Debug for ProcessLocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLocalPeer")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .finish()
    }
}

struct LocalServer {
    active: AtomicBool,
    accept_queue: WorkQueue<Arc<ProcessLocalPeer>, (), MeshbusError>,
}

impl LocalServer {
    fn connect(&self, remote_address: &str) -> Result<Arc<ProcessLocalPeer>> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(MeshbusError::NoConnection(
                "This server is not accepting connections".to_string(),
            ));
        }
        let (initiating, receiving) = ProcessLocalPeer::pair(remote_address);
        self.accept_queue.add_job(receiving, None);
        Ok(initiating)
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.accept_queue.shutdown();
    }
}

struct LocalListener {
    server: Arc<LocalServer>,
}

#[async_trait]
impl Listener for LocalListener {
    fn local_address(&self) -> String {
        "local://".to_string()
    }

    async fn close(&self) {
        self.server.close();
    }
}

/// One process-local server slot.
#[derive(Default)]
pub struct ProcessLocalTransport {
    server: Mutex<Option<Arc<LocalServer>>>,
}

impl ProcessLocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance used unless a manager is given its own.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ProcessLocalTransport>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    fn check_address(address: &str) -> Result<()> {
        let parsed = parse_address(address)?;
        if parsed.protocol != MessagingProtocol::ProcessLocal {
            return Err(MeshbusError::invalid_address(address, "not a process-local address"));
        }
        if parsed.secure {
            return Err(MeshbusError::Unsupported(
                "SSL support not implemented".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ProcessLocalTransport {
    async fn start_server(
        &self,
        listen_address: &str,
        on_new_peer: NewPeerCallback,
        options: TransportOptions,
    ) -> Result<Box<dyn Listener>> {
        let mut slot = self.server.lock();
        if slot
            .as_ref()
            .is_some_and(|server| server.active.load(Ordering::SeqCst))
        {
            return Err(MeshbusError::AddressInUse(
                "Local server already exists".to_string(),
            ));
        }
        options.reject_extensions("ProcessLocalPeer", true)?;
        Self::check_address(listen_address)?;

        let accept_queue = WorkQueue::new(
            WorkQueueConfig::new("process-local-accept"),
            move |peer: Arc<ProcessLocalPeer>| {
                let on_new_peer = Arc::clone(&on_new_peer);
                async move { on_new_peer(peer as Arc<dyn Peer>).await }
            },
        )?;
        accept_queue.start();

        let server = Arc::new(LocalServer {
            active: AtomicBool::new(true),
            accept_queue,
        });
        *slot = Some(Arc::clone(&server));
        debug!("Process-local server started");
        Ok(Box::new(LocalListener { server }))
    }

    async fn open_connection(
        &self,
        remote_address: &str,
        options: TransportOptions,
    ) -> Result<Arc<dyn Peer>> {
        options.reject_extensions("ProcessLocalPeer", false)?;
        Self::check_address(remote_address)?;
        let server = self.server.lock().clone().ok_or_else(|| {
            MeshbusError::NoConnection("No process-local server available".to_string())
        })?;
        let peer = server.connect(remote_address)?;
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_pair_exchanges_messages() {
        let (a, b) = ProcessLocalPeer::pair("local://");
        let mut b_inbox = b.incoming_messages().unwrap();
        assert!(b.incoming_messages().is_none());

        a.enqueue_message(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(b_inbox.next().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(a.remote_address(), Some("local://"));
        assert_eq!(b.remote_address(), None);
    }

    #[tokio::test]
    async fn test_shutdown_closes_partner_without_request() {
        let (a, b) = ProcessLocalPeer::pair("local://");
        let mut b_inbox = b.incoming_messages().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for peer in [&a, &b] {
            let seen = Arc::clone(&seen);
            peer.register_connection_closed_callback(Box::new(move |closed| {
                seen.lock().push(closed.was_requested);
            }));
        }

        a.shutdown().await;
        assert_eq!(*seen.lock(), vec![false, true]);
        assert!(b_inbox.next().await.is_none());
        assert!(matches!(
            b.enqueue_message(Bytes::new()),
            Err(MeshbusError::NoConnection(_))
        ));
        // A second shutdown is a no-op.
        b.shutdown().await;
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_one_side_disconnects_the_other() {
        let (a, b) = ProcessLocalPeer::pair("local://");
        let mut b_inbox = b.incoming_messages().unwrap();
        drop(a);
        assert!(b_inbox.next().await.is_none());
        assert!(b.start().await.is_err());
    }

    #[tokio::test]
    async fn test_transport_accepts_connections() {
        let transport = ProcessLocalTransport::new();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: NewPeerCallback = Arc::new(move |peer: Arc<dyn Peer>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            async move {
                let _ = tx.send(peer);
                Ok(())
            }
            .boxed()
        });

        let listener = transport
            .start_server("local://", Arc::clone(&callback), TransportOptions::default())
            .await
            .unwrap();
        assert_eq!(listener.local_address(), "local://");

        let second = transport
            .start_server("local://", callback, TransportOptions::default())
            .await;
        assert!(matches!(second, Err(MeshbusError::AddressInUse(_))));

        let client = transport
            .open_connection("local://", TransportOptions::default())
            .await
            .unwrap();
        client.start().await.unwrap();
        let server_side = rx.recv().await.unwrap();
        let mut inbox = server_side.incoming_messages().unwrap();
        client.enqueue_message(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(inbox.next().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        listener.close().await;
        let refused = transport
            .open_connection("local://", TransportOptions::default())
            .await;
        assert!(matches!(refused, Err(MeshbusError::NoConnection(_))));
    }

    #[tokio::test]
    async fn test_open_without_server_fails() {
        let transport = ProcessLocalTransport::new();
        let result = transport
            .open_connection("local://", TransportOptions::default())
            .await;
        assert!(matches!(result, Err(MeshbusError::NoConnection(_))));
    }
}
