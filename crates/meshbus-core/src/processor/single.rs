use super::client::Client;
use super::config::{NewClientCallback, ProcessorConfig, ReconnectCallback};
use super::base::{ClientRegistry, ProcessorCore};
use crate::connection::OutboundConnectionHandle;
use crate::error::{ErrorKind, MeshbusError, Result};
use crate::networking::{format_address, AddressSpec};
use crate::protocol::{Hello, MultiplexedRpcPeer, RequestHandler};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone)]
enum FirstCallback {
    Pending,
    Done,
    Failed(ErrorKind, String),
}

struct SingleRegistry {
    client: Mutex<Option<Client>>,
    first_callback: watch::Sender<FirstCallback>,
    new_client_callback: Option<NewClientCallback>,
    reconnect_callbacks: Mutex<Vec<ReconnectCallback>>,
}

#[async_trait]
impl ClientRegistry for SingleRegistry {
    async fn register_new_client(&self, _core: &ProcessorCore, client: &Client) -> Result<()> {
        *self.client.lock() = Some(client.clone());
        Ok(())
    }

    async fn invoke_new_client_callback(&self, _core: &ProcessorCore, client: Client) {
        let first_done = matches!(*self.first_callback.borrow(), FirstCallback::Done);
        if !first_done {
            let outcome = match &self.new_client_callback {
                Some(callback) => callback(client).await,
                None => Ok(()),
            };
            let state = match outcome {
                Ok(()) => FirstCallback::Done,
                Err(e) => {
                    error!(error = %e, "New client callback failed");
                    FirstCallback::Failed(e.kind(), e.message())
                }
            };
            self.first_callback.send_replace(state);
            return;
        }

        info!(peer = client.peer_name().unwrap_or_default(), "Reconnected");
        if let Some(callback) = &self.new_client_callback {
            if let Err(e) = callback(client).await {
                error!(error = %e, "New client callback failed after reconnect");
            }
        }
        let callbacks = self.reconnect_callbacks.lock().clone();
        for outcome in join_all(callbacks.iter().map(|callback| callback())).await {
            if let Err(e) = outcome {
                error!(error = %e, "Reconnect callback failed");
            }
        }
    }

    async fn peer_discarded(&self, _core: &ProcessorCore, _rpc_peer: &Arc<MultiplexedRpcPeer>) {}

    async fn updated_hello(&self, _core: &ProcessorCore, _rpc_peer: &Arc<MultiplexedRpcPeer>, _updated: &Hello) {}
}

/// A processor with exactly one logical outbound connection, re-established
/// whenever it drops.
///
/// # Example
///
/// ```rust,ignore
/// let processor = SinglePeerProcessor::with_socket_path("/run/hub.sock", config, service)?;
/// processor.start().await?;
/// let client = processor.client().expect("connected");
/// let pong: String = client.call("ping", &()).await?;
/// ```
pub struct SinglePeerProcessor {
    core: Arc<ProcessorCore>,
    registry: Arc<SingleRegistry>,
    peer_address: String,
    connection: Mutex<Option<Arc<OutboundConnectionHandle>>>,
}

impl SinglePeerProcessor {
    pub fn new(
        peer_address: impl Into<String>,
        config: ProcessorConfig,
        handler: impl Into<RequestHandler>,
    ) -> Self {
        let registry = Arc::new(SingleRegistry {
            client: Mutex::new(None),
            first_callback: watch::channel(FirstCallback::Pending).0,
            new_client_callback: config.new_client_callback.clone(),
            reconnect_callbacks: Mutex::new(Vec::new()),
        });
        let core = ProcessorCore::new(config, handler.into(), registry.clone());
        Self {
            core,
            registry,
            peer_address: peer_address.into(),
            connection: Mutex::new(None),
        }
    }

    /// Connect over the Unix domain socket at `path`.
    pub fn with_socket_path(
        path: impl AsRef<Path>,
        config: ProcessorConfig,
        handler: impl Into<RequestHandler>,
    ) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let address = format_address(&AddressSpec::unix(path))?;
        Ok(Self::new(address, config, handler))
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Connect and wait for the first new-client callback to finish. Its
    /// failure fails `start`.
    pub async fn start(&self) -> Result<()> {
        let handle = self.core.manager().open_connection(&self.peer_address, None)?;
        *self.connection.lock() = Some(Arc::clone(&handle));
        handle.connected().await?;

        let mut rx = self.registry.first_callback.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, FirstCallback::Pending))
            .await
            .map_err(|_| MeshbusError::Cancelled("Processor dropped".to_string()))?;
        match &*state {
            FirstCallback::Failed(kind, message) => Err(MeshbusError::from_kind(*kind, message.clone())),
            _ => Ok(()),
        }
    }

    pub async fn shutdown(&self) {
        self.connection.lock().take();
        self.core.shutdown().await;
        self.registry.first_callback.send_replace(FirstCallback::Pending);
    }

    /// The client of the most recent connection.
    pub fn client(&self) -> Option<Client> {
        self.registry.client.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.is_connected())
            && self.client().is_some_and(|client| {
                client.rpc_peer().is_some_and(|rpc_peer| !rpc_peer.is_closed())
            })
    }

    pub fn aliases(&self) -> Vec<String> {
        self.core.aliases().into_iter().collect()
    }

    /// Add `alias` to our identity, announcing it to a connected peer. On a
    /// failed announcement the alias is dropped again.
    pub fn add_alias(&self, alias: &str) -> Result<()> {
        if alias == self.core.name() || !self.core.insert_alias(alias) {
            return Ok(());
        }
        if let Err(e) = self.push_hello() {
            self.core.remove_alias(alias);
            return Err(e);
        }
        Ok(())
    }

    /// Remove `alias` from our identity. The primary name cannot be removed.
    pub fn remove_alias(&self, alias: &str) -> Result<()> {
        if alias == self.core.name() {
            error!(alias, "Cannot remove primary name");
            return Ok(());
        }
        if !self.core.remove_alias(alias) {
            return Ok(());
        }
        if let Err(e) = self.push_hello() {
            self.core.insert_alias(alias);
            return Err(e);
        }
        Ok(())
    }

    /// Run `callback` after every reconnect, following the new-client callback.
    pub fn add_reconnect_callback(&self, callback: ReconnectCallback) {
        self.registry.reconnect_callbacks.lock().push(callback);
    }

    fn push_hello(&self) -> Result<()> {
        let rpc_peer = self
            .client()
            .and_then(|client| client.rpc_peer().cloned())
            .filter(|rpc_peer| !rpc_peer.is_closed());
        match rpc_peer {
            Some(rpc_peer) => rpc_peer.update_hello(self.core.my_hello()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SinglePeerProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinglePeerProcessor")
            .field("name", &self.core.name())
            .field("peer_address", &self.peer_address)
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BackoffConfig;
    use crate::networking::{MessagingProtocol, ProcessLocalTransport};
    use crate::protocol::{Request, RequestContext, Response, Service};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig::new()
            .with_step(Duration::from_millis(10))
            .with_reconnect_delay(Duration::from_millis(10))
            .with_rate_windows(Vec::new())
    }

    /// Serve `local://` with a bare Hello-answering peer for every connection.
    async fn hello_server(transport: &Arc<ProcessLocalTransport>) -> Arc<Mutex<Vec<Arc<MultiplexedRpcPeer>>>> {
        use crate::networking::{Peer, Transport, TransportOptions};
        let peers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&peers);
        let handler: RequestHandler = Arc::new(|_request: Request, _ctx: RequestContext| {
            async { Response::ok(bytes::Bytes::from_static(b"\"pong\"")) }.boxed()
        });
        transport
            .start_server(
                "local://",
                Arc::new(move |peer: Arc<dyn Peer>| {
                    let sink = Arc::clone(&sink);
                    let handler = Arc::clone(&handler);
                    async move {
                        let rpc_peer = MultiplexedRpcPeer::builder(peer, Hello::new("server"), handler).build();
                        rpc_peer.start(true)?;
                        sink.lock().push(rpc_peer);
                        Ok::<_, MeshbusError>(())
                    }
                    .boxed()
                }),
                TransportOptions::default(),
            )
            .await
            .unwrap();
        peers
    }

    fn config(transport: &Arc<ProcessLocalTransport>) -> ProcessorConfig {
        ProcessorConfig::new("client")
            .with_backoff(fast_backoff())
            .with_transport(MessagingProtocol::ProcessLocal, transport.clone())
    }

    #[tokio::test]
    async fn test_start_connects_and_runs_callback() {
        let transport = Arc::new(ProcessLocalTransport::new());
        let _server = hello_server(&transport).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let config = config(&transport).on_new_client(Arc::new(move |client: Client| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(client.peer_name(), Some("server"));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, MeshbusError>(())
            }
            .boxed()
        }));
        let processor = SinglePeerProcessor::new("local://", config, Service::builder().build());
        processor.start().await.unwrap();
        assert!(processor.is_connected());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let client = processor.client().unwrap();
        let pong: String = client.call("ping", &()).await.unwrap();
        assert_eq!(pong, "pong");

        processor.shutdown().await;
        assert!(!processor.is_connected());
    }

    #[tokio::test]
    async fn test_failed_first_callback_fails_start() {
        let transport = Arc::new(ProcessLocalTransport::new());
        let _server = hello_server(&transport).await;
        let config = config(&transport).on_new_client(Arc::new(|_client: Client| {
            async { Err::<(), _>(MeshbusError::Consistency("not ready".to_string())) }.boxed()
        }));
        let processor = SinglePeerProcessor::new("local://", config, Service::builder().build());
        let err = processor.start().await.unwrap_err();
        assert!(matches!(err, MeshbusError::Consistency(ref m) if m == "not ready"));
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_runs_reconnect_callbacks() {
        let transport = Arc::new(ProcessLocalTransport::new());
        let server_peers = hello_server(&transport).await;
        let processor = SinglePeerProcessor::new("local://", config(&transport), Service::builder().build());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        processor.add_reconnect_callback(Arc::new(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok::<_, MeshbusError>(())
            }
            .boxed()
        }));
        processor.start().await.unwrap();
        let first = processor.client().unwrap();

        let server_side = server_peers.lock().first().cloned().unwrap();
        server_side.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = processor.client().unwrap();
        assert!(!first.same_peer(&second));
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_aliases_are_pushed_to_the_peer() {
        let transport = Arc::new(ProcessLocalTransport::new());
        let server_peers = hello_server(&transport).await;
        let processor = SinglePeerProcessor::new("local://", config(&transport), Service::builder().build());
        processor.start().await.unwrap();

        processor.add_alias("lamp").unwrap();
        processor.add_alias("client").unwrap();
        assert_eq!(processor.aliases(), ["lamp"]);

        let server_side = server_peers.lock().first().cloned().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server_side.peer_hello().map(|hello| hello.aliases) != Some(vec!["lamp".to_string()]) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        processor.remove_alias("client").unwrap();
        processor.remove_alias("lamp").unwrap();
        assert!(processor.aliases().is_empty());
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_with_socket_path_formats_unix_address() {
        let processor =
            SinglePeerProcessor::with_socket_path("/tmp/hub.sock", ProcessorConfig::new("c"), Service::builder().build())
                .unwrap();
        assert_eq!(processor.peer_address(), "unix://%2Ftmp%2Fhub.sock");
    }
}
