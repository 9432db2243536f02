//! Machinery shared by both processor flavours: turning admitted peers into
//! RPC peers and clients, and tearing them down again.

use super::client::Client;
use super::config::ProcessorConfig;
use crate::connection::PeerConnectionManager;
use crate::error::{MeshbusError, Result};
use crate::networking::{NewPeerCallback, Peer, PeerId};
use crate::protocol::{ApiVersionTranslator, Hello, MultiplexedRpcPeer, RequestHandler};
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

/// How a processor flavour tracks the clients it has created.
#[async_trait]
pub(crate) trait ClientRegistry: Send + Sync {
    /// Make `client` reachable. An error discards the new connection.
    async fn register_new_client(&self, core: &ProcessorCore, client: &Client) -> Result<()>;

    /// Run user callbacks for a client whose server side has been started.
    async fn invoke_new_client_callback(&self, core: &ProcessorCore, client: Client);

    async fn peer_discarded(&self, core: &ProcessorCore, rpc_peer: &Arc<MultiplexedRpcPeer>);

    /// Called before `rpc_peer` records `updated` as its peer's Hello.
    async fn updated_hello(&self, core: &ProcessorCore, rpc_peer: &Arc<MultiplexedRpcPeer>, updated: &Hello);
}

struct TrackedPeer {
    rpc_peer: Arc<MultiplexedRpcPeer>,
    /// Set once the registry knows about the peer's client.
    registered: bool,
}

pub(crate) struct ProcessorCore {
    name: String,
    domain: Option<String>,
    aliases: Mutex<BTreeSet<String>>,
    synchronous_requests: bool,
    request_timeout: Duration,
    hello_timeout: Duration,
    handler: RequestHandler,
    translator: Option<Arc<dyn ApiVersionTranslator>>,
    rpc_peers: Mutex<HashMap<PeerId, TrackedPeer>>,
    manager: PeerConnectionManager,
    registry: Arc<dyn ClientRegistry>,
    weak_self: Weak<ProcessorCore>,
}

impl ProcessorCore {
    pub(crate) fn new(
        config: ProcessorConfig,
        handler: RequestHandler,
        registry: Arc<dyn ClientRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ProcessorCore>| {
            let on_new_peer: NewPeerCallback = {
                let weak = weak.clone();
                Arc::new(move |peer| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(core) => core.new_peer(peer).await,
                            None => Err(MeshbusError::Cancelled("Processor dropped".to_string())),
                        }
                    }
                    .boxed()
                })
            };
            Self {
                name: config.name,
                domain: config.domain,
                aliases: Mutex::new(config.aliases),
                synchronous_requests: config.synchronous_requests,
                request_timeout: config.request_timeout,
                hello_timeout: config.hello_timeout,
                handler,
                translator: config.api_translator,
                rpc_peers: Mutex::new(HashMap::new()),
                manager: PeerConnectionManager::new(on_new_peer, config.connection),
                registry,
                weak_self: weak.clone(),
            }
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub(crate) fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    pub(crate) fn translator(&self) -> Option<Arc<dyn ApiVersionTranslator>> {
        self.translator.clone()
    }

    pub(crate) fn aliases(&self) -> BTreeSet<String> {
        self.aliases.lock().clone()
    }

    /// Returns false if `alias` was already present.
    pub(crate) fn insert_alias(&self, alias: &str) -> bool {
        self.aliases.lock().insert(alias.to_string())
    }

    /// Returns false if `alias` was not present.
    pub(crate) fn remove_alias(&self, alias: &str) -> bool {
        self.aliases.lock().remove(alias)
    }

    pub(crate) fn my_hello(&self) -> Hello {
        Hello {
            name: self.name.clone(),
            domain: self.domain.clone(),
            aliases: self.aliases.lock().iter().cloned().collect(),
        }
    }

    /// `domain.name`, with our own domain standing in for a missing one.
    pub(crate) fn qualified_name(&self, name: &str, domain: Option<&str>) -> String {
        match domain.filter(|d| !d.is_empty()).or(self.domain.as_deref()) {
            Some(domain) => format!("{}.{}", domain, name),
            None => name.to_string(),
        }
    }

    /// Qualified primary name and aliases announced in `hello`.
    pub(crate) fn qualified_names(&self, hello: &Hello) -> (String, BTreeSet<String>) {
        let domain = hello.domain.as_deref();
        let aliases = hello
            .aliases
            .iter()
            .map(|alias| self.qualified_name(alias, domain))
            .collect();
        (self.qualified_name(&hello.name, domain), aliases)
    }

    pub(crate) fn rpc_peer_count(&self) -> usize {
        self.rpc_peers.lock().len()
    }

    async fn new_peer(self: Arc<Self>, peer: Arc<dyn Peer>) -> Result<()> {
        let is_initiator = peer.remote_address().is_some();
        let client = self.make_client_for_peer(peer, is_initiator).await?;
        let Some(rpc_peer) = client.rpc_peer().cloned() else {
            return Err(MeshbusError::General("Client has no peer".to_string()));
        };

        if let Err(e) = self.registry.register_new_client(&self, &client).await {
            if matches!(e, MeshbusError::NameInUse(_)) {
                error!(peer = %rpc_peer.peer_name(), error = %e, "Cannot add client for peer");
            }
            self.rpc_peers.lock().remove(&rpc_peer.id());
            rpc_peer.shutdown().await;
            return Err(e);
        }

        // Whoever takes the peer out of the map after registration owns the
        // matching `peer_discarded` call.
        let still_tracked = match self.rpc_peers.lock().get_mut(&rpc_peer.id()) {
            Some(tracked) => {
                tracked.registered = true;
                true
            }
            None => false,
        };
        if !still_tracked {
            debug!(peer = %rpc_peer.peer_name(), "Connection lost during registration");
            rpc_peer.shutdown().await;
            self.registry.peer_discarded(&self, &rpc_peer).await;
            return Err(MeshbusError::NoConnection(
                "Connection to peer has been lost".to_string(),
            ));
        }

        info!(
            peer = client.peer_name().unwrap_or_default(),
            initiator = is_initiator,
            "Registered client"
        );
        rpc_peer.start_server();
        self.registry.invoke_new_client_callback(&self, client).await;
        Ok(())
    }

    async fn make_client_for_peer(&self, peer: Arc<dyn Peer>, is_initiator: bool) -> Result<Client> {
        let on_lost = {
            let weak = self.weak_self.clone();
            Arc::new(move |rpc_peer: Arc<MultiplexedRpcPeer>| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.discard_peer(&rpc_peer).await;
                    }
                }
                .boxed()
            })
        };
        let on_updated_hello = {
            let weak = self.weak_self.clone();
            Arc::new(move |rpc_peer: Arc<MultiplexedRpcPeer>, hello: Hello| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        let registry = Arc::clone(&core.registry);
                        registry.updated_hello(&core, &rpc_peer, &hello).await;
                    }
                }
                .boxed()
            })
        };

        let rpc_peer = MultiplexedRpcPeer::builder(peer, self.my_hello(), Arc::clone(&self.handler))
            .initiator(is_initiator)
            .synchronous_requests(self.synchronous_requests)
            .request_timeout(self.request_timeout)
            .on_connection_lost(on_lost)
            .on_updated_hello(on_updated_hello)
            .build();
        // Tracked before it starts so a connection lost at any later point is
        // seen by `discard_peer`.
        self.rpc_peers.lock().insert(
            rpc_peer.id(),
            TrackedPeer {
                rpc_peer: Arc::clone(&rpc_peer),
                registered: false,
            },
        );
        let hello = match rpc_peer.start(false) {
            Ok(()) => tokio::time::timeout(self.hello_timeout, rpc_peer.handshake())
                .await
                .unwrap_or_else(|_| {
                    Err(MeshbusError::Timeout("No Hello received from peer".to_string()))
                }),
            Err(e) => Err(e),
        };
        let hello = match hello {
            Ok(hello) => hello,
            Err(e) => {
                self.rpc_peers.lock().remove(&rpc_peer.id());
                rpc_peer.shutdown().await;
                return Err(e);
            }
        };
        debug!(peer = %hello.name, domain = ?hello.domain, "Hello exchanged");

        let peer_name = self.qualified_name(&hello.name, hello.domain.as_deref());
        Ok(Client::for_peer(rpc_peer, peer_name, hello.name, self.translator()))
    }

    /// Forget `rpc_peer` and close its connection.
    pub(crate) async fn discard_peer(&self, rpc_peer: &Arc<MultiplexedRpcPeer>) {
        let registered = self
            .rpc_peers
            .lock()
            .remove(&rpc_peer.id())
            .is_some_and(|tracked| tracked.registered);
        rpc_peer.shutdown().await;
        if registered {
            debug!(peer = %rpc_peer.peer_name(), "Discarding peer");
            self.registry.peer_discarded(self, rpc_peer).await;
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.manager.shutdown().await;
        let tracked: Vec<_> = self.rpc_peers.lock().drain().map(|(_, tracked)| tracked).collect();
        join_all(tracked.iter().map(|tracked| tracked.rpc_peer.shutdown())).await;
        for tracked in tracked.iter().filter(|tracked| tracked.registered) {
            self.registry.peer_discarded(self, &tracked.rpc_peer).await;
        }
    }
}
