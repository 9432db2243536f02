use super::client::Client;
use super::config::{NewClientCallback, ProcessorConfig, RemovedClientCallback};
use super::base::{ClientRegistry, ProcessorCore};
use crate::config::ProtocolConfig;
use crate::connection::OutboundConnectionHandle;
use crate::error::{MeshbusError, Result};
use crate::networking::PeerId;
use crate::protocol::{Hello, MultiplexedRpcPeer, RequestHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Qualified names (primary and aliases) to the client they resolve to.
struct MultiRegistry {
    clients: Mutex<HashMap<String, Client>>,
    new_client_callback: Option<NewClientCallback>,
    removed_client_callback: Option<RemovedClientCallback>,
}

impl MultiRegistry {
    /// Point `alias` at `client`, taking it over from another client if needed.
    fn add_alias(clients: &mut HashMap<String, Client>, client: &Client, alias: String) {
        if let Some(existing) = clients.get(&alias) {
            if existing.same_peer(client) {
                return;
            }
            if existing.peer_name() == Some(alias.as_str()) {
                warn!(alias = %alias, "Alias matches the primary name of another client; ignoring");
                return;
            }
            warn!(
                alias = %alias,
                from = existing.peer_name().unwrap_or_default(),
                to = client.peer_name().unwrap_or_default(),
                "Reassigning alias"
            );
        }
        clients.insert(alias, client.clone());
    }

    /// Remove the entries of `names` that still resolve to `client`.
    fn remove_names<'a>(
        clients: &mut HashMap<String, Client>,
        client: &Client,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        let mut removed = Vec::new();
        for name in names {
            if clients.get(name).is_some_and(|existing| existing.same_peer(client)) {
                clients.remove(name);
                removed.push(name.clone());
            }
        }
        removed
    }

    async fn notify_removed(&self, removed: Vec<String>) {
        if removed.is_empty() {
            return;
        }
        info!(names = ?removed, "Removed clients");
        if let Some(callback) = &self.removed_client_callback {
            if let Err(e) = callback(removed).await {
                error!(error = %e, "Removed client callback failed");
            }
        }
    }
}

#[async_trait]
impl ClientRegistry for MultiRegistry {
    async fn register_new_client(&self, core: &ProcessorCore, client: &Client) -> Result<()> {
        let Some(hello) = client.rpc_peer().and_then(|rpc_peer| rpc_peer.peer_hello()) else {
            return Err(MeshbusError::Protocol("Client has not sent a Hello".to_string()));
        };
        let (name, aliases) = core.qualified_names(&hello);

        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(&name) {
            if existing.peer_name() == Some(name.as_str()) {
                return Err(MeshbusError::NameInUse(format!(
                    "cannot bind {} to a new client",
                    name
                )));
            }
            warn!(alias = %name, owner = existing.peer_name().unwrap_or_default(), "Primary name replaces an alias");
        }
        clients.insert(name, client.clone());
        for alias in aliases {
            Self::add_alias(&mut clients, client, alias);
        }
        Ok(())
    }

    async fn invoke_new_client_callback(&self, _core: &ProcessorCore, client: Client) {
        if let Some(callback) = &self.new_client_callback {
            let name = client.peer_name().unwrap_or_default().to_string();
            if let Err(e) = callback(client).await {
                error!(peer = %name, error = %e, "New client callback failed");
            }
        }
    }

    async fn peer_discarded(&self, core: &ProcessorCore, rpc_peer: &Arc<MultiplexedRpcPeer>) {
        let Some(hello) = rpc_peer.peer_hello() else {
            warn!("Discarded a peer that never sent a Hello");
            return;
        };
        let (name, aliases) = core.qualified_names(&hello);
        let removed = {
            let mut clients = self.clients.lock();
            let client = match clients.get(&name) {
                Some(client) if client.rpc_peer().is_some_and(|p| p.id() == rpc_peer.id()) => client.clone(),
                _ => {
                    warn!(peer = %name, "Could not match discarded peer to a client");
                    return;
                }
            };
            Self::remove_names(&mut clients, &client, std::iter::once(&name).chain(aliases.iter()))
        };
        self.notify_removed(removed).await;
    }

    async fn updated_hello(&self, core: &ProcessorCore, rpc_peer: &Arc<MultiplexedRpcPeer>, updated: &Hello) {
        let Some(prior) = rpc_peer.peer_hello() else {
            return;
        };
        let (name, prior_aliases) = core.qualified_names(&prior);
        let (new_name, new_aliases) = core.qualified_names(updated);
        if new_name != name {
            error!(from = %name, to = %new_name, "Peer changed its primary name; ignoring");
            return;
        }

        let removed = {
            let mut clients = self.clients.lock();
            let Some(client) = clients
                .get(&name)
                .filter(|client| client.rpc_peer().is_some_and(|p| p.id() == rpc_peer.id()))
                .cloned()
            else {
                return;
            };
            for alias in new_aliases.difference(&prior_aliases) {
                Self::add_alias(&mut clients, &client, alias.clone());
            }
            Self::remove_names(&mut clients, &client, prior_aliases.difference(&new_aliases))
        };
        self.notify_removed(removed).await;
    }
}

/// A processor that listens on one or more addresses and routes requests to
/// its peers by name.
///
/// # Example
///
/// ```rust,ignore
/// let processor = MultiPeerProcessor::new(["unix:///run/hub.sock"], config, service)?;
/// let bound = processor.start().await?;
/// if let Some(lamp) = processor.get_client("lamp", None) {
///     lamp.notify("on", &()).await?;
/// }
/// ```
pub struct MultiPeerProcessor {
    core: Arc<ProcessorCore>,
    registry: Arc<MultiRegistry>,
    listen_addresses: Vec<String>,
}

impl MultiPeerProcessor {
    pub fn new<I, S>(listen_addresses: I, config: ProcessorConfig, handler: impl Into<RequestHandler>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let listen_addresses: Vec<String> = listen_addresses.into_iter().map(Into::into).collect();
        if listen_addresses.is_empty() {
            return Err(MeshbusError::config("At least one listen address is required"));
        }
        let registry = Arc::new(MultiRegistry {
            clients: Mutex::new(HashMap::new()),
            new_client_callback: config.new_client_callback.clone(),
            removed_client_callback: config.removed_client_callback.clone(),
        });
        let core = ProcessorCore::new(config, handler.into(), registry.clone());
        Ok(Self {
            core,
            registry,
            listen_addresses,
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn domain(&self) -> Option<&str> {
        self.core.domain()
    }

    pub fn listen_addresses(&self) -> &[String] {
        &self.listen_addresses
    }

    /// Start every listener. Returns the bound addresses in order.
    pub async fn start(&self) -> Result<Vec<String>> {
        let mut bound = Vec::with_capacity(self.listen_addresses.len());
        for address in &self.listen_addresses {
            bound.push(self.core.manager().start_server(address).await?);
        }
        info!(name = %self.core.name(), addresses = ?bound, "Processor listening");
        Ok(bound)
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
    }

    /// Client registered under `name`, falling back to the peer that claimed
    /// the wildcard alias in the same domain.
    pub fn get_client(&self, name: &str, domain: Option<&str>) -> Option<Client> {
        let clients = self.registry.clients.lock();
        clients
            .get(&self.core.qualified_name(name, domain))
            .or_else(|| clients.get(&self.core.qualified_name(ProtocolConfig::WILDCARD_ALIAS, domain)))
            .cloned()
    }

    /// A client that fans requests out to every named peer that is known.
    /// Unknown names are logged and skipped.
    pub fn get_multicast_client(&self, names: &[(&str, Option<&str>)], log_errors: bool) -> Client {
        let mut seen = HashSet::new();
        let mut rpc_peers = Vec::new();
        for (name, domain) in names {
            match self.get_client(name, *domain) {
                Some(client) => {
                    if let Some(rpc_peer) = client.rpc_peer() {
                        if seen.insert(rpc_peer.id()) {
                            rpc_peers.push(Arc::clone(rpc_peer));
                        }
                    }
                }
                None => warn!(name = %name, domain = ?domain, "No client for multicast target"),
            }
        }
        Client::multicast(rpc_peers, log_errors, self.core.translator())
    }

    /// A client that fans requests out to every registered peer.
    pub fn get_broadcast_client(&self, log_errors: bool) -> Client {
        let rpc_peers = self.unique_rpc_peers();
        Client::multicast(rpc_peers, log_errors, self.core.translator())
    }

    /// Close the connection of the peer registered under `name`.
    pub async fn drop_client(&self, name: &str, domain: Option<&str>) -> Result<()> {
        let client = self.get_client(name, domain).ok_or_else(|| {
            MeshbusError::DoesNotExist(format!("No client named {}", self.core.qualified_name(name, domain)))
        })?;
        if let Some(rpc_peer) = client.rpc_peer() {
            self.core.discard_peer(rpc_peer).await;
        }
        Ok(())
    }

    pub fn open_connection(
        &self,
        remote_address: &str,
        expected_peer_parameters: Option<HashMap<String, String>>,
    ) -> Result<Arc<OutboundConnectionHandle>> {
        self.core
            .manager()
            .open_connection(remote_address, expected_peer_parameters)
    }

    pub async fn cancel_pending_connection(&self, remote_address: &str) {
        self.core.manager().cancel_pending_connection(remote_address).await;
    }

    /// Every registered qualified name, sorted.
    pub fn client_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self.registry.clients.lock().keys().cloned().collect();
        names.into_iter().collect()
    }

    pub fn client_count(&self) -> usize {
        self.unique_rpc_peers().len()
    }

    fn unique_rpc_peers(&self) -> Vec<Arc<MultiplexedRpcPeer>> {
        let clients = self.registry.clients.lock();
        let mut seen: HashSet<PeerId> = HashSet::new();
        clients
            .values()
            .filter_map(|client| client.rpc_peer())
            .filter(|rpc_peer| seen.insert(rpc_peer.id()))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn rpc_peer_count(&self) -> usize {
        self.core.rpc_peer_count()
    }
}

impl std::fmt::Debug for MultiPeerProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPeerProcessor")
            .field("name", &self.core.name())
            .field("domain", &self.core.domain())
            .field("listen_addresses", &self.listen_addresses)
            .finish()
    }
}
