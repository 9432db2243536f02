//! PeerConnectionManager - inbound listeners and outbound connections.
//!
//! Provides:
//! - Transport selection by address scheme, with per-protocol overrides
//! - Bounded concurrent peer admission with parameter checks
//! - Reconnection of outbound peers that drop unexpectedly

use super::backoff::BackoffConfig;
use super::handle::OutboundConnectionHandle;
use crate::config::ConnectionConfig;
use crate::error::{MeshbusError, Result};
use crate::networking::{
    parse_address, AuthenticationPolicy, Authenticator, ClosedPeer, JsonRpcTransport, Listener,
    MessagingProtocol, NewPeerCallback, NewlineTransport, Peer, PeerId, ProcessLocalTransport,
    Transport, TransportOptions,
};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Configuration for a [`PeerConnectionManager`].
#[derive(Clone)]
pub struct ConnectionManagerConfig {
    /// Passed to every transport. The authenticator is derived from
    /// `authentication_policy`.
    pub transport_options: TransportOptions,
    pub authentication_policy: Option<Arc<dyn AuthenticationPolicy>>,
    pub max_concurrent_peer_starts: usize,
    pub backoff: BackoffConfig,
    pub transport_overrides: HashMap<MessagingProtocol, Arc<dyn Transport>>,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            transport_options: TransportOptions::default(),
            authentication_policy: None,
            max_concurrent_peer_starts: ConnectionConfig::MAX_CONCURRENT_PEER_STARTS,
            backoff: BackoffConfig::default(),
            transport_overrides: HashMap::new(),
        }
    }
}

impl ConnectionManagerConfig {
    pub fn with_transport_options(mut self, options: TransportOptions) -> Self {
        self.transport_options = options;
        self
    }

    pub fn with_authentication_policy(mut self, policy: Arc<dyn AuthenticationPolicy>) -> Self {
        self.authentication_policy = Some(policy);
        self
    }

    pub fn with_max_concurrent_peer_starts(mut self, max: usize) -> Self {
        self.max_concurrent_peer_starts = max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_transport(mut self, protocol: MessagingProtocol, transport: Arc<dyn Transport>) -> Self {
        self.transport_overrides.insert(protocol, transport);
        self
    }
}

impl std::fmt::Debug for ConnectionManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManagerConfig")
            .field("transport_options", &self.transport_options)
            .field("max_concurrent_peer_starts", &self.max_concurrent_peer_starts)
            .field("backoff", &self.backoff)
            .field("overrides", &self.transport_overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
struct ManagerState {
    peers: HashMap<PeerId, Arc<dyn Peer>>,
    listeners: Vec<Box<dyn Listener>>,
    handles: HashMap<String, Arc<OutboundConnectionHandle>>,
    shutdown_requested: bool,
}

struct ManagerInner {
    on_new_peer: NewPeerCallback,
    options: TransportOptions,
    backoff: BackoffConfig,
    transports: HashMap<MessagingProtocol, Arc<dyn Transport>>,
    start_semaphore: Semaphore,
    state: Mutex<ManagerState>,
}

/// Owns every listener and outbound connection of a process.
///
/// Admitted peers are handed to the `on_new_peer` callback; the manager keeps
/// track of them until they close.
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

impl PeerConnectionManager {
    pub fn new(on_new_peer: NewPeerCallback, config: ConnectionManagerConfig) -> Self {
        let mut transports: HashMap<MessagingProtocol, Arc<dyn Transport>> = HashMap::new();
        transports.insert(MessagingProtocol::NewlineDelimited, Arc::new(NewlineTransport::new()));
        transports.insert(MessagingProtocol::ProcessLocal, ProcessLocalTransport::global());
        transports.insert(MessagingProtocol::JsonRpc, Arc::new(JsonRpcTransport::new()));
        transports.extend(config.transport_overrides);

        let mut options = config.transport_options;
        if let Some(policy) = config.authentication_policy {
            options.authenticator = Some(Arc::new(Authenticator::new(policy)));
        }

        Self {
            inner: Arc::new(ManagerInner {
                on_new_peer,
                options,
                backoff: config.backoff,
                transports,
                start_semaphore: Semaphore::new(config.max_concurrent_peer_starts.max(1)),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Listen on `listen_address`. Returns the address clients should use,
    /// with any OS-assigned port filled in.
    pub async fn start_server(&self, listen_address: &str) -> Result<String> {
        let transport = self.inner.transport_for(listen_address)?;
        self.inner.state.lock().shutdown_requested = false;

        let weak = Arc::downgrade(&self.inner);
        let on_new_peer: NewPeerCallback = Arc::new(move |peer: Arc<dyn Peer>| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.add_new_peer(peer, None).await.map(|_| ()),
                    None => {
                        peer.shutdown().await;
                        Err(MeshbusError::Cancelled(
                            "Connection manager is gone".to_string(),
                        ))
                    }
                }
            }
            .boxed()
        });

        let listener = transport
            .start_server(listen_address, on_new_peer, self.inner.options.clone())
            .await?;
        let local_address = listener.local_address();
        info!(address = %local_address, "Listening for peers");
        self.inner.state.lock().listeners.push(listener);
        Ok(local_address)
    }

    /// Start connecting to `remote_address` in the background.
    ///
    /// Idempotent: an active handle for the address is returned as is.
    /// `expected_peer_parameters` are compared with the connected peer's
    /// connection parameters; a mismatch discards the peer.
    pub fn open_connection(
        &self,
        remote_address: &str,
        expected_peer_parameters: Option<HashMap<String, String>>,
    ) -> Result<Arc<OutboundConnectionHandle>> {
        let transport = self.inner.transport_for(remote_address)?;
        let handle = {
            let mut state = self.inner.state.lock();
            state.shutdown_requested = false;
            if let Some(handle) = state.handles.get(remote_address) {
                if handle.is_active() {
                    return Ok(Arc::clone(handle));
                }
            }
            let handle = OutboundConnectionHandle::new(
                remote_address,
                expected_peer_parameters,
                self.inner.backoff.clone(),
            );
            state
                .handles
                .insert(remote_address.to_string(), Arc::clone(&handle));
            handle
        };
        self.inner.start_connect_loop(&handle, transport, false);
        Ok(handle)
    }

    /// Drop and shut down the handle for `remote_address`, if any.
    pub async fn cancel_pending_connection(&self, remote_address: &str) {
        let handle = self.inner.state.lock().handles.remove(remote_address);
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    pub fn connection_handle(&self, remote_address: &str) -> Option<Arc<OutboundConnectionHandle>> {
        self.inner.state.lock().handles.get(remote_address).cloned()
    }

    /// Number of admitted peers that have not closed.
    pub fn peer_count(&self) -> usize {
        self.inner.state.lock().peers.len()
    }

    /// Close listeners, stop connect loops and shut down every peer.
    /// Idempotent until the next `start_server` or `open_connection`.
    pub async fn shutdown(&self) {
        let (listeners, handles, peers) = {
            let mut state = self.inner.state.lock();
            if state.shutdown_requested {
                return;
            }
            state.shutdown_requested = true;
            (
                std::mem::take(&mut state.listeners),
                state.handles.drain().map(|(_, h)| h).collect::<Vec<_>>(),
                state.peers.drain().map(|(_, p)| p).collect::<Vec<_>>(),
            )
        };

        join_all(listeners.iter().map(|listener| async move {
            let socket_path = listener.unix_socket_path();
            listener.close().await;
            if let Some(path) = socket_path {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }))
        .await;
        join_all(handles.iter().map(|handle| handle.shutdown())).await;
        join_all(peers.iter().map(|peer| peer.shutdown())).await;
        debug!("Connection manager shut down");
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PeerConnectionManager")
            .field("peers", &state.peers.len())
            .field("listeners", &state.listeners.len())
            .field("connections", &state.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn peer_label(peer: &dyn Peer) -> String {
    format!(
        "{} [{}]",
        peer.id(),
        peer.peer_common_name().as_deref().unwrap_or("<unknown>")
    )
}

impl ManagerInner {
    fn transport_for(&self, address: &str) -> Result<Arc<dyn Transport>> {
        let parsed = parse_address(address)?;
        self.transports
            .get(&parsed.protocol)
            .cloned()
            .ok_or_else(|| {
                MeshbusError::Unsupported(format!(
                    "No transport available for {:?} addresses",
                    parsed.protocol
                ))
            })
    }

    fn start_connect_loop(
        self: &Arc<Self>,
        handle: &Arc<OutboundConnectionHandle>,
        transport: Arc<dyn Transport>,
        is_reconnect: bool,
    ) {
        let generation = handle.begin_attempt();
        let task = tokio::spawn(connect_loop(
            Arc::downgrade(self),
            Arc::clone(handle),
            transport,
            generation,
            is_reconnect,
        ));
        handle.set_task(generation, task);
    }

    /// Start and register a peer. `Ok(false)` means it was discarded as part
    /// of normal churn; other failures shut the peer down and are returned.
    async fn add_new_peer(
        self: &Arc<Self>,
        peer: Arc<dyn Peer>,
        expected_peer_parameters: Option<&HashMap<String, String>>,
    ) -> Result<bool> {
        let weak = Arc::downgrade(self);
        peer.register_connection_closed_callback(Box::new(move |closed| {
            if let Some(inner) = weak.upgrade() {
                inner.peer_closed(closed);
            }
        }));

        let _permit = self
            .start_semaphore
            .acquire()
            .await
            .map_err(|_| MeshbusError::Cancelled("Peer admission closed".to_string()))?;

        let result = match peer.start().await {
            Err(e) if e.is_discardable_during_start() => {
                warn!(peer = %peer_label(peer.as_ref()), error = %e, "Discarding peer that failed to start");
                peer.shutdown().await;
                return Ok(false);
            }
            Err(e) => Err(e),
            Ok(()) => self.register_peer(&peer, expected_peer_parameters).await,
        };

        if let Err(e) = &result {
            let label = peer_label(peer.as_ref());
            match e {
                MeshbusError::ParameterMismatch { .. } => {
                    warn!(peer = %label, error = %e, "Mismatch on peer")
                }
                MeshbusError::Timeout(_) => warn!(peer = %label, "Timed out on adding new peer"),
                MeshbusError::Cancelled(_) => {
                    warn!(peer = %label, "Cancelled adding new peer; discarding")
                }
                _ => error!(peer = %label, error = %e, "Failed to add new peer"),
            }
            self.state.lock().peers.remove(&peer.id());
            peer.shutdown().await;
        }
        result.map(|()| true)
    }

    async fn register_peer(
        &self,
        peer: &Arc<dyn Peer>,
        expected_peer_parameters: Option<&HashMap<String, String>>,
    ) -> Result<()> {
        if let Some(expected) = expected_peer_parameters {
            let actual = peer.peer_connection_parameters().unwrap_or_default();
            for (name, expected_value) in expected {
                let actual_value = actual.get(name);
                if actual_value != Some(expected_value) {
                    return Err(MeshbusError::ParameterMismatch {
                        name: name.clone(),
                        expected: expected_value.clone(),
                        actual: actual_value.cloned(),
                    });
                }
            }
        }
        self.state.lock().peers.insert(peer.id(), Arc::clone(peer));
        (self.on_new_peer)(Arc::clone(peer)).await
    }

    async fn connect_once(
        self: &Arc<Self>,
        handle: &OutboundConnectionHandle,
        transport: &Arc<dyn Transport>,
    ) -> Result<Option<Arc<dyn Peer>>> {
        let peer = transport
            .open_connection(handle.remote_address(), self.options.clone())
            .await?;
        let admitted = self
            .add_new_peer(Arc::clone(&peer), handle.expected_peer_parameters())
            .await?;
        Ok(admitted.then_some(peer))
    }

    fn peer_closed(self: &Arc<Self>, closed: ClosedPeer) {
        // Released after the lock: dropping a peer may close its partner.
        let _removed;
        let handle = {
            let mut state = self.state.lock();
            if state.shutdown_requested {
                return;
            }
            _removed = state.peers.remove(&closed.id);
            if closed.was_requested {
                info!(peer = %closed.id, "Closed connection to peer");
                return;
            }
            warn!(peer = %closed.id, "Lost connection to peer");
            // Inbound peers are the remote side's to re-establish.
            let Some(address) = closed.remote_address.as_deref() else {
                return;
            };
            match state.handles.get(address) {
                Some(handle) if handle.is_active() => Arc::clone(handle),
                _ => {
                    warn!(address, "Could not find connection for peer");
                    return;
                }
            }
        };

        let transport = match self.transport_for(handle.remote_address()) {
            Ok(transport) => transport,
            Err(e) => {
                error!(address = %handle.remote_address(), error = %e, "Cannot reconnect");
                return;
            }
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(address = %handle.remote_address(), "No runtime available to reconnect");
            return;
        }
        info!(address = %handle.remote_address(), "Initiating reconnect attempt");
        self.start_connect_loop(&handle, transport, true);
    }
}

async fn connect_loop(
    inner: Weak<ManagerInner>,
    handle: Arc<OutboundConnectionHandle>,
    transport: Arc<dyn Transport>,
    generation: u64,
    is_reconnect: bool,
) {
    let mut attempt: u32 = 0;
    loop {
        if !handle.is_current(generation) {
            debug!(address = %handle.remote_address(), "Connect loop superseded");
            return;
        }
        handle
            .backoff_before_attempting_connection(attempt, is_reconnect)
            .await;
        if !handle.is_current(generation) {
            debug!(address = %handle.remote_address(), "Connect loop superseded");
            return;
        }
        let Some(manager) = inner.upgrade() else {
            return;
        };

        match manager.connect_once(&handle, &transport).await {
            Ok(Some(peer)) => {
                if !handle.mark_connected(generation, Arc::clone(&peer)) {
                    peer.shutdown().await;
                }
                return;
            }
            Ok(None) => {
                warn!(address = %handle.remote_address(), attempt, "Peer discarded during start; retrying")
            }
            Err(e) => {
                warn!(address = %handle.remote_address(), attempt, error = %e, "Problem opening connection")
            }
        }
        attempt = attempt.saturating_add(1);
    }
}
