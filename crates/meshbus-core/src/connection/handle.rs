use super::backoff::BackoffConfig;
use crate::error::{MeshbusError, Result};
use crate::networking::Peer;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone)]
enum ConnectStatus {
    Idle,
    Connecting,
    Connected(Arc<dyn Peer>),
    Shutdown,
}

#[derive(Default)]
struct HandleState {
    /// Bumped whenever a connect loop is replaced or the handle shuts down.
    /// A loop whose captured generation is stale exits before its next try.
    generation: u64,
    task: Option<JoinHandle<()>>,
    /// Most recent first.
    attempts: VecDeque<Instant>,
    active: bool,
}

/// Desired and actual state of one outbound link.
///
/// Created by [`super::PeerConnectionManager::open_connection`]; at most one
/// connect loop runs per handle.
pub struct OutboundConnectionHandle {
    remote_address: String,
    expected_peer_parameters: Option<HashMap<String, String>>,
    backoff: BackoffConfig,
    state: Mutex<HandleState>,
    status: watch::Sender<ConnectStatus>,
}

impl OutboundConnectionHandle {
    pub(crate) fn new(
        remote_address: impl Into<String>,
        expected_peer_parameters: Option<HashMap<String, String>>,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_address: remote_address.into(),
            expected_peer_parameters,
            backoff,
            state: Mutex::new(HandleState::default()),
            status: watch::channel(ConnectStatus::Idle).0,
        })
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn expected_peer_parameters(&self) -> Option<&HashMap<String, String>> {
        self.expected_peer_parameters.as_ref()
    }

    /// Replace any running connect loop. Returns the generation the new loop
    /// must carry.
    pub(crate) fn begin_attempt(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.active = true;
        if let Some(task) = state.task.take() {
            task.abort();
        }
        self.status.send_replace(ConnectStatus::Connecting);
        state.generation
    }

    pub(crate) fn set_task(&self, generation: u64, task: JoinHandle<()>) {
        let mut state = self.state.lock();
        if state.generation == generation && state.active {
            state.task = Some(task);
        } else {
            task.abort();
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.active && state.generation == generation
    }

    /// Sleep before connection attempt `attempt` of the current loop, then
    /// record the attempt.
    pub(crate) async fn backoff_before_attempting_connection(&self, attempt: u32, is_reconnect: bool) {
        let backoff = {
            let state = self.state.lock();
            self.backoff
                .compute_backoff(attempt, is_reconnect, &state.attempts, Instant::now())
        };
        if is_reconnect && attempt == 0 {
            info!(address = %self.remote_address, "Backing off after failed connection");
        }
        if !backoff.is_zero() {
            let delay = self.backoff.jitter(backoff);
            debug!(address = %self.remote_address, attempt, ?delay, "Waiting before connection attempt");
            tokio::time::sleep(delay).await;
        }

        let history_len = self.backoff.history_len();
        let mut state = self.state.lock();
        state.attempts.push_front(Instant::now());
        state.attempts.truncate(history_len);
    }

    /// Publish the peer a loop connected. Fails if the loop was superseded.
    pub(crate) fn mark_connected(&self, generation: u64, peer: Arc<dyn Peer>) -> bool {
        let state = self.state.lock();
        if !(state.active && state.generation == generation) {
            return false;
        }
        self.status.send_replace(ConnectStatus::Connected(peer));
        true
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.status.borrow(), ConnectStatus::Connected(_))
    }

    /// Whether a connect loop has been started and not shut down.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Wait for the current connect loop to produce a peer.
    pub async fn connected(&self) -> Result<Arc<dyn Peer>> {
        if !self.is_active() {
            return Err(MeshbusError::Cancelled(
                "This connection has been shut down".to_string(),
            ));
        }
        let mut rx = self.status.subscribe();
        let status = rx
            .wait_for(|status| matches!(status, ConnectStatus::Connected(_) | ConnectStatus::Shutdown))
            .await
            .map_err(|_| MeshbusError::Cancelled("Connection handle dropped".to_string()))?;
        match &*status {
            ConnectStatus::Connected(peer) => Ok(Arc::clone(peer)),
            _ => Err(MeshbusError::Cancelled(
                "This connection has been shut down".to_string(),
            )),
        }
    }

    /// Stop the connect loop, or close the connected peer.
    pub async fn shutdown(&self) {
        let task = {
            let mut state = self.state.lock();
            state.active = false;
            state.generation += 1;
            state.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        let previous = self.status.send_replace(ConnectStatus::Shutdown);
        if let ConnectStatus::Connected(peer) = previous {
            peer.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn attempt_count(&self) -> usize {
        self.state.lock().attempts.len()
    }
}

impl std::fmt::Debug for OutboundConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnectionHandle")
            .field("remote_address", &self.remote_address)
            .field("is_active", &self.is_active())
            .field("is_connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::ProcessLocalPeer;
    use std::time::Duration;

    fn handle() -> Arc<OutboundConnectionHandle> {
        OutboundConnectionHandle::new("local://", None, BackoffConfig::default())
    }

    #[tokio::test]
    async fn test_new_attempt_supersedes_previous() {
        let handle = handle();
        let first = handle.begin_attempt();
        assert!(handle.is_current(first));
        let second = handle.begin_attempt();
        assert!(!handle.is_current(first));
        assert!(handle.is_current(second));

        let (peer, _remote) = ProcessLocalPeer::pair("local://");
        assert!(!handle.mark_connected(first, peer.clone()));
        assert!(!handle.is_connected());
        assert!(handle.mark_connected(second, peer));
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn test_superseded_loop_is_aborted() {
        let handle = handle();
        let generation = handle.begin_attempt();
        let task = tokio::spawn(futures::future::pending::<()>());
        handle.set_task(generation, task);
        handle.begin_attempt();
        assert!(handle.state.lock().task.is_none());
    }

    #[tokio::test]
    async fn test_connected_resolves_with_peer() {
        let handle = handle();
        let generation = handle.begin_attempt();
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.connected().await.map(|peer| peer.id()) })
        };
        let (peer, _remote) = ProcessLocalPeer::pair("local://");
        let id = peer.id();
        handle.mark_connected(generation, peer);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters_and_closes_peer() {
        let handle = handle();
        let generation = handle.begin_attempt();
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.connected().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        handle.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Err(MeshbusError::Cancelled(_))));
        assert!(!handle.is_active());
        assert!(!handle.is_current(generation));
        assert!(matches!(handle.connected().await, Err(MeshbusError::Cancelled(_))));

        let handle = self::handle();
        let generation = handle.begin_attempt();
        let (peer, remote) = ProcessLocalPeer::pair("local://");
        handle.mark_connected(generation, peer);
        handle.shutdown().await;
        assert!(remote.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_records_attempts() {
        let handle = handle();
        let start = Instant::now();
        handle.backoff_before_attempting_connection(0, false).await;
        assert_eq!(Instant::now(), start);
        handle.backoff_before_attempting_connection(0, false).await;
        // Two attempts in the last minute fill the first window.
        handle.backoff_before_attempting_connection(0, false).await;
        assert!(Instant::now() - start >= Duration::from_secs(48));
        assert_eq!(handle.attempt_count(), 3);

        for _ in 0..10 {
            handle.backoff_before_attempting_connection(0, false).await;
        }
        assert_eq!(handle.attempt_count(), 7);
    }
}
