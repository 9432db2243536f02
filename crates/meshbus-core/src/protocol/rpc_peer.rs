//! Request/response multiplexing over one transport [`Peer`].
//!
//! Every outgoing envelope takes the next value of a per-connection sequence
//! counter shared by Hello and Request messages. Responses are matched to
//! outstanding requests by that number. A small ring of recently timed-out
//! numbers lets late responses be dropped quietly.
//!
//! Inbound requests are dispatched in one of two modes:
//!
//! - synchronous: a FIFO drained by a single server task, so a request's
//!   handler never starts before the previous one has returned;
//! - asynchronous: handlers are invoked in arrival order and driven
//!   concurrently, so only their start order is guaranteed.
//!
//! Neither mode orders requests against responses or Hello messages arriving
//! on the same connection.

use super::context::{RequestContext, TlsInfo};
use super::message::{Hello, Message, MessageBody, Request, Response, StatusCode};
use super::serialization::{deserialize_message, serialize_message, SerializationProtocol};
use crate::config::ProtocolConfig;
use crate::error::{MeshbusError, Result};
use crate::networking::auth::certificate_fingerprint;
use crate::networking::{IncomingMessages, Peer, PeerId};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

tokio::task_local! {
    /// Set while the synchronous server task of a peer drives a handler.
    static SERVING: PeerId;
}

/// Produces the response to an inbound request.
pub type RequestHandler =
    Arc<dyn Fn(Request, RequestContext) -> BoxFuture<'static, Response> + Send + Sync>;

/// Invoked when the connection drops without a local shutdown request.
pub type ConnectionLostCallback =
    Arc<dyn Fn(Arc<MultiplexedRpcPeer>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with each Hello received after the first.
pub type UpdatedHelloCallback =
    Arc<dyn Fn(Arc<MultiplexedRpcPeer>, Hello) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
enum HelloState {
    Pending,
    Received(Hello),
    Cancelled,
}

struct OutstandingRequest {
    tx: oneshot::Sender<Result<Response>>,
    command: String,
    timer: JoinHandle<()>,
    sent_at: Instant,
}

impl OutstandingRequest {
    fn resolve(self, result: Result<Response>) {
        self.timer.abort();
        if self.tx.send(result).is_err() {
            debug!(
                command = %self.command,
                elapsed_ms = self.sent_at.elapsed().as_millis() as u64,
                "Caller stopped waiting for response"
            );
        }
    }
}

#[derive(Default)]
struct RpcState {
    next_sequence_number: u64,
    outstanding: HashMap<u64, OutstandingRequest>,
    timed_out: VecDeque<u64>,
    hello_sent: bool,
}

impl RpcState {
    fn allocate_sequence_number(&mut self) -> u64 {
        let seq = self.next_sequence_number;
        self.next_sequence_number += 1;
        seq
    }

    fn remember_timed_out(&mut self, seq: u64) {
        if self.timed_out.len() == ProtocolConfig::TIMED_OUT_HISTORY {
            self.timed_out.pop_front();
        }
        self.timed_out.push_back(seq);
    }
}

enum Dispatch {
    Synchronous {
        tx: Option<mpsc::UnboundedSender<(u64, Request)>>,
        rx: Option<mpsc::UnboundedReceiver<(u64, Request)>>,
    },
    Asynchronous {
        started: bool,
        backlog: VecDeque<(u64, Request)>,
    },
}

/// Completion of a request sent with [`MultiplexedRpcPeer::send_request`].
#[derive(Debug)]
pub struct PendingResponse {
    rx: Option<oneshot::Receiver<Result<Response>>>,
}

impl PendingResponse {
    /// `None` for oneway requests.
    pub async fn wait(self) -> Result<Option<Response>> {
        let Some(rx) = self.rx else {
            return Ok(None);
        };
        match rx.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(MeshbusError::NoConnection(
                "Request was abandoned before completion".to_string(),
            )),
        }
    }
}

pub struct MultiplexedRpcPeerBuilder {
    peer: Arc<dyn Peer>,
    my_hello: Hello,
    handler: RequestHandler,
    is_initiator: bool,
    synchronous_requests: bool,
    request_timeout: Duration,
    on_connection_lost: Option<ConnectionLostCallback>,
    on_updated_hello: Option<UpdatedHelloCallback>,
}

impl MultiplexedRpcPeerBuilder {
    /// The initiator sends its Hello as soon as it starts.
    pub fn initiator(mut self, is_initiator: bool) -> Self {
        self.is_initiator = is_initiator;
        self
    }

    pub fn synchronous_requests(mut self, synchronous: bool) -> Self {
        self.synchronous_requests = synchronous;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn on_connection_lost(mut self, callback: ConnectionLostCallback) -> Self {
        self.on_connection_lost = Some(callback);
        self
    }

    pub fn on_updated_hello(mut self, callback: UpdatedHelloCallback) -> Self {
        self.on_updated_hello = Some(callback);
        self
    }

    pub fn build(self) -> Arc<MultiplexedRpcPeer> {
        let dispatch = if self.synchronous_requests {
            let (tx, rx) = mpsc::unbounded_channel();
            Dispatch::Synchronous {
                tx: Some(tx),
                rx: Some(rx),
            }
        } else {
            Dispatch::Asynchronous {
                started: false,
                backlog: VecDeque::new(),
            }
        };
        Arc::new(MultiplexedRpcPeer {
            peer: self.peer,
            my_hello: Mutex::new(self.my_hello),
            handler: self.handler,
            on_connection_lost: self.on_connection_lost,
            on_updated_hello: self.on_updated_hello,
            is_initiator: self.is_initiator,
            request_timeout: self.request_timeout,
            state: Mutex::new(RpcState::default()),
            dispatch: Mutex::new(dispatch),
            requests_closed: AtomicBool::new(false),
            hello: watch::channel(HelloState::Pending).0,
            connection_lost: watch::channel(None).0,
            triage_task: Mutex::new(None),
            server_task: Mutex::new(None),
            shutdown_task: Mutex::new(None),
        })
    }
}

pub struct MultiplexedRpcPeer {
    peer: Arc<dyn Peer>,
    my_hello: Mutex<Hello>,
    handler: RequestHandler,
    on_connection_lost: Option<ConnectionLostCallback>,
    on_updated_hello: Option<UpdatedHelloCallback>,
    is_initiator: bool,
    request_timeout: Duration,
    state: Mutex<RpcState>,
    dispatch: Mutex<Dispatch>,
    requests_closed: AtomicBool,
    hello: watch::Sender<HelloState>,
    /// `Some(was_requested)` once shut down.
    connection_lost: watch::Sender<Option<bool>>,
    triage_task: Mutex<Option<JoinHandle<()>>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_task: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
}

impl MultiplexedRpcPeer {
    /// Synchronous dispatch and the socket timeout by default.
    pub fn builder(
        peer: Arc<dyn Peer>,
        my_hello: Hello,
        handler: RequestHandler,
    ) -> MultiplexedRpcPeerBuilder {
        MultiplexedRpcPeerBuilder {
            peer,
            my_hello,
            handler,
            is_initiator: false,
            synchronous_requests: true,
            request_timeout: ProtocolConfig::SOCKET_TIMEOUT,
            on_connection_lost: None,
            on_updated_hello: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.peer.id()
    }

    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn serialization_protocol(&self) -> SerializationProtocol {
        self.peer.serialization_protocol()
    }

    pub fn negotiated_api_version(&self) -> Option<u32> {
        self.peer.negotiated_api_version()
    }

    /// Begin reading from the peer. The initiator sends its Hello here.
    ///
    /// With `start_server == false` inbound requests are held until
    /// [`start_server`](Self::start_server) is called.
    pub fn start(self: &Arc<Self>, start_server: bool) -> Result<()> {
        let incoming = self.peer.incoming_messages().ok_or_else(|| {
            MeshbusError::Protocol("Peer messages are already being consumed".to_string())
        })?;
        let this = Arc::clone(self);
        let triage = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(Arc::clone(&this).triage(incoming))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(peer = %this.peer_name(), "Triage task panicked");
            }
            this.finish_triage();
        });
        *self.triage_task.lock() = Some(triage);

        if self.is_initiator {
            self.send_hello()?;
        }
        if start_server {
            self.start_server();
        }
        Ok(())
    }

    /// Resolve with the peer's first Hello.
    pub async fn handshake(&self) -> Result<Hello> {
        let mut rx = self.hello.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, HelloState::Pending))
            .await
            .map_err(|_| MeshbusError::Cancelled("Peer dropped".to_string()))?;
        match &*state {
            HelloState::Received(hello) => Ok(hello.clone()),
            _ => Err(MeshbusError::Cancelled(
                "Connection closed before Hello was received".to_string(),
            )),
        }
    }

    /// Allow inbound requests to be handled. Idempotent.
    pub fn start_server(self: &Arc<Self>) {
        let mut dispatch = self.dispatch.lock();
        match &mut *dispatch {
            Dispatch::Synchronous { rx, .. } => {
                let Some(mut rx) = rx.take() else {
                    return;
                };
                let this = Arc::clone(self);
                let server = tokio::spawn(SERVING.scope(self.id(), async move {
                    while let Some((seq, request)) = rx.recv().await {
                        if this.requests_closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let response = this.invoke_handler(request.clone());
                        this.finish_request(seq, &request, response).await;
                    }
                }));
                *self.server_task.lock() = Some(server);
            }
            Dispatch::Asynchronous { started, backlog } => {
                if *started {
                    return;
                }
                *started = true;
                for (seq, request) in backlog.drain(..) {
                    self.spawn_request(seq, request);
                }
            }
        }
    }

    pub fn peer_hello(&self) -> Option<Hello> {
        match &*self.hello.borrow() {
            HelloState::Received(hello) => Some(hello.clone()),
            _ => None,
        }
    }

    /// For log messages.
    pub fn peer_name(&self) -> String {
        self.peer_hello()
            .map(|hello| hello.name)
            .unwrap_or_else(|| "<anonymous>".to_string())
    }

    pub fn my_hello(&self) -> Hello {
        self.my_hello.lock().clone()
    }

    /// Replace the local identity, re-announcing it if a Hello was already sent.
    pub fn update_hello(&self, my_hello: Hello) -> Result<()> {
        *self.my_hello.lock() = my_hello;
        let hello_sent = self.state.lock().hello_sent;
        if hello_sent {
            self.send_hello()?;
        }
        Ok(())
    }

    pub fn tls_info(&self) -> TlsInfo {
        TlsInfo {
            peer_common_name: self.peer.peer_common_name(),
            is_validated: self.peer.is_validated(),
            peer_certificate_fingerprint: self
                .peer
                .peer_certificate()
                .map(|cert| certificate_fingerprint(&cert)),
        }
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            peer_hello: self.peer_hello(),
            tls_info: self.tls_info(),
            serialization_protocol: self.serialization_protocol(),
            negotiated_api_version: self.negotiated_api_version(),
        }
    }

    /// Send `request` now and return its completion.
    ///
    /// A failure to enqueue is returned before any bookkeeping is created.
    /// Oneway requests complete as soon as they are sent.
    pub fn send_request(self: &Arc<Self>, request: Request) -> Result<PendingResponse> {
        let is_oneway = request.is_oneway;
        let command = request.command.clone();

        let mut state = self.state.lock();
        let seq = state.allocate_sequence_number();
        self.send_message(&Message::request(seq, request))?;
        if is_oneway {
            return Ok(PendingResponse { rx: None });
        }

        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(self);
        let timeout = self.request_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(this) = weak.upgrade() {
                this.handle_request_timeout(seq);
            }
        });
        state.outstanding.insert(
            seq,
            OutstandingRequest {
                tx,
                command,
                timer,
                sent_at: Instant::now(),
            },
        );
        Ok(PendingResponse { rx: Some(rx) })
    }

    pub async fn make_request(self: &Arc<Self>, request: Request) -> Result<Option<Response>> {
        self.send_request(request)?.wait().await
    }

    pub fn outstanding_requests(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Shut down the connection and fail every outstanding request.
    /// Concurrent and repeated calls share one shutdown.
    ///
    /// Shutdown joins the synchronous server task. Called from a handler
    /// running on that task, this closes the transport and returns; the rest
    /// of the shutdown completes after the handler returns.
    pub async fn shutdown(self: &Arc<Self>) {
        let task = self.trigger_shutdown(true);
        let from_own_server = SERVING
            .try_with(|serving| *serving == self.id())
            .unwrap_or(false);
        if from_own_server {
            self.peer.shutdown().await;
        } else {
            task.await;
        }
        self.cancel_pending_hello();
    }

    /// Wait until the peer has shut down. Returns whether it was requested
    /// locally.
    pub async fn closed(&self) -> bool {
        let mut rx = self.connection_lost.subscribe();
        let closed = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).unwrap_or(true),
            Err(_) => true,
        };
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.connection_lost.borrow().is_some()
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        let raw = serialize_message(message, self.serialization_protocol())?;
        self.peer.enqueue_message(raw)
    }

    fn send_hello(&self) -> Result<()> {
        let hello = self.my_hello();
        let mut state = self.state.lock();
        let seq = state.allocate_sequence_number();
        self.send_message(&Message::hello(seq, hello))?;
        state.hello_sent = true;
        Ok(())
    }

    async fn triage(self: Arc<Self>, mut incoming: IncomingMessages) {
        while let Some(raw) = incoming.next().await {
            debug!(
                peer = %self.peer.id(),
                "Received message: {:.80}",
                String::from_utf8_lossy(&raw)
            );
            let message = match deserialize_message(&raw, self.serialization_protocol()) {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer = %self.peer_name(), error = %e, "Dropping undecodable message");
                    continue;
                }
            };
            let seq = message.sequence_number;
            match message.body_union {
                MessageBody::Request(request) => self.schedule_request(seq, request),
                MessageBody::Response(response) => self.handle_response(seq, response),
                MessageBody::Hello(hello) => self.handle_hello(hello).await,
            }
        }
    }

    /// The inbound stream ended: drop queued requests and shut down.
    fn finish_triage(self: &Arc<Self>) {
        self.requests_closed.store(true, Ordering::SeqCst);
        match &mut *self.dispatch.lock() {
            Dispatch::Synchronous { tx, .. } => {
                tx.take();
            }
            Dispatch::Asynchronous { backlog, .. } => backlog.clear(),
        }
        self.cancel_pending_hello();
        // Not awaited: the shutdown task waits for this one.
        let _ = self.trigger_shutdown(false);
    }

    fn schedule_request(self: &Arc<Self>, seq: u64, request: Request) {
        let mut dispatch = self.dispatch.lock();
        match &mut *dispatch {
            Dispatch::Synchronous { tx: Some(tx), .. } => {
                let _ = tx.send((seq, request));
            }
            Dispatch::Synchronous { tx: None, .. } => {}
            Dispatch::Asynchronous { started: true, .. } => self.spawn_request(seq, request),
            Dispatch::Asynchronous { backlog, .. } => backlog.push_back((seq, request)),
        }
    }

    fn spawn_request(self: &Arc<Self>, seq: u64, request: Request) {
        // Invoked here, in arrival order; only completion is concurrent.
        let response = self.invoke_handler(request.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move { this.finish_request(seq, &request, response).await });
    }

    fn invoke_handler(&self, request: Request) -> BoxFuture<'static, Response> {
        (self.handler)(request, self.request_context())
    }

    async fn finish_request(
        &self,
        seq: u64,
        request: &Request,
        response: BoxFuture<'static, Response>,
    ) {
        let response = match AssertUnwindSafe(response).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                error!(command = %request.command, "Error in request handler callback!");
                Response::error(StatusCode::GeneralError, "Request handler panicked")
            }
        };
        if request.is_oneway {
            return;
        }
        match self.send_message(&Message::response(seq, response)) {
            Ok(()) => {}
            Err(MeshbusError::NoConnection(_)) => {
                warn!(peer = %self.peer_name(), command = %request.command, "Lost connection before response delivered!");
            }
            Err(e) => {
                error!(peer = %self.peer_name(), command = %request.command, error = %e, "Failed to send response");
            }
        }
    }

    fn handle_response(&self, seq: u64, response: Response) {
        let mut state = self.state.lock();
        if let Some(request) = state.outstanding.remove(&seq) {
            drop(state);
            request.resolve(Ok(response));
            return;
        }
        match state.timed_out.iter().position(|timed_out| *timed_out == seq) {
            Some(index) => {
                state.timed_out.remove(index);
                debug!(seq, "Received a response for timed out request");
            }
            None => {
                warn!(seq, "Received response with no matching or timed out request");
            }
        }
    }

    fn handle_request_timeout(&self, seq: u64) {
        let mut state = self.state.lock();
        if let Some(request) = state.outstanding.remove(&seq) {
            state.remember_timed_out(seq);
            drop(state);
            request.resolve(Err(MeshbusError::Timeout("No response received!".to_string())));
        }
    }

    async fn handle_hello(self: &Arc<Self>, hello: Hello) {
        let completed = matches!(*self.hello.borrow(), HelloState::Received(_));
        if !completed {
            let hello_sent = self.state.lock().hello_sent;
            if !self.is_initiator && !hello_sent {
                if let Err(e) = self.send_hello() {
                    warn!(peer = %hello.name, error = %e, "Lost connection responding to Hello!");
                }
            }
        } else if let Some(callback) = &self.on_updated_hello {
            callback(Arc::clone(self), hello.clone()).await;
        }
        self.hello.send_replace(HelloState::Received(hello));
    }

    fn cancel_pending_hello(&self) {
        self.hello.send_if_modified(|state| {
            if matches!(state, HelloState::Pending) {
                *state = HelloState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    fn trigger_shutdown(self: &Arc<Self>, was_requested: bool) -> Shared<BoxFuture<'static, ()>> {
        let mut slot = self.shutdown_task.lock();
        if let Some(task) = slot.as_ref() {
            return task.clone();
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.do_shutdown(was_requested).await });
        let task = async move {
            if let Err(e) = handle.await {
                error!(error = %e, "RPC peer shutdown task failed");
            }
        }
        .boxed()
        .shared();
        *slot = Some(task.clone());
        task
    }

    async fn do_shutdown(self: Arc<Self>, was_requested: bool) {
        self.peer.shutdown().await;

        let triage = self.triage_task.lock().take();
        let server = self.server_task.lock().take();
        for task in [triage, server].into_iter().flatten() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(peer = %self.peer_name(), error = %e, "RPC peer task failed");
                }
            }
        }

        self.cancel_pending_hello();
        self.connection_lost.send_replace(Some(was_requested));

        let outstanding: Vec<_> = self
            .state
            .lock()
            .outstanding
            .drain()
            .map(|(_, request)| request)
            .collect();
        let peer_name = self.peer_name();
        for request in outstanding {
            request.resolve(Err(MeshbusError::NoConnection(format!(
                "Connection to {} lost before request completed!",
                peer_name
            ))));
        }

        if !was_requested {
            if let Some(callback) = &self.on_connection_lost {
                tokio::spawn(callback(Arc::clone(&self)));
            }
        }
    }

    #[cfg(test)]
    fn recently_timed_out(&self) -> Vec<u64> {
        self.state.lock().timed_out.iter().copied().collect()
    }
}

impl std::fmt::Debug for MultiplexedRpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedRpcPeer")
            .field("peer", &self.peer.id())
            .field("peer_name", &self.peer_name())
            .field("is_initiator", &self.is_initiator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::CapturedLogs;
    use crate::networking::ProcessLocalPeer;
    use bytes::Bytes;

    fn handler<F, Fut>(f: F) -> RequestHandler
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response> + Send + 'static,
    {
        Arc::new(move |request, _context| f(request).boxed())
    }

    fn echo() -> RequestHandler {
        handler(|request: Request| async move { Response::ok(request.args_serialized) })
    }

    /// Client and server sides over a process-local pair, both started.
    async fn connected(
        server_handler: RequestHandler,
        configure_server: impl FnOnce(MultiplexedRpcPeerBuilder) -> MultiplexedRpcPeerBuilder,
    ) -> (Arc<MultiplexedRpcPeer>, Arc<MultiplexedRpcPeer>) {
        let (a, b) = ProcessLocalPeer::pair("local://");
        let client = MultiplexedRpcPeer::builder(a as Arc<dyn Peer>, Hello::new("client"), echo())
            .initiator(true)
            .request_timeout(Duration::from_secs(1))
            .build();
        let server = configure_server(MultiplexedRpcPeer::builder(
            b as Arc<dyn Peer>,
            Hello::new("server"),
            server_handler,
        ))
        .build();
        server.start(true).unwrap();
        client.start(true).unwrap();
        assert_eq!(client.handshake().await.unwrap().name, "server");
        assert_eq!(server.handshake().await.unwrap().name, "client");
        (client, server)
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (client, _server) = connected(echo(), |b| b).await;
        let response = client
            .make_request(Request::new("echo", Bytes::from_static(b"hi")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status.status_code, StatusCode::NoError);
        assert_eq!(response.result_serialized, Bytes::from_static(b"hi"));
        assert_eq!(client.outstanding_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responses_matched_by_sequence_number() {
        // Later requests finish first.
        let slow_first = handler(|request: Request| async move {
            let delay = 100 - u64::from(request.args_serialized[0]);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Response::ok(request.args_serialized)
        });
        let (client, _server) = connected(slow_first, |b| b.synchronous_requests(false)).await;

        let pending: Vec<_> = (0u8..10)
            .map(|i| client.send_request(Request::new("echo", vec![i])).unwrap())
            .collect();
        for (i, pending) in pending.into_iter().enumerate() {
            let response = pending.wait().await.unwrap().unwrap();
            assert_eq!(response.result_serialized, Bytes::from(vec![i as u8]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_absorbed() {
        let (logs, _guard) = CapturedLogs::install();
        let slow = handler(|request: Request| async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Response::ok(request.args_serialized)
        });
        let (client, _server) = connected(slow, |b| b).await;

        let result = client.make_request(Request::new("slow", Bytes::new())).await;
        assert!(matches!(result, Err(MeshbusError::Timeout(_))));
        assert_eq!(client.outstanding_requests(), 0);
        let timed_out = client.recently_timed_out();
        assert_eq!(timed_out.len(), 1);

        // Let the handler finish and its response arrive.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(client.recently_timed_out().is_empty());
        assert_eq!(client.outstanding_requests(), 0);

        let contents = logs.contents();
        assert!(contents.contains("Received a response for timed out request"));
        assert!(!contents.contains("no matching or timed out request"));
    }

    #[tokio::test]
    async fn test_response_with_unknown_sequence_number_is_reported() {
        let (logs, _guard) = CapturedLogs::install();
        let (a, b) = ProcessLocalPeer::pair("local://");
        let client = MultiplexedRpcPeer::builder(a as Arc<dyn Peer>, Hello::new("client"), echo())
            .initiator(true)
            .build();
        client.start(true).unwrap();

        let stray = Message::response(42, Response::ok(Bytes::new()));
        b.enqueue_message(serialize_message(&stray, SerializationProtocol::Json).unwrap())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !logs.contents().contains("no matching or timed out request") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stray response was not reported");
        assert_eq!(client.outstanding_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_requests_run_one_at_a_time() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        let recording = handler(move |request: Request| {
            let events = Arc::clone(&recorder);
            async move {
                let tag = request.args_serialized[0];
                events.lock().push(("start", tag));
                if tag == 1 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                events.lock().push(("end", tag));
                Response::ok(Bytes::new())
            }
        });
        let (client, _server) = connected(recording, |b| b).await;

        let first = client.send_request(Request::new("r", vec![1u8])).unwrap();
        let second = client.send_request(Request::new("r", vec![2u8])).unwrap();
        first.wait().await.unwrap();
        second.wait().await.unwrap();
        assert_eq!(
            *events.lock(),
            vec![("start", 1), ("end", 1), ("start", 2), ("end", 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_asynchronous_requests_start_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        let recording: RequestHandler = Arc::new(move |request: Request, _context| {
            let tag = request.args_serialized[0];
            recorder.lock().push(("start", tag));
            let events = Arc::clone(&recorder);
            async move {
                if tag == 1 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                events.lock().push(("end", tag));
                Response::ok(Bytes::new())
            }
            .boxed()
        });
        let (client, _server) = connected(recording, |b| b.synchronous_requests(false)).await;

        let first = client.send_request(Request::new("r", vec![1u8])).unwrap();
        let second = client.send_request(Request::new("r", vec![2u8])).unwrap();
        second.wait().await.unwrap();
        first.wait().await.unwrap();
        assert_eq!(
            *events.lock(),
            vec![("start", 1), ("start", 2), ("end", 2), ("end", 1)]
        );
    }

    #[tokio::test]
    async fn test_requests_wait_for_server_start() {
        let (a, b) = ProcessLocalPeer::pair("local://");
        let client = MultiplexedRpcPeer::builder(a as Arc<dyn Peer>, Hello::new("client"), echo())
            .initiator(true)
            .build();
        let server =
            MultiplexedRpcPeer::builder(b as Arc<dyn Peer>, Hello::new("server"), echo()).build();
        server.start(false).unwrap();
        client.start(true).unwrap();
        server.handshake().await.unwrap();

        let pending = client.send_request(Request::new("echo", vec![9u8])).unwrap();
        tokio::task::yield_now().await;
        server.start_server();
        let response = pending.wait().await.unwrap().unwrap();
        assert_eq!(response.result_serialized, Bytes::from(vec![9u8]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_outstanding_requests() {
        let never = handler(|_request: Request| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Response::ok(Bytes::new())
        });
        let (client, _server) = connected(never, |b| b).await;

        let first = client.send_request(Request::new("wait", Bytes::new())).unwrap();
        let second = client.send_request(Request::new("wait", Bytes::new())).unwrap();
        assert_eq!(client.outstanding_requests(), 2);

        client.shutdown().await;
        assert_eq!(client.outstanding_requests(), 0);
        assert!(matches!(first.wait().await, Err(MeshbusError::NoConnection(_))));
        assert!(matches!(second.wait().await, Err(MeshbusError::NoConnection(_))));
        assert!(client.closed().await);

        // Repeated shutdown is a no-op.
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_close_reports_connection_lost() {
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let (a, b) = ProcessLocalPeer::pair("local://");
        let client = MultiplexedRpcPeer::builder(a as Arc<dyn Peer>, Hello::new("client"), echo())
            .initiator(true)
            .on_connection_lost(Arc::new(move |peer: Arc<MultiplexedRpcPeer>| {
                let lost_tx = lost_tx.clone();
                async move {
                    let _ = lost_tx.send(peer.peer_name());
                }
                .boxed()
            }))
            .build();
        let server =
            MultiplexedRpcPeer::builder(b as Arc<dyn Peer>, Hello::new("server"), echo()).build();
        server.start(true).unwrap();
        client.start(true).unwrap();
        client.handshake().await.unwrap();

        server.shutdown().await;
        assert_eq!(lost_rx.recv().await.unwrap(), "server");
        assert!(!client.closed().await);
        assert!(server.closed().await);
    }

    #[tokio::test]
    async fn test_oneway_resolves_on_send() {
        let (client, _server) = connected(echo(), |b| b).await;
        let response = client
            .make_request(Request::oneway("notify", Bytes::new()))
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(client.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_updated_hello_is_reported() {
        let (updated_tx, mut updated_rx) = mpsc::unbounded_channel();
        let on_updated: UpdatedHelloCallback =
            Arc::new(move |peer: Arc<MultiplexedRpcPeer>, hello: Hello| {
                let updated_tx = updated_tx.clone();
                async move {
                    let _ = updated_tx.send((peer.peer_hello().unwrap(), hello));
                }
                .boxed()
            });
        let (client, server) = connected(echo(), |b| b.on_updated_hello(on_updated)).await;

        client
            .update_hello(Hello::new("client").with_aliases(["kitchen"]))
            .unwrap();
        let (previous, updated) = updated_rx.recv().await.unwrap();
        assert!(previous.aliases.is_empty());
        assert_eq!(updated.aliases, vec!["kitchen".to_string()]);

        // The new identity is visible once the callback has run.
        tokio::task::yield_now().await;
        while server.peer_hello().unwrap().aliases.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_failure_surfaces_immediately() {
        let (a, b) = ProcessLocalPeer::pair("local://");
        let client =
            MultiplexedRpcPeer::builder(a as Arc<dyn Peer>, Hello::new("client"), echo()).build();
        drop(b);
        let result = client.send_request(Request::new("echo", Bytes::new()));
        assert!(matches!(result, Err(MeshbusError::NoConnection(_))));
        assert_eq!(client.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_handler_can_shut_down_its_own_peer() {
        let slot: Arc<std::sync::OnceLock<std::sync::Weak<MultiplexedRpcPeer>>> =
            Arc::new(std::sync::OnceLock::new());
        let handler_slot = Arc::clone(&slot);
        let closing = handler(move |_request: Request| {
            let slot = Arc::clone(&handler_slot);
            async move {
                if let Some(peer) = slot.get().and_then(std::sync::Weak::upgrade) {
                    peer.shutdown().await;
                }
                Response::ok(Bytes::new())
            }
        });
        let (client, server) = connected(closing, |b| b.synchronous_requests(true)).await;
        slot.set(Arc::downgrade(&server)).unwrap();

        let result = client.make_request(Request::new("close", Bytes::new())).await;
        assert!(matches!(result, Err(MeshbusError::NoConnection(_))));
        let requested = tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .expect("shutdown from a handler did not complete");
        assert!(requested);
    }

    #[tokio::test]
    async fn test_handler_panic_answers_general_error() {
        let panicking = handler(|request: Request| async move {
            if request.command == "boom" {
                panic!("handler bug");
            }
            Response::ok(Bytes::new())
        });
        let (client, _server) = connected(panicking, |b| b).await;
        let response = client
            .make_request(Request::new("boom", Bytes::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status.status_code, StatusCode::GeneralError);
    }
}
