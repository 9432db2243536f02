//! Caller-side view of one peer, or of a set of peers for multicast.

use crate::error::{MeshbusError, Result};
use crate::protocol::{
    encode_payload, parse_payload, ApiVersionTranslator, MultiplexedRpcPeer, Request, Response,
    SerializationProtocol,
};
use bytes::Bytes;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

/// Arguments of an outbound request.
#[derive(Debug, Clone)]
pub enum RequestArgs {
    /// Sent as-is; never translated.
    Raw(Bytes),
    /// JSON arguments, translated to the peer's negotiated API version.
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub command: String,
    pub args: RequestArgs,
    pub is_oneway: bool,
}

impl OutgoingRequest {
    pub fn new(command: impl Into<String>, args: RequestArgs) -> Self {
        Self {
            command: command.into(),
            args,
            is_oneway: false,
        }
    }

    pub fn oneway(command: impl Into<String>, args: RequestArgs) -> Self {
        Self {
            is_oneway: true,
            ..Self::new(command, args)
        }
    }
}

enum Target {
    Peer {
        rpc_peer: Arc<MultiplexedRpcPeer>,
        peer_name: String,
        unqualified_peer_name: String,
    },
    Multicast {
        rpc_peers: Vec<Arc<MultiplexedRpcPeer>>,
        log_errors: bool,
    },
}

struct ClientInner {
    target: Target,
    translator: Option<Arc<dyn ApiVersionTranslator>>,
}

/// Issues requests to the peer (or peers) it was created for.
///
/// Cheap to clone. Status codes in responses surface as the matching
/// [`MeshbusError`] variant.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(crate) fn for_peer(
        rpc_peer: Arc<MultiplexedRpcPeer>,
        peer_name: String,
        unqualified_peer_name: String,
        translator: Option<Arc<dyn ApiVersionTranslator>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                target: Target::Peer {
                    rpc_peer,
                    peer_name,
                    unqualified_peer_name,
                },
                translator,
            }),
        }
    }

    pub(crate) fn multicast(
        rpc_peers: Vec<Arc<MultiplexedRpcPeer>>,
        log_errors: bool,
        translator: Option<Arc<dyn ApiVersionTranslator>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                target: Target::Multicast {
                    rpc_peers,
                    log_errors,
                },
                translator,
            }),
        }
    }

    /// Qualified name of the peer. `None` for multicast clients.
    pub fn peer_name(&self) -> Option<&str> {
        match &self.inner.target {
            Target::Peer { peer_name, .. } => Some(peer_name),
            Target::Multicast { .. } => None,
        }
    }

    /// Name the peer announced, without its domain.
    pub fn unqualified_peer_name(&self) -> Option<&str> {
        match &self.inner.target {
            Target::Peer {
                unqualified_peer_name,
                ..
            } => Some(unqualified_peer_name),
            Target::Multicast { .. } => None,
        }
    }

    pub fn rpc_peer(&self) -> Option<&Arc<MultiplexedRpcPeer>> {
        match &self.inner.target {
            Target::Peer { rpc_peer, .. } => Some(rpc_peer),
            Target::Multicast { .. } => None,
        }
    }

    /// Number of peers a request fans out to.
    pub fn target_count(&self) -> usize {
        match &self.inner.target {
            Target::Peer { .. } => 1,
            Target::Multicast { rpc_peers, .. } => rpc_peers.len(),
        }
    }

    pub fn serialization_protocol(&self) -> SerializationProtocol {
        match &self.inner.target {
            Target::Peer { rpc_peer, .. } => rpc_peer.serialization_protocol(),
            Target::Multicast { .. } => SerializationProtocol::None,
        }
    }

    /// Multicast clients report the local translator's current version.
    pub fn negotiated_api_version(&self) -> Option<u32> {
        match &self.inner.target {
            Target::Peer { rpc_peer, .. } => rpc_peer.negotiated_api_version(),
            Target::Multicast { .. } => self
                .inner
                .translator
                .as_ref()
                .map(|translator| translator.current_version()),
        }
    }

    /// Whether both clients talk to the same connection.
    pub fn same_peer(&self, other: &Client) -> bool {
        match (self.rpc_peer(), other.rpc_peer()) {
            (Some(a), Some(b)) => a.id() == b.id(),
            _ => Arc::ptr_eq(&self.inner, &other.inner),
        }
    }

    /// Call `command` with JSON arguments and decode its JSON result.
    pub async fn call<A, R>(&self, command: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let response = self
            .make_request_to_peer(OutgoingRequest::new(command, RequestArgs::Json(args)))
            .await?
            .ok_or_else(|| MeshbusError::Protocol(format!("No response to {}", command)))?;
        let raw = response.into_result()?;
        let mut result = parse_payload(&raw)
            .map_err(|e| MeshbusError::Protocol(format!("Malformed result for {}: {}", command, e)))?;

        if let Target::Peer { rpc_peer, .. } = &self.inner.target {
            if let (Some(translator), Some(version)) =
                (&self.inner.translator, rpc_peer.negotiated_api_version())
            {
                result = translator.translate_response_from_version(command, result, version)?;
            }
        }
        serde_json::from_value(result)
            .map_err(|e| MeshbusError::Protocol(format!("Unexpected result for {}: {}", command, e)))
    }

    /// Send `command` without waiting for a result.
    pub async fn notify<A>(&self, command: &str, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        let args = serde_json::to_value(args)?;
        let response = self
            .make_request_to_peer(OutgoingRequest::oneway(command, RequestArgs::Json(args)))
            .await?;
        if response.is_some() {
            warn!(command, "Received a response to a oneway request");
        }
        Ok(())
    }

    /// Call `command` with opaque argument bytes and return the result bytes.
    pub async fn call_raw(&self, command: &str, args: Bytes) -> Result<Bytes> {
        self.make_request_to_peer(OutgoingRequest::new(command, RequestArgs::Raw(args)))
            .await?
            .ok_or_else(|| MeshbusError::Protocol(format!("No response to {}", command)))?
            .into_result()
    }

    /// Send `request` and return the peer's response untouched. Oneway
    /// requests resolve to `None`.
    ///
    /// A multicast client resolves to the first successful response. When
    /// every peer fails it returns the first peer's error; a client built to
    /// log errors also logs each failure. An empty peer set fails with
    /// [`MeshbusError::NoConnection`].
    pub async fn make_request_to_peer(&self, request: OutgoingRequest) -> Result<Option<Response>> {
        match &self.inner.target {
            Target::Peer { rpc_peer, .. } => {
                let args = self.encode_args(&request, rpc_peer.negotiated_api_version())?;
                rpc_peer.make_request(build_request(&request, args)).await
            }
            Target::Multicast {
                rpc_peers,
                log_errors,
            } => self.multicast_request(rpc_peers, *log_errors, request).await,
        }
    }

    fn encode_args(&self, request: &OutgoingRequest, version: Option<u32>) -> Result<Bytes> {
        match &request.args {
            RequestArgs::Raw(bytes) => Ok(bytes.clone()),
            RequestArgs::Json(value) => match (&self.inner.translator, version) {
                (Some(translator), Some(version)) => {
                    let translated =
                        translator.translate_args_to_version(&request.command, value.clone(), version)?;
                    encode_payload(&translated)
                }
                _ => encode_payload(value),
            },
        }
    }

    async fn multicast_request(
        &self,
        rpc_peers: &[Arc<MultiplexedRpcPeer>],
        log_errors: bool,
        request: OutgoingRequest,
    ) -> Result<Option<Response>> {
        let mut encoded: HashMap<(SerializationProtocol, Option<u32>), Bytes> = HashMap::new();
        let mut pending = Vec::with_capacity(rpc_peers.len());

        // A failure to encode or send for one peer must not stop delivery to
        // the others, so it becomes that peer's outcome.
        for rpc_peer in rpc_peers {
            let key = (
                rpc_peer.serialization_protocol(),
                rpc_peer.negotiated_api_version(),
            );
            let args = match encoded.get(&key) {
                Some(args) => Ok(args.clone()),
                None => {
                    let args = self.encode_args(&request, key.1);
                    if let Ok(args) = &args {
                        encoded.insert(key, args.clone());
                    }
                    args
                }
            };
            let sent = args.and_then(|args| rpc_peer.send_request(build_request(&request, args)));
            pending.push(async move { sent?.wait().await });
        }

        let mut first_success = None;
        let mut first_error = None;
        for (rpc_peer, outcome) in rpc_peers.iter().zip(join_all(pending).await) {
            let outcome = outcome.and_then(|response| {
                response
                    .map(|response| response.into_result().map(Response::ok))
                    .transpose()
            });
            match outcome {
                Ok(response) => {
                    if first_success.is_none() {
                        first_success = Some(response);
                    }
                }
                Err(e) => {
                    if log_errors {
                        let name = rpc_peer.peer_name();
                        if matches!(e, MeshbusError::Timeout(_) | MeshbusError::NoConnection(_)) {
                            warn!(peer = %name, command = %request.command, error = %e, "Multicast request failed");
                        } else {
                            error!(peer = %name, command = %request.command, error = %e, "Multicast request failed");
                        }
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match (first_success, first_error) {
            (Some(response), _) => Ok(response),
            (None, Some(e)) => Err(e),
            (None, None) => Err(MeshbusError::NoConnection("No results available!".to_string())),
        }
    }
}

fn build_request(request: &OutgoingRequest, args: Bytes) -> Request {
    if request.is_oneway {
        Request::oneway(request.command.clone(), args)
    } else {
        Request::new(request.command.clone(), args)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner.target {
            Target::Peer { peer_name, .. } => f.debug_struct("Client").field("peer_name", peer_name).finish(),
            Target::Multicast { rpc_peers, log_errors } => f
                .debug_struct("Client")
                .field("multicast", &rpc_peers.len())
                .field("log_errors", log_errors)
                .finish(),
        }
    }
}
