//! Command routing for inbound requests.
//!
//! A [`Service`] maps command names to handlers. Typed routes take and return
//! serde values encoded as JSON in the request's `args_serialized` and the
//! response's `result_serialized`; raw routes see the bytes unchanged.

use super::context::RequestContext;
use super::message::{Request, Response, StatusCode};
use super::rpc_peer::RequestHandler;
use super::status::error_response;
use crate::config::ProtocolConfig;
use crate::error::{MeshbusError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Translates payloads between the local API version and the version
/// negotiated with a peer. Every hook defaults to the identity.
pub trait ApiVersionTranslator: Send + Sync {
    fn current_version(&self) -> u32;

    /// Local arguments to `version`, before sending.
    fn translate_args_to_version(&self, _command: &str, args: Value, _version: u32) -> Result<Value> {
        Ok(args)
    }

    /// Arguments received from a peer speaking `version`.
    fn translate_args_from_version(
        &self,
        _command: &str,
        args: Value,
        _version: u32,
    ) -> Result<Value> {
        Ok(args)
    }

    fn translate_response_to_version(
        &self,
        _command: &str,
        response: Value,
        _version: u32,
    ) -> Result<Value> {
        Ok(response)
    }

    fn translate_response_from_version(
        &self,
        _command: &str,
        response: Value,
        _version: u32,
    ) -> Result<Value> {
        Ok(response)
    }
}

type TypedRoute =
    Arc<dyn Fn(Value, RequestContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
type RawRoute =
    Arc<dyn Fn(Bytes, RequestContext) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

#[derive(Clone)]
enum Route {
    Typed(TypedRoute),
    Raw(RawRoute),
}

/// Decode a JSON payload. An empty payload is `null`.
pub(crate) fn parse_payload(raw: &[u8]) -> std::result::Result<Value, serde_json::Error> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(raw)
}

pub(crate) fn encode_payload(value: &Value) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub struct ServiceBuilder {
    routes: HashMap<String, Route>,
    translator: Option<Arc<dyn ApiVersionTranslator>>,
    handler_timeout: Duration,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            translator: None,
            handler_timeout: ProtocolConfig::SOCKET_TIMEOUT,
        }
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler. Arguments that fail to deserialize answer
    /// `BAD_ARGS_ERROR` without invoking it.
    pub fn route<A, R, F, Fut>(mut self, command: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let route: TypedRoute = Arc::new(move |args: Value, context: RequestContext| {
            let handler = Arc::clone(&handler);
            async move {
                let args: A = serde_json::from_value(args)
                    .map_err(|e| MeshbusError::BadArgs(format!("Invalid arguments: {}", e)))?;
                let result = handler(args, context).await?;
                Ok(serde_json::to_value(result)?)
            }
            .boxed()
        });
        self.routes.insert(command.into(), Route::Typed(route));
        self
    }

    /// Register a handler that receives and returns undecoded payloads.
    pub fn raw_route<F, Fut>(mut self, command: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let route: RawRoute = Arc::new(move |args, context| handler(args, context).boxed());
        self.routes.insert(command.into(), Route::Raw(route));
        self
    }

    pub fn translator(mut self, translator: Arc<dyn ApiVersionTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn build(self) -> Service {
        Service {
            routes: self.routes,
            translator: self.translator,
            handler_timeout: self.handler_timeout,
        }
    }
}

pub struct Service {
    routes: HashMap<String, Route>,
    translator: Option<Arc<dyn ApiVersionTranslator>>,
    handler_timeout: Duration,
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&str> {
        let mut commands: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        commands.sort_unstable();
        commands
    }

    pub fn translator(&self) -> Option<&Arc<dyn ApiVersionTranslator>> {
        self.translator.as_ref()
    }

    /// Run the handler for `request` and build its response. Never fails:
    /// errors, timeouts and panics all become error statuses.
    pub async fn handle_request(&self, request: Request, context: RequestContext) -> Response {
        let command = request.command.clone();
        let Some(route) = self.routes.get(&command) else {
            return error_response(
                &command,
                &MeshbusError::BadArgs(format!("Unknown command: {}", command)),
            );
        };

        let handled = AssertUnwindSafe(self.dispatch(route, request, context)).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, handled).await {
            Ok(Ok(Ok(result))) => Response::ok(result),
            Ok(Ok(Err(e))) => error_response(&command, &e),
            Ok(Err(_)) => {
                error!(command = %command, "Request handler panicked");
                Response::error(StatusCode::GeneralError, "Internal error in request handler")
            }
            Err(_) => error_response(
                &command,
                &MeshbusError::Timeout(format!("Handler for {} timed out", command)),
            ),
        }
    }

    async fn dispatch(&self, route: &Route, request: Request, context: RequestContext) -> Result<Bytes> {
        match route {
            Route::Raw(handler) => handler(request.args_serialized, context).await,
            Route::Typed(handler) => {
                let translation = self.translator.as_ref().zip(context.negotiated_api_version);
                let mut args = parse_payload(&request.args_serialized)
                    .map_err(|e| MeshbusError::BadArgs(format!("Malformed arguments: {}", e)))?;
                if let Some((translator, version)) = translation {
                    args = translator.translate_args_from_version(&request.command, args, version)?;
                }
                let mut result = handler(args, context).await?;
                if let Some((translator, version)) = translation {
                    result =
                        translator.translate_response_to_version(&request.command, result, version)?;
                }
                encode_payload(&result)
            }
        }
    }

    /// Adapt this service into a [`RequestHandler`] for an RPC peer.
    pub fn into_handler(self) -> RequestHandler {
        let service = Arc::new(self);
        Arc::new(move |request, context| {
            let service = Arc::clone(&service);
            async move { service.handle_request(request, context).await }.boxed()
        })
    }
}

impl From<Service> for RequestHandler {
    fn from(service: Service) -> Self {
        service.into_handler()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("commands", &self.commands())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}
