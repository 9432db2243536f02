//! Builder-style configuration shared by both processor flavours.

use super::client::Client;
use crate::config::ProtocolConfig;
use crate::connection::{BackoffConfig, ConnectionManagerConfig};
use crate::error::Result;
use crate::networking::{AuthenticationPolicy, MessagingProtocol, Transport};
use crate::protocol::ApiVersionTranslator;
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Invoked once per registered client. An error from the first invocation on a
/// [`super::SinglePeerProcessor`] fails its `start()`.
pub type NewClientCallback = Arc<dyn Fn(Client) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Invoked with every qualified name (primary or alias) that stopped
/// resolving to a client.
pub type RemovedClientCallback =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Invoked after every reconnect of a [`super::SinglePeerProcessor`].
pub type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Identity and behaviour of a processor.
///
/// # Example
///
/// ```rust,ignore
/// let config = ProcessorConfig::new("hub")
///     .with_domain("home")
///     .with_aliases(["*"])
///     .with_request_timeout(Duration::from_secs(2));
/// let processor = MultiPeerProcessor::new(["tcp://127.0.0.1:0"], config, service)?;
/// ```
#[derive(Clone)]
pub struct ProcessorConfig {
    pub name: String,
    pub domain: Option<String>,
    pub aliases: BTreeSet<String>,
    /// Handle inbound requests one at a time in arrival order.
    pub synchronous_requests: bool,
    /// Deadline for outbound requests.
    pub request_timeout: Duration,
    /// Deadline for the Hello exchange on a new connection.
    pub hello_timeout: Duration,
    pub connection: ConnectionManagerConfig,
    pub api_translator: Option<Arc<dyn ApiVersionTranslator>>,
    pub new_client_callback: Option<NewClientCallback>,
    pub removed_client_callback: Option<RemovedClientCallback>,
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: None,
            aliases: BTreeSet::new(),
            synchronous_requests: true,
            request_timeout: ProtocolConfig::SOCKET_TIMEOUT,
            hello_timeout: ProtocolConfig::HELLO_TIMEOUT,
            connection: ConnectionManagerConfig::default(),
            api_translator: None,
            new_client_callback: None,
            removed_client_callback: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into()).filter(|d: &String| !d.is_empty());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_synchronous_requests(mut self, synchronous: bool) -> Self {
        self.synchronous_requests = synchronous;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Parameters this side advertises to the peers it connects to.
    pub fn with_connection_params(mut self, params: HashMap<String, String>) -> Self {
        self.connection.transport_options = self.connection.transport_options.with_params(params);
        self
    }

    /// Socket timeout handed to every transport.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.connection.transport_options = self.connection.transport_options.with_timeout(timeout);
        self
    }

    pub fn with_authentication_policy(mut self, policy: Arc<dyn AuthenticationPolicy>) -> Self {
        self.connection = self.connection.with_authentication_policy(policy);
        self
    }

    pub fn with_supported_api_versions(mut self, versions: Vec<u32>) -> Self {
        self.connection.transport_options = self
            .connection
            .transport_options
            .with_supported_api_versions(versions);
        self
    }

    pub fn with_cert_file_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.connection.transport_options.cert_file_directory = Some(directory.into());
        self
    }

    pub fn with_max_concurrent_peer_starts(mut self, max: usize) -> Self {
        self.connection = self.connection.with_max_concurrent_peer_starts(max);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.connection = self.connection.with_backoff(backoff);
        self
    }

    /// Serve and open addresses of `protocol` through `transport`.
    pub fn with_transport(mut self, protocol: MessagingProtocol, transport: Arc<dyn Transport>) -> Self {
        self.connection = self.connection.with_transport(protocol, transport);
        self
    }

    pub fn with_api_translator(mut self, translator: Arc<dyn ApiVersionTranslator>) -> Self {
        self.api_translator = Some(translator);
        self
    }

    pub fn on_new_client(mut self, callback: NewClientCallback) -> Self {
        self.new_client_callback = Some(callback);
        self
    }

    pub fn on_removed_client(mut self, callback: RemovedClientCallback) -> Self {
        self.removed_client_callback = Some(callback);
        self
    }
}

impl std::fmt::Debug for ProcessorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorConfig")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("aliases", &self.aliases)
            .field("synchronous_requests", &self.synchronous_requests)
            .field("request_timeout", &self.request_timeout)
            .field("connection", &self.connection)
            .field("has_translator", &self.api_translator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::new("hub");
        assert_eq!(config.name, "hub");
        assert!(config.domain.is_none());
        assert!(config.synchronous_requests);
        assert_eq!(config.request_timeout, ProtocolConfig::SOCKET_TIMEOUT);
    }

    #[test]
    fn test_builder_chain() {
        let config = ProcessorConfig::new("hub")
            .with_domain("home")
            .with_aliases(["*", "router"])
            .with_synchronous_requests(false)
            .with_supported_api_versions(vec![1, 2])
            .with_max_concurrent_peer_starts(0);
        assert_eq!(config.domain.as_deref(), Some("home"));
        assert_eq!(config.aliases.iter().collect::<Vec<_>>(), ["*", "router"]);
        assert!(!config.synchronous_requests);
        assert_eq!(config.connection.transport_options.supported_api_versions, Some(vec![1, 2]));
        assert_eq!(config.connection.max_concurrent_peer_starts, 1);

        assert!(ProcessorConfig::new("hub").with_domain("").domain.is_none());
    }
}
