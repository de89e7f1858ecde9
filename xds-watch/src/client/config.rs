//! Configuration for the xDS watch client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::message::Node;
use crate::metrics::MetricsReporter;
use crate::resource::ResourceTypeRegistry;

/// Default time to wait for a resource after it is first requested.
pub const DEFAULT_RESOURCE_INITIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Logical identity of a management server.
///
/// Two identifiers are the same server when their values are equal, even if
/// they are referenced by different authorities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentifier {
    /// URI of the server, e.g. `https://xds.example.com:443`.
    pub server_uri: String,
    /// Opaque channel credential selector, interpreted by the transport.
    pub channel_credentials: Option<String>,
}

impl ServerIdentifier {
    /// Identify a server by URI.
    pub fn new(server_uri: impl Into<String>) -> Self {
        Self {
            server_uri: server_uri.into(),
            channel_credentials: None,
        }
    }

    /// Attach a channel credential selector.
    pub fn with_channel_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.channel_credentials = Some(credentials.into());
        self
    }
}

/// A server plus the protocol options used when talking to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerConfig {
    /// Which server to talk to.
    pub server_identifier: ServerIdentifier,
    /// Keep resources that vanish from state-of-the-world responses instead
    /// of reporting them as deleted.
    pub ignore_resource_deletion: bool,
}

impl ServerConfig {
    /// Server config with default options.
    pub fn new(server_identifier: ServerIdentifier) -> Self {
        Self {
            server_identifier,
            ignore_resource_deletion: false,
        }
    }

    /// Set `ignore_resource_deletion`.
    pub fn with_ignore_resource_deletion(mut self, ignore: bool) -> Self {
        self.ignore_resource_deletion = ignore;
        self
    }

    /// The server URI.
    pub fn uri(&self) -> &str {
        &self.server_identifier.server_uri
    }
}

/// A named authority: a priority-ordered fallback chain of servers.
///
/// An empty chain means "use the top-level servers".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityConfig {
    /// Servers in priority order; index 0 is tried first.
    pub xds_servers: Vec<ServerConfig>,
}

impl AuthorityConfig {
    /// Authority with the given fallback chain.
    pub fn new(xds_servers: Vec<ServerConfig>) -> Self {
        Self { xds_servers }
    }
}

/// Configuration for the xDS watch client.
///
/// Consumed once by [`XdsClientBuilder::build`](crate::XdsClientBuilder::build)
/// and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ClientConfig<TB> {
    /// Node identification sent to every server.
    pub node: Node,

    /// Resource types the client can decode. Must be present.
    pub resource_types: Option<ResourceTypeRegistry>,

    /// Builds one transport per active server. Must be present.
    pub transport_builder: Option<TB>,

    /// Servers of the default authority, used for non-`xdstp` names.
    pub servers: Vec<ServerConfig>,

    /// Named authorities, used for `xdstp://<authority>/...` names.
    pub authorities: HashMap<String, AuthorityConfig>,

    /// Backoff between passes over an authority's server chain.
    pub retry_policy: RetryPolicy,

    /// How long a requested resource may go without a response before
    /// watchers are told it is unavailable. `None` disables the timer.
    pub resource_initial_timeout: Option<Duration>,

    /// Optional metrics sink.
    pub metrics_reporter: Option<Arc<dyn MetricsReporter>>,
}

impl<TB> ClientConfig<TB> {
    /// Create a new configuration with the given node identification.
    ///
    /// Resource types, transport builder and at least one server or
    /// authority still have to be supplied.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_watch::{ClientConfig, Node, ResourceTypeRegistry, ServerConfig, ServerIdentifier};
    /// use xds_watch::TonicTransportBuilder;
    ///
    /// let node = Node::new("grpc", "1.0").with_id("my-node");
    /// let config = ClientConfig::new(node)
    ///     .with_resource_types(ResourceTypeRegistry::new())
    ///     .with_transport_builder(TonicTransportBuilder::new())
    ///     .with_server(ServerConfig::new(ServerIdentifier::new("http://xds.example.com:18000")));
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(node: Node) -> Self {
        Self {
            node,
            resource_types: None,
            transport_builder: None,
            servers: Vec::new(),
            authorities: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            resource_initial_timeout: Some(DEFAULT_RESOURCE_INITIAL_TIMEOUT),
            metrics_reporter: None,
        }
    }

    /// Set the resource type registry.
    pub fn with_resource_types(mut self, registry: ResourceTypeRegistry) -> Self {
        self.resource_types = Some(registry);
        self
    }

    /// Set the transport builder.
    pub fn with_transport_builder(mut self, builder: TB) -> Self {
        self.transport_builder = Some(builder);
        self
    }

    /// Append a server to the default authority's chain.
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }

    /// Add or replace a named authority.
    pub fn with_authority(mut self, name: impl Into<String>, authority: AuthorityConfig) -> Self {
        self.authorities.insert(name.into(), authority);
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the resource initial timeout. `None` disables it.
    pub fn with_resource_initial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.resource_initial_timeout = timeout;
        self
    }

    /// Set the metrics reporter.
    pub fn with_metrics_reporter(mut self, reporter: Arc<dyn MetricsReporter>) -> Self {
        self.metrics_reporter = Some(reporter);
        self
    }

    /// Check the config, reporting the first problem found.
    ///
    /// Checks, in order: the resource type registry is present, the
    /// transport builder is present, and at least one server or authority
    /// is configured.
    pub fn validate(&self) -> Result<()> {
        if self.resource_types.is_none() {
            return Err(Error::Config("resource types map is nil".into()));
        }
        if self.transport_builder.is_none() {
            return Err(Error::Config("transport builder is nil".into()));
        }
        if self.servers.is_empty() && self.authorities.is_empty() {
            return Err(Error::Config("no servers or authorities specified".into()));
        }
        Ok(())
    }
}
