//! Resource-watch engine for [xDS](https://www.envoyproxy.io/docs/envoy/latest/api-docs/xds_protocol)
//! control planes.
//!
//! The crate owns the protocol side of an xDS client:
//! - one aggregated discovery stream per distinct server chain, opened lazily
//! - subscription bookkeeping per resource, with duplicate watches served
//!   from cache
//! - version/nonce tracking and ACK/NACK, with per-resource partial
//!   acceptance
//! - fallback across a priority-ordered server chain, with backoff between
//!   passes
//! - `xdstp://` name routing to named authorities
//!
//! It does NOT interpret resources. Decoding and validation are supplied by
//! the caller through [`Resource`], and transports, codecs and runtimes are
//! pluggable through [`TransportBuilder`], [`XdsCodec`] and [`Runtime`].
//!
//! # Example
//!
//! ```ignore
//! use xds_watch::{ClientConfig, Node, ResourceEvent, ResourceTypeRegistry, ServerConfig,
//!     ServerIdentifier, TonicTransportBuilder, XdsClient};
//!
//! let node = Node::new("grpc", "1.0").with_id("my-node");
//! let config = ClientConfig::new(node)
//!     .with_resource_types(ResourceTypeRegistry::new().with::<Listener>())
//!     .with_transport_builder(TonicTransportBuilder::new())
//!     .with_server(ServerConfig::new(ServerIdentifier::new("http://xds.example.com:18000")));
//! let client = XdsClient::new(config)?;
//!
//! let mut watcher = client.watch::<Listener>("my-listener");
//! while let Some(event) = watcher.next().await {
//!     match event {
//!         ResourceEvent::Changed(listener) => {
//!             // Cascade to the route configuration it names.
//!             let _routes = client.watch::<RouteConfiguration>(listener.route_name());
//!         }
//!         ResourceEvent::ResourceError(error) => eprintln!("listener rejected: {error}"),
//!         ResourceEvent::DoesNotExist => eprintln!("listener removed"),
//!         ResourceEvent::AmbientError(error) => eprintln!("control plane unavailable: {error}"),
//!     }
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the use of the `tonic` transport. This enables the `rt-tokio` feature. Enabled by default.
//! - `rt-tokio`: Enables the use of the `tokio` runtime.
//! - `codegen-prost`: Enables the use of the `prost` codec built on `envoy-types`. Enabled by default.
//! - `test-util`: Exports [`testutil`], an in-memory management server for tests.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod metrics;
pub mod resource;
pub mod runtime;
#[cfg(all(
    any(test, feature = "test-util"),
    feature = "codegen-prost",
    feature = "rt-tokio"
))]
pub mod testutil;
pub mod transport;

pub use client::config::{
    AuthorityConfig, ClientConfig, DEFAULT_RESOURCE_INITIAL_TIMEOUT, ServerConfig,
    ServerIdentifier,
};
pub use client::retry::{Backoff, RetryPolicy};
pub use client::state::{WatchStateSnapshot, WatchStatus};
pub use client::watch::{ResourceEvent, ResourceWatcher, WatcherId};
pub use client::{XdsClient, XdsClientBuilder};
pub use codec::XdsCodec;
pub use error::{Error, Result};
pub use message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Locality, Node, ResourceAny};
pub use metrics::{Metric, MetricsReporter};
pub use resource::{DecodeResult, DecodedResource, Resource, ResourceType, ResourceTypeRegistry};
pub use runtime::Runtime;
pub use transport::{ADS_METHOD, Transport, TransportBuilder, TransportStream};

// Prost codec
#[cfg(feature = "codegen-prost")]
pub use codec::prost::ProstCodec;

// Tokio runtime
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::{TonicTransport, TonicTransportBuilder};
