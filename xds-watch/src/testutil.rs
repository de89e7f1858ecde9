//! In-memory transport and resource types for exercising the client.
//!
//! [`FakeTransportBuilder`] hands every stream the client opens to a
//! [`FakeServer`], which plays the management server: tests read the
//! discovery requests the client sent and push responses back.
//!
//! Test resources are serialized as `name=value` UTF-8 strings:
//! - bytes without `=` cannot be parsed, so no name is recovered;
//! - a value starting with `invalid` parses but fails validation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use tokio::sync::mpsc;

use crate::client::config::ServerConfig;
use crate::error::{Error, Result};
use crate::metrics::{Metric, MetricsReporter};
use crate::resource::{DecodeResult, Resource, ResourceTypeRegistry};
use crate::transport::{Transport, TransportBuilder, TransportStream};

/// How long the fake server waits for the client before giving up.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Shared {
    failing: Mutex<HashSet<String>>,
    builds: Mutex<Vec<String>>,
    closed_transports: AtomicUsize,
    connections: mpsc::UnboundedSender<FakeConnection>,
}

/// [`TransportBuilder`] connected to a [`FakeServer`].
#[derive(Debug, Clone)]
pub struct FakeTransportBuilder {
    shared: Arc<Shared>,
}

impl FakeTransportBuilder {
    /// Create a builder and the server end that observes it.
    pub fn new() -> (Self, FakeServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            failing: Mutex::new(HashSet::new()),
            builds: Mutex::new(Vec::new()),
            closed_transports: AtomicUsize::new(0),
            connections: tx,
        });
        let server = FakeServer {
            shared: Arc::clone(&shared),
            connections: rx,
        };
        (Self { shared }, server)
    }
}

impl TransportBuilder for FakeTransportBuilder {
    type Transport = FakeTransport;

    async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
        let uri = server.uri().to_string();
        self.shared
            .builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(uri.clone());

        let failing = self
            .shared
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&uri);
        if failing {
            return Err(Error::Connection(format!("{uri} is unreachable")));
        }

        Ok(FakeTransport {
            server_uri: uri,
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A transport whose streams are delivered to the [`FakeServer`].
#[derive(Debug)]
pub struct FakeTransport {
    server_uri: String,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl Transport for FakeTransport {
    type Stream = FakeStream;

    async fn new_stream(&self, method: &str) -> Result<Self::Stream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let connection = FakeConnection {
            server_uri: self.server_uri.clone(),
            method: method.to_string(),
            requests: requests_rx,
            responses: responses_tx,
        };
        self.shared
            .connections
            .send(connection)
            .map_err(|_| Error::Connection("fake server dropped".into()))?;

        Ok(FakeStream {
            requests: requests_tx,
            responses: responses_rx,
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.closed_transports.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Client end of a fake ADS stream.
#[derive(Debug)]
pub struct FakeStream {
    requests: mpsc::UnboundedSender<Bytes>,
    responses: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl TransportStream for FakeStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.responses.recv().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}

/// The management-server side of every stream a [`FakeTransportBuilder`]
/// opens.
#[derive(Debug)]
pub struct FakeServer {
    shared: Arc<Shared>,
    connections: mpsc::UnboundedReceiver<FakeConnection>,
}

impl FakeServer {
    /// The next stream the client opened, or `None` if none is opened within
    /// [`DEFAULT_WAIT`].
    pub async fn next_connection(&mut self) -> Option<FakeConnection> {
        self.try_next_connection(DEFAULT_WAIT).await
    }

    /// The next stream opened within `wait`.
    pub async fn try_next_connection(&mut self, wait: Duration) -> Option<FakeConnection> {
        tokio::time::timeout(wait, self.connections.recv())
            .await
            .ok()
            .flatten()
    }

    /// Make transports to `server_uri` fail to build.
    pub fn set_failing(&self, server_uri: &str, failing: bool) {
        let mut set = self
            .shared
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if failing {
            set.insert(server_uri.to_string());
        } else {
            set.remove(server_uri);
        }
    }

    /// URIs of every transport build attempt, in order.
    pub fn builds(&self) -> Vec<String> {
        self.shared
            .builds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of transports the client has closed.
    pub fn closed_transports(&self) -> usize {
        self.shared.closed_transports.load(Ordering::Acquire)
    }
}

/// Server end of one fake ADS stream.
///
/// Dropping it ends the stream as if the server hung up.
#[derive(Debug)]
pub struct FakeConnection {
    /// Server the stream was opened to.
    pub server_uri: String,
    /// RPC method the stream was opened on.
    pub method: String,
    requests: mpsc::UnboundedReceiver<Bytes>,
    responses: mpsc::UnboundedSender<Result<Bytes>>,
}

impl FakeConnection {
    /// The next request sent on this stream, or `None` if the stream ended or
    /// nothing arrives within [`DEFAULT_WAIT`].
    pub async fn next_request(&mut self) -> Option<ReceivedRequest> {
        self.try_next_request(DEFAULT_WAIT).await
    }

    /// The next request sent within `wait`.
    pub async fn try_next_request(&mut self, wait: Duration) -> Option<ReceivedRequest> {
        let bytes = tokio::time::timeout(wait, self.requests.recv())
            .await
            .ok()??;
        ReceivedRequest::decode(bytes)
    }

    /// Send a discovery response carrying `resources` of `type_url`.
    pub fn send_response(&self, type_url: &str, version: &str, nonce: &str, resources: Vec<Bytes>) {
        let response = discovery::DiscoveryResponse {
            version_info: version.to_string(),
            resources: resources
                .into_iter()
                .map(|value| Any {
                    type_url: type_url.to_string(),
                    value: value.to_vec(),
                })
                .collect(),
            type_url: type_url.to_string(),
            nonce: nonce.to_string(),
            ..Default::default()
        };
        self.send_raw(response.encode_to_vec().into());
    }

    /// Send arbitrary bytes as a response envelope.
    pub fn send_raw(&self, bytes: Bytes) {
        let _ = self.responses.send(Ok(bytes));
    }

    /// Fail the stream with `error`.
    pub fn fail(&self, error: Error) {
        let _ = self.responses.send(Err(error));
    }
}

/// A decoded discovery request as seen by the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRequest {
    /// Requested type URL.
    pub type_url: String,
    /// Subscribed names, in the order sent.
    pub resource_names: Vec<String>,
    /// Last ACKed version.
    pub version_info: String,
    /// Nonce being ACKed or NACKed.
    pub response_nonce: String,
    /// NACK message, if this request is a NACK.
    pub error_detail: Option<String>,
    /// Node id, if a node was sent.
    pub node_id: Option<String>,
}

impl ReceivedRequest {
    fn decode(bytes: Bytes) -> Option<Self> {
        let request = discovery::DiscoveryRequest::decode(bytes).ok()?;
        Some(Self {
            type_url: request.type_url,
            resource_names: request.resource_names,
            version_info: request.version_info,
            response_nonce: request.response_nonce,
            error_detail: request.error_detail.map(|status| status.message),
            node_id: request.node.map(|node| node.id),
        })
    }

    /// Whether this request rejects a response.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }
}

/// Serialize a test resource.
pub fn resource_bytes(name: &str, value: &str) -> Bytes {
    Bytes::from(format!("{name}={value}"))
}

fn decode_with<T>(bytes: &[u8], make: impl FnOnce(String, String) -> T) -> DecodeResult<T> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return DecodeResult::TopLevelError(Error::Decode(e.to_string())),
    };
    let Some((name, value)) = text.split_once('=') else {
        return DecodeResult::TopLevelError(Error::Decode(format!(
            "malformed test resource {text:?}"
        )));
    };
    if value.starts_with("invalid") {
        return DecodeResult::ResourceError {
            name: name.to_string(),
            error: Error::ResourceValidation(format!("{name}: rejected value {value:?}")),
        };
    }
    DecodeResult::Success {
        name: name.to_string(),
        resource: make(name.to_string(), value.to_string()),
    }
}

/// A resource type whose state-of-the-world responses enumerate every
/// resource, like Listener or Cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResource {
    /// Resource name.
    pub name: String,
    /// Opaque payload.
    pub value: String,
}

impl Resource for TestResource {
    const TYPE_URL: &'static str = "type.googleapis.com/xds.test.v1.TestResource";
    const ALL_RESOURCES_REQUIRED_IN_SOTW: bool = true;

    fn decode(bytes: Bytes) -> DecodeResult<Self> {
        decode_with(&bytes, |name, value| Self { name, value })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A resource type whose responses may omit resources, like
/// RouteConfiguration or ClusterLoadAssignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialTestResource {
    /// Resource name.
    pub name: String,
    /// Opaque payload.
    pub value: String,
}

impl Resource for PartialTestResource {
    const TYPE_URL: &'static str = "type.googleapis.com/xds.test.v1.PartialTestResource";

    fn decode(bytes: Bytes) -> DecodeResult<Self> {
        decode_with(&bytes, |name, value| Self { name, value })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Registry with both test resource types.
pub fn registry() -> ResourceTypeRegistry {
    ResourceTypeRegistry::new()
        .with::<TestResource>()
        .with::<PartialTestResource>()
}

/// [`MetricsReporter`] that keeps every observation.
#[derive(Debug, Default)]
pub struct RecordingMetricsReporter {
    metrics: Mutex<Vec<Metric>>,
}

impl RecordingMetricsReporter {
    /// Everything reported so far.
    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsReporter for RecordingMetricsReporter {
    fn report_metric(&self, metric: Metric) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_decoding() {
        match TestResource::decode(resource_bytes("a", "1")) {
            DecodeResult::Success { name, resource } => {
                assert_eq!(name, "a");
                assert_eq!(resource.value, "1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            TestResource::decode(resource_bytes("a", "invalid-1")),
            DecodeResult::ResourceError { name, .. } if name == "a"
        ));
        assert!(matches!(
            TestResource::decode(Bytes::from_static(b"garbage")),
            DecodeResult::TopLevelError(_)
        ));
    }
}
