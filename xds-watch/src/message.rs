//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and sit between the watch engine and the
//! codec layer. The codec converts them to and from the wire format.

use std::collections::BTreeMap;

use bytes::Bytes;

/// A discovery request to send to the management server.
///
/// Borrows from the authority state it is built from, so building one per
/// ACK/NACK does not clone subscription sets.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest<'a> {
    /// Version of the most recently ACKed response for this type, or empty.
    pub version_info: &'a str,
    /// The node making the request.
    pub node: &'a Node,
    /// Resource names subscribed to for this type.
    pub resource_names: &'a [String],
    /// Type URL of the resources being requested.
    pub type_url: &'a str,
    /// Nonce of the response being ACKed or NACKed, or empty for the first
    /// request on a stream.
    pub response_nonce: &'a str,
    /// Set when this request NACKs a response.
    pub error_detail: Option<ErrorDetail>,
}

/// A discovery response (envelope) from the management server.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// Serialized resources carried by this envelope.
    pub resources: Vec<ResourceAny>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Nonce to echo on the next request for this type.
    pub nonce: String,
}

/// A resource wrapped as `google.protobuf.Any`.
#[derive(Debug, Clone)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// Identity of the client, advertised to every management server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// An opaque node identifier. May be empty.
    pub id: String,
    /// The cluster the node belongs to.
    pub cluster: String,
    /// Where the node is running.
    pub locality: Option<Locality>,
    /// Opaque metadata forwarded to the server.
    pub metadata: BTreeMap<String, String>,
    /// Free-form string identifying the client type (e.g. "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
    /// Client features advertised to the server.
    pub client_features: Vec<String>,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
            ..Default::default()
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Advertise a client feature.
    pub fn with_client_feature(mut self, feature: impl Into<String>) -> Self {
        self.client_features.push(feature.into());
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details attached to a NACK.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}

impl ErrorDetail {
    /// gRPC `INVALID_ARGUMENT`, the code used for every NACK.
    pub const INVALID_ARGUMENT: i32 = 3;

    pub(crate) fn invalid_argument(message: String) -> Self {
        Self {
            code: Self::INVALID_ARGUMENT,
            message,
        }
    }
}
