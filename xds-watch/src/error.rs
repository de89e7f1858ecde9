//! Error types for the xDS watch client.

use thiserror::Error;

/// Error type for the xDS watch client.
///
/// The type is `Clone` so a single failure can be delivered to every watcher
/// of the affected resource.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The client configuration is invalid. Construction fails.
    #[error("invalid xDS client config: {0}")]
    Config(String),

    /// A policy or option failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Failed to establish a connection to a management server.
    #[error("connection error: {0}")]
    Connection(String),

    /// The underlying gRPC stream failed.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Stream(tonic::Status),

    /// The stream was closed by the peer.
    #[error("stream closed")]
    StreamClosed,

    /// The transport was closed and can no longer open streams.
    #[error("transport closed")]
    TransportClosed,

    /// A discovery message could not be (de)serialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// A resource was rejected by its type-specific validation.
    #[error("resource validation failed: {0}")]
    ResourceValidation(String),

    /// A state-of-the-world response confirmed the resource is absent.
    #[error("resource does not exist")]
    ResourceDoesNotExist,

    /// No response arrived for the resource within the initial timeout.
    #[error("timed out waiting for resource from the management server")]
    ResourceTimeout,

    /// The type URL is not present in the resource type registry.
    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    /// The resource name refers to an authority missing from the config.
    #[error("authority {0:?} is not present in the client config")]
    UnknownAuthority(String),

    /// Every server of the authority failed and retries are exhausted.
    #[error("no management server reachable for authority {0:?}")]
    AuthorityUnavailable(String),

    /// The client was closed.
    #[error("xDS client is closed")]
    ClientClosed,
}

/// Result type alias for xDS watch client operations.
pub type Result<T> = std::result::Result<T, Error>;
