//! Provides abstraction for transport layers.

use crate::client::config::ServerConfig;
use crate::error::Result;
use bytes::Bytes;
use std::future::Future;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// The ADS method every session opens its stream on.
pub const ADS_METHOD: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// Factory for creating transports to management servers.
///
/// Called at most once per server each time an authority activates a
/// session on it. The returned transport must not be connected yet.
pub trait TransportBuilder: Send + Sync + 'static {
    /// The transport type produced by this builder.
    type Transport: Transport;

    /// Create a transport for the given server.
    fn build(&self, server: &ServerConfig) -> impl Future<Output = Result<Self::Transport>> + Send;
}

/// A connection to a single management server that can open streams.
///
/// This abstraction allows for different transport implementations:
/// - Tonic-based gRPC transport
/// - Mock transport for testing
/// - Other custom transports
pub trait Transport: Send + Sync + 'static {
    /// The stream type produced by this transport.
    type Stream: TransportStream;

    /// Open a new bidirectional stream for `method`.
    ///
    /// Dropping the returned future cancels stream creation.
    fn new_stream(&self, method: &str) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Close the transport. Every later `new_stream` fails fast.
    fn close(&self);
}

/// A bidirectional byte stream for ADS communication.
///
/// The bytes are serialized DiscoveryRequest/DiscoveryResponse messages;
/// (de)serialization is handled by the session through the codec.
pub trait TransportStream: Send + 'static {
    /// Send serialized DiscoveryRequest bytes to the server.
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Receive serialized DiscoveryResponse bytes from the server.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a response.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    ///
    /// Must be cancel safe: dropping the future before it completes must not
    /// lose a message or break the stream.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}
