//! Codec for encoding/decoding xDS messages.
//!
//! The codec layer converts between crate-owned message types
//! ([`DiscoveryRequest`], [`DiscoveryResponse`]) and serialized bytes, so the
//! watch engine never depends on a particular protobuf implementation.

use crate::error::Result;
use crate::message::{DiscoveryRequest, DiscoveryResponse};
use bytes::Bytes;

#[cfg(feature = "codegen-prost")]
pub mod prost;

/// Encodes outbound discovery requests and decodes inbound envelopes.
pub trait XdsCodec: Send + Sync + 'static {
    /// Encode a [`DiscoveryRequest`] to bytes.
    fn encode_request(&self, request: &DiscoveryRequest<'_>) -> Result<Bytes>;

    /// Decode bytes into a [`DiscoveryResponse`].
    ///
    /// Failure here is envelope-level: the session cannot recover the type
    /// URL or nonce, so the message is dropped.
    fn decode_response(&self, bytes: Bytes) -> Result<DiscoveryResponse>;
}
