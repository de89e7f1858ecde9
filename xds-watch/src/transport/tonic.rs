//! `tonic` based transport implementation.
//!
//! This transport uses tonic's low-level `Grpc` client with a `BytesCodec`
//! to send and receive raw bytes, allowing the watch engine to handle
//! serialization independently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::config::ServerConfig;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportBuilder, TransportStream};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Status, Streaming};

/// A codec that passes bytes through without serialization.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// A transport to one management server backed by a tonic [`Channel`].
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
    closed: Arc<AtomicBool>,
}

impl TonicTransport {
    /// Create a transport from an existing tonic [`Channel`].
    ///
    /// Use this when you need custom channel configuration (e.g., TLS, timeouts).
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            channel,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Builds a lazily-connecting [`TonicTransport`] per server.
///
/// The channel is created with `connect_lazy`, so building never performs
/// network I/O; the connection is established when the first stream opens.
#[derive(Debug, Clone, Default)]
pub struct TonicTransportBuilder {}

impl TonicTransportBuilder {
    /// Create a new transport builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportBuilder for TonicTransportBuilder {
    type Transport = TonicTransport;

    async fn build(&self, server: &ServerConfig) -> Result<Self::Transport> {
        let channel = Channel::from_shared(server.uri().to_string())
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect_lazy();

        Ok(TonicTransport::from_channel(channel))
    }
}

type PendingCall = Pin<Box<dyn Future<Output = Result<Streaming<Bytes>>> + Send>>;

impl Transport for TonicTransport {
    type Stream = TonicAdsStream;

    async fn new_stream(&self, method: &str) -> Result<Self::Stream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportClosed);
        }

        let path = PathAndQuery::try_from(method.to_string())
            .map_err(|e| Error::Connection(e.to_string()))?;

        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

        // Some servers don't send response headers until they see the first
        // request, so the call is only driven once the session asks to
        // receive, after its initial requests are queued.
        let call: PendingCall = Box::pin(async move {
            let response = grpc
                .streaming(
                    tonic::Request::new(UnboundedReceiverStream::new(rx)),
                    path,
                    BytesCodec,
                )
                .await
                .map_err(Error::Stream)?;
            Ok(response.into_inner())
        });

        Ok(TonicAdsStream {
            sender: tx,
            response: ResponseState::Pending(call),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

enum ResponseState {
    Pending(PendingCall),
    Ready(Streaming<Bytes>),
    Failed,
}

/// A bidirectional ADS stream backed by tonic.
pub struct TonicAdsStream {
    sender: mpsc::UnboundedSender<Bytes>,
    response: ResponseState,
}

impl std::fmt::Debug for TonicAdsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.response {
            ResponseState::Pending(_) => "pending",
            ResponseState::Ready(_) => "ready",
            ResponseState::Failed => "failed",
        };
        f.debug_struct("TonicAdsStream")
            .field("response", &state)
            .finish_non_exhaustive()
    }
}

impl TransportStream for TonicAdsStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender.send(request).map_err(|_| Error::StreamClosed)
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        if let ResponseState::Pending(call) = &mut self.response {
            match call.await {
                Ok(streaming) => self.response = ResponseState::Ready(streaming),
                Err(e) => {
                    self.response = ResponseState::Failed;
                    return Err(e);
                }
            }
        }

        match &mut self.response {
            ResponseState::Ready(streaming) => streaming.message().await.map_err(Error::Stream),
            _ => Err(Error::StreamClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::config::ServerIdentifier;
    use crate::transport::ADS_METHOD;
    use envoy_types::pb::envoy::service::discovery::v3::{
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
    };
    use prost::Message;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_stream::Stream;
    use tokio_stream::StreamExt as _;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::{Request, Response, Status};

    /// ADS server that answers each request with an empty envelope whose
    /// version is the number of names requested and whose nonce counts
    /// the requests seen on the stream.
    struct CountingAdsServer;

    #[tonic::async_trait]
    impl AggregatedDiscoveryService for CountingAdsServer {
        type StreamAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;

        async fn stream_aggregated_resources(
            &self,
            request: Request<tonic::Streaming<DiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
            let mut inbound = request.into_inner();

            let outbound = async_stream::try_stream! {
                let mut seen = 0;
                while let Some(req) = inbound.next().await {
                    let req = req?;
                    seen += 1;
                    yield DiscoveryResponse {
                        version_info: req.resource_names.len().to_string(),
                        type_url: req.type_url,
                        nonce: format!("nonce-{seen}"),
                        ..Default::default()
                    };
                }
            };

            Ok(Response::new(Box::pin(outbound)))
        }

        type DeltaAggregatedResourcesStream =
            Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

        async fn delta_aggregated_resources(
            &self,
            _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
        ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
            Err(Status::unimplemented("delta xDS is not served"))
        }
    }

    async fn start_mock_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(AggregatedDiscoveryServiceServer::new(CountingAdsServer))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        addr
    }

    fn request(type_url: &str, names: &[&str]) -> Bytes {
        DiscoveryRequest {
            type_url: type_url.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
        .encode_to_vec()
        .into()
    }

    #[tokio::test]
    async fn test_requests_queued_before_recv_are_answered_in_order() {
        let addr = start_mock_server().await;
        let server = ServerConfig::new(ServerIdentifier::new(format!("http://{addr}")));

        let transport = TonicTransportBuilder::new().build(&server).await.unwrap();
        let mut stream = transport.new_stream(ADS_METHOD).await.unwrap();

        let listeners = "type.googleapis.com/envoy.config.listener.v3.Listener";
        let clusters = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
        stream.send(request(listeners, &["l1"])).await.unwrap();
        stream.send(request(clusters, &["c1", "c2"])).await.unwrap();

        let first = DiscoveryResponse::decode(stream.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.type_url, listeners);
        assert_eq!(first.version_info, "1");
        assert_eq!(first.nonce, "nonce-1");

        let second = DiscoveryResponse::decode(stream.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.type_url, clusters);
        assert_eq!(second.version_info, "2");
        assert_eq!(second.nonce, "nonce-2");
    }

    #[tokio::test]
    async fn test_closed_transport_fails_new_stream() {
        let server = ServerConfig::new(ServerIdentifier::new("http://127.0.0.1:1"));
        let transport = TonicTransportBuilder::new().build(&server).await.unwrap();

        transport.close();
        let err = transport.new_stream(ADS_METHOD).await.unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }
}
