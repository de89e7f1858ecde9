//! One ADS stream to one management server.
//!
//! A session is a background task that builds a transport, opens a single
//! stream, drains the authority's outbound queue onto it and decodes every
//! inbound envelope back to the authority. It never retries: the first
//! failure is reported to the authority and the task exits.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::authority::AuthorityCommand;
use crate::client::config::ServerConfig;
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::DiscoveryResponse;
use crate::runtime::Runtime;
use crate::transport::{ADS_METHOD, Transport, TransportBuilder, TransportStream};

/// Identifies a session within its authority, so events from a session that
/// was already replaced can be told apart.
pub(crate) type SessionId = u64;

/// What a session reports to its authority.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A decoded envelope.
    Response {
        session: SessionId,
        response: DiscoveryResponse,
    },
    /// The session ended. It will not send anything else.
    Failed {
        session: SessionId,
        error: Error,
        /// Whether at least one envelope was received before the failure.
        received_response: bool,
    },
}

/// Authority-side handle to a running session.
///
/// Dropping the handle stops the session and closes its transport.
#[derive(Debug)]
pub(crate) struct StreamSession {
    id: SessionId,
    server: ServerConfig,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl StreamSession {
    /// Spawn a session for `server`. `initial_requests` are sent before
    /// anything queued later through [`send`](Self::send).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start<TB, C, R>(
        id: SessionId,
        server: ServerConfig,
        transport_builder: Arc<TB>,
        codec: Arc<C>,
        runtime: &R,
        initial_requests: Vec<Bytes>,
        events: mpsc::UnboundedSender<AuthorityCommand>,
        parent: &CancellationToken,
    ) -> Self
    where
        TB: TransportBuilder,
        C: XdsCodec,
        R: Runtime,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        for request in initial_requests {
            // The receiver is alive: it is moved into the task below.
            let _ = outbound.send(request);
        }

        let cancel = parent.child_token();
        let worker = SessionWorker {
            id,
            server: server.clone(),
            codec,
            outbound: outbound_rx,
            events,
            received_response: false,
        };
        let token = cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(session = id, "session cancelled");
                }
                _ = worker.run(transport_builder) => {}
            }
        });

        Self {
            id,
            server,
            outbound,
            cancel,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// Queue a serialized request. Never blocks; the session task performs
    /// the actual send.
    pub(crate) fn send(&self, request: Bytes) {
        if self.outbound.send(request).is_err() {
            // The task already exited and reported its failure.
            trace!(session = self.id, "dropping request for finished session");
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Closes the transport however the session ends, including cancellation.
struct CloseOnDrop<T: Transport>(T);

impl<T: Transport> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

struct SessionWorker<C> {
    id: SessionId,
    server: ServerConfig,
    codec: Arc<C>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<AuthorityCommand>,
    received_response: bool,
}

impl<C: XdsCodec> SessionWorker<C> {
    async fn run<TB: TransportBuilder>(mut self, transport_builder: Arc<TB>) {
        let error = match self.connect_and_serve(&*transport_builder).await {
            Ok(()) => return,
            Err(error) => error,
        };

        debug!(
            session = self.id,
            server = self.server.uri(),
            %error,
            received_response = self.received_response,
            "session failed"
        );
        let _ = self.events.send(AuthorityCommand::Session(SessionEvent::Failed {
            session: self.id,
            error,
            received_response: self.received_response,
        }));
    }

    /// Returns `Ok(())` only when the authority dropped the session.
    async fn connect_and_serve<TB: TransportBuilder>(&mut self, transport_builder: &TB) -> Result<()> {
        let transport = CloseOnDrop(transport_builder.build(&self.server).await?);
        let mut stream = transport.0.new_stream(ADS_METHOD).await?;
        debug!(session = self.id, server = self.server.uri(), "stream opened");

        loop {
            tokio::select! {
                request = self.outbound.recv() => match request {
                    Some(bytes) => stream.send(bytes).await?,
                    None => return Ok(()),
                },
                response = stream.recv() => match response {
                    Ok(Some(bytes)) => self.deliver(bytes),
                    Ok(None) => return Err(Error::StreamClosed),
                    Err(error) => return Err(error),
                },
            }
        }
    }

    fn deliver(&mut self, bytes: Bytes) {
        let response = match self.codec.decode_response(bytes) {
            Ok(response) => response,
            Err(error) => {
                // Without a type URL and nonce the envelope can be neither
                // ACKed nor NACKed.
                warn!(
                    session = self.id,
                    server = self.server.uri(),
                    %error,
                    "dropping undecodable discovery response"
                );
                return;
            }
        };

        trace!(
            session = self.id,
            type_url = %response.type_url,
            version = %response.version_info,
            nonce = %response.nonce,
            resources = response.resources.len(),
            "received discovery response"
        );
        self.received_response = true;
        let _ = self.events.send(AuthorityCommand::Session(SessionEvent::Response {
            session: self.id,
            response,
        }));
    }
}
