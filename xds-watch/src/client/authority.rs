//! Authority worker: subscriptions, ACK/NACK and the server fallback chain.
//!
//! Each authority runs as one background task that exclusively owns every
//! [`ResourceWatchState`] routed to it. Watch/unwatch calls, session events
//! and resource timers all arrive as [`AuthorityCommand`]s on one channel,
//! so they are applied strictly one at a time.
//!
//! Fallback is an explicit state machine: `index` into the server chain,
//! the current [`StreamSession`], and an optional retry timer.
//! - A session that fails before receiving anything moves on to the next
//!   server immediately.
//! - Once the whole chain has failed, the authority sleeps for the next
//!   backoff and starts over at the highest-priority server.
//! - A session that fails after receiving responses reconnects to the
//!   highest-priority server right away with a fresh backoff.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::config::ServerConfig;
use crate::client::retry::{Backoff, RetryPolicy};
use crate::client::session::{SessionEvent, SessionId, StreamSession};
use crate::client::state::{ResourceWatchState, WatchStateSnapshot, WatchStatus};
use crate::client::watch::{Notification, NotificationTx, WatcherId};
use crate::codec::XdsCodec;
use crate::error::Error;
use crate::message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Node};
use crate::metrics::{Metric, MetricsReporter};
use crate::resource::{DecodeResult, DecodedResource, ResourceType, ResourceTypeRegistry};
use crate::runtime::Runtime;
use crate::transport::TransportBuilder;

/// Commands processed by an authority worker.
#[derive(Debug)]
pub(crate) enum AuthorityCommand {
    /// Add a watcher for a resource.
    Watch {
        type_url: String,
        name: String,
        watcher_id: WatcherId,
        tx: NotificationTx,
    },
    /// Remove a watcher.
    Unwatch {
        type_url: String,
        name: String,
        watcher_id: WatcherId,
    },
    /// The initial-response timer of a resource fired.
    ResourceTimerExpired {
        type_url: String,
        name: String,
        generation: u64,
    },
    /// Report the watch state of a resource.
    WatchState {
        type_url: String,
        name: String,
        reply: oneshot::Sender<Option<WatchStateSnapshot>>,
    },
    /// Something happened on a session.
    Session(SessionEvent),
}

/// Everything an authority needs that is shared client-wide.
#[derive(Debug)]
pub(crate) struct AuthorityContext<TB, C, R> {
    pub(crate) node: Arc<Node>,
    pub(crate) registry: Arc<ResourceTypeRegistry>,
    pub(crate) transport_builder: Arc<TB>,
    pub(crate) codec: Arc<C>,
    pub(crate) runtime: R,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) resource_initial_timeout: Option<Duration>,
    pub(crate) metrics: Option<Arc<dyn MetricsReporter>>,
    pub(crate) shutdown: CancellationToken,
}

impl<TB, C, R: Clone> Clone for AuthorityContext<TB, C, R> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            registry: Arc::clone(&self.registry),
            transport_builder: Arc::clone(&self.transport_builder),
            codec: Arc::clone(&self.codec),
            runtime: self.runtime.clone(),
            retry_policy: self.retry_policy.clone(),
            resource_initial_timeout: self.resource_initial_timeout,
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Handle used by the watch manager to reach an authority worker.
#[derive(Debug, Clone)]
pub(crate) struct AuthorityHandle {
    pub(crate) command_tx: mpsc::UnboundedSender<AuthorityCommand>,
}

/// Subscription and protocol state for one resource type.
#[derive(Debug)]
struct TypeState {
    resource_type: ResourceType,
    /// Version of the last ACKed envelope.
    version_info: String,
    /// Nonce of the last envelope on the current stream.
    nonce: String,
    resources: BTreeMap<String, ResourceWatchState>,
}

impl TypeState {
    fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            version_info: String::new(),
            nonce: String::new(),
            resources: BTreeMap::new(),
        }
    }

    fn resource_names(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }
}

type RetryTimer = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct Authority<TB, C, R> {
    name: String,
    servers: Vec<ServerConfig>,
    ctx: AuthorityContext<TB, C, R>,
    command_tx: mpsc::UnboundedSender<AuthorityCommand>,
    command_rx: mpsc::UnboundedReceiver<AuthorityCommand>,
    types: HashMap<String, TypeState>,
    /// Index of the server the current or next session targets.
    index: usize,
    backoff: Backoff,
    session: Option<StreamSession>,
    next_session_id: SessionId,
    next_timer_generation: u64,
    retry_timer: Option<RetryTimer>,
    /// Retries exhausted; nothing reconnects until a new subscription.
    failed: bool,
}

impl<TB, C, R> Authority<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec,
    R: Runtime,
{
    /// Spawn a worker for `servers` and return its handle.
    ///
    /// No connection is made until the first subscription arrives.
    pub(crate) fn spawn(
        name: String,
        servers: Vec<ServerConfig>,
        ctx: AuthorityContext<TB, C, R>,
    ) -> AuthorityHandle {
        let authority = Self::new(name, servers, ctx);
        let handle = AuthorityHandle {
            command_tx: authority.command_tx.clone(),
        };
        let runtime = authority.ctx.runtime.clone();
        runtime.spawn(authority.run());
        handle
    }

    fn new(name: String, servers: Vec<ServerConfig>, ctx: AuthorityContext<TB, C, R>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            name,
            servers,
            backoff: Backoff::new(ctx.retry_policy.clone()),
            ctx,
            command_tx,
            command_rx,
            types: HashMap::new(),
            index: 0,
            session: None,
            next_session_id: 0,
            next_timer_generation: 0,
            retry_timer: None,
            failed: false,
        }
    }

    async fn run(mut self) {
        let shutdown = self.ctx.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = wait_for(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    self.connect();
                }
            }
        }

        debug!(authority = %self.name, "authority shutting down");
        // Dropping the session cancels its task; dropping the states
        // releases every watcher channel.
        self.session = None;
        self.types.clear();
    }

    fn handle_command(&mut self, command: AuthorityCommand) {
        match command {
            AuthorityCommand::Watch {
                type_url,
                name,
                watcher_id,
                tx,
            } => self.subscribe(type_url, name, watcher_id, tx),
            AuthorityCommand::Unwatch {
                type_url,
                name,
                watcher_id,
            } => self.unsubscribe(&type_url, &name, watcher_id),
            AuthorityCommand::ResourceTimerExpired {
                type_url,
                name,
                generation,
            } => self.handle_resource_timeout(&type_url, &name, generation),
            AuthorityCommand::WatchState {
                type_url,
                name,
                reply,
            } => {
                let snapshot = self
                    .types
                    .get(&type_url)
                    .and_then(|ts| ts.resources.get(&name))
                    .map(ResourceWatchState::snapshot);
                let _ = reply.send(snapshot);
            }
            AuthorityCommand::Session(SessionEvent::Response { session, response }) => {
                if self.is_current(session) {
                    self.handle_response(response);
                }
            }
            AuthorityCommand::Session(SessionEvent::Failed {
                session,
                error,
                received_response,
            }) => {
                if self.is_current(session) {
                    self.handle_session_failure(error, received_response);
                }
            }
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id() == session)
    }

    /// Add a watcher. A new (type, name) pair is requested from the server;
    /// an existing one is served from its cached state without any traffic.
    fn subscribe(&mut self, type_url: String, name: String, watcher_id: WatcherId, tx: NotificationTx) {
        let Some(resource_type) = self.ctx.registry.get(&type_url) else {
            let _ = tx.send(Notification::AmbientError(Error::UnknownResourceType(type_url)));
            return;
        };

        let type_state = self
            .types
            .entry(type_url.clone())
            .or_insert_with(|| TypeState::new(resource_type.clone()));

        if let Some(state) = type_state.resources.get_mut(&name) {
            trace!(authority = %self.name, %type_url, resource = %name, "adding watcher to existing subscription");
            state.add_watcher(watcher_id, tx);
            return;
        }

        debug!(authority = %self.name, %type_url, resource = %name, "subscribing");
        let mut state = ResourceWatchState::new();
        state.add_watcher(watcher_id, tx);
        type_state.resources.insert(name.clone(), state);
        // The timer runs from subscription, whether or not a server is reachable.
        self.start_resource_timer(&type_url, &name);

        if self.failed {
            self.failed = false;
            self.backoff.reset();
            self.index = 0;
        }
        self.subscriptions_changed(&type_url);
    }

    /// Remove a watcher; the resource is dropped from the subscription once
    /// its last watcher is gone.
    fn unsubscribe(&mut self, type_url: &str, name: &str, watcher_id: WatcherId) {
        let Some(type_state) = self.types.get_mut(type_url) else {
            return;
        };
        let Some(state) = type_state.resources.get_mut(name) else {
            return;
        };
        if !state.remove_watcher(watcher_id) {
            return;
        }

        debug!(authority = %self.name, %type_url, resource = %name, "unsubscribing");
        type_state.resources.remove(name);
        self.subscriptions_changed(type_url);

        if self.types.get(type_url).is_some_and(|ts| ts.resources.is_empty()) {
            self.types.remove(type_url);
        }
    }

    fn subscriptions_changed(&mut self, type_url: &str) {
        if self.session.is_some() {
            self.send_request(type_url, None);
        } else if self.retry_timer.is_none() && !self.failed {
            self.connect();
        }
    }

    /// Open a session on the current server, replaying every subscription.
    fn connect(&mut self) {
        if self.types.values().all(|ts| ts.resources.is_empty()) {
            trace!(authority = %self.name, "no subscriptions; staying idle");
            return;
        }
        let Some(server) = self.servers.get(self.index).cloned() else {
            return;
        };

        for type_state in self.types.values_mut() {
            // Nonces are scoped to a stream.
            type_state.nonce.clear();
        }

        let initial_requests: Vec<Bytes> = self
            .types
            .iter()
            .filter(|(_, ts)| !ts.resources.is_empty())
            .filter_map(|(type_url, ts)| self.encode_request(type_url, ts, None))
            .collect();

        self.next_session_id += 1;
        debug!(
            authority = %self.name,
            server = server.uri(),
            session = self.next_session_id,
            types = initial_requests.len(),
            "starting session"
        );
        self.session = Some(StreamSession::start(
            self.next_session_id,
            server,
            Arc::clone(&self.ctx.transport_builder),
            Arc::clone(&self.ctx.codec),
            &self.ctx.runtime,
            initial_requests,
            self.command_tx.clone(),
            &self.ctx.shutdown,
        ));
    }

    fn handle_session_failure(&mut self, error: Error, received_response: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let server = session.server().uri().to_string();
        drop(session);

        if received_response {
            debug!(authority = %self.name, %server, %error, "stream broke; reconnecting");
            self.backoff.reset();
            self.index = 0;
            self.connect();
            return;
        }

        warn!(authority = %self.name, %server, %error, "management server unreachable");
        if let Some(metrics) = &self.ctx.metrics {
            metrics.report_metric(Metric::ServerFailure { server_uri: server });
        }

        self.index += 1;
        if self.index < self.servers.len() {
            debug!(authority = %self.name, index = self.index, "falling back to next server");
            self.connect();
            return;
        }

        self.index = 0;
        match self.backoff.next_backoff() {
            Some(delay) => {
                debug!(authority = %self.name, ?delay, "server chain exhausted; backing off");
                let runtime = self.ctx.runtime.clone();
                self.retry_timer = Some(Box::pin(async move { runtime.sleep(delay).await }));
            }
            None => {
                warn!(authority = %self.name, "retries exhausted; authority unavailable");
                self.failed = true;
                let error = Error::AuthorityUnavailable(self.name.clone());
                for type_state in self.types.values() {
                    for state in type_state.resources.values() {
                        state.on_ambient_error(error.clone());
                    }
                }
            }
        }
    }

    /// Apply one envelope, then ACK or NACK it.
    ///
    /// Valid resources are applied even when others in the same envelope are
    /// rejected; a rejected resource keeps its previous value.
    fn handle_response(&mut self, response: DiscoveryResponse) {
        let ignore_deletion = self
            .session
            .as_ref()
            .is_some_and(|s| s.server().ignore_resource_deletion);
        let server_uri = self
            .session
            .as_ref()
            .map(|s| s.server().uri().to_string())
            .unwrap_or_default();

        let Some(type_state) = self.types.get_mut(&response.type_url) else {
            trace!(authority = %self.name, type_url = %response.type_url, "ignoring response for unsubscribed type");
            return;
        };
        type_state.nonce = response.nonce.clone();

        let mut valid: Vec<(String, DecodedResource, Bytes)> = Vec::new();
        let mut resource_errors: Vec<(String, Error)> = Vec::new();
        let mut top_level_errors: Vec<Error> = Vec::new();

        for any in &response.resources {
            match type_state.resource_type.decode(any.value.clone()) {
                DecodeResult::Success { name, resource } => {
                    valid.push((name, resource, any.value.clone()))
                }
                DecodeResult::ResourceError { name, error } => resource_errors.push((name, error)),
                DecodeResult::TopLevelError(error) => top_level_errors.push(error),
            }
        }

        let seen: HashSet<&str> = valid
            .iter()
            .map(|(name, ..)| name.as_str())
            .chain(resource_errors.iter().map(|(name, _)| name.as_str()))
            .collect();

        // Absence is only conclusive for fully enumerated types, and only if
        // every entry's name could be recovered.
        let deleted: Vec<String> = if type_state.resource_type.all_resources_required_in_sotw()
            && top_level_errors.is_empty()
        {
            type_state
                .resources
                .iter()
                .filter(|(name, state)| {
                    !seen.contains(name.as_str())
                        && (state.has_value() || state.status() == WatchStatus::Timeout)
                })
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            Vec::new()
        };

        for (name, resource, raw) in &valid {
            if let Some(state) = type_state.resources.get_mut(name) {
                if state.on_update(resource.clone(), raw.clone(), &response.version_info) {
                    debug!(authority = %self.name, type_url = %response.type_url, resource = %name, version = %response.version_info, "resource updated");
                }
            }
        }
        for (name, error) in &resource_errors {
            if let Some(state) = type_state.resources.get_mut(name) {
                state.on_error(error.clone());
            }
        }
        for name in &deleted {
            let Some(state) = type_state.resources.get_mut(name) else {
                continue;
            };
            if ignore_deletion {
                warn!(authority = %self.name, type_url = %response.type_url, resource = %name, "ignoring resource deletion");
            } else if state.status() != WatchStatus::DoesNotExist {
                debug!(authority = %self.name, type_url = %response.type_url, resource = %name, "resource does not exist");
                state.on_does_not_exist();
            }
        }

        let invalid = resource_errors.len() + top_level_errors.len();
        if let Some(metrics) = &self.ctx.metrics {
            if !valid.is_empty() {
                metrics.report_metric(Metric::ResourceUpdatesValid {
                    server_uri: server_uri.clone(),
                    resource_type: response.type_url.clone(),
                    count: valid.len() as u64,
                });
            }
            if invalid > 0 {
                metrics.report_metric(Metric::ResourceUpdatesInvalid {
                    server_uri,
                    resource_type: response.type_url.clone(),
                    count: invalid as u64,
                });
            }
        }

        if invalid == 0 {
            type_state.version_info = response.version_info.clone();
            trace!(authority = %self.name, type_url = %response.type_url, version = %response.version_info, "ACK");
            self.send_request(&response.type_url, None);
            return;
        }

        let mut messages: Vec<String> = Vec::new();
        if !top_level_errors.is_empty() {
            let joined = top_level_errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            messages.push(format!("top level errors: {joined}"));
        }
        messages.extend(
            resource_errors
                .iter()
                .map(|(name, error)| format!("{name}: {error}")),
        );
        let message = messages.join("; ");
        warn!(
            authority = %self.name,
            type_url = %response.type_url,
            version = %response.version_info,
            error = %message,
            "NACK"
        );
        self.send_request(
            &response.type_url,
            Some(ErrorDetail::invalid_argument(message)),
        );
    }

    /// Queue a request for `type_url` on the current session, carrying the
    /// last ACKed version and the latest nonce.
    fn send_request(&self, type_url: &str, error_detail: Option<ErrorDetail>) {
        let (Some(session), Some(type_state)) = (&self.session, self.types.get(type_url)) else {
            return;
        };
        if let Some(bytes) = self.encode_request(type_url, type_state, error_detail) {
            session.send(bytes);
        }
    }

    fn encode_request(
        &self,
        type_url: &str,
        type_state: &TypeState,
        error_detail: Option<ErrorDetail>,
    ) -> Option<Bytes> {
        let resource_names = type_state.resource_names();
        let request = DiscoveryRequest {
            version_info: &type_state.version_info,
            node: &self.ctx.node,
            resource_names: &resource_names,
            type_url,
            response_nonce: &type_state.nonce,
            error_detail,
        };
        match self.ctx.codec.encode_request(&request) {
            Ok(bytes) => {
                trace!(authority = %self.name, %type_url, names = ?resource_names, nonce = %type_state.nonce, "queued discovery request");
                Some(bytes)
            }
            Err(error) => {
                warn!(authority = %self.name, %type_url, %error, "failed to encode discovery request");
                None
            }
        }
    }

    /// Arm the initial-response timer of a newly requested resource. It is
    /// only cancelled by an answer for the resource or by unsubscribing.
    fn start_resource_timer(&mut self, type_url: &str, name: &str) {
        let Some(timeout) = self.ctx.resource_initial_timeout else {
            return;
        };
        let Some(state) = self
            .types
            .get_mut(type_url)
            .and_then(|ts| ts.resources.get_mut(name))
        else {
            return;
        };

        self.next_timer_generation += 1;
        let generation = self.next_timer_generation;
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let command_tx = self.command_tx.clone();
        let runtime = self.ctx.runtime.clone();
        let type_url = type_url.to_string();
        let name = name.to_string();
        self.ctx.runtime.spawn(async move {
            tokio::select! {
                _ = runtime.sleep(timeout) => {
                    let _ = command_tx.send(AuthorityCommand::ResourceTimerExpired {
                        type_url,
                        name,
                        generation,
                    });
                }
                _ = cancel_rx => {}
            }
        });
        state.set_timer(generation, cancel_tx);
    }

    fn handle_resource_timeout(&mut self, type_url: &str, name: &str, generation: u64) {
        let Some(state) = self
            .types
            .get_mut(type_url)
            .and_then(|ts| ts.resources.get_mut(name))
        else {
            return;
        };
        // Expiry of a timer armed for an earlier subscription of this name.
        if state.timer_generation() != Some(generation) {
            trace!(authority = %self.name, %type_url, resource = %name, generation, "ignoring stale resource timer");
            return;
        }
        if state.on_timeout() {
            warn!(authority = %self.name, %type_url, resource = %name, "timed out waiting for resource");
        }
    }
}

async fn wait_for(timer: &mut Option<RetryTimer>) {
    match timer {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, feature = "codegen-prost", feature = "rt-tokio"))]
mod tests {
    use super::*;
    use crate::client::config::ServerIdentifier;
    use crate::codec::prost::ProstCodec;
    use crate::resource::Resource;
    use crate::runtime::tokio::TokioRuntime;
    use crate::testutil::{FakeServer, FakeTransportBuilder, TestResource, registry};

    type TestAuthority = Authority<FakeTransportBuilder, ProstCodec, TokioRuntime>;

    fn authority(resource_initial_timeout: Duration) -> (TestAuthority, FakeServer) {
        let (builder, fake) = FakeTransportBuilder::new();
        let ctx = AuthorityContext {
            node: Arc::new(Node::new("grpc", "1.0").with_id("test-node")),
            registry: Arc::new(registry()),
            transport_builder: Arc::new(builder),
            codec: Arc::new(ProstCodec),
            runtime: TokioRuntime,
            retry_policy: RetryPolicy::default(),
            resource_initial_timeout: Some(resource_initial_timeout),
            metrics: None,
            shutdown: CancellationToken::new(),
        };
        let servers = vec![ServerConfig::new(ServerIdentifier::new("server-1"))];
        (Authority::new("test".into(), servers, ctx), fake)
    }

    fn watch(authority: &mut TestAuthority, name: &str, watcher_id: WatcherId, tx: &NotificationTx) {
        authority.handle_command(AuthorityCommand::Watch {
            type_url: TestResource::TYPE_URL.into(),
            name: name.into(),
            watcher_id,
            tx: tx.clone(),
        });
    }

    fn state<'a>(authority: &'a TestAuthority, name: &str) -> &'a ResourceWatchState {
        &authority.types[TestResource::TYPE_URL].resources[name]
    }

    fn expire(authority: &mut TestAuthority, name: &str, generation: u64) {
        authority.handle_command(AuthorityCommand::ResourceTimerExpired {
            type_url: TestResource::TYPE_URL.into(),
            name: name.into(),
            generation,
        });
    }

    #[tokio::test]
    async fn timer_of_earlier_subscription_is_ignored() {
        let (mut authority, _fake) = authority(Duration::from_secs(60));
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = WatcherId::new();
        watch(&mut authority, "A", first, &tx);
        let stale = state(&authority, "A").timer_generation().unwrap();

        authority.handle_command(AuthorityCommand::Unwatch {
            type_url: TestResource::TYPE_URL.into(),
            name: "A".into(),
            watcher_id: first,
        });
        watch(&mut authority, "A", WatcherId::new(), &tx);
        let current = state(&authority, "A").timer_generation().unwrap();
        assert_ne!(stale, current);

        expire(&mut authority, "A", stale);
        assert_eq!(state(&authority, "A").status(), WatchStatus::Requested);

        expire(&mut authority, "A", current);
        assert_eq!(state(&authority, "A").status(), WatchStatus::Timeout);
    }

    #[tokio::test]
    async fn timer_survives_session_failure() {
        let (mut authority, fake) = authority(Duration::from_secs(60));
        fake.set_failing("server-1", true);
        let (tx, _rx) = mpsc::unbounded_channel();

        watch(&mut authority, "A", WatcherId::new(), &tx);
        assert!(state(&authority, "A").timer_generation().is_some());

        assert!(authority.session.is_some());
        authority.handle_session_failure(Error::Connection("unreachable".into()), false);
        assert!(state(&authority, "A").timer_generation().is_some());
    }
}
