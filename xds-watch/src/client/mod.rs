//! Client interface through which the user can watch and receive updates for xDS resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::authority::{AuthorityCommand, AuthorityContext};
use crate::client::config::ClientConfig;
use crate::client::manager::{WatchManager, WatchRouter};
use crate::client::state::WatchStateSnapshot;
use crate::client::watch::{Notification, ResourceWatcher, WatchRegistration, WatcherId};
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::resource::Resource;
use crate::runtime::Runtime;
use crate::transport::TransportBuilder;

pub(crate) mod authority;
pub mod config;
pub(crate) mod manager;
pub mod retry;
pub(crate) mod session;
pub mod state;
pub mod watch;

/// Builder for [`XdsClient`].
#[derive(Debug)]
pub struct XdsClientBuilder<TB, C, R> {
    config: ClientConfig<TB>,
    codec: C,
    runtime: R,
}

impl<TB, C, R> XdsClientBuilder<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new builder with the given configuration, codec, and runtime.
    pub fn new(config: ClientConfig<TB>, codec: C, runtime: R) -> Self {
        Self {
            config,
            codec,
            runtime,
        }
    }

    /// Validate the configuration and build the client.
    ///
    /// No connection is made here: each authority connects when its first
    /// resource is watched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn build(self) -> Result<XdsClient> {
        self.config.validate()?;
        let ClientConfig {
            node,
            resource_types,
            transport_builder,
            servers,
            authorities,
            retry_policy,
            resource_initial_timeout,
            metrics_reporter,
        } = self.config;
        let registry =
            resource_types.ok_or_else(|| Error::Config("resource types map is nil".into()))?;
        let transport_builder =
            transport_builder.ok_or_else(|| Error::Config("transport builder is nil".into()))?;

        let ctx = AuthorityContext {
            node: Arc::new(node),
            registry: Arc::new(registry),
            transport_builder: Arc::new(transport_builder),
            codec: Arc::new(self.codec),
            runtime: self.runtime,
            retry_policy,
            resource_initial_timeout,
            metrics: metrics_reporter,
            shutdown: CancellationToken::new(),
        };
        debug!(
            servers = servers.len(),
            authorities = authorities.len(),
            "xDS client created"
        );
        let manager = WatchManager::new(ctx, servers, authorities);

        Ok(XdsClient {
            inner: Arc::new(ClientInner {
                router: Box::new(manager),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

#[derive(Debug)]
struct ClientInner {
    router: Box<dyn WatchRouter>,
    closed: AtomicBool,
}

impl ClientInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing xDS client");
        self.router.close();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// The xDS client.
///
/// A cheap handle to the background authority workers. Cloning it creates a
/// new reference to the same client; the client closes when [`close`] is
/// called or the last handle is dropped.
///
/// [`close`]: XdsClient::close
#[derive(Clone, Debug)]
pub struct XdsClient {
    inner: Arc<ClientInner>,
}

impl XdsClient {
    /// Create a new builder with the given configuration, codec, and runtime.
    pub fn builder<TB, C, R>(
        config: ClientConfig<TB>,
        codec: C,
        runtime: R,
    ) -> XdsClientBuilder<TB, C, R>
    where
        TB: TransportBuilder,
        C: XdsCodec,
        R: Runtime,
    {
        XdsClientBuilder::new(config, codec, runtime)
    }

    /// Build a client using [`ProstCodec`](crate::ProstCodec) and
    /// [`TokioRuntime`](crate::TokioRuntime).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    #[cfg(all(feature = "codegen-prost", feature = "rt-tokio"))]
    pub fn new<TB: TransportBuilder>(config: ClientConfig<TB>) -> Result<Self> {
        Self::builder(
            config,
            crate::codec::prost::ProstCodec,
            crate::runtime::tokio::TokioRuntime,
        )
        .build()
    }

    /// Watch a resource by name.
    ///
    /// Names of the form `xdstp://<authority>/...` are served by that
    /// authority's servers; any other name by the top-level servers.
    ///
    /// The returned watcher first replays whatever is already known about the
    /// resource, then every later change. Routing problems, like an unknown
    /// authority, arrive as a single [`ResourceEvent::AmbientError`] after
    /// which the stream ends. Dropping the watcher unsubscribes.
    ///
    /// Must be called within the context of the client's runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut watcher = client.watch::<Listener>("my-listener");
    /// while let Some(event) = watcher.next().await {
    ///     match event {
    ///         ResourceEvent::Changed(listener) => println!("listener: {}", listener.name()),
    ///         ResourceEvent::ResourceError(error) => println!("rejected: {error}"),
    ///         ResourceEvent::DoesNotExist => println!("listener removed"),
    ///         ResourceEvent::AmbientError(error) => println!("unavailable: {error}"),
    ///     }
    /// }
    /// ```
    ///
    /// [`ResourceEvent::AmbientError`]: crate::ResourceEvent::AmbientError
    pub fn watch<T: Resource>(&self, name: impl Into<String>) -> ResourceWatcher<T> {
        let name = name.into();
        let watcher_id = WatcherId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        if self.inner.closed.load(Ordering::Acquire) {
            return ResourceWatcher::new(watcher_id, rx, None);
        }

        let handle = match self.inner.router.route(T::TYPE_URL, &name) {
            Ok(handle) => handle,
            Err(Error::ClientClosed) => return ResourceWatcher::new(watcher_id, rx, None),
            Err(error) => {
                debug!(type_url = T::TYPE_URL, resource = %name, %error, "cannot watch resource");
                let _ = tx.send(Notification::AmbientError(error));
                return ResourceWatcher::new(watcher_id, rx, None);
            }
        };

        let command = AuthorityCommand::Watch {
            type_url: T::TYPE_URL.to_string(),
            name: name.clone(),
            watcher_id,
            tx,
        };
        if handle.command_tx.send(command).is_err() {
            return ResourceWatcher::new(watcher_id, rx, None);
        }

        let registration = WatchRegistration {
            watcher_id,
            type_url: T::TYPE_URL.to_string(),
            name,
            command_tx: handle.command_tx,
        };
        ResourceWatcher::new(watcher_id, rx, Some(registration))
    }

    /// Snapshot of the watch state of a resource, or `None` if nothing
    /// watches it or the client is closed.
    pub async fn watch_state(&self, type_url: &str, name: &str) -> Option<WatchStateSnapshot> {
        let handle = self.inner.router.lookup(name)?;
        let (reply, rx) = oneshot::channel();
        handle
            .command_tx
            .send(AuthorityCommand::WatchState {
                type_url: type_url.to_string(),
                name: name.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Shut the client down.
    ///
    /// Every stream is closed and every watcher stream ends. Calling it
    /// again does nothing.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
