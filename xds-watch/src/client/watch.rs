//! Resource watcher types.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use crate::client::authority::AuthorityCommand;
use crate::error::Error;
use crate::resource::{DecodedResource, Resource};

/// Global counter for generating unique watcher IDs.
static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(u64);

impl WatcherId {
    /// Create a new unique watcher ID.
    pub fn new() -> Self {
        Self(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

/// Events delivered to resource watchers.
#[derive(Debug, Clone)]
pub enum ResourceEvent<T> {
    /// The server ACKed a new value for the resource.
    Changed(Arc<T>),
    /// The server sent a value that failed validation. The previously
    /// delivered value, if any, is still current.
    ResourceError(Error),
    /// A state-of-the-world response confirmed the resource is absent.
    /// Terminal until the server sends the resource again.
    DoesNotExist,
    /// A transient problem, such as the initial response timing out or no
    /// server being reachable. The subscription stays active.
    AmbientError(Error),
}

/// What the authority sends down a watcher's channel.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Changed(DecodedResource),
    ResourceError(Error),
    DoesNotExist,
    AmbientError(Error),
}

pub(crate) type NotificationTx = mpsc::UnboundedSender<Notification>;

/// Removes the watcher from its authority when dropped.
#[derive(Debug)]
pub(crate) struct WatchRegistration {
    pub(crate) watcher_id: WatcherId,
    pub(crate) type_url: String,
    pub(crate) name: String,
    pub(crate) command_tx: mpsc::UnboundedSender<AuthorityCommand>,
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        // The authority may already be gone after close.
        let _ = self.command_tx.send(AuthorityCommand::Unwatch {
            type_url: std::mem::take(&mut self.type_url),
            name: std::mem::take(&mut self.name),
            watcher_id: self.watcher_id,
        });
    }
}

/// A watcher for one resource of type `T`.
///
/// Implements [`Stream`] to receive resource events. Events for a resource
/// arrive in the order the server's responses were processed.
/// Dropping the watcher, or calling [`cancel`](Self::cancel), unsubscribes.
/// The stream ends when the client is closed.
#[derive(Debug)]
pub struct ResourceWatcher<T> {
    id: WatcherId,
    events: mpsc::UnboundedReceiver<Notification>,
    registration: Option<WatchRegistration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> ResourceWatcher<T> {
    pub(crate) fn new(
        id: WatcherId,
        events: mpsc::UnboundedReceiver<Notification>,
        registration: Option<WatchRegistration>,
    ) -> Self {
        Self {
            id,
            events,
            registration,
            _marker: PhantomData,
        }
    }

    /// This watcher's identity.
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Receive the next event, or `None` once the client is closed.
    pub async fn next(&mut self) -> Option<ResourceEvent<T>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Stop watching. Equivalent to dropping the watcher.
    pub fn cancel(mut self) {
        self.registration.take();
    }

    fn convert(notification: Notification) -> ResourceEvent<T> {
        match notification {
            Notification::Changed(resource) => match resource.downcast::<T>() {
                Some(resource) => ResourceEvent::Changed(resource),
                None => ResourceEvent::ResourceError(Error::Decode(format!(
                    "resource {:?} registered for {} did not decode to the watched type",
                    resource.name(),
                    T::TYPE_URL
                ))),
            },
            Notification::ResourceError(error) => ResourceEvent::ResourceError(error),
            Notification::DoesNotExist => ResourceEvent::DoesNotExist,
            Notification::AmbientError(error) => ResourceEvent::AmbientError(error),
        }
    }
}

impl<T: Resource> Stream for ResourceWatcher<T> {
    type Item = ResourceEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_recv(cx)
            .map(|notification| notification.map(Self::convert))
    }
}
