//! Per-resource watch state.
//!
//! Lifecycle of one (type, name) pair:
//!
//! ```text
//!              response ok              response invalid
//!   Requested ─────────────▶ Acked ◀──────────────────────▶ Nacked
//!       │  ▲                   │  ▲                            │
//!  timer│  │response           │  │response        absent from │
//!       ▼  │                   ▼  │                 SotW       │
//!    Timeout                DoesNotExist ◀─────────────────────┘
//! ```
//!
//! Only server responses and the initial timer move the status. Watcher
//! registration touches nothing but the watcher set.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::client::watch::{Notification, NotificationTx, WatcherId};
use crate::error::Error;
use crate::resource::DecodedResource;

/// Protocol status of a watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// Subscribed; the server has not answered for this resource yet.
    Requested,
    /// The server sent a value that was accepted.
    Acked,
    /// The server's latest value was rejected. Any earlier accepted value
    /// is still served.
    Nacked,
    /// A state-of-the-world response showed the resource is absent.
    DoesNotExist,
    /// No answer arrived within the initial timeout. Still subscribed.
    Timeout,
}

/// Point-in-time copy of a resource's watch state.
#[derive(Debug, Clone)]
pub struct WatchStateSnapshot {
    /// Current status.
    pub status: WatchStatus,
    /// Envelope version the cached value was accepted at.
    pub version: Option<String>,
    /// Last accepted value.
    pub resource: Option<DecodedResource>,
    /// Error of the latest rejected value, if the last update was a NACK.
    pub error: Option<Error>,
    /// Number of registered watchers.
    pub watchers: usize,
}

#[derive(Debug)]
pub(crate) struct ResourceWatchState {
    status: WatchStatus,
    version: Option<String>,
    resource: Option<DecodedResource>,
    raw: Option<Bytes>,
    error: Option<Error>,
    watchers: HashMap<WatcherId, NotificationTx>,
    // Generation of the armed initial-response timer. Dropping the sender
    // cancels it.
    timer: Option<(u64, oneshot::Sender<()>)>,
}

impl ResourceWatchState {
    pub(crate) fn new() -> Self {
        Self {
            status: WatchStatus::Requested,
            version: None,
            resource: None,
            raw: None,
            error: None,
            watchers: HashMap::new(),
            timer: None,
        }
    }

    pub(crate) fn status(&self) -> WatchStatus {
        self.status
    }

    pub(crate) fn has_value(&self) -> bool {
        self.resource.is_some()
    }

    pub(crate) fn timer_generation(&self) -> Option<u64> {
        self.timer.as_ref().map(|(generation, _)| *generation)
    }

    pub(crate) fn set_timer(&mut self, generation: u64, cancel: oneshot::Sender<()>) {
        self.timer = Some((generation, cancel));
    }

    /// Register a watcher and replay whatever is already known.
    pub(crate) fn add_watcher(&mut self, id: WatcherId, tx: NotificationTx) {
        if let Some(resource) = &self.resource {
            let _ = tx.send(Notification::Changed(resource.clone()));
        }
        match self.status {
            WatchStatus::Nacked => {
                if let Some(error) = &self.error {
                    let _ = tx.send(Notification::ResourceError(error.clone()));
                }
            }
            WatchStatus::DoesNotExist => {
                let _ = tx.send(Notification::DoesNotExist);
            }
            WatchStatus::Timeout => {
                let _ = tx.send(Notification::AmbientError(Error::ResourceTimeout));
            }
            WatchStatus::Requested | WatchStatus::Acked => {}
        }
        self.watchers.insert(id, tx);
    }

    /// Returns true when no watchers remain.
    pub(crate) fn remove_watcher(&mut self, id: WatcherId) -> bool {
        self.watchers.remove(&id);
        self.watchers.is_empty()
    }

    /// Accept a value. Returns false if the value is byte-identical to the
    /// cached one, in which case watchers are not notified again.
    pub(crate) fn on_update(&mut self, resource: DecodedResource, raw: Bytes, version: &str) -> bool {
        self.timer = None;
        self.version = Some(version.to_owned());
        self.error = None;

        let unchanged = self.status == WatchStatus::Acked && self.raw.as_ref() == Some(&raw);
        self.status = WatchStatus::Acked;
        if unchanged {
            return false;
        }

        self.raw = Some(raw);
        self.resource = Some(resource.clone());
        self.notify(Notification::Changed(resource));
        true
    }

    /// Reject a value. The cached value, if any, is kept.
    pub(crate) fn on_error(&mut self, error: Error) {
        self.timer = None;
        self.status = WatchStatus::Nacked;
        self.error = Some(error.clone());
        self.notify(Notification::ResourceError(error));
    }

    pub(crate) fn on_does_not_exist(&mut self) {
        self.timer = None;
        self.status = WatchStatus::DoesNotExist;
        self.resource = None;
        self.raw = None;
        self.error = None;
        self.notify(Notification::DoesNotExist);
    }

    /// Returns true if the resource was still waiting for its first answer.
    pub(crate) fn on_timeout(&mut self) -> bool {
        self.timer = None;
        if self.status != WatchStatus::Requested {
            return false;
        }
        self.status = WatchStatus::Timeout;
        self.notify(Notification::AmbientError(Error::ResourceTimeout));
        true
    }

    /// Report a transient problem without touching status or value.
    pub(crate) fn on_ambient_error(&self, error: Error) {
        self.notify(Notification::AmbientError(error));
    }

    pub(crate) fn snapshot(&self) -> WatchStateSnapshot {
        WatchStateSnapshot {
            status: self.status,
            version: self.version.clone(),
            resource: self.resource.clone(),
            error: self.error.clone(),
            watchers: self.watchers.len(),
        }
    }

    fn notify(&self, notification: Notification) {
        for tx in self.watchers.values() {
            let _ = tx.send(notification.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DecodeResult, Resource};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Route(String);

    impl Resource for Route {
        const TYPE_URL: &'static str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

        fn decode(_bytes: Bytes) -> DecodeResult<Self> {
            unreachable!()
        }

        fn name(&self) -> &str {
            &self.0
        }
    }

    fn route(name: &str) -> DecodedResource {
        DecodedResource::new(Route(name.to_string()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn nack_keeps_previous_value() {
        let mut state = ResourceWatchState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.add_watcher(WatcherId::new(), tx);
        assert!(drain(&mut rx).is_empty());

        assert!(state.on_update(route("r1"), Bytes::from_static(b"x"), "v1"));
        state.on_error(Error::ResourceValidation("bad".into()));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.status, WatchStatus::Nacked);
        assert_eq!(snapshot.version.as_deref(), Some("v1"));
        assert_eq!(snapshot.resource.unwrap().name(), "r1");

        let events = drain(&mut rx);
        assert!(matches!(events[0], Notification::Changed(_)));
        assert!(matches!(events[1], Notification::ResourceError(_)));
    }

    #[test]
    fn identical_update_is_not_renotified() {
        let mut state = ResourceWatchState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.add_watcher(WatcherId::new(), tx);

        assert!(state.on_update(route("r1"), Bytes::from_static(b"x"), "v1"));
        assert!(!state.on_update(route("r1"), Bytes::from_static(b"x"), "v2"));
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(state.snapshot().version.as_deref(), Some("v2"));
    }

    #[test]
    fn new_watcher_gets_cached_state() {
        let mut state = ResourceWatchState::new();
        state.on_update(route("r1"), Bytes::from_static(b"x"), "v1");
        state.on_error(Error::ResourceValidation("bad".into()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.add_watcher(WatcherId::new(), tx);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Notification::Changed(r) if r.name() == "r1"));
        assert!(matches!(&events[1], Notification::ResourceError(_)));
    }

    #[test]
    fn timeout_only_applies_while_requested() {
        let mut state = ResourceWatchState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.add_watcher(WatcherId::new(), tx);

        assert!(state.on_timeout());
        assert_eq!(state.status(), WatchStatus::Timeout);
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [Notification::AmbientError(Error::ResourceTimeout)]
        ));

        state.on_update(route("r1"), Bytes::from_static(b"x"), "v1");
        assert!(!state.on_timeout());
        assert_eq!(state.status(), WatchStatus::Acked);
    }

    #[test]
    fn does_not_exist_clears_value() {
        let mut state = ResourceWatchState::new();
        state.on_update(route("r1"), Bytes::from_static(b"x"), "v1");
        state.on_does_not_exist();
        assert!(!state.has_value());
        assert_eq!(state.status(), WatchStatus::DoesNotExist);

        // Coming back is a fresh change even with identical bytes.
        assert!(state.on_update(route("r1"), Bytes::from_static(b"x"), "v2"));
    }

    #[test]
    fn remove_last_watcher_reports_empty() {
        let mut state = ResourceWatchState::new();
        let (a, b) = (WatcherId::new(), WatcherId::new());
        state.add_watcher(a, mpsc::unbounded_channel().0);
        state.add_watcher(b, mpsc::unbounded_channel().0);
        assert!(!state.remove_watcher(a));
        assert!(state.remove_watcher(b));
    }
}
