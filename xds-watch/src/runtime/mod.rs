//! Async runtime abstraction.
//!
//! The client never calls into a concrete executor directly; authorities,
//! sessions and resource timers are all driven through [`Runtime`].

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "rt-tokio")]
pub mod tokio;

/// Spawning and timers for the watch engine.
pub trait Runtime: Send + Sync + Clone + 'static {
    /// Run a future in the background until it completes.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Complete after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}
