//! Backoff between passes over an authority's server chain (gRFC A6 style).

use std::time::Duration;

use crate::error::{Error, Result};

/// Exponential backoff settings for reconnecting to management servers.
///
/// An authority walks its server chain without waiting; once every server
/// has failed it sleeps for the next backoff before starting over from the
/// highest-priority server.
///
/// # Example
///
/// ```
/// use xds_watch::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_initial_backoff(Duration::from_millis(500)).unwrap()
///     .with_max_backoff(Duration::from_secs(60)).unwrap()
///     .with_backoff_multiplier(1.6).unwrap();
/// assert_eq!(policy.backoff_duration(0), Some(Duration::from_millis(500)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Backoff after the first failed pass. Default: 1 second.
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff. Default: 30 seconds.
    pub max_backoff: Duration,
    /// Growth factor per failed pass. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Failed passes after which the authority gives up.
    /// `None` (the default) retries forever.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Set the initial backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is zero or greater than `max_backoff`.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if duration > self.max_backoff {
            let max_backoff = self.max_backoff;
            return Err(Error::Validation(format!(
                "initial_backoff ({duration:?}) must be <= max_backoff ({max_backoff:?})"
            )));
        }
        self.initial_backoff = duration;
        Ok(self)
    }

    /// Set the maximum backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is less than `initial_backoff`.
    pub fn with_max_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration < self.initial_backoff {
            let initial_backoff = self.initial_backoff;
            return Err(Error::Validation(format!(
                "max_backoff ({duration:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }
        self.max_backoff = duration;
        Ok(self)
    }

    /// Set the backoff multiplier.
    ///
    /// # Errors
    ///
    /// Returns an error if `multiplier` is less than 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Result<Self> {
        if multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        self.backoff_multiplier = multiplier;
        Ok(self)
    }

    /// Limit the number of failed passes. `None` retries indefinitely.
    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Backoff before pass `attempt + 1` (0-indexed), or `None` once
    /// `max_attempts` is reached.
    pub fn backoff_duration(&self, attempt: usize) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff = self
            .initial_backoff
            .as_secs_f64()
            * self.backoff_multiplier.powi(exponent);

        if !backoff.is_finite() || backoff >= self.max_backoff.as_secs_f64() {
            return Some(self.max_backoff);
        }
        Some(Duration::from_secs_f64(backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Stateful attempt counter over a [`RetryPolicy`].
///
/// # Example
///
/// ```
/// use xds_watch::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(RetryPolicy::default());
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
///
/// backoff.reset();
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Start counting from zero.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The next backoff, advancing the counter. `None` when exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let duration = self.policy.backoff_duration(self.attempt)?;
        self.attempt += 1;
        Some(duration)
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_duration(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_duration(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.backoff_duration(10), Some(Duration::from_secs(30)));
        assert_eq!(policy.backoff_duration(10_000), Some(Duration::from_secs(30)));
    }

    #[test]
    fn max_attempts_exhausts() {
        let mut backoff = Backoff::new(RetryPolicy::default().with_max_attempts(Some(2)));
        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn setters_validate() {
        assert!(RetryPolicy::default()
            .with_initial_backoff(Duration::ZERO)
            .is_err());
        assert!(RetryPolicy::default()
            .with_initial_backoff(Duration::from_secs(60))
            .is_err());
        assert!(RetryPolicy::default()
            .with_max_backoff(Duration::from_millis(10))
            .is_err());
        assert!(RetryPolicy::default().with_backoff_multiplier(0.5).is_err());
    }
}
