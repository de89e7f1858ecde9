//! Metrics reported by the client.
//!
//! The client only describes what happened; aggregation and export belong to
//! the [`MetricsReporter`] the caller plugs in.

use std::fmt::Debug;

/// A single metric observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Metric {
    /// Resources from one envelope that decoded and validated.
    ResourceUpdatesValid {
        /// Server the envelope came from.
        server_uri: String,
        /// Type URL of the envelope.
        resource_type: String,
        /// Number of valid resources.
        count: u64,
    },
    /// Resources from one envelope that were rejected.
    ResourceUpdatesInvalid {
        /// Server the envelope came from.
        server_uri: String,
        /// Type URL of the envelope.
        resource_type: String,
        /// Number of rejected resources.
        count: u64,
    },
    /// A stream to a server failed before it delivered any response.
    ServerFailure {
        /// The failing server.
        server_uri: String,
    },
}

/// Sink for [`Metric`]s.
///
/// Called inline from authority workers, so implementations must not block.
pub trait MetricsReporter: Send + Sync + Debug + 'static {
    /// Record one observation.
    fn report_metric(&self, metric: Metric);
}
