//! Canary error types.
//!
//! Startup errors (configuration, client creation) are fatal. Everything a
//! periodic tick produces is logged and counted by the caller, never
//! propagated past the scheduler.

use thiserror::Error;

/// Errors that can occur while probing the cluster.
#[derive(Debug, Error)]
pub enum CanaryError {
    /// The cluster could not be described, or it is smaller than expected.
    #[error("cluster unavailable: {0}")]
    ClusterUnavailable(String),

    /// A probe record was not acknowledged.
    #[error("produce to partition {partition} failed: {message}")]
    ProduceFailed {
        /// The partition the record was sent to.
        partition: i32,
        /// Details reported by the client.
        message: String,
    },

    /// Polling or committing on the probe consumer failed.
    #[error("consume failed: {0}")]
    ConsumeFailed(String),

    /// A consumed record did not decode into a probe message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Invalid canary configuration.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Required configuration key is missing.
    #[error("missing required config: {0}")]
    MissingConfig(String),

    /// The probe topic exists with more partitions than expected.
    #[error("topic '{topic}' has {partitions} partitions, expected {expected}")]
    TopicShape {
        /// The probe topic name.
        topic: String,
        /// The partition count found on the cluster.
        partitions: i32,
        /// The expected cluster size.
        expected: i32,
    },

    /// Creating or altering the probe topic failed.
    #[error("topic operation failed: {0}")]
    TopicOperation(String),

    /// A Kafka client could not be created.
    #[error("client creation failed: {0}")]
    ClientCreation(String),

    /// The metrics registry rejected an instrument or failed to encode.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// The operation was interrupted by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// An internal error that doesn't fit other categories.
    #[error("internal error: {0}")]
    Internal(String),

    /// An I/O error from the underlying system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanaryError {
    /// Returns `true` if the error is expected to clear on a later tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::ConfigurationError(_) | Self::MissingConfig(_) | Self::ClientCreation(_)
        )
    }
}
