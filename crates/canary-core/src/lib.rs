//! # Kafka Canary Core
//!
//! Synthetic health probing for an Apache Kafka cluster. The canary keeps a
//! dedicated probe topic with one partition per expected broker, produces a
//! timestamped record to every partition on each reconcile tick, consumes
//! them back, and reports latency histograms, error counters and the
//! fraction of produced records that were consumed over a sliding window.
//!
//! ## Components
//!
//! - [`topic`] - Probe topic reconciliation and the startup cluster wait
//! - [`producer`] / [`consumer`] - The two sides of the probe
//! - [`status`] - Consumed-fraction sampling over [`ring`] buffers
//! - [`connection`] - Per-broker TCP connectivity check
//! - [`canary`] - Orchestrator running the periodic tasks
//! - [`testing`] - In-memory cluster for tests
//!
//! ```text
//!            reconcile tick                        status tick
//!   TopicReconciler ─► ProducerProbe ┐         StatusSampler
//!                      ConsumerProbe ┘ (join)    ▲
//!                            │                   │
//!                            ▼                   │
//!                     MessageCounters ───────────┘
//!                     MetricsRegistry ──► /metrics
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::float_cmp,
        clippy::unreadable_literal,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::unwrap_used
    )
)]

/// Error types.
pub mod error;

/// Environment configuration.
pub mod config;

/// Metrics registry and instruments.
pub mod metrics;

/// Fixed-capacity sample ring.
pub mod ring;

/// Shared produced/consumed counters.
pub mod counters;

/// Probe message codec.
pub mod message;

/// Cluster client traits and Kafka implementations.
pub mod client;

/// Periodic tasks and shutdown signalling.
pub mod ticker;

/// Client-creation retry.
pub mod retry;

/// Lifecycle state.
pub mod health;

/// Probe topic reconciliation.
pub mod topic;

/// Producer probe.
pub mod producer;

/// Consumer probe.
pub mod consumer;

/// Consuming status sampler.
pub mod status;

/// Broker connectivity check.
pub mod connection;

/// Orchestrator.
pub mod canary;

/// Testing utilities (in-memory cluster).
pub mod testing;

pub use canary::{Canary, ProbeClients, ReconcileOutcome, ReconcileTask};
pub use config::{CanaryConfig, EnvConfig};
pub use error::CanaryError;
pub use health::CanaryState;
pub use metrics::MetricsRegistry;
pub use status::{ConsumingStatus, StatusReport, StatusSampler};
pub use ticker::{ShutdownListener, ShutdownSignal};
