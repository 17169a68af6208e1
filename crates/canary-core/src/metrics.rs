//! Canary metrics registry.
//!
//! A [`MetricsRegistry`] hands out [`Counter`] and [`Histogram`] instruments
//! keyed by metric name and label tuple. Instruments are created lazily and
//! registered with a private Prometheus [`Registry`]; repeated lookups with the
//! same key return handles to the same underlying instrument.
//!
//! Registration errors never panic. If Prometheus rejects an instrument, the
//! caller receives a detached instrument that discards its records and a
//! warning is logged.

use std::collections::HashMap;
use std::io::Write;

use parking_lot::Mutex;
use prometheus::core::Metric as _;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::error::CanaryError;

/// Prefix applied to every canary metric name.
pub const METRIC_PREFIX: &str = "strimzi_canary_";

/// Metric names (without [`METRIC_PREFIX`]).
pub mod names {
    /// Records acknowledged by the cluster.
    pub const RECORDS_PRODUCED: &str = "records_produced_total";
    /// Records the cluster failed to acknowledge.
    pub const RECORDS_PRODUCED_FAILED: &str = "records_produced_failed_total";
    /// Produce latency histogram.
    pub const RECORDS_PRODUCED_LATENCY: &str = "records_produced_latency";
    /// Records consumed back from the probe topic.
    pub const RECORDS_CONSUMED: &str = "records_consumed_total";
    /// End-to-end latency histogram.
    pub const RECORDS_CONSUMED_LATENCY: &str = "records_consumed_latency";
    /// Consumer poll, commit and decode errors.
    pub const CONSUMER_ERROR: &str = "consumer_error_total";
    /// Client construction errors.
    pub const CLIENT_CREATION_ERROR: &str = "client_creation_error_total";
    /// Cluster smaller than expected.
    pub const EXPECTED_CLUSTER_SIZE_ERROR: &str = "expected_cluster_size_error_total";
    /// Probe topic creation errors.
    pub const TOPIC_CREATION_FAILED: &str = "topic_creation_failed_total";
    /// Cluster description errors.
    pub const DESCRIBE_CLUSTER_ERROR: &str = "describe_cluster_error_total";
    /// Probe topic description errors.
    pub const TOPIC_DESCRIBE_ERROR: &str = "topic_describe_error_total";
    /// Broker connection errors.
    pub const CONNECTION_ERROR: &str = "connection_error_total";
    /// Broker connection latency histogram.
    pub const CONNECTION_LATENCY: &str = "connection_latency";
}

fn help_for(name: &str) -> &'static str {
    match name {
        names::RECORDS_PRODUCED => "The total number of records produced",
        names::RECORDS_PRODUCED_FAILED => "The total number of records failed to produce",
        names::RECORDS_PRODUCED_LATENCY => "Records produced latency in milliseconds",
        names::RECORDS_CONSUMED => "The total number of records consumed",
        names::RECORDS_CONSUMED_LATENCY => "Records end-to-end latency in milliseconds",
        names::CONSUMER_ERROR => "Total number of errors reported by the consumer",
        names::CLIENT_CREATION_ERROR => {
            "Total number of errors while creating Kafka producer, consumer or admin"
        }
        names::EXPECTED_CLUSTER_SIZE_ERROR => {
            "Total number of errors while waiting for Kafka cluster having the expected size"
        }
        names::TOPIC_CREATION_FAILED => "Total number of errors while creating the canary topic",
        names::DESCRIBE_CLUSTER_ERROR => "Total number of errors while describing cluster",
        names::TOPIC_DESCRIBE_ERROR => "Total number of errors while getting canary topic metadata",
        names::CONNECTION_ERROR => "Total number of errors while checking the connection to Kafka brokers",
        names::CONNECTION_LATENCY => "Latency in milliseconds for established or failed connections",
        _ => "Canary metric",
    }
}

/// A monotonically non-decreasing counter.
///
/// Cloning yields another handle to the same instrument.
#[derive(Clone, Debug)]
pub struct Counter {
    inner: Option<prometheus::IntCounter>,
}

impl Counter {
    fn detached() -> Self {
        Self { inner: None }
    }

    /// Increments by one.
    pub fn increment(&self) {
        if let Some(inner) = &self.inner {
            inner.inc();
        }
    }

    /// Increments by `n`.
    pub fn increment_by(&self, n: u64) {
        if let Some(inner) = &self.inner {
            inner.inc_by(n);
        }
    }

    /// Returns the current value. Detached counters always read zero.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.inner.as_ref().map_or(0, prometheus::IntCounter::get)
    }
}

/// A latency histogram with frozen bucket bounds (milliseconds).
///
/// Cloning yields another handle to the same instrument.
#[derive(Clone, Debug)]
pub struct Histogram {
    inner: Option<prometheus::Histogram>,
    buckets: Vec<f64>,
}

impl Histogram {
    fn detached(buckets: &[f64]) -> Self {
        Self {
            inner: None,
            buckets: buckets.to_vec(),
        }
    }

    /// Records one observation.
    pub fn record(&self, value: f64) {
        if let Some(inner) = &self.inner {
            inner.observe(value);
        }
    }

    /// Returns the bucket upper bounds the instrument was created with.
    #[must_use]
    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    /// Returns the number of observations.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, prometheus::Histogram::get_sample_count)
    }

    /// Returns `(upper_bound, cumulative_count)` for every bucket.
    #[must_use]
    pub fn cumulative_counts(&self) -> Vec<(f64, u64)> {
        let Some(inner) = &self.inner else {
            return self.buckets.iter().map(|b| (*b, 0)).collect();
        };
        inner
            .metric()
            .get_histogram()
            .get_bucket()
            .iter()
            .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
            .collect()
    }
}

#[derive(Default)]
struct Families {
    counters: HashMap<String, IntCounterVec>,
    histograms: HashMap<String, (HistogramVec, Vec<f64>)>,
}

/// Registry of canary instruments.
///
/// Thread-safe; share it behind an `Arc`.
pub struct MetricsRegistry {
    registry: Registry,
    families: Mutex<Families>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            families: Mutex::new(Families::default()),
        }
    }

    /// Returns the counter for `(name, labels)`, creating it on first use.
    ///
    /// `name` is given without the `strimzi_canary_` prefix.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let label_values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();

        let mut families = self.families.lock();
        let family = match families.counters.get(name) {
            Some(family) => family.clone(),
            None => {
                let opts = Opts::new(format!("{METRIC_PREFIX}{name}"), help_for(name));
                let family = match IntCounterVec::new(opts, &label_names) {
                    Ok(family) => family,
                    Err(e) => {
                        warn!(metric = name, error = %e, "failed to create counter");
                        return Counter::detached();
                    }
                };
                if let Err(e) = self.registry.register(Box::new(family.clone())) {
                    warn!(metric = name, error = %e, "failed to register counter");
                    return Counter::detached();
                }
                families.counters.insert(name.to_string(), family.clone());
                family
            }
        };
        drop(families);

        match family.get_metric_with_label_values(&label_values) {
            Ok(inner) => Counter { inner: Some(inner) },
            Err(e) => {
                warn!(metric = name, error = %e, "counter label mismatch");
                Counter::detached()
            }
        }
    }

    /// Returns the histogram for `(name, labels)`, creating it on first use.
    ///
    /// Buckets are frozen when the metric is first created; later calls
    /// receive the original buckets regardless of the `buckets` argument.
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)], buckets: &[f64]) -> Histogram {
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let label_values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();

        let mut families = self.families.lock();
        let (family, frozen) = match families.histograms.get(name) {
            Some((family, frozen)) => {
                if frozen.as_slice() != buckets {
                    warn!(
                        metric = name,
                        registered = ?frozen,
                        requested = ?buckets,
                        "histogram buckets differ from the registered ones"
                    );
                }
                (family.clone(), frozen.clone())
            }
            None => {
                let opts = HistogramOpts::new(format!("{METRIC_PREFIX}{name}"), help_for(name))
                    .buckets(buckets.to_vec());
                let family = match HistogramVec::new(opts, &label_names) {
                    Ok(family) => family,
                    Err(e) => {
                        warn!(metric = name, error = %e, "failed to create histogram");
                        return Histogram::detached(buckets);
                    }
                };
                if let Err(e) = self.registry.register(Box::new(family.clone())) {
                    warn!(metric = name, error = %e, "failed to register histogram");
                    return Histogram::detached(buckets);
                }
                families
                    .histograms
                    .insert(name.to_string(), (family.clone(), buckets.to_vec()));
                (family, buckets.to_vec())
            }
        };
        drop(families);

        match family.get_metric_with_label_values(&label_values) {
            Ok(inner) => Histogram {
                inner: Some(inner),
                buckets: frozen,
            },
            Err(e) => {
                warn!(metric = name, error = %e, "histogram label mismatch");
                Histogram::detached(&frozen)
            }
        }
    }

    /// Writes every instrument in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::Metrics` if encoding fails.
    pub fn scrape<W: Write>(&self, writer: &mut W) -> Result<(), CanaryError> {
        let families = self.registry.gather();
        TextEncoder::new()
            .encode(&families, writer)
            .map_err(|e| CanaryError::Metrics(format!("failed to encode metrics: {e}")))
    }

    /// Renders every instrument to a string.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::Metrics` if encoding fails.
    pub fn scrape_to_string(&self) -> Result<String, CanaryError> {
        let mut buf = Vec::new();
        self.scrape(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| CanaryError::Metrics(format!("metrics are not UTF-8: {e}")))
    }

    /// Content type of [`scrape`](Self::scrape) output.
    #[must_use]
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let families = self.families.lock();
        f.debug_struct("MetricsRegistry")
            .field("counters", &families.counters.len())
            .field("histograms", &families.histograms.len())
            .finish()
    }
}
