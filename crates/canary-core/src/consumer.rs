//! Consumer side of the probe.
//!
//! The consumer is assigned to every probe partition directly, without group
//! rebalancing. Each round polls for a short bounded window, measures the
//! end-to-end latency of every decoded record and commits synchronously.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::ProbeConsumer;
use crate::config::CanaryConfig;
use crate::counters::MessageCounters;
use crate::error::CanaryError;
use crate::message::{now_ms, ProbeMessage};
use crate::metrics::{names, MetricsRegistry};

/// Poll window of one consume round.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Result of one consume round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeRound {
    /// Records decoded and counted.
    pub consumed: usize,
    /// Records skipped because they did not decode.
    pub malformed: usize,
}

/// Owns the probe consumer.
pub struct ConsumerProbe {
    consumer: Box<dyn ProbeConsumer>,
    topic: String,
    client_id: String,
    partitions: i32,
    poll_timeout: Duration,
    latency_buckets: Vec<f64>,
    metrics: Arc<MetricsRegistry>,
    counters: Arc<MessageCounters>,
}

impl ConsumerProbe {
    /// Creates a probe reading partitions `[0, expected_cluster_size)`.
    #[must_use]
    pub fn new(
        consumer: Box<dyn ProbeConsumer>,
        config: &CanaryConfig,
        metrics: Arc<MetricsRegistry>,
        counters: Arc<MessageCounters>,
    ) -> Self {
        Self {
            consumer,
            topic: config.topic.clone(),
            client_id: config.client_id.clone(),
            partitions: config.expected_cluster_size,
            poll_timeout: POLL_TIMEOUT,
            latency_buckets: config.end_to_end_latency_buckets.clone(),
            metrics,
            counters,
        }
    }

    /// Assigns the consumer to every probe partition.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ConsumeFailed` if the assignment is rejected.
    pub fn assign(&mut self) -> Result<(), CanaryError> {
        let partitions: Vec<i32> = (0..self.partitions).collect();
        self.consumer.assign(&self.topic, &partitions).inspect_err(|_| {
            self.count_error();
        })
    }

    /// Polls once, records what arrived and commits.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ConsumeFailed` if the poll or the commit fails.
    /// The failure has already been counted.
    pub async fn receive_messages(&mut self) -> Result<ConsumeRound, CanaryError> {
        let records = match self.consumer.poll(self.poll_timeout).await {
            Ok(records) => records,
            Err(e) => {
                self.count_error();
                return Err(e);
            }
        };

        let mut round = ConsumeRound::default();
        for record in records {
            let decoded = record
                .payload
                .as_deref()
                .ok_or_else(|| CanaryError::MalformedMessage("record has no value".into()))
                .and_then(ProbeMessage::decode);
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    warn!(partition = record.partition, offset = record.offset, error = %e, "skipping probe record");
                    self.count_error();
                    round.malformed += 1;
                    continue;
                }
            };

            #[allow(clippy::cast_precision_loss)]
            let latency = (now_ms() - message.timestamp).max(0) as f64;
            debug!(
                partition = record.partition,
                offset = record.offset,
                latency_ms = latency,
                "probe record consumed"
            );

            let partition_label = record.partition.to_string();
            let labels = [
                ("clientid", self.client_id.as_str()),
                ("partition", partition_label.as_str()),
            ];
            self.metrics
                .histogram(names::RECORDS_CONSUMED_LATENCY, &labels, &self.latency_buckets)
                .record(latency);
            self.metrics.counter(names::RECORDS_CONSUMED, &labels).increment();
            self.counters.increment_consumed();
            round.consumed += 1;
        }

        self.consumer.commit_sync().inspect_err(|_| {
            self.count_error();
        })?;
        Ok(round)
    }

    /// Drops the assignment and closes the consumer.
    pub async fn close(&mut self) {
        self.consumer.unsubscribe();
        self.consumer.close().await;
    }

    fn count_error(&self) {
        self.metrics
            .counter(names::CONSUMER_ERROR, &[("clientid", self.client_id.as_str())])
            .increment();
    }
}

impl std::fmt::Debug for ConsumerProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerProbe")
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("partitions", &self.partitions)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;

    const TOPIC: &str = "__strimzi_canary";

    fn probe(cluster: &MockCluster) -> (ConsumerProbe, Arc<MetricsRegistry>, Arc<MessageCounters>) {
        let mut config = CanaryConfig::default();
        config.expected_cluster_size = 2;
        let metrics = Arc::new(MetricsRegistry::new());
        let counters = Arc::new(MessageCounters::new());
        let probe = ConsumerProbe::new(
            Box::new(cluster.consumer()),
            &config,
            Arc::clone(&metrics),
            Arc::clone(&counters),
        );
        (probe, metrics, counters)
    }

    fn payload(partition: i32) -> Vec<u8> {
        ProbeMessage::new("strimzi-canary-client", partition)
            .encode()
            .unwrap()
            .into_bytes()
    }

    #[tokio::test]
    async fn test_consumes_and_commits() {
        let cluster = MockCluster::with_brokers(2);
        cluster.create_topic_direct(TOPIC, 2, 2);
        let (mut probe, metrics, counters) = probe(&cluster);
        probe.assign().unwrap();

        cluster.append(TOPIC, 0, Some(payload(0)));
        cluster.append(TOPIC, 1, Some(payload(1)));

        let round = probe.receive_messages().await.unwrap();
        assert_eq!(round, ConsumeRound { consumed: 2, malformed: 0 });
        assert_eq!(counters.consumed(), 2);
        assert_eq!(cluster.committed(TOPIC, 0), Some(1));
        assert_eq!(cluster.committed(TOPIC, 1), Some(1));

        let labels = [("clientid", "strimzi-canary-client"), ("partition", "1")];
        assert_eq!(metrics.counter(names::RECORDS_CONSUMED, &labels).get(), 1);
        assert_eq!(
            metrics
                .histogram(names::RECORDS_CONSUMED_LATENCY, &labels, &[])
                .sample_count(),
            1
        );

        let round = probe.receive_messages().await.unwrap();
        assert_eq!(round.consumed, 0);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let cluster = MockCluster::with_brokers(2);
        cluster.create_topic_direct(TOPIC, 2, 2);
        let (mut probe, metrics, counters) = probe(&cluster);
        probe.assign().unwrap();

        cluster.append(TOPIC, 0, Some(b"garbage".to_vec()));
        cluster.append(TOPIC, 0, None);
        cluster.append(TOPIC, 0, Some(payload(0)));

        let round = probe.receive_messages().await.unwrap();
        assert_eq!(round, ConsumeRound { consumed: 1, malformed: 2 });
        assert_eq!(counters.consumed(), 1);
        assert_eq!(
            metrics
                .counter(names::CONSUMER_ERROR, &[("clientid", "strimzi-canary-client")])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn test_poll_failure_is_counted() {
        let cluster = MockCluster::with_brokers(2);
        cluster.create_topic_direct(TOPIC, 2, 2);
        let (mut probe, metrics, _) = probe(&cluster);
        probe.assign().unwrap();
        cluster.fail_consume(true);

        assert!(probe.receive_messages().await.is_err());
        assert_eq!(
            metrics
                .counter(names::CONSUMER_ERROR, &[("clientid", "strimzi-canary-client")])
                .get(),
            1
        );

        cluster.fail_consume(false);
        cluster.append(TOPIC, 0, Some(payload(0)));
        assert_eq!(probe.receive_messages().await.unwrap().consumed, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_ends_round() {
        let cluster = MockCluster::with_brokers(2);
        cluster.create_topic_direct(TOPIC, 2, 2);
        let (mut probe, metrics, counters) = probe(&cluster);
        probe.assign().unwrap();
        cluster.append(TOPIC, 0, Some(payload(0)));
        cluster.fail_commit(true);

        let err = probe.receive_messages().await.unwrap_err();
        assert!(matches!(err, CanaryError::ConsumeFailed(_)));
        assert_eq!(
            metrics
                .counter(names::CONSUMER_ERROR, &[("clientid", "strimzi-canary-client")])
                .get(),
            1
        );
        assert_eq!(cluster.committed(TOPIC, 0), None);

        cluster.fail_commit(false);
        cluster.append(TOPIC, 1, Some(payload(1)));
        let round = probe.receive_messages().await.unwrap();
        assert_eq!(round.consumed, 1);
        assert_eq!(counters.consumed(), 2);
        assert_eq!(cluster.committed(TOPIC, 0), Some(1));
        assert_eq!(cluster.committed(TOPIC, 1), Some(1));
    }
}
