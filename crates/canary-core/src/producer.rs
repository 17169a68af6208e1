//! Producer side of the probe.
//!
//! Each round sends one [`ProbeMessage`] to every partition of the probe
//! topic. All sends are dispatched together and the round ends once every
//! partition has been acknowledged or has failed.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::client::ProbeProducer;
use crate::config::CanaryConfig;
use crate::counters::MessageCounters;
use crate::message::{now_ms, ProbeMessage};
use crate::metrics::{names, MetricsRegistry};

/// Result of one produce round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProduceRound {
    /// Partitions whose record was acknowledged.
    pub acknowledged: usize,
    /// Partitions whose record failed.
    pub failed: usize,
}

/// Owns the probe producer.
pub struct ProducerProbe {
    producer: Box<dyn ProbeProducer>,
    topic: String,
    client_id: String,
    partitions: i32,
    latency_buckets: Vec<f64>,
    metrics: Arc<MetricsRegistry>,
    counters: Arc<MessageCounters>,
}

impl ProducerProbe {
    /// Creates a probe sending to partitions `[0, expected_cluster_size)`.
    #[must_use]
    pub fn new(
        producer: Box<dyn ProbeProducer>,
        config: &CanaryConfig,
        metrics: Arc<MetricsRegistry>,
        counters: Arc<MessageCounters>,
    ) -> Self {
        Self {
            producer,
            topic: config.topic.clone(),
            client_id: config.client_id.clone(),
            partitions: config.expected_cluster_size,
            latency_buckets: config.producer_latency_buckets.clone(),
            metrics,
            counters,
        }
    }

    /// Sends one probe record to every partition and waits for all outcomes.
    pub async fn send_messages(&self) -> ProduceRound {
        let sends = (0..self.partitions).map(|partition| async move {
            let message = ProbeMessage::new(self.client_id.as_str(), partition);
            let result = match message.encode() {
                Ok(payload) => {
                    self.producer
                        .send(&self.topic, partition, payload.as_bytes())
                        .await
                }
                Err(e) => Err(e),
            };
            (partition, message.timestamp, result, now_ms())
        });

        let mut round = ProduceRound::default();
        for (partition, sent_at, result, acked_at) in join_all(sends).await {
            let partition_label = partition.to_string();
            let labels = [
                ("clientid", self.client_id.as_str()),
                ("partition", partition_label.as_str()),
            ];
            match result {
                Ok(ack) => {
                    #[allow(clippy::cast_precision_loss)]
                    let latency = (acked_at - sent_at).max(0) as f64;
                    debug!(partition, offset = ack.offset, latency_ms = latency, "probe record acknowledged");
                    self.metrics.counter(names::RECORDS_PRODUCED, &labels).increment();
                    self.metrics
                        .histogram(names::RECORDS_PRODUCED_LATENCY, &labels, &self.latency_buckets)
                        .record(latency);
                    self.counters.increment_produced();
                    round.acknowledged += 1;
                }
                Err(e) => {
                    warn!(partition, error = %e, "failed to produce probe record");
                    self.metrics
                        .counter(names::RECORDS_PRODUCED_FAILED, &labels)
                        .increment();
                    round.failed += 1;
                }
            }
        }
        round
    }

    /// Closes the producer.
    pub async fn close(&self) {
        self.producer.close().await;
    }
}

impl std::fmt::Debug for ProducerProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerProbe")
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;

    fn probe(cluster: &MockCluster, partitions: i32) -> (ProducerProbe, Arc<MetricsRegistry>, Arc<MessageCounters>) {
        let mut config = CanaryConfig::default();
        config.expected_cluster_size = partitions;
        let metrics = Arc::new(MetricsRegistry::new());
        let counters = Arc::new(MessageCounters::new());
        let probe = ProducerProbe::new(
            Box::new(cluster.producer()),
            &config,
            Arc::clone(&metrics),
            Arc::clone(&counters),
        );
        (probe, metrics, counters)
    }

    #[tokio::test]
    async fn test_one_record_per_partition() {
        let cluster = MockCluster::with_brokers(3);
        cluster.create_topic_direct("__strimzi_canary", 3, 3);
        let (probe, metrics, counters) = probe(&cluster, 3);

        let round = probe.send_messages().await;
        assert_eq!(round, ProduceRound { acknowledged: 3, failed: 0 });
        assert_eq!(counters.produced(), 3);

        for partition in 0..3 {
            let records = cluster.records("__strimzi_canary", partition);
            assert_eq!(records.len(), 1);
            let message = ProbeMessage::decode(&records[0]).unwrap();
            assert_eq!(message.message_id, partition);
            assert_eq!(message.producer_id, "strimzi-canary-client");

            let p = partition.to_string();
            let labels = [("clientid", "strimzi-canary-client"), ("partition", p.as_str())];
            assert_eq!(metrics.counter(names::RECORDS_PRODUCED, &labels).get(), 1);
            assert_eq!(
                metrics
                    .histogram(names::RECORDS_PRODUCED_LATENCY, &labels, &[])
                    .sample_count(),
                1
            );
        }
    }

    #[tokio::test]
    async fn test_partition_failure_does_not_abort_round() {
        let cluster = MockCluster::with_brokers(3);
        cluster.create_topic_direct("__strimzi_canary", 3, 3);
        cluster.fail_partition(1, true);
        let (probe, metrics, counters) = probe(&cluster, 3);

        let round = probe.send_messages().await;
        assert_eq!(round, ProduceRound { acknowledged: 2, failed: 1 });
        assert_eq!(counters.produced(), 2);
        assert_eq!(
            metrics
                .counter(
                    names::RECORDS_PRODUCED_FAILED,
                    &[("clientid", "strimzi-canary-client"), ("partition", "1")]
                )
                .get(),
            1
        );
        assert_eq!(
            metrics
                .counter(
                    names::RECORDS_PRODUCED,
                    &[("clientid", "strimzi-canary-client"), ("partition", "1")]
                )
                .get(),
            0
        );
    }
}
