//! Probe topic reconciliation.
//!
//! [`TopicReconciler`] keeps the probe topic at one partition per expected
//! broker. It creates the topic when missing and widens it when it has too
//! few partitions. It never narrows a topic or touches its replication
//! factor once created.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::{ClusterAdmin, NewTopicSpec};
use crate::config::CanaryConfig;
use crate::error::CanaryError;
use crate::metrics::{names, MetricsRegistry};
use crate::ticker::ShutdownListener;

/// Topic option forced on the probe topic.
pub const CLEANUP_POLICY: &str = "cleanup.policy";

/// What a reconcile pass did to the probe topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicOutcome {
    /// The topic was missing and has been created.
    Created,
    /// The topic had fewer partitions than expected and has been widened.
    Widened {
        /// Partition count before widening.
        from: i32,
    },
    /// The topic already matched the expected size.
    Unchanged,
    /// The topic has more partitions than expected; left alone.
    Oversized {
        /// Partition count found on the cluster.
        partitions: i32,
    },
}

/// Owns the admin client and reconciles the probe topic.
pub struct TopicReconciler {
    admin: Box<dyn ClusterAdmin>,
    topic: String,
    topic_config: HashMap<String, String>,
    expected: i32,
    metrics: Arc<MetricsRegistry>,
}

impl TopicReconciler {
    /// Creates a reconciler for the configured probe topic.
    #[must_use]
    pub fn new(
        admin: Box<dyn ClusterAdmin>,
        config: &CanaryConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            admin,
            topic: config.topic.clone(),
            topic_config: config.topic_config.clone(),
            expected: config.expected_cluster_size,
            metrics,
        }
    }

    /// Returns the probe topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the expected cluster size.
    #[must_use]
    pub fn expected_cluster_size(&self) -> i32 {
        self.expected
    }

    /// Builds the creation request: `expected` partitions and replicas, with
    /// `cleanup.policy=delete` overriding any configured value.
    #[must_use]
    pub fn topic_spec(&self) -> NewTopicSpec {
        let mut config = self.topic_config.clone();
        config.insert(CLEANUP_POLICY.to_string(), "delete".to_string());
        NewTopicSpec {
            name: self.topic.clone(),
            partitions: self.expected,
            replication_factor: self.expected,
            config,
        }
    }

    /// Brings the probe topic in line with the expected cluster size.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClusterUnavailable` if the topic cannot be listed
    /// or described, and `CanaryError::TopicOperation` if creating or
    /// widening it fails. Both are counted.
    pub async fn ensure_topic(&self) -> Result<TopicOutcome, CanaryError> {
        let topics = self.admin.list_topics().await.inspect_err(|e| {
            self.count_describe_error();
            warn!(topic = %self.topic, error = %e, "failed to list topics");
        })?;

        if !topics.iter().any(|t| t == &self.topic) {
            let spec = self.topic_spec();
            info!(
                topic = %self.topic,
                partitions = spec.partitions,
                replication_factor = spec.replication_factor,
                "creating probe topic"
            );
            self.admin.create_topic(&spec).await.inspect_err(|e| {
                self.metrics
                    .counter(names::TOPIC_CREATION_FAILED, &[("topic", self.topic.as_str())])
                    .increment();
                warn!(topic = %self.topic, error = %e, "failed to create probe topic");
            })?;
            return Ok(TopicOutcome::Created);
        }

        let description = self.admin.describe_topic(&self.topic).await.inspect_err(|e| {
            self.count_describe_error();
            warn!(topic = %self.topic, error = %e, "failed to describe probe topic");
        })?;

        match description.partitions.cmp(&self.expected) {
            std::cmp::Ordering::Less => {
                info!(
                    topic = %self.topic,
                    from = description.partitions,
                    to = self.expected,
                    "widening probe topic"
                );
                self.admin
                    .increase_partitions(&self.topic, self.expected)
                    .await
                    .inspect_err(|e| {
                        warn!(topic = %self.topic, error = %e, "failed to widen probe topic");
                    })?;
                Ok(TopicOutcome::Widened {
                    from: description.partitions,
                })
            }
            std::cmp::Ordering::Greater => {
                let shape = CanaryError::TopicShape {
                    topic: self.topic.clone(),
                    partitions: description.partitions,
                    expected: self.expected,
                };
                warn!(error = %shape, "probe topic is wider than the cluster, leaving it as is");
                Ok(TopicOutcome::Oversized {
                    partitions: description.partitions,
                })
            }
            std::cmp::Ordering::Equal => Ok(TopicOutcome::Unchanged),
        }
    }

    /// Describes the cluster once and checks it has at least `expected` brokers.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClusterUnavailable` if the cluster cannot be
    /// described or is too small. Both are counted.
    pub async fn check_cluster_size(&self) -> Result<usize, CanaryError> {
        let brokers = self.admin.describe_cluster().await.inspect_err(|_| {
            self.metrics
                .counter(names::DESCRIBE_CLUSTER_ERROR, &[])
                .increment();
        })?;

        let expected = usize::try_from(self.expected).unwrap_or(usize::MAX);
        if brokers.len() < expected {
            self.metrics
                .counter(names::EXPECTED_CLUSTER_SIZE_ERROR, &[])
                .increment();
            return Err(CanaryError::ClusterUnavailable(format!(
                "cluster has {} brokers, expected {}",
                brokers.len(),
                self.expected
            )));
        }
        Ok(brokers.len())
    }

    /// Polls the cluster every `interval` until it has the expected size.
    ///
    /// There is no attempt limit.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::Cancelled` if shutdown is requested first.
    pub async fn wait_for_cluster(
        &self,
        interval: Duration,
        shutdown: &mut ShutdownListener,
    ) -> Result<usize, CanaryError> {
        loop {
            if shutdown.is_cancelled() {
                return Err(CanaryError::Cancelled);
            }
            match self.check_cluster_size().await {
                Ok(brokers) => {
                    info!(brokers, expected = self.expected, "cluster reached the expected size");
                    return Ok(brokers);
                }
                Err(e) => warn!(expected = self.expected, error = %e, "waiting for the cluster"),
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Err(CanaryError::Cancelled),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Closes the admin client.
    pub async fn close(&self) {
        self.admin.close().await;
    }

    fn count_describe_error(&self) {
        self.metrics
            .counter(names::TOPIC_DESCRIBE_ERROR, &[("topic", self.topic.as_str())])
            .increment();
    }
}

impl std::fmt::Debug for TopicReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicReconciler")
            .field("topic", &self.topic)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;
    use crate::ticker::ShutdownSignal;

    fn reconciler(cluster: &MockCluster, expected: i32) -> (TopicReconciler, Arc<MetricsRegistry>) {
        let mut config = CanaryConfig::default();
        config.expected_cluster_size = expected;
        config.topic_config.insert("retention.ms".into(), "600000".into());
        config.topic_config.insert(CLEANUP_POLICY.into(), "compact".into());
        let metrics = Arc::new(MetricsRegistry::new());
        (
            TopicReconciler::new(Box::new(cluster.admin()), &config, Arc::clone(&metrics)),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_creates_missing_topic() {
        let cluster = MockCluster::with_brokers(3);
        let (reconciler, _) = reconciler(&cluster, 3);

        assert_eq!(reconciler.ensure_topic().await.unwrap(), TopicOutcome::Created);
        let topic = cluster.topic("__strimzi_canary").unwrap();
        assert_eq!(topic.partitions, 3);
        assert_eq!(topic.replication_factor, 3);
        assert_eq!(topic.config[CLEANUP_POLICY], "delete");
        assert_eq!(topic.config["retention.ms"], "600000");

        assert_eq!(reconciler.ensure_topic().await.unwrap(), TopicOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_widens_narrow_topic() {
        let cluster = MockCluster::with_brokers(3);
        cluster.create_topic_direct("__strimzi_canary", 1, 1);
        let (reconciler, _) = reconciler(&cluster, 3);

        assert_eq!(
            reconciler.ensure_topic().await.unwrap(),
            TopicOutcome::Widened { from: 1 }
        );
        let topic = cluster.topic("__strimzi_canary").unwrap();
        assert_eq!(topic.partitions, 3);
        assert_eq!(topic.replication_factor, 1);
    }

    #[tokio::test]
    async fn test_never_narrows() {
        let cluster = MockCluster::with_brokers(3);
        cluster.create_topic_direct("__strimzi_canary", 5, 3);
        let (reconciler, _) = reconciler(&cluster, 3);

        assert_eq!(
            reconciler.ensure_topic().await.unwrap(),
            TopicOutcome::Oversized { partitions: 5 }
        );
        assert_eq!(cluster.topic("__strimzi_canary").unwrap().partitions, 5);
    }

    #[tokio::test]
    async fn test_creation_failure_is_counted() {
        let cluster = MockCluster::with_brokers(1);
        cluster.fail_topic_creation(true);
        let (reconciler, metrics) = reconciler(&cluster, 1);

        assert!(reconciler.ensure_topic().await.is_err());
        assert_eq!(
            metrics
                .counter(names::TOPIC_CREATION_FAILED, &[("topic", "__strimzi_canary")])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_list_failure_is_counted() {
        let cluster = MockCluster::with_brokers(1);
        cluster.fail_admin(true);
        let (reconciler, metrics) = reconciler(&cluster, 1);

        let err = reconciler.ensure_topic().await.unwrap_err();
        assert!(matches!(err, CanaryError::ClusterUnavailable(_)));
        assert_eq!(
            metrics
                .counter(names::TOPIC_DESCRIBE_ERROR, &[("topic", "__strimzi_canary")])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_cluster_size_check() {
        let cluster = MockCluster::with_brokers(1);
        let (reconciler, metrics) = reconciler(&cluster, 3);

        assert!(reconciler.check_cluster_size().await.is_err());
        assert!(reconciler.check_cluster_size().await.is_err());
        assert_eq!(
            metrics.counter(names::EXPECTED_CLUSTER_SIZE_ERROR, &[]).get(),
            2
        );

        cluster.set_brokers(3);
        assert_eq!(reconciler.check_cluster_size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_cluster_completes_when_brokers_join() {
        let cluster = MockCluster::with_brokers(1);
        let (reconciler, metrics) = reconciler(&cluster, 2);
        let signal = ShutdownSignal::new();
        let mut listener = signal.listener();

        let joiner = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cluster.set_brokers(2);
            })
        };

        let brokers = reconciler
            .wait_for_cluster(Duration::from_millis(5), &mut listener)
            .await
            .unwrap();
        joiner.await.unwrap();
        assert_eq!(brokers, 2);
        assert!(metrics.counter(names::EXPECTED_CLUSTER_SIZE_ERROR, &[]).get() >= 1);
    }

    #[tokio::test]
    async fn test_wait_for_cluster_is_cancellable() {
        let cluster = MockCluster::with_brokers(0);
        let (reconciler, metrics) = reconciler(&cluster, 1);
        let signal = ShutdownSignal::new();
        let mut listener = signal.listener();

        let trigger = {
            let signal = signal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                signal.trigger();
            })
        };

        let err = reconciler
            .wait_for_cluster(Duration::from_millis(5), &mut listener)
            .await
            .unwrap_err();
        trigger.await.unwrap();
        assert!(matches!(err, CanaryError::Cancelled));
        assert!(metrics.counter(names::EXPECTED_CLUSTER_SIZE_ERROR, &[]).get() >= 1);
    }

    #[tokio::test]
    async fn test_describe_cluster_failure_is_counted() {
        let cluster = MockCluster::with_brokers(1);
        cluster.fail_admin(true);
        let (reconciler, metrics) = reconciler(&cluster, 1);
        assert!(reconciler.check_cluster_size().await.is_err());
        assert_eq!(metrics.counter(names::DESCRIBE_CLUSTER_ERROR, &[]).get(), 1);
    }
}
