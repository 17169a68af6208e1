//! Testing utilities for the probes.
//!
//! [`MockCluster`] is an in-memory stand-in for a Kafka cluster. Its admin,
//! producer and consumer handles implement the client traits and share one
//! state, so a test can drive the probes and inspect what they did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{
    BrokerInfo, ClusterAdmin, ConsumedRecord, DeliveryAck, NewTopicSpec, ProbeConsumer,
    ProbeProducer, TopicDescription,
};
use crate::error::CanaryError;

/// A topic held by a [`MockCluster`].
#[derive(Debug, Clone, Default)]
pub struct MockTopic {
    /// Number of partitions.
    pub partitions: i32,
    /// Replication factor.
    pub replication_factor: i32,
    /// Topic configuration.
    pub config: HashMap<String, String>,
    logs: Vec<Vec<Option<Vec<u8>>>>,
}

impl MockTopic {
    fn new(partitions: i32, replication_factor: i32, config: HashMap<String, String>) -> Self {
        let mut topic = Self {
            partitions: 0,
            replication_factor,
            config,
            logs: Vec::new(),
        };
        topic.widen(partitions);
        topic
    }

    fn widen(&mut self, partitions: i32) {
        self.partitions = partitions;
        self.logs
            .resize_with(usize::try_from(partitions).unwrap_or(0), Vec::new);
    }

    fn log(&self, partition: i32) -> Option<&Vec<Option<Vec<u8>>>> {
        usize::try_from(partition).ok().and_then(|p| self.logs.get(p))
    }

    fn log_mut(&mut self, partition: i32) -> Option<&mut Vec<Option<Vec<u8>>>> {
        usize::try_from(partition).ok().and_then(|p| self.logs.get_mut(p))
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    brokers: Vec<BrokerInfo>,
    topics: HashMap<String, MockTopic>,
    committed: HashMap<(String, i32), i64>,
    failing_partitions: Vec<i32>,
    fail_admin: bool,
    fail_topic_creation: bool,
    fail_consume: bool,
    fail_commit: bool,
    closed: usize,
}

/// In-memory cluster shared by its client handles.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    /// Creates a cluster of `n` brokers on `127.0.0.1:9092+i`.
    #[must_use]
    pub fn with_brokers(n: usize) -> Self {
        let cluster = Self::default();
        cluster.set_brokers(n);
        cluster
    }

    /// Returns an admin handle.
    #[must_use]
    pub fn admin(&self) -> MockAdmin {
        MockAdmin {
            cluster: self.clone(),
        }
    }

    /// Returns a producer handle.
    #[must_use]
    pub fn producer(&self) -> MockProducer {
        MockProducer {
            cluster: self.clone(),
        }
    }

    /// Returns an unassigned consumer handle.
    #[must_use]
    pub fn consumer(&self) -> MockConsumer {
        MockConsumer {
            cluster: self.clone(),
            topic: None,
            positions: HashMap::new(),
        }
    }

    /// Replaces the broker list with `n` brokers.
    pub fn set_brokers(&self, n: usize) {
        let brokers = (0..n)
            .map(|i| BrokerInfo {
                id: i32::try_from(i).unwrap_or(i32::MAX),
                host: "127.0.0.1".to_string(),
                port: u16::try_from(9092 + i).unwrap_or(u16::MAX),
            })
            .collect();
        self.state.lock().brokers = brokers;
    }

    /// Adds one broker.
    pub fn add_broker(&self, broker: BrokerInfo) {
        self.state.lock().brokers.push(broker);
    }

    /// Creates a topic without going through the admin handle.
    pub fn create_topic_direct(&self, name: &str, partitions: i32, replication_factor: i32) {
        self.state.lock().topics.insert(
            name.to_string(),
            MockTopic::new(partitions, replication_factor, HashMap::new()),
        );
    }

    /// Returns a snapshot of a topic.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<MockTopic> {
        self.state.lock().topics.get(name).cloned()
    }

    /// Appends a record to a partition log.
    ///
    /// # Panics
    ///
    /// Panics if the topic or partition does not exist.
    pub fn append(&self, topic: &str, partition: i32, payload: Option<Vec<u8>>) {
        let mut state = self.state.lock();
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.log_mut(partition))
            .expect("append to unknown topic partition");
        log.push(payload);
    }

    /// Returns the non-tombstone payloads of a partition log, oldest first.
    #[must_use]
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.log(partition))
            .map(|log| log.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the committed offset of a partition.
    #[must_use]
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Number of client handles that have been closed.
    #[must_use]
    pub fn closed_clients(&self) -> usize {
        self.state.lock().closed
    }

    /// Makes list, describe and cluster-describe calls fail.
    pub fn fail_admin(&self, fail: bool) {
        self.state.lock().fail_admin = fail;
    }

    /// Makes topic creation fail.
    pub fn fail_topic_creation(&self, fail: bool) {
        self.state.lock().fail_topic_creation = fail;
    }

    /// Makes sends to `partition` fail.
    pub fn fail_partition(&self, partition: i32, fail: bool) {
        let mut state = self.state.lock();
        state.failing_partitions.retain(|p| *p != partition);
        if fail {
            state.failing_partitions.push(partition);
        }
    }

    /// Makes consumer polls fail.
    pub fn fail_consume(&self, fail: bool) {
        self.state.lock().fail_consume = fail;
    }

    /// Makes offset commits fail.
    pub fn fail_commit(&self, fail: bool) {
        self.state.lock().fail_commit = fail;
    }

    fn mark_closed(&self) {
        self.state.lock().closed += 1;
    }
}

/// Admin handle of a [`MockCluster`].
#[derive(Debug, Clone)]
pub struct MockAdmin {
    cluster: MockCluster,
}

impl MockAdmin {
    fn check_available(&self) -> Result<(), CanaryError> {
        if self.cluster.state.lock().fail_admin {
            return Err(CanaryError::ClusterUnavailable(
                "mock cluster is unreachable".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterAdmin for MockAdmin {
    async fn list_topics(&self) -> Result<Vec<String>, CanaryError> {
        self.check_available()?;
        let mut names: Vec<String> = self.cluster.state.lock().topics.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn describe_topic(&self, name: &str) -> Result<TopicDescription, CanaryError> {
        self.check_available()?;
        let state = self.cluster.state.lock();
        let topic = state.topics.get(name).ok_or_else(|| {
            CanaryError::ClusterUnavailable(format!("unknown topic '{name}'"))
        })?;
        Ok(TopicDescription {
            name: name.to_string(),
            partitions: topic.partitions,
            replication_factor: topic.replication_factor,
        })
    }

    async fn create_topic(&self, spec: &NewTopicSpec) -> Result<(), CanaryError> {
        let mut state = self.cluster.state.lock();
        if state.fail_topic_creation {
            return Err(CanaryError::TopicOperation(format!(
                "creation of '{}' rejected",
                spec.name
            )));
        }
        if state.topics.contains_key(&spec.name) {
            return Err(CanaryError::TopicOperation(format!(
                "topic '{}' already exists",
                spec.name
            )));
        }
        state.topics.insert(
            spec.name.clone(),
            MockTopic::new(spec.partitions, spec.replication_factor, spec.config.clone()),
        );
        Ok(())
    }

    async fn increase_partitions(&self, name: &str, total: i32) -> Result<(), CanaryError> {
        let mut state = self.cluster.state.lock();
        let topic = state
            .topics
            .get_mut(name)
            .ok_or_else(|| CanaryError::TopicOperation(format!("unknown topic '{name}'")))?;
        if total <= topic.partitions {
            return Err(CanaryError::TopicOperation(format!(
                "topic '{name}' already has {} partitions",
                topic.partitions
            )));
        }
        topic.widen(total);
        Ok(())
    }

    async fn describe_cluster(&self) -> Result<Vec<BrokerInfo>, CanaryError> {
        self.check_available()?;
        Ok(self.cluster.state.lock().brokers.clone())
    }

    async fn close(&self) {
        self.cluster.mark_closed();
    }
}

/// Producer handle of a [`MockCluster`].
#[derive(Debug, Clone)]
pub struct MockProducer {
    cluster: MockCluster,
}

#[async_trait]
impl ProbeProducer for MockProducer {
    async fn send(
        &self,
        topic: &str,
        partition: i32,
        payload: &[u8],
    ) -> Result<DeliveryAck, CanaryError> {
        let mut state = self.cluster.state.lock();
        if state.failing_partitions.contains(&partition) {
            return Err(CanaryError::ProduceFailed {
                partition,
                message: "partition leader unavailable".into(),
            });
        }
        let log = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.log_mut(partition))
            .ok_or_else(|| CanaryError::ProduceFailed {
                partition,
                message: format!("unknown partition of '{topic}'"),
            })?;
        log.push(Some(payload.to_vec()));
        Ok(DeliveryAck {
            partition,
            offset: i64::try_from(log.len()).unwrap_or(i64::MAX) - 1,
        })
    }

    async fn close(&self) {
        self.cluster.mark_closed();
    }
}

/// Consumer handle of a [`MockCluster`].
///
/// Starts from the committed offset of each partition, or from the log start
/// when nothing was committed.
#[derive(Debug)]
pub struct MockConsumer {
    cluster: MockCluster,
    topic: Option<String>,
    positions: HashMap<i32, i64>,
}

#[async_trait]
impl ProbeConsumer for MockConsumer {
    fn assign(&mut self, topic: &str, partitions: &[i32]) -> Result<(), CanaryError> {
        let state = self.cluster.state.lock();
        self.positions = partitions
            .iter()
            .map(|&p| {
                let start = state
                    .committed
                    .get(&(topic.to_string(), p))
                    .copied()
                    .unwrap_or(0);
                (p, start)
            })
            .collect();
        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, CanaryError> {
        let records = {
            let state = self.cluster.state.lock();
            if state.fail_consume {
                return Err(CanaryError::ConsumeFailed("mock fetch failed".into()));
            }
            let mut records = Vec::new();
            if let Some(topic) = self.topic.as_ref().and_then(|t| state.topics.get(t)) {
                let mut partitions: Vec<i32> = self.positions.keys().copied().collect();
                partitions.sort_unstable();
                for partition in partitions {
                    let Some(log) = topic.log(partition) else {
                        continue;
                    };
                    let position = self.positions.entry(partition).or_insert(0);
                    let start = usize::try_from(*position).unwrap_or(0);
                    for (i, payload) in log.iter().enumerate().skip(start) {
                        records.push(ConsumedRecord {
                            partition,
                            offset: i64::try_from(i).unwrap_or(i64::MAX),
                            payload: payload.clone(),
                        });
                    }
                    *position = i64::try_from(log.len()).unwrap_or(i64::MAX);
                }
            }
            records
        };

        if records.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(records)
    }

    fn commit_sync(&mut self) -> Result<(), CanaryError> {
        let Some(topic) = &self.topic else {
            return Ok(());
        };
        let mut state = self.cluster.state.lock();
        if state.fail_commit {
            return Err(CanaryError::ConsumeFailed("mock commit failed".into()));
        }
        for (&partition, &position) in &self.positions {
            state.committed.insert((topic.clone(), partition), position);
        }
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.topic = None;
        self.positions.clear();
    }

    async fn close(&mut self) {
        self.cluster.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_consumer_resumes_from_commit() {
        let cluster = MockCluster::with_brokers(1);
        cluster.create_topic_direct("t", 1, 1);
        cluster.append("t", 0, Some(b"a".to_vec()));

        let mut first = cluster.consumer();
        first.assign("t", &[0]).unwrap();
        assert_eq!(first.poll(Duration::from_millis(1)).await.unwrap().len(), 1);
        first.commit_sync().unwrap();

        cluster.append("t", 0, Some(b"b".to_vec()));
        let mut second = cluster.consumer();
        second.assign("t", &[0]).unwrap();
        let records = second.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, 1);
        assert_eq!(records[0].payload.as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn test_widen_keeps_existing_records() {
        let cluster = MockCluster::with_brokers(1);
        cluster.create_topic_direct("t", 1, 1);
        cluster.append("t", 0, Some(b"a".to_vec()));
        cluster.admin().increase_partitions("t", 3).await.unwrap();

        let topic = cluster.topic("t").unwrap();
        assert_eq!(topic.partitions, 3);
        assert_eq!(cluster.records("t", 0).len(), 1);
        assert!(cluster.records("t", 2).is_empty());
    }
}
