//! Cluster client traits.
//!
//! The probes talk to the cluster only through these traits. [`kafka`]
//! provides the `rdkafka` implementations; [`crate::testing`] provides an
//! in-memory cluster.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CanaryError;

pub mod kafka;

pub use kafka::{KafkaAdmin, KafkaProbeConsumer, KafkaProbeProducer};

/// A broker as reported by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    /// Broker id.
    pub id: i32,
    /// Advertised host.
    pub host: String,
    /// Advertised port.
    pub port: u16,
}

/// Partition layout of an existing topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescription {
    /// Topic name.
    pub name: String,
    /// Number of partitions.
    pub partitions: i32,
    /// Replicas of partition 0.
    pub replication_factor: i32,
}

/// A topic creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopicSpec {
    /// Topic name.
    pub name: String,
    /// Number of partitions.
    pub partitions: i32,
    /// Replication factor.
    pub replication_factor: i32,
    /// Topic-level configuration.
    pub config: HashMap<String, String>,
}

/// Broker acknowledgement of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    /// Partition the record landed on.
    pub partition: i32,
    /// Offset assigned to the record.
    pub offset: i64,
}

/// A record returned by a consumer poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset of the record.
    pub offset: i64,
    /// Record value, absent for tombstones.
    pub payload: Option<Vec<u8>>,
}

/// Administrative operations on the cluster.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Lists topic names.
    async fn list_topics(&self) -> Result<Vec<String>, CanaryError>;

    /// Describes one topic.
    async fn describe_topic(&self, name: &str) -> Result<TopicDescription, CanaryError>;

    /// Creates a topic.
    async fn create_topic(&self, spec: &NewTopicSpec) -> Result<(), CanaryError>;

    /// Raises the partition count of a topic to `total`.
    async fn increase_partitions(&self, name: &str, total: i32) -> Result<(), CanaryError>;

    /// Lists the brokers currently in the cluster.
    async fn describe_cluster(&self) -> Result<Vec<BrokerInfo>, CanaryError>;

    /// Releases client resources.
    async fn close(&self);
}

/// Sends probe records to explicit partitions.
#[async_trait]
pub trait ProbeProducer: Send + Sync {
    /// Sends `payload` to `topic`/`partition` with no key or headers and
    /// waits for the acknowledgement.
    async fn send(
        &self,
        topic: &str,
        partition: i32,
        payload: &[u8],
    ) -> Result<DeliveryAck, CanaryError>;

    /// Flushes in-flight records and releases client resources.
    async fn close(&self);
}

/// Reads probe records from explicitly assigned partitions.
#[async_trait]
pub trait ProbeConsumer: Send {
    /// Assigns the consumer to `partitions` of `topic`, without group rebalancing.
    fn assign(&mut self, topic: &str, partitions: &[i32]) -> Result<(), CanaryError>;

    /// Returns the records that arrive within `timeout`.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, CanaryError>;

    /// Commits the current positions synchronously.
    fn commit_sync(&mut self) -> Result<(), CanaryError>;

    /// Drops the current assignment.
    fn unsubscribe(&mut self);

    /// Releases client resources.
    async fn close(&mut self);
}
