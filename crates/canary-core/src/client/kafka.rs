//! `rdkafka`-backed cluster clients.
//!
//! Metadata requests are blocking calls in librdkafka, so they run on the
//! blocking pool with a timeout equal to the reconcile interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::admin::{AdminClient, AdminOptions, NewPartitions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{
    BrokerInfo, ClusterAdmin, ConsumedRecord, DeliveryAck, NewTopicSpec, ProbeConsumer,
    ProbeProducer, TopicDescription,
};
use crate::config::CanaryConfig;
use crate::error::CanaryError;

/// Admin client for topic management and cluster description.
///
/// [`ClusterAdmin::close`] drops the client; requests issued afterwards fail
/// with `CanaryError::ClusterUnavailable`. A metadata request already on the
/// blocking pool keeps its own handle until it returns.
pub struct KafkaAdmin {
    admin: Mutex<Option<Arc<AdminClient<DefaultClientContext>>>>,
    timeout: Duration,
}

impl KafkaAdmin {
    /// Creates an admin client.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClientCreation` if librdkafka rejects the configuration.
    pub fn new(config: &CanaryConfig) -> Result<Self, CanaryError> {
        info!(brokers = %config.bootstrap_servers, "creating Kafka admin client");
        let admin: AdminClient<DefaultClientContext> =
            config.to_admin_config().create().map_err(|e| {
                CanaryError::ClientCreation(format!("failed to create admin client: {e}"))
            })?;
        Ok(Self {
            admin: Mutex::new(Some(Arc::new(admin))),
            timeout: config.reconcile_interval,
        })
    }

    fn client(&self) -> Result<Arc<AdminClient<DefaultClientContext>>, CanaryError> {
        self.admin
            .lock()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| CanaryError::ClusterUnavailable("admin client is closed".into()))
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new().request_timeout(Some(self.timeout))
    }

    /// Fetches cluster metadata and maps it on the blocking thread.
    async fn with_metadata<T, F>(&self, topic: Option<&str>, map: F) -> Result<T, CanaryError>
    where
        T: Send + 'static,
        F: FnOnce(&Metadata) -> Result<T, CanaryError> + Send + 'static,
    {
        let admin = self.client()?;
        let topic = topic.map(str::to_string);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let metadata = admin
                .inner()
                .fetch_metadata(topic.as_deref(), timeout)
                .map_err(|e| {
                    CanaryError::ClusterUnavailable(format!("metadata request failed: {e}"))
                })?;
            map(&metadata)
        })
        .await
        .map_err(|e| CanaryError::Internal(format!("metadata task failed: {e}")))?
    }
}

#[async_trait]
impl ClusterAdmin for KafkaAdmin {
    async fn list_topics(&self) -> Result<Vec<String>, CanaryError> {
        self.with_metadata(None, |metadata| {
            Ok(metadata
                .topics()
                .iter()
                .filter(|t| t.error().is_none())
                .map(|t| t.name().to_string())
                .collect())
        })
        .await
    }

    async fn describe_topic(&self, name: &str) -> Result<TopicDescription, CanaryError> {
        let wanted = name.to_string();
        self.with_metadata(Some(name), move |metadata| {
            let name = wanted;
            let topic = metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| {
                    CanaryError::ClusterUnavailable(format!("topic '{name}' missing from metadata"))
                })?;
            if let Some(err) = topic.error() {
                return Err(CanaryError::ClusterUnavailable(format!(
                    "topic '{name}' metadata error: {:?}",
                    RDKafkaErrorCode::from(err)
                )));
            }
            let partitions = i32::try_from(topic.partitions().len()).unwrap_or(i32::MAX);
            let replication_factor = topic
                .partitions()
                .iter()
                .find(|p| p.id() == 0)
                .map_or(0, |p| i32::try_from(p.replicas().len()).unwrap_or(i32::MAX));
            Ok(TopicDescription {
                name,
                partitions,
                replication_factor,
            })
        })
        .await
    }

    async fn create_topic(&self, spec: &NewTopicSpec) -> Result<(), CanaryError> {
        let mut topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        for (key, value) in &spec.config {
            topic = topic.set(key, value);
        }

        let results = self
            .client()?
            .create_topics(&[topic], &self.options())
            .await
            .map_err(|e| CanaryError::TopicOperation(format!("create topic request failed: {e}")))?;

        for result in results {
            if let Err((name, code)) = result {
                return Err(CanaryError::TopicOperation(format!(
                    "failed to create topic '{name}': {code}"
                )));
            }
        }
        Ok(())
    }

    async fn increase_partitions(&self, name: &str, total: i32) -> Result<(), CanaryError> {
        let count = usize::try_from(total)
            .map_err(|_| CanaryError::Internal(format!("invalid partition count {total}")))?;
        let results = self
            .client()?
            .create_partitions(&[NewPartitions::new(name, count)], &self.options())
            .await
            .map_err(|e| {
                CanaryError::TopicOperation(format!("create partitions request failed: {e}"))
            })?;

        for result in results {
            if let Err((name, code)) = result {
                return Err(CanaryError::TopicOperation(format!(
                    "failed to increase partitions of '{name}': {code}"
                )));
            }
        }
        Ok(())
    }

    async fn describe_cluster(&self) -> Result<Vec<BrokerInfo>, CanaryError> {
        self.with_metadata(None, |metadata| {
            Ok(metadata
                .brokers()
                .iter()
                .map(|b| BrokerInfo {
                    id: b.id(),
                    host: b.host().to_string(),
                    port: u16::try_from(b.port()).unwrap_or_default(),
                })
                .collect())
        })
        .await
    }

    async fn close(&self) {
        if self.admin.lock().take().is_some() {
            info!("closing Kafka admin client");
        }
    }
}

impl std::fmt::Debug for KafkaAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaAdmin")
            .field("open", &self.admin.lock().is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Producer sending one probe record per partition.
pub struct KafkaProbeProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProbeProducer {
    /// Creates a producer with `acks=all` and a delivery timeout equal to the
    /// reconcile interval.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClientCreation` if librdkafka rejects the configuration.
    pub fn new(config: &CanaryConfig) -> Result<Self, CanaryError> {
        info!(
            brokers = %config.bootstrap_servers,
            client_id = %config.client_id,
            "creating Kafka probe producer"
        );
        let producer: FutureProducer = config.to_producer_config().create().map_err(|e| {
            CanaryError::ClientCreation(format!("failed to create producer: {e}"))
        })?;
        Ok(Self {
            producer,
            timeout: config.reconcile_interval,
        })
    }
}

#[async_trait]
impl ProbeProducer for KafkaProbeProducer {
    async fn send(
        &self,
        topic: &str,
        partition: i32,
        payload: &[u8],
    ) -> Result<DeliveryAck, CanaryError> {
        let record = FutureRecord::<(), [u8]>::to(topic)
            .partition(partition)
            .payload(payload);
        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| CanaryError::ProduceFailed {
                partition,
                message: e.to_string(),
            })?;
        Ok(DeliveryAck { partition, offset })
    }

    async fn close(&self) {
        info!("closing Kafka probe producer");
        let producer = self.producer.clone();
        let timeout = self.timeout;
        match tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to flush probe producer"),
            Err(e) => warn!(error = %e, "producer flush task failed"),
        }
    }
}

impl std::fmt::Debug for KafkaProbeProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProbeProducer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Consumer manually assigned to every probe partition.
pub struct KafkaProbeConsumer {
    /// rdkafka consumer (cleared on `close()`).
    consumer: Option<StreamConsumer>,
    /// Current assignment, for logging.
    assigned: Vec<i32>,
}

impl KafkaProbeConsumer {
    /// Creates a consumer starting from the earliest offset when none is committed.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClientCreation` if librdkafka rejects the configuration.
    pub fn new(config: &CanaryConfig) -> Result<Self, CanaryError> {
        info!(
            brokers = %config.bootstrap_servers,
            group_id = %config.consumer_group_id,
            "creating Kafka probe consumer"
        );
        let consumer: StreamConsumer = config.to_consumer_config().create().map_err(|e| {
            CanaryError::ClientCreation(format!("failed to create consumer: {e}"))
        })?;
        Ok(Self {
            consumer: Some(consumer),
            assigned: Vec::new(),
        })
    }

    fn consumer(&self) -> Result<&StreamConsumer, CanaryError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| CanaryError::ConsumeFailed("consumer is closed".into()))
    }
}

#[async_trait]
impl ProbeConsumer for KafkaProbeConsumer {
    fn assign(&mut self, topic: &str, partitions: &[i32]) -> Result<(), CanaryError> {
        let mut tpl = TopicPartitionList::new();
        for &partition in partitions {
            tpl.add_partition_offset(topic, partition, Offset::Stored)
                .map_err(|e| CanaryError::ConsumeFailed(format!("invalid partition: {e}")))?;
        }
        self.consumer()?
            .assign(&tpl)
            .map_err(|e| CanaryError::ConsumeFailed(format!("failed to assign: {e}")))?;
        self.assigned = partitions.to_vec();
        info!(topic, partitions = ?self.assigned, "probe consumer assigned");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumedRecord>, CanaryError> {
        let consumer = self.consumer()?;
        let mut records = Vec::new();

        let poll_start = Instant::now();
        while poll_start.elapsed() < timeout {
            let remaining = timeout.saturating_sub(poll_start.elapsed());
            match tokio::time::timeout(remaining, consumer.recv()).await {
                Ok(Ok(msg)) => {
                    debug!(partition = msg.partition(), offset = msg.offset(), "received probe record");
                    records.push(ConsumedRecord {
                        partition: msg.partition(),
                        offset: msg.offset(),
                        payload: msg.payload().map(<[u8]>::to_vec),
                    });
                }
                Ok(Err(e)) => {
                    return Err(CanaryError::ConsumeFailed(format!("poll failed: {e}")));
                }
                Err(_) => break,
            }
        }
        Ok(records)
    }

    fn commit_sync(&mut self) -> Result<(), CanaryError> {
        match self.consumer()?.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(CanaryError::ConsumeFailed(format!("commit failed: {e}"))),
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(consumer) = &self.consumer {
            if let Err(e) = consumer.unassign() {
                warn!(error = %e, "failed to unassign probe consumer");
            }
            consumer.unsubscribe();
        }
        self.assigned.clear();
    }

    async fn close(&mut self) {
        info!("closing Kafka probe consumer");
        self.unsubscribe();
        self.consumer = None;
    }
}

impl std::fmt::Debug for KafkaProbeConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProbeConsumer")
            .field("open", &self.consumer.is_some())
            .field("assigned", &self.assigned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_admin_rejects_requests() {
        // Client creation does not contact the brokers.
        let admin = KafkaAdmin::new(&CanaryConfig::default()).unwrap();
        assert!(format!("{admin:?}").contains("open: true"));

        admin.close().await;
        admin.close().await;
        assert!(format!("{admin:?}").contains("open: false"));

        let err = admin.list_topics().await.unwrap_err();
        assert!(matches!(err, CanaryError::ClusterUnavailable(ref msg) if msg.contains("closed")));
        let spec = NewTopicSpec {
            name: "t".into(),
            partitions: 1,
            replication_factor: 1,
            config: Default::default(),
        };
        assert!(admin.create_topic(&spec).await.is_err());
    }
}
