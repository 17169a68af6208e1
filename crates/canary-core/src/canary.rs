//! The canary orchestrator.
//!
//! [`Canary`] waits for the cluster to reach its expected size, then runs
//! three periodic tasks until shutdown:
//!
//! - the reconcile task, which keeps the probe topic in shape and runs one
//!   produce round and one consume round in parallel per tick,
//! - the status task, which samples the message counters,
//! - the connection check, which dials every broker.
//!
//! Every probe client is owned by exactly one task and closed by it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::client::{
    ClusterAdmin, KafkaAdmin, KafkaProbeConsumer, KafkaProbeProducer, ProbeConsumer,
    ProbeProducer,
};
use crate::config::CanaryConfig;
use crate::connection::ConnectionChecker;
use crate::consumer::{ConsumeRound, ConsumerProbe};
use crate::counters::MessageCounters;
use crate::error::CanaryError;
use crate::health::CanaryState;
use crate::metrics::{names, MetricsRegistry};
use crate::producer::{ProduceRound, ProducerProbe};
use crate::retry::{with_retry_and_handler, RetryPolicy};
use crate::status::StatusSampler;
use crate::ticker::{spawn_periodic, PeriodicTask, ShutdownSignal};
use crate::topic::{TopicOutcome, TopicReconciler};

/// How long shutdown waits for periodic tasks before aborting them.
pub const TASK_TERMINATION_TIMEOUT: Duration = Duration::from_secs(120);

/// The cluster clients a canary run takes ownership of.
pub struct ProbeClients {
    /// Admin client of the topic reconciler.
    pub admin: Box<dyn ClusterAdmin>,
    /// Probe producer.
    pub producer: Box<dyn ProbeProducer>,
    /// Probe consumer.
    pub consumer: Box<dyn ProbeConsumer>,
    /// Admin client of the connection check.
    pub connection_admin: Box<dyn ClusterAdmin>,
}

impl ProbeClients {
    /// Builds the Kafka clients, retrying each with the bootstrap backoff.
    ///
    /// Every failed attempt increments `client_creation_error_total`.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClientCreation` once a client has used up its
    /// attempts.
    pub async fn connect_kafka(
        config: &CanaryConfig,
        metrics: &MetricsRegistry,
    ) -> Result<Self, CanaryError> {
        let policy = RetryPolicy::from_config(config);
        let admin = create_client(&policy, metrics, "admin", || KafkaAdmin::new(config)).await?;
        let producer =
            create_client(&policy, metrics, "producer", || KafkaProbeProducer::new(config))
                .await?;
        let consumer =
            create_client(&policy, metrics, "consumer", || KafkaProbeConsumer::new(config))
                .await?;
        let connection_admin =
            create_client(&policy, metrics, "connection-admin", || KafkaAdmin::new(config))
                .await?;
        info!(bootstrap_servers = %config.bootstrap_servers, "kafka clients created");

        Ok(Self {
            admin: Box::new(admin),
            producer: Box::new(producer),
            consumer: Box::new(consumer),
            connection_admin: Box::new(connection_admin),
        })
    }
}

impl std::fmt::Debug for ProbeClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeClients").finish_non_exhaustive()
    }
}

async fn create_client<T, F>(
    policy: &RetryPolicy,
    metrics: &MetricsRegistry,
    kind: &'static str,
    mut build: F,
) -> Result<T, CanaryError>
where
    F: FnMut() -> Result<T, CanaryError>,
{
    with_retry_and_handler(
        policy,
        || std::future::ready(build()),
        |attempt, e| {
            metrics.counter(names::CLIENT_CREATION_ERROR, &[]).increment();
            warn!(client = kind, attempt, error = %e, "failed to create client");
        },
    )
    .await
}

/// What one reconcile tick did.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Topic reconciliation result, `None` if it failed.
    pub topic: Option<TopicOutcome>,
    /// Produce round result.
    pub produced: ProduceRound,
    /// Consume round result, `None` if polling or committing failed.
    pub consumed: Option<ConsumeRound>,
}

/// Reconciles the topic and runs the producer and consumer probes.
pub struct ReconcileTask {
    reconciler: TopicReconciler,
    producer: ProducerProbe,
    consumer: ConsumerProbe,
    assigned: bool,
}

impl ReconcileTask {
    /// Creates the task. The consumer is assigned on the first tick.
    #[must_use]
    pub fn new(reconciler: TopicReconciler, producer: ProducerProbe, consumer: ConsumerProbe) -> Self {
        Self {
            reconciler,
            producer,
            consumer,
            assigned: false,
        }
    }

    /// Runs one reconcile pass.
    ///
    /// A topic failure does not skip the probes: their failures are what
    /// the counters are meant to show.
    pub async fn run_once(&mut self) -> ReconcileOutcome {
        let topic = self.reconciler.ensure_topic().await.ok();

        if !self.assigned {
            match self.consumer.assign() {
                Ok(()) => self.assigned = true,
                Err(e) => warn!(error = %e, "failed to assign probe consumer"),
            }
        }

        let assigned = self.assigned;
        let consumer = &mut self.consumer;
        let consume = async move {
            if assigned {
                consumer.receive_messages().await.ok()
            } else {
                None
            }
        };
        let (produced, consumed) = tokio::join!(self.producer.send_messages(), consume);

        ReconcileOutcome {
            topic,
            produced,
            consumed,
        }
    }
}

#[async_trait]
impl PeriodicTask for ReconcileTask {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    async fn tick(&mut self) -> Result<(), CanaryError> {
        let outcome = self.run_once().await;
        if outcome.consumed.is_none() {
            return Err(CanaryError::ConsumeFailed(
                "consume round did not complete".into(),
            ));
        }
        if outcome.produced.failed > 0 {
            return Err(CanaryError::ProduceFailed {
                partition: -1,
                message: format!("{} partitions failed", outcome.produced.failed),
            });
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.producer.close().await;
        self.consumer.close().await;
        self.reconciler.close().await;
    }
}

impl std::fmt::Debug for ReconcileTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileTask")
            .field("reconciler", &self.reconciler)
            .field("producer", &self.producer)
            .field("consumer", &self.consumer)
            .field("assigned", &self.assigned)
            .finish()
    }
}

struct StatusTask {
    sampler: Arc<StatusSampler>,
}

#[async_trait]
impl PeriodicTask for StatusTask {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn tick(&mut self) -> Result<(), CanaryError> {
        self.sampler.sample();
        Ok(())
    }
}

/// Runs the probes against one cluster.
pub struct Canary {
    config: CanaryConfig,
    metrics: Arc<MetricsRegistry>,
    counters: Arc<MessageCounters>,
    sampler: Arc<StatusSampler>,
    state: Arc<RwLock<CanaryState>>,
    shutdown: ShutdownSignal,
}

impl Canary {
    /// Creates a canary with a fresh registry and counters.
    #[must_use]
    pub fn new(config: CanaryConfig) -> Self {
        let counters = Arc::new(MessageCounters::new());
        let sampler = Arc::new(StatusSampler::new(
            config.status_time_window,
            config.status_check_interval,
            Arc::clone(&counters),
        ));
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
            counters,
            sampler,
            state: Arc::new(RwLock::new(CanaryState::Init)),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CanaryConfig {
        &self.config
    }

    /// Returns the shared metrics registry.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Returns the shared message counters.
    #[must_use]
    pub fn counters(&self) -> Arc<MessageCounters> {
        Arc::clone(&self.counters)
    }

    /// Returns the status sampler.
    #[must_use]
    pub fn status_sampler(&self) -> Arc<StatusSampler> {
        Arc::clone(&self.sampler)
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CanaryState {
        *self.state.read()
    }

    /// Returns the signal that stops [`Canary::run`].
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Waits for the cluster, then runs the periodic tasks until shutdown.
    ///
    /// Takes ownership of `clients` and closes all of them before returning.
    /// Shutdown during the cluster wait is a clean exit.
    ///
    /// Steady-state failures are logged and counted rather than returned.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::Internal` if a periodic task panicked outside a
    /// tick or had to be aborted after [`TASK_TERMINATION_TIMEOUT`]. The
    /// canary is `Terminated` either way.
    pub async fn run(&self, clients: ProbeClients) -> Result<(), CanaryError> {
        let ProbeClients {
            admin,
            producer,
            consumer,
            connection_admin,
        } = clients;
        let mut shutdown = self.shutdown.listener();

        let reconciler = TopicReconciler::new(admin, &self.config, self.metrics());
        let producer = ProducerProbe::new(producer, &self.config, self.metrics(), self.counters());
        let mut consumer =
            ConsumerProbe::new(consumer, &self.config, self.metrics(), self.counters());
        let mut connection = ConnectionChecker::new(connection_admin, &self.config, self.metrics());

        self.set_state(CanaryState::WaitForCluster);
        if let Err(e) = reconciler
            .wait_for_cluster(self.config.reconcile_interval, &mut shutdown)
            .await
        {
            info!(error = %e, "stopped while waiting for the cluster");
            self.set_state(CanaryState::ShuttingDown);
            producer.close().await;
            consumer.close().await;
            reconciler.close().await;
            connection.stop().await;
            self.set_state(CanaryState::Terminated);
            return Ok(());
        }

        self.set_state(CanaryState::Running);
        let reconcile = ReconcileTask::new(reconciler, producer, consumer);
        let status = StatusTask {
            sampler: self.status_sampler(),
        };
        let handles = vec![
            spawn_periodic(
                Box::new(reconcile),
                self.config.reconcile_interval,
                self.shutdown.listener(),
            ),
            spawn_periodic(
                Box::new(status),
                self.config.status_check_interval,
                self.shutdown.listener(),
            ),
            spawn_periodic(
                Box::new(connection),
                self.config.connection_check_interval,
                self.shutdown.listener(),
            ),
        ];

        shutdown.cancelled().await;
        self.set_state(CanaryState::ShuttingDown);

        let stopped = join_periodic(handles, TASK_TERMINATION_TIMEOUT).await;
        self.set_state(CanaryState::Terminated);
        stopped
    }

    fn set_state(&self, next: CanaryState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        info!(from = %previous, to = %next, "canary state changed");
    }
}

/// Waits up to `timeout` for the periodic tasks to stop, aborting the
/// stragglers.
async fn join_periodic(handles: Vec<JoinHandle<()>>, timeout: Duration) -> Result<(), CanaryError> {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    match tokio::time::timeout(timeout, join_all(handles)).await {
        Ok(results) => {
            let failed: Vec<String> = results
                .into_iter()
                .filter_map(Result::err)
                .map(|e| e.to_string())
                .collect();
            for error in &failed {
                warn!(%error, "periodic task ended abnormally");
            }
            if failed.is_empty() {
                Ok(())
            } else {
                Err(CanaryError::Internal(format!(
                    "{} periodic task(s) ended abnormally: {}",
                    failed.len(),
                    failed.join("; ")
                )))
            }
        }
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "periodic tasks did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
            Err(CanaryError::Internal(format!(
                "periodic tasks did not stop within {timeout:?}"
            )))
        }
    }
}

impl std::fmt::Debug for Canary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canary")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
