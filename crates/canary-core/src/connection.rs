//! Broker connectivity check.
//!
//! Periodically opens a plain TCP connection to every broker in the cluster
//! and records how long it took, labelled by broker id and outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::client::{BrokerInfo, ClusterAdmin};
use crate::config::CanaryConfig;
use crate::error::CanaryError;
use crate::metrics::{names, MetricsRegistry};
use crate::ticker::PeriodicTask;

/// Connect timeout for one broker.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Outcome of probing one broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerProbe {
    /// Broker id.
    pub broker_id: i32,
    /// Whether the connection was established.
    pub connected: bool,
    /// Time spent connecting or failing, in ms.
    pub latency_ms: f64,
}

/// Owns an admin client used only to discover brokers.
pub struct ConnectionChecker {
    admin: Box<dyn ClusterAdmin>,
    timeout: Duration,
    latency_buckets: Vec<f64>,
    metrics: Arc<MetricsRegistry>,
}

impl ConnectionChecker {
    /// Creates a checker.
    #[must_use]
    pub fn new(
        admin: Box<dyn ClusterAdmin>,
        config: &CanaryConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            admin,
            timeout: CONNECTION_TIMEOUT,
            latency_buckets: config.connection_latency_buckets.clone(),
            metrics,
        }
    }

    /// Overrides the per-broker connect timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probes every broker once.
    ///
    /// # Errors
    ///
    /// Returns `CanaryError::ClusterUnavailable` if the cluster cannot be
    /// described or reports no brokers.
    pub async fn check_connections(&self) -> Result<Vec<BrokerProbe>, CanaryError> {
        let brokers = self.admin.describe_cluster().await.inspect_err(|_| {
            self.metrics
                .counter(names::DESCRIBE_CLUSTER_ERROR, &[])
                .increment();
        })?;
        if brokers.is_empty() {
            return Err(CanaryError::ClusterUnavailable(
                "cluster description returned no brokers".into(),
            ));
        }

        let mut probes = Vec::with_capacity(brokers.len());
        for broker in &brokers {
            probes.push(self.probe(broker).await);
        }
        Ok(probes)
    }

    async fn probe(&self, broker: &BrokerInfo) -> BrokerProbe {
        let start = Instant::now();
        let result =
            tokio::time::timeout(self.timeout, TcpStream::connect((broker.host.as_str(), broker.port))).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let connected = match result {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                warn!(broker = broker.id, host = %broker.host, port = broker.port, error = %e, "broker connection failed");
                false
            }
            Err(_) => {
                warn!(broker = broker.id, host = %broker.host, port = broker.port, "broker connection timed out");
                false
            }
        };

        let broker_id = broker.id.to_string();
        let labels = [
            ("brokerid", broker_id.as_str()),
            ("connected", if connected { "true" } else { "false" }),
        ];
        self.metrics
            .histogram(names::CONNECTION_LATENCY, &labels, &self.latency_buckets)
            .record(latency_ms);
        if !connected {
            self.metrics.counter(names::CONNECTION_ERROR, &labels).increment();
        }
        debug!(broker = broker.id, connected, latency_ms, "broker connection checked");

        BrokerProbe {
            broker_id: broker.id,
            connected,
            latency_ms,
        }
    }
}

#[async_trait]
impl PeriodicTask for ConnectionChecker {
    fn name(&self) -> &'static str {
        "connection-check"
    }

    async fn tick(&mut self) -> Result<(), CanaryError> {
        let probes = self.check_connections().await?;
        let failed = probes.iter().filter(|p| !p.connected).count();
        if failed > 0 {
            return Err(CanaryError::ClusterUnavailable(format!(
                "{failed} of {} brokers unreachable",
                probes.len()
            )));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.admin.close().await;
    }
}

impl std::fmt::Debug for ConnectionChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionChecker")
            .field("timeout", &self.timeout)
            .field("latency_buckets", &self.latency_buckets)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCluster;
    use tokio::net::TcpListener;

    fn checker(cluster: &MockCluster) -> (ConnectionChecker, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let checker = ConnectionChecker::new(
            Box::new(cluster.admin()),
            &CanaryConfig::default(),
            Arc::clone(&metrics),
        )
        .with_timeout(Duration::from_secs(2));
        (checker, metrics)
    }

    #[tokio::test]
    async fn test_reachable_and_unreachable_brokers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();

        // Bind then drop to get a port nothing listens on.
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let cluster = MockCluster::with_brokers(0);
        cluster.add_broker(BrokerInfo { id: 0, host: "127.0.0.1".into(), port: open_port });
        cluster.add_broker(BrokerInfo { id: 1, host: "127.0.0.1".into(), port: closed_port });
        let (checker, metrics) = checker(&cluster);

        let probes = checker.check_connections().await.unwrap();
        assert_eq!(probes.len(), 2);
        assert!(probes[0].connected);
        assert!(!probes[1].connected);

        assert_eq!(
            metrics
                .counter(names::CONNECTION_ERROR, &[("brokerid", "1"), ("connected", "false")])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .histogram(names::CONNECTION_LATENCY, &[("brokerid", "0"), ("connected", "true")], &[])
                .sample_count(),
            1
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_empty_cluster_is_an_error() {
        let cluster = MockCluster::with_brokers(0);
        let (mut checker, _) = checker(&cluster);
        assert!(checker.tick().await.is_err());
    }

    #[tokio::test]
    async fn test_describe_failure_is_counted() {
        let cluster = MockCluster::with_brokers(1);
        cluster.fail_admin(true);
        let (checker, metrics) = checker(&cluster);
        assert!(checker.check_connections().await.is_err());
        assert_eq!(metrics.counter(names::DESCRIBE_CLUSTER_ERROR, &[]).get(), 1);
    }
}
