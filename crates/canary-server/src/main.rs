//! Kafka canary server

mod http;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use canary_core::{Canary, CanaryConfig, ProbeClients};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::http::HttpServer;

/// Kafka canary - synthetic produce/consume probe for a Kafka cluster
///
/// Cluster and probe settings are read from the environment
/// (`KAFKA_BOOTSTRAP_SERVERS`, `EXPECTED_CLUSTER_SIZE`, ...).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level
    #[arg(long, env = "CANARY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Bind address for the health, status and metrics endpoints
    #[arg(long, env = "CANARY_HTTP_BIND", default_value = "0.0.0.0:8080")]
    http_bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("canary={0},canary_core={0}", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Kafka canary");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = CanaryConfig::from_env().context("invalid canary configuration")?;
    info!(?config, "configuration loaded");

    let canary = Canary::new(config);
    let signal = canary.shutdown_signal();
    let mut shutdown = signal.listener();

    let listener = TcpListener::bind(args.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", args.http_bind))?;
    let server = HttpServer::new(canary.metrics(), canary.status_sampler());
    let http_task = tokio::spawn(server.serve(listener, signal.listener()));

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        signal.trigger();
    });

    let metrics = canary.metrics();
    let clients = tokio::select! {
        biased;
        () = shutdown.cancelled() => {
            info!("stopped before the kafka clients were created");
            None
        }
        clients = ProbeClients::connect_kafka(canary.config(), &metrics) => {
            Some(clients.context("failed to create kafka clients")?)
        }
    };

    if let Some(clients) = clients {
        canary.run(clients).await.context("canary failed")?;
    }

    http_task
        .await
        .context("http server task panicked")?
        .context("http server failed")?;
    info!("Kafka canary stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
