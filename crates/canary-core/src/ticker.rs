//! Periodic task scheduling and cooperative shutdown.
//!
//! Every recurring job in the canary implements [`PeriodicTask`] and is driven
//! by [`spawn_periodic`]. Ticks of one task never overlap: a tick that runs
//! past its period causes the missed ticks to be skipped. A failed or
//! panicking tick is logged and the next tick runs as scheduled.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::CanaryError;

/// Broadcasts shutdown to every listener.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a listener that resolves when shutdown is requested.
    #[must_use]
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the signal is dropped.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A job run at a fixed cadence.
#[async_trait]
pub trait PeriodicTask: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one tick.
    async fn tick(&mut self) -> Result<(), CanaryError>;

    /// Runs once after the last tick, before the task exits.
    async fn stop(&mut self) {}
}

/// Spawns `task` on the runtime, ticking every `period` until `shutdown` fires.
///
/// The first tick runs immediately. Shutdown is observed between ticks: a tick
/// already running when it is requested completes first, then
/// [`PeriodicTask::stop`] runs exactly once. Bounding how long that takes is
/// up to the caller.
pub fn spawn_periodic(
    mut task: Box<dyn PeriodicTask>,
    period: Duration,
    mut shutdown: ShutdownListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = task.name();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(task = name, period_ms = period.as_millis(), "periodic task started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let outcome = AssertUnwindSafe(task.tick()).catch_unwind().await;

            match outcome {
                Ok(Ok(())) => debug!(task = name, "tick completed"),
                Ok(Err(e)) if e.is_transient() => warn!(task = name, error = %e, "tick failed"),
                Ok(Err(e)) => error!(task = name, error = %e, "tick failed"),
                Err(panic) => error!(
                    task = name,
                    panic = panic_message(panic.as_ref()),
                    "tick panicked"
                ),
            }
        }

        task.stop().await;
        info!(task = name, "periodic task stopped");
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
