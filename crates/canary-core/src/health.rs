//! Lifecycle state of the canary.

use std::fmt;

/// Lifecycle of a [`crate::canary::Canary`].
///
/// Transitions only move forward:
/// `Init → WaitForCluster → Running → ShuttingDown → Terminated`.
/// Shutdown during the cluster wait skips `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanaryState {
    /// Created, not yet started.
    #[default]
    Init,

    /// Waiting for the cluster to reach the expected size.
    WaitForCluster,

    /// Periodic tasks are running.
    Running,

    /// Tasks are being stopped and clients closed.
    ShuttingDown,

    /// Everything has stopped.
    Terminated,
}

impl CanaryState {
    /// Returns `true` while the probes are active.
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Returns `true` once shutdown has begun.
    #[must_use]
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for CanaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanaryState::Init => write!(f, "Init"),
            CanaryState::WaitForCluster => write!(f, "WaitForCluster"),
            CanaryState::Running => write!(f, "Running"),
            CanaryState::ShuttingDown => write!(f, "ShuttingDown"),
            CanaryState::Terminated => write!(f, "Terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(CanaryState::WaitForCluster.to_string(), "WaitForCluster");
        assert_eq!(CanaryState::default(), CanaryState::Init);
    }

    #[test]
    fn test_predicates() {
        assert!(CanaryState::Running.is_running());
        assert!(!CanaryState::Running.is_stopping());
        assert!(CanaryState::ShuttingDown.is_stopping());
        assert!(CanaryState::Terminated.is_stopping());
    }
}
