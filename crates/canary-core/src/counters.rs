//! Shared produced/consumed message counts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide produced and consumed counts.
///
/// Probes increment from the reconcile task; the status sampler reads from
/// the status task. Values never decrease outside tests.
#[derive(Debug, Default)]
pub struct MessageCounters {
    produced: AtomicU64,
    consumed: AtomicU64,
}

impl MessageCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one acknowledged probe record.
    pub fn increment_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one consumed probe record.
    pub fn increment_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the produced count.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Returns the consumed count.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Zeroes both counts.
    #[doc(hidden)]
    pub fn reset(&self) {
        self.produced.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increments() {
        let counters = MessageCounters::new();
        counters.increment_produced();
        counters.increment_produced();
        counters.increment_consumed();
        assert_eq!(counters.produced(), 2);
        assert_eq!(counters.consumed(), 1);
        counters.reset();
        assert_eq!(counters.produced(), 0);
        assert_eq!(counters.consumed(), 0);
    }

    #[test]
    fn test_visible_across_threads() {
        let counters = Arc::new(MessageCounters::new());
        let writer = {
            let counters = Arc::clone(&counters);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    counters.increment_produced();
                }
            })
        };
        writer.join().unwrap();
        assert_eq!(counters.produced(), 1000);
    }
}
