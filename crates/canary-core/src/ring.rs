//! Fixed-capacity ring of sampled counter values.
//!
//! [`TimeWindowRing`] keeps the last `N` samples of a monotonic counter so
//! the status sampler can compare the newest value with the oldest one still
//! inside the window. It knows nothing about time; the caller decides the
//! sampling cadence.

use std::time::Duration;

use tracing::warn;

/// Upper bound on the number of retained samples.
pub const MAX_BUCKETS: usize = 384;

/// Circular buffer of integer samples.
///
/// Inserting into a full ring evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct TimeWindowRing {
    buffer: Box<[i64]>,
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

impl TimeWindowRing {
    /// Creates a ring covering `window` when sampled every `period`.
    ///
    /// The capacity is `window / period`, capped at [`MAX_BUCKETS`] and never
    /// below one. A capped window is logged once, here.
    #[must_use]
    pub fn new(window: Duration, period: Duration) -> Self {
        let (capacity, capped) = Self::capacity_for(window, period);
        if capped {
            warn!(
                window_ms = window.as_millis(),
                period_ms = period.as_millis(),
                capacity,
                effective_window_ms = period.as_millis() * capacity as u128,
                "status time window exceeds the ring capacity, using a shorter window"
            );
        }
        Self::with_capacity(capacity)
    }

    /// Creates an empty ring holding at most `capacity` samples (minimum one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity.max(1)].into_boxed_slice(),
            head: None,
            tail: None,
            count: 0,
        }
    }

    /// Returns the capacity for `window / period` and whether it was capped.
    #[must_use]
    pub fn capacity_for(window: Duration, period: Duration) -> (usize, bool) {
        let period_ms = period.as_millis().max(1);
        let wanted = window.as_millis() / period_ms;
        if wanted > MAX_BUCKETS as u128 {
            (MAX_BUCKETS, true)
        } else {
            // Bounded by MAX_BUCKETS above, so the cast is lossless.
            #[allow(clippy::cast_possible_truncation)]
            let wanted = wanted as usize;
            (wanted.max(1), false)
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn put(&mut self, value: i64) {
        let capacity = self.buffer.len();
        let head = self.head.map_or(0, |h| (h + 1) % capacity);
        self.buffer[head] = value;
        self.head = Some(head);

        self.tail = match self.tail {
            None => Some(0),
            Some(t) if self.count == capacity => Some((t + 1) % capacity),
            keep => keep,
        };
        self.count = (self.count + 1).min(capacity);
    }

    /// Returns the most recent sample.
    #[must_use]
    pub fn head(&self) -> Option<i64> {
        self.head.map(|h| self.buffer[h])
    }

    /// Returns the oldest retained sample.
    #[must_use]
    pub fn tail(&self) -> Option<i64> {
        self.tail.map(|t| self.buffer[t])
    }

    /// Returns the number of retained samples.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the maximum number of retained samples.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing has been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
