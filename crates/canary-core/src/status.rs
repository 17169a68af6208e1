//! Consumed-fraction status over a sliding window.
//!
//! [`StatusSampler`] snapshots the produced and consumed counts into two
//! parallel [`TimeWindowRing`]s on every status tick. The consuming status
//! compares the newest and oldest samples of each ring.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::counters::MessageCounters;
use crate::ring::TimeWindowRing;

/// Sentinel percentage meaning "not enough samples yet".
pub const INSUFFICIENT_DATA: f64 = -1.0;

/// Consumed fraction over the sampled window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConsumingStatus {
    /// Window actually covered by the samples, in ms.
    #[serde(rename = "TimeWindow")]
    pub time_window_ms: u64,
    /// Consumed records as a percentage of produced ones, two decimals,
    /// or [`INSUFFICIENT_DATA`].
    #[serde(rename = "Percentage")]
    pub percentage: f64,
}

/// Body of the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatusReport {
    /// Consuming status.
    #[serde(rename = "Consuming")]
    pub consuming: ConsumingStatus,
}

struct Rings {
    producer: TimeWindowRing,
    consumer: TimeWindowRing,
}

/// Samples the message counters into fixed-size rings.
///
/// Both rings are updated under one lock so readers never observe a sample
/// in one ring without its partner in the other.
pub struct StatusSampler {
    period: Duration,
    counters: Arc<MessageCounters>,
    rings: Mutex<Rings>,
}

impl StatusSampler {
    /// Creates a sampler covering `window` when sampled every `period`.
    #[must_use]
    pub fn new(window: Duration, period: Duration, counters: Arc<MessageCounters>) -> Self {
        let producer = TimeWindowRing::new(window, period);
        let consumer = TimeWindowRing::with_capacity(producer.capacity());
        Self {
            period,
            counters,
            rings: Mutex::new(Rings { producer, consumer }),
        }
    }

    /// Records the current produced and consumed counts.
    pub fn sample(&self) {
        let produced = clamp_to_i64(self.counters.produced());
        let consumed = clamp_to_i64(self.counters.consumed());
        let mut rings = self.rings.lock();
        rings.producer.put(produced);
        rings.consumer.put(consumed);
        debug!(produced, consumed, samples = rings.consumer.count(), "status sampled");
    }

    /// Computes the consumed fraction over the retained samples.
    #[must_use]
    pub fn consuming_status(&self) -> ConsumingStatus {
        let rings = self.rings.lock();
        let (Some(p_head), Some(p_tail), Some(c_head), Some(c_tail)) = (
            rings.producer.head(),
            rings.producer.tail(),
            rings.consumer.head(),
            rings.consumer.tail(),
        ) else {
            return ConsumingStatus {
                time_window_ms: 0,
                percentage: INSUFFICIENT_DATA,
            };
        };

        let time_window_ms = duration_ms(self.period).saturating_mul(rings.consumer.count() as u64);
        let produced = p_head - p_tail;
        let consumed = c_head - c_tail;
        drop(rings);

        let percentage = if produced > 0 && consumed > 0 {
            percentage_half_up(consumed.unsigned_abs(), produced.unsigned_abs())
        } else {
            INSUFFICIENT_DATA
        };
        ConsumingStatus {
            time_window_ms,
            percentage,
        }
    }

    /// Returns the status endpoint body.
    #[must_use]
    pub fn report(&self) -> StatusReport {
        StatusReport {
            consuming: self.consuming_status(),
        }
    }

    /// Returns the sampling period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns the number of samples each ring can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.rings.lock().consumer.capacity()
    }
}

impl std::fmt::Debug for StatusSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSampler")
            .field("period", &self.period)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// `consumed * 100 / produced` rounded half-up to two decimals, computed in
/// integer hundredths so ties round exactly.
#[allow(clippy::cast_precision_loss)]
fn percentage_half_up(consumed: u64, produced: u64) -> f64 {
    let numerator = u128::from(consumed) * 10_000 * 2 + u128::from(produced);
    let hundredths = numerator / (u128::from(produced) * 2);
    hundredths as f64 / 100.0
}

fn clamp_to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
