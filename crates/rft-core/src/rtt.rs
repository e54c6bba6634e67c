//! Round-trip time estimation.
//!
//! A plain running mean over microsecond samples. The estimate drives every
//! retransmit-class timeout as `factor × average`, clamped below by a floor
//! so scheduler jitter on fast links cannot expire timers spuriously.

use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    sum_micros: u64,
    samples: u32,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: Duration) {
        self.record_micros(sample.as_micros().min(u32::MAX as u128) as u32);
    }

    pub fn record_micros(&mut self, micros: u32) {
        self.sum_micros += micros as u64;
        self.samples += 1;
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Mean sample in microseconds; 0 before the first sample.
    pub fn average_micros(&self) -> u32 {
        if self.samples == 0 {
            return 0;
        }
        (self.sum_micros / self.samples as u64).min(u32::MAX as u64) as u32
    }

    /// Timeout horizon for retransmit-class timers.
    pub fn timeout(&self, factor: u32, floor: Duration, initial: Duration) -> Duration {
        if self.samples == 0 {
            return initial;
        }
        Duration::from_micros(self.average_micros() as u64 * factor as u64).max(floor)
    }
}
