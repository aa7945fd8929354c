use super::Bandwidth;
use crate::{Duration, Instant};

/// Byte counter that drains at a fixed rate
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    bytes: u64,
    time_last_updated: Instant,
    draining_rate: Bandwidth,
}

impl LeakyBucket {
    /// An empty bucket draining at `draining_rate`
    pub fn new(draining_rate: Bandwidth, now: Instant) -> Self {
        Self {
            bytes: 0,
            time_last_updated: now,
            draining_rate,
        }
    }

    /// Change the drain rate, accounting for what drained at the old rate first
    pub fn set_draining_rate(&mut self, now: Instant, draining_rate: Bandwidth) {
        self.update(now);
        self.draining_rate = draining_rate;
    }

    /// Pour `bytes` into the bucket
    pub fn add(&mut self, now: Instant, bytes: u64) {
        self.update(now);
        self.bytes += bytes;
    }

    /// Time until the bucket is empty
    pub fn time_remaining(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.time_last_updated);
        let send_delay = self
            .draining_rate
            .transfer_time(self.bytes)
            .unwrap_or(Duration::MAX);
        send_delay.saturating_sub(elapsed)
    }

    /// Bytes still in the bucket at `now`
    pub fn bytes_pending(&mut self, now: Instant) -> u64 {
        self.update(now);
        self.bytes
    }

    fn update(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.time_last_updated);
        let cleared = self.draining_rate.to_bytes_per_period(elapsed);
        self.bytes = self.bytes.saturating_sub(cleared);
        self.time_last_updated = now;
    }
}
