use super::{Bandwidth, LeakyBucket};
use crate::{Duration, Instant};

/// Bursts of at least this many packets are never paced
const MIN_PACKET_BURST_SIZE: u64 = 2;
/// Expected slack between asking when to send and actually sending
const MAX_SCHEDULING_DELAY: Duration = Duration::from_micros(2000);

/// Spreads packets out over time at the estimated bandwidth
#[derive(Debug, Clone)]
pub struct PacedSender {
    leaky_bucket: LeakyBucket,
    pace: Bandwidth,
    max_segment_size: u64,
}

impl PacedSender {
    /// Pace at `estimate`, never holding back bursts smaller than two segments
    pub fn new(estimate: Bandwidth, max_segment_size: u64, now: Instant) -> Self {
        Self {
            leaky_bucket: LeakyBucket::new(estimate, now),
            pace: estimate,
            max_segment_size,
        }
    }

    /// Adopt a new bandwidth estimate
    pub fn update_bandwidth_estimate(&mut self, now: Instant, estimate: Bandwidth) {
        self.leaky_bucket.set_draining_rate(now, estimate);
        self.pace = estimate;
    }

    /// Account for a sent packet
    pub fn sent_packet(&mut self, now: Instant, bytes: u64) {
        self.leaky_bucket.add(now, bytes);
    }

    /// Refine the delay proposed by the congestion controller
    pub fn time_until_send(&mut self, now: Instant, time_until_send: Duration) -> Duration {
        if time_until_send >= MAX_SCHEDULING_DELAY {
            return time_until_send;
        }
        let pacing_window = self
            .pace
            .to_bytes_per_period(MAX_SCHEDULING_DELAY)
            .max(MIN_PACKET_BURST_SIZE * self.max_segment_size);
        if pacing_window > self.leaky_bucket.bytes_pending(now) {
            // Pacing window not full yet
            return time_until_send;
        }
        self.leaky_bucket.time_remaining(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_minimum_burst() {
        let now = Instant::now();
        let mut pacer = PacedSender::new(Bandwidth::from_kbytes_per_second(100), 1200, now);
        pacer.sent_packet(now, 1200);
        assert_eq!(pacer.time_until_send(now, Duration::ZERO), Duration::ZERO);
        pacer.sent_packet(now, 1200);
        assert_eq!(
            pacer.time_until_send(now, Duration::ZERO),
            Duration::from_millis(24)
        );
    }

    #[test]
    fn long_delays_pass_through() {
        let now = Instant::now();
        let mut pacer = PacedSender::new(Bandwidth::from_kbytes_per_second(100), 1200, now);
        pacer.sent_packet(now, 12000);
        let delay = Duration::from_millis(5);
        assert_eq!(pacer.time_until_send(now, delay), delay);
    }
}
