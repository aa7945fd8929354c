use tracing::warn;

use super::{
    Bandwidth, CongestionControllerFactory, LeakyBucket, PacedSender, ReceiveAlgorithm,
    SendAlgorithm, TransmissionType,
};
use crate::{frame::CongestionFeedbackFrame, Duration, Instant};

/// A sender that transmits at whatever rate the receiver asks for
///
/// Data in flight is capped at the bytes the configured rate delivers in 10 ms, but never
/// below one full packet.
#[derive(Debug, Clone)]
pub struct FixRateSender {
    bitrate: Bandwidth,
    max_segment_size: u64,
    leaky_bucket: LeakyBucket,
    paced_sender: PacedSender,
    data_in_flight: u64,
    latest_rtt: Duration,
}

/// Interval the in-flight cap is derived from
const WINDOW: Duration = Duration::from_millis(10);

impl FixRateSender {
    /// Construct a sender starting at `config.initial_bitrate`
    pub fn new(config: &FixRateConfig, max_segment_size: u64, now: Instant) -> Self {
        let bitrate = config.initial_bitrate;
        Self {
            bitrate,
            max_segment_size,
            leaky_bucket: LeakyBucket::new(bitrate, now),
            paced_sender: PacedSender::new(bitrate, max_segment_size, now),
            data_in_flight: 0,
            latest_rtt: Duration::ZERO,
        }
    }

    fn congestion_window(&self) -> u64 {
        self.bitrate
            .to_bytes_per_period(WINDOW)
            .max(self.max_segment_size)
    }
}

impl SendAlgorithm for FixRateSender {
    fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        receive_time: Instant,
    ) {
        match *feedback {
            CongestionFeedbackFrame::FixRate { bitrate } => {
                self.bitrate = bitrate;
                self.leaky_bucket.set_draining_rate(receive_time, bitrate);
                self.paced_sender
                    .update_bandwidth_estimate(receive_time, bitrate);
            }
            ref other => warn!(?other, "ignoring feedback meant for another sender"),
        }
    }

    fn on_incoming_ack(&mut self, _sequence_number: u64, bytes_acked: u64, rtt: Option<Duration>) {
        self.data_in_flight = self.data_in_flight.saturating_sub(bytes_acked);
        if let Some(rtt) = rtt {
            self.latest_rtt = rtt;
        }
    }

    fn on_incoming_loss(&mut self, _ack_receive_time: Instant) {}

    fn sent_packet(
        &mut self,
        sent_time: Instant,
        _sequence_number: u64,
        bytes: u64,
        transmission_type: TransmissionType,
        _has_retransmittable_data: bool,
    ) -> bool {
        self.leaky_bucket.add(sent_time, bytes);
        self.paced_sender.sent_packet(sent_time, bytes);
        if !transmission_type.is_retransmission() {
            self.data_in_flight += bytes;
        }
        true
    }

    fn abandoning_packet(&mut self, _sequence_number: u64, abandoned_bytes: u64) {
        self.data_in_flight = self.data_in_flight.saturating_sub(abandoned_bytes);
    }

    fn time_until_send(
        &mut self,
        now: Instant,
        _transmission_type: TransmissionType,
        _has_retransmittable_data: bool,
        _is_handshake: bool,
    ) -> Option<Duration> {
        let window = self.congestion_window();
        if window > self.leaky_bucket.bytes_pending(now) {
            if window <= self.data_in_flight {
                // Need an ack before sending more
                return None;
            }
            return Some(self.paced_sender.time_until_send(now, Duration::ZERO));
        }
        let remaining = self.leaky_bucket.time_remaining(now);
        if remaining.is_zero() {
            return None;
        }
        Some(self.paced_sender.time_until_send(now, remaining))
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.bitrate
    }

    fn smoothed_rtt(&self) -> Duration {
        self.latest_rtt
    }

    fn retransmission_delay(&self) -> Duration {
        self.latest_rtt * 2
    }
}

/// Receiver side of the fixed-rate scheme: always asks for the configured rate
#[derive(Debug, Clone)]
pub struct FixRateReceiver {
    configured_rate: Bandwidth,
}

impl FixRateReceiver {
    /// Ask peers to send at `configured_rate`
    pub fn new(configured_rate: Bandwidth) -> Self {
        Self { configured_rate }
    }

    /// Change the rate requested from now on
    pub fn set_bitrate(&mut self, bitrate: Bandwidth) {
        self.configured_rate = bitrate;
    }
}

impl ReceiveAlgorithm for FixRateReceiver {
    fn generate_congestion_feedback(&mut self) -> Option<CongestionFeedbackFrame> {
        Some(CongestionFeedbackFrame::FixRate {
            bitrate: self.configured_rate,
        })
    }

    fn record_incoming_packet(&mut self, _: u64, _: u64, _: Instant, _: bool) {}
}

/// Configuration for the fixed-rate sender and receiver pair
#[derive(Debug, Clone)]
pub struct FixRateConfig {
    initial_bitrate: Bandwidth,
    requested_bitrate: Bandwidth,
}

impl FixRateConfig {
    /// Rate the sender uses until the peer's feedback arrives
    pub fn initial_bitrate(&mut self, value: Bandwidth) -> &mut Self {
        self.initial_bitrate = value;
        self
    }

    /// Rate the receiver asks its peer to send at
    pub fn requested_bitrate(&mut self, value: Bandwidth) -> &mut Self {
        self.requested_bitrate = value;
        self
    }
}

impl Default for FixRateConfig {
    fn default() -> Self {
        const INITIAL_BITRATE: Bandwidth = Bandwidth::from_bytes_per_second(100_000);
        Self {
            initial_bitrate: INITIAL_BITRATE,
            requested_bitrate: INITIAL_BITRATE,
        }
    }
}

impl CongestionControllerFactory for FixRateConfig {
    fn build_sender(&self, now: Instant, max_packet_length: usize) -> Box<dyn SendAlgorithm> {
        Box::new(FixRateSender::new(self, max_packet_length as u64, now))
    }

    fn build_receiver(&self) -> Box<dyn ReceiveAlgorithm> {
        Box::new(FixRateReceiver::new(self.requested_bitrate))
    }
}
