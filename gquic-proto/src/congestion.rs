//! Logic for controlling the rate at which data is sent

use std::{fmt, sync::Arc};

use crate::{frame::CongestionFeedbackFrame, Duration, Instant};

mod fix_rate;
mod leaky_bucket;
mod paced_sender;

pub use fix_rate::{FixRateConfig, FixRateReceiver, FixRateSender};
pub use leaky_bucket::LeakyBucket;
pub use paced_sender::PacedSender;

/// Why a packet is being sent
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransmissionType {
    /// First transmission of the packet's frames
    NotRetransmission,
    /// Resent after enough later packets were acknowledged
    NackRetransmission,
    /// Resent after the retransmission timer fired
    RtoRetransmission,
}

impl TransmissionType {
    /// Whether the frames were sent before under another sequence number
    pub fn is_retransmission(self) -> bool {
        self != TransmissionType::NotRetransmission
    }
}

/// Common interface for sender-side congestion control
pub trait SendAlgorithm: Send {
    /// Feedback from the peer's [`ReceiveAlgorithm`] arrived
    fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        receive_time: Instant,
    );

    /// A packet was acknowledged
    ///
    /// `rtt` is only known for the largest observed packet of an ack.
    fn on_incoming_ack(&mut self, sequence_number: u64, bytes_acked: u64, rtt: Option<Duration>);

    /// An ack revealed at least one packet as lost
    fn on_incoming_loss(&mut self, ack_receive_time: Instant);

    /// A packet was handed to the writer
    ///
    /// Returns whether the algorithm wants to hear about the packet's fate through
    /// [`on_incoming_ack`](Self::on_incoming_ack) or
    /// [`abandoning_packet`](Self::abandoning_packet).
    fn sent_packet(
        &mut self,
        sent_time: Instant,
        sequence_number: u64,
        bytes: u64,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool;

    /// A packet will never be acknowledged and no longer counts as in flight
    fn abandoning_packet(&mut self, sequence_number: u64, abandoned_bytes: u64);

    /// How long to wait before sending the next packet
    ///
    /// `None` means no packet may be sent until something is acknowledged.
    fn time_until_send(
        &mut self,
        now: Instant,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
        is_handshake: bool,
    ) -> Option<Duration>;

    /// Current estimate of the available bandwidth
    fn bandwidth_estimate(&self) -> Bandwidth;

    /// Current round trip time estimate
    fn smoothed_rtt(&self) -> Duration;

    /// Suggested retransmission timeout; zero lets the connection pick its default
    fn retransmission_delay(&self) -> Duration;
}

/// Common interface for receiver-side congestion feedback generation
pub trait ReceiveAlgorithm: Send {
    /// Feedback to bundle with the next ack, if any
    fn generate_congestion_feedback(&mut self) -> Option<CongestionFeedbackFrame>;

    /// A packet arrived (or was reconstructed from FEC data when `revived`)
    fn record_incoming_packet(
        &mut self,
        bytes: u64,
        sequence_number: u64,
        timestamp: Instant,
        revived: bool,
    );
}

/// Constructs congestion control state for new connections
pub trait CongestionControllerFactory: Send + Sync {
    /// Construct a fresh sender side
    fn build_sender(&self, now: Instant, max_packet_length: usize) -> Box<dyn SendAlgorithm>;
    /// Construct a fresh receiver side
    fn build_receiver(&self) -> Box<dyn ReceiveAlgorithm>;
}

impl<T: CongestionControllerFactory + ?Sized> CongestionControllerFactory for Arc<T> {
    fn build_sender(&self, now: Instant, max_packet_length: usize) -> Box<dyn SendAlgorithm> {
        (**self).build_sender(now, max_packet_length)
    }

    fn build_receiver(&self) -> Box<dyn ReceiveAlgorithm> {
        (**self).build_receiver()
    }
}

/// A data rate
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bandwidth {
    bits_per_second: u64,
}

impl Bandwidth {
    /// No bandwidth at all
    pub const ZERO: Self = Self { bits_per_second: 0 };

    /// Construct from bits per second
    pub const fn from_bits_per_second(bits_per_second: u64) -> Self {
        Self { bits_per_second }
    }

    /// Construct from bytes per second
    pub const fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Self {
            bits_per_second: bytes_per_second * 8,
        }
    }

    /// Construct from kilobytes per second
    pub const fn from_kbytes_per_second(kbytes_per_second: u64) -> Self {
        Self::from_bytes_per_second(kbytes_per_second * 1000)
    }

    /// The rate at which `bytes` are delivered over `period`
    pub fn from_bytes_and_time_delta(bytes: u64, period: Duration) -> Self {
        let micros = period.as_micros().max(1);
        let bits_per_second = u128::from(bytes) * 8 * 1_000_000 / micros;
        Self {
            bits_per_second: u64::try_from(bits_per_second).unwrap_or(u64::MAX),
        }
    }

    /// Bits per second
    pub fn to_bits_per_second(self) -> u64 {
        self.bits_per_second
    }

    /// Bytes per second
    pub fn to_bytes_per_second(self) -> u64 {
        self.bits_per_second / 8
    }

    /// Bytes delivered over `period` at this rate
    pub fn to_bytes_per_period(self, period: Duration) -> u64 {
        let bytes = u128::from(self.bits_per_second) * period.as_micros() / 8 / 1_000_000;
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }

    /// Time needed to deliver `bytes` at this rate, `None` for a zero rate
    pub fn transfer_time(self, bytes: u64) -> Option<Duration> {
        if self.bits_per_second == 0 {
            return None;
        }
        let micros = u128::from(bytes) * 8 * 1_000_000 / u128::from(self.bits_per_second);
        Some(Duration::from_micros(
            u64::try_from(micros).unwrap_or(u64::MAX),
        ))
    }

    /// Whether the rate is zero
    pub fn is_zero(self) -> bool {
        self.bits_per_second == 0
    }
}

impl fmt::Debug for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bits/s", self.bits_per_second)
    }
}
