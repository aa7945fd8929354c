use std::collections::BTreeMap;

use tracing::trace;

use super::received::is_awaiting_packet;
use crate::{
    congestion::{
        Bandwidth, CongestionControllerFactory, ReceiveAlgorithm, SendAlgorithm, TransmissionType,
    },
    frame::{AckFrame, CongestionFeedbackFrame},
    Duration, Instant,
};

/// Used until the send algorithm has an RTT estimate
const DEFAULT_RETRANSMISSION_TIME: Duration = Duration::from_millis(500);
const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);
const MAX_RETRANSMISSION_TIME: Duration = Duration::from_secs(60);
/// The retransmission delay stops doubling after this many consecutive timeouts
const MAX_RETRANSMISSIONS: u32 = 10;

/// Feeds the pluggable congestion algorithms and remembers what they need to be told later
pub(super) struct CongestionManager {
    send_algorithm: Box<dyn SendAlgorithm>,
    receive_algorithm: Box<dyn ReceiveAlgorithm>,
    /// Packets the send algorithm is tracking: size and send time
    pending_packets: BTreeMap<u64, (u64, Instant)>,
    /// Largest sequence number an ack has reported missing
    largest_missing: u64,
    rtt_sample: Option<Duration>,
}

impl CongestionManager {
    pub(super) fn new(
        factory: &dyn CongestionControllerFactory,
        now: Instant,
        max_packet_length: usize,
    ) -> Self {
        Self {
            send_algorithm: factory.build_sender(now, max_packet_length),
            receive_algorithm: factory.build_receiver(),
            pending_packets: BTreeMap::new(),
            largest_missing: 0,
            rtt_sample: None,
        }
    }

    pub(super) fn sent_packet(
        &mut self,
        sequence_number: u64,
        sent_time: Instant,
        bytes: u64,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) {
        if self.send_algorithm.sent_packet(
            sent_time,
            sequence_number,
            bytes,
            transmission_type,
            has_retransmittable_data,
        ) {
            self.pending_packets
                .insert(sequence_number, (bytes, sent_time));
        }
    }

    /// The packet will never be acknowledged
    pub(super) fn abandoning_packet(&mut self, sequence_number: u64) {
        if let Some((bytes, _)) = self.pending_packets.remove(&sequence_number) {
            self.send_algorithm
                .abandoning_packet(sequence_number, bytes);
        }
    }

    pub(super) fn on_incoming_ack_frame(&mut self, ack: &AckFrame, ack_receive_time: Instant) {
        let received_info = &ack.received_info;
        // Only the largest observed packet gives an RTT sample free of ack aggregation delay
        let mut new_sample = None;
        if let (Some(&(_, sent_time)), Some(delta)) = (
            self.pending_packets.get(&received_info.largest_observed),
            received_info.delta_time_largest_observed,
        ) {
            let send_delta = ack_receive_time.saturating_duration_since(sent_time);
            if send_delta > delta {
                new_sample = Some(send_delta - delta);
            } else if self.rtt_sample.is_none() {
                // The peer's delay claim is implausible, but the send delta is an upper bound
                new_sample = Some(send_delta);
            }
            if new_sample.is_some() {
                self.rtt_sample = new_sample;
                trace!(rtt = ?new_sample, "RTT sample");
            }
        }

        let mut new_packet_loss_reported = false;
        let candidates = self
            .pending_packets
            .range(..=received_info.largest_observed)
            .map(|(&sequence_number, &(bytes, _))| (sequence_number, bytes))
            .collect::<Vec<_>>();
        for (sequence_number, bytes) in candidates {
            if is_awaiting_packet(received_info, sequence_number) {
                if sequence_number > self.largest_missing {
                    new_packet_loss_reported = true;
                    self.largest_missing = sequence_number;
                }
                continue;
            }
            self.pending_packets.remove(&sequence_number);
            let rtt = match sequence_number == received_info.largest_observed {
                true => new_sample,
                false => None,
            };
            self.send_algorithm
                .on_incoming_ack(sequence_number, bytes, rtt);
        }
        if new_packet_loss_reported {
            self.send_algorithm.on_incoming_loss(ack_receive_time);
        }
    }

    pub(super) fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        receive_time: Instant,
    ) {
        self.send_algorithm
            .on_incoming_congestion_feedback(feedback, receive_time);
    }

    pub(super) fn time_until_send(
        &mut self,
        now: Instant,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
        is_handshake: bool,
    ) -> Option<Duration> {
        self.send_algorithm.time_until_send(
            now,
            transmission_type,
            has_retransmittable_data,
            is_handshake,
        )
    }

    /// Retransmission timeout after `consecutive_rto_count` timeouts without progress
    pub(super) fn retransmission_delay(&self, consecutive_rto_count: u32) -> Duration {
        let mut delay = self.send_algorithm.retransmission_delay();
        if delay.is_zero() {
            delay = DEFAULT_RETRANSMISSION_TIME;
        }
        let backoff = 1u32 << consecutive_rto_count.min(MAX_RETRANSMISSIONS);
        delay
            .saturating_mul(backoff)
            .clamp(MIN_RETRANSMISSION_TIME, MAX_RETRANSMISSION_TIME)
    }

    pub(super) fn bandwidth_estimate(&self) -> Bandwidth {
        self.send_algorithm.bandwidth_estimate()
    }

    pub(super) fn smoothed_rtt(&self) -> Duration {
        self.send_algorithm.smoothed_rtt()
    }

    pub(super) fn record_incoming_packet(
        &mut self,
        bytes: u64,
        sequence_number: u64,
        timestamp: Instant,
        revived: bool,
    ) {
        self.receive_algorithm
            .record_incoming_packet(bytes, sequence_number, timestamp, revived);
    }

    pub(super) fn generate_congestion_feedback(&mut self) -> Option<CongestionFeedbackFrame> {
        self.receive_algorithm.generate_congestion_feedback()
    }
}
