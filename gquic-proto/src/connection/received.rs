use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::{
    frame::{AckFrame, ReceivedPacketInfo},
    framer::ReceivedEntropyHashCalculator,
    EntropyHash, Instant, PacketHeader,
};

/// Tracks what we received from the peer, and what the peer told us about our own packets
#[derive(Debug, Default)]
pub(super) struct ReceivedPacketManager {
    /// Basis of outgoing acks; `entropy_hash` is filled in when an ack is built
    received_info: ReceivedPacketInfo,
    /// Receipt time of `received_info.largest_observed`, cleared once reported in an ack
    time_largest_observed: Option<Instant>,
    entropy: ReceivedEntropy,

    /// Smallest sequence number the peer still waits to see acked, from its latest ack
    least_packet_awaited_by_peer: u64,
    /// Largest of our packets the peer has observed
    peer_largest_observed_packet: u64,
    /// The peer will never send anything below this again
    peer_least_packet_awaiting_ack: u64,
}

impl ReceivedPacketManager {
    pub(super) fn new() -> Self {
        Self {
            least_packet_awaited_by_peer: 1,
            ..Self::default()
        }
    }

    pub(super) fn record_packet_received(&mut self, header: &PacketHeader, receipt_time: Instant) {
        let sequence_number = header.packet_sequence_number;
        debug_assert!(self.is_awaiting_packet(sequence_number));
        let info = &mut self.received_info;
        let gap_start = (info.largest_observed + 1).max(self.peer_least_packet_awaiting_ack);
        info.missing_packets.extend(gap_start..sequence_number);
        if info.largest_observed > sequence_number {
            // One of the out of order packets arrived
            trace!(sequence_number, "no longer missing");
            info.missing_packets.remove(&sequence_number);
        }
        if sequence_number > info.largest_observed {
            info.largest_observed = sequence_number;
            self.time_largest_observed = Some(receipt_time);
        }
        self.entropy.record(sequence_number, header.entropy_hash);
    }

    /// Whether `sequence_number` is neither a duplicate nor something the peer gave up on
    pub(super) fn is_awaiting_packet(&self, sequence_number: u64) -> bool {
        is_awaiting_packet(&self.received_info, sequence_number)
            && sequence_number >= self.peer_least_packet_awaiting_ack
    }

    /// Fill in the received half of an outgoing ack
    pub(super) fn update_received_packet_info(&mut self, ack: &mut AckFrame, now: Instant) {
        ack.received_info = self.received_info.clone();
        ack.received_info.entropy_hash = self.entropy.entropy_hash(self.received_info.largest_observed);
        // Unknown when nothing new arrived since the last ack
        ack.received_info.delta_time_largest_observed = self
            .time_largest_observed
            .take()
            .map(|received| now.saturating_duration_since(received));
    }

    /// Learn which of our packets the peer has seen
    pub(super) fn update_packet_information_received_by_peer(&mut self, ack: &AckFrame) {
        let received_info = &ack.received_info;
        debug_assert!(self.peer_largest_observed_packet <= received_info.largest_observed);
        self.peer_largest_observed_packet = received_info.largest_observed;
        self.least_packet_awaited_by_peer = match received_info.missing_packets.first() {
            Some(&first) => first,
            None => self.peer_largest_observed_packet + 1,
        };
    }

    /// Stop waiting for packets the peer will never send
    pub(super) fn update_packet_information_sent_by_peer(&mut self, ack: &AckFrame) {
        let least_unacked = ack.sent_info.least_unacked;
        debug_assert!(self.peer_least_packet_awaiting_ack <= least_unacked);
        if least_unacked > self.peer_least_packet_awaiting_ack {
            let missed_packets = self.dont_wait_for_packets_before(least_unacked);
            if missed_packets || least_unacked > self.received_info.largest_observed + 1 {
                debug!(least_unacked, "peer abandoned packets, recalculating entropy");
                self.entropy
                    .recalculate(least_unacked, ack.sent_info.entropy_hash);
            }
            self.peer_least_packet_awaiting_ack = least_unacked;
        }
    }

    /// Returns whether any missing packet was forgotten
    fn dont_wait_for_packets_before(&mut self, least_unacked: u64) -> bool {
        let missing = &mut self.received_info.missing_packets;
        let count = missing.len();
        *missing = missing.split_off(&least_unacked);
        count != missing.len()
    }

    pub(super) fn has_missing_packets(&self) -> bool {
        !self.received_info.missing_packets.is_empty()
    }

    pub(super) fn least_packet_awaited_by_peer(&self) -> u64 {
        self.least_packet_awaited_by_peer
    }

    pub(super) fn peer_largest_observed_packet(&self) -> u64 {
        self.peer_largest_observed_packet
    }

    pub(super) fn peer_least_packet_awaiting_ack(&self) -> u64 {
        self.peer_least_packet_awaiting_ack
    }
}

impl ReceivedEntropyHashCalculator for ReceivedPacketManager {
    fn entropy_hash(&self, sequence_number: u64) -> EntropyHash {
        self.entropy.entropy_hash(sequence_number)
    }
}

/// Whether `info` leaves `sequence_number` unacknowledged
pub(super) fn is_awaiting_packet(info: &ReceivedPacketInfo, sequence_number: u64) -> bool {
    sequence_number > info.largest_observed || info.missing_packets.contains(&sequence_number)
}

/// Cumulative entropy of received packets
///
/// Entropy below `floor` is summarized in `hash`; entries at or above it are kept individually
/// so the hash at any received sequence number can be recovered for truncated acks.
#[derive(Debug, Default)]
struct ReceivedEntropy {
    packets: BTreeMap<u64, EntropyHash>,
    /// XOR of everything received, including what the peer vouched for below `floor`
    hash: EntropyHash,
    floor: u64,
    largest_received: u64,
}

impl ReceivedEntropy {
    fn record(&mut self, sequence_number: u64, entropy_hash: EntropyHash) {
        if sequence_number < self.floor {
            debug!(
                sequence_number,
                floor = self.floor,
                "ignoring entropy below peer's least unacked"
            );
            return;
        }
        self.packets.insert(sequence_number, entropy_hash);
        self.hash ^= entropy_hash;
        self.largest_received = self.largest_received.max(sequence_number);
        trace!(hash = self.hash, "cumulative received entropy");
    }

    fn entropy_hash(&self, sequence_number: u64) -> EntropyHash {
        if sequence_number >= self.largest_received {
            return self.hash;
        }
        self.packets
            .range(sequence_number + 1..)
            .fold(self.hash, |hash, (_, &x)| hash ^ x)
    }

    /// Replace everything below `least_unacked` with the peer's cumulative sent entropy
    fn recalculate(&mut self, least_unacked: u64, entropy_hash: EntropyHash) {
        if least_unacked < self.floor {
            debug!(least_unacked, floor = self.floor, "ignoring stale least unacked");
            return;
        }
        self.floor = least_unacked;
        self.packets = self
            .packets
            .split_off(&least_unacked.min(self.largest_received));
        self.hash = self
            .packets
            .range(least_unacked..)
            .fold(entropy_hash, |hash, (_, &x)| hash ^ x);
    }
}
