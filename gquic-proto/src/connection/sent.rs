use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace, warn};

use super::received::is_awaiting_packet;
use crate::{
    frame::{AckFrame, RetransmittableFrames},
    EntropyHash, SequenceNumberLength,
};

/// Packets an ack must name as missing this many times before they are resent
const NUMBER_OF_NACKS_BEFORE_RETRANSMISSION: usize = 3;
/// Upper bound on nack-triggered retransmissions per incoming ack
const MAX_RETRANSMISSIONS_PER_ACK: usize = 10;

/// A sent packet whose frames must be resent if it is lost
#[derive(Debug)]
pub(super) struct UnackedPacket {
    pub(super) frames: RetransmittableFrames,
    /// Retransmissions keep the sequence number length of the original
    pub(super) sequence_number_length: SequenceNumberLength,
    number_nacks: usize,
    pub(super) number_retransmissions: usize,
}

/// What an incoming ack meant for our sent packets
#[derive(Debug, Default)]
pub(super) struct AckOutcome {
    /// Newly acknowledged packets, data and FEC alike
    pub(super) acked: Vec<u64>,
    /// Packets nacked often enough to be resent now
    pub(super) nacked: Vec<u64>,
}

/// Bookkeeping for packets we sent and have not seen acknowledged
#[derive(Debug, Default)]
pub(super) struct SentPacketManager {
    unacked: BTreeMap<u64, UnackedPacket>,
    unacked_fec: BTreeSet<u64>,
    entropy: SentEntropyManager,
}

impl SentPacketManager {
    /// Start tracking a packet carrying retransmittable frames
    pub(super) fn add_retransmittable(
        &mut self,
        sequence_number: u64,
        frames: RetransmittableFrames,
        sequence_number_length: SequenceNumberLength,
        number_retransmissions: usize,
    ) {
        debug_assert!(self
            .unacked
            .last_key_value()
            .map_or(true, |(&last, _)| last < sequence_number));
        self.unacked.insert(
            sequence_number,
            UnackedPacket {
                frames,
                sequence_number_length,
                number_nacks: 0,
                number_retransmissions,
            },
        );
    }

    pub(super) fn add_fec(&mut self, sequence_number: u64) {
        self.unacked_fec.insert(sequence_number);
    }

    /// Apply a validated ack
    ///
    /// Only packets up to `largest_observed` are considered; later ones were sent after the
    /// peer built its ack.
    pub(super) fn on_ack(&mut self, ack: &AckFrame) -> AckOutcome {
        let received_info = &ack.received_info;
        let mut outcome = AckOutcome::default();
        self.unacked.retain(|&sequence_number, packet| {
            if sequence_number > received_info.largest_observed {
                return true;
            }
            if !is_awaiting_packet(received_info, sequence_number) {
                trace!(sequence_number, "packet acked");
                outcome.acked.push(sequence_number);
                return false;
            }
            // The peer got packets after this one; an explicit nack
            packet.number_nacks += 1;
            if packet.number_nacks >= NUMBER_OF_NACKS_BEFORE_RETRANSMISSION
                && outcome.nacked.len() < MAX_RETRANSMISSIONS_PER_ACK
            {
                debug!(
                    sequence_number,
                    nacks = packet.number_nacks,
                    "retransmitting nacked packet"
                );
                outcome.nacked.push(sequence_number);
            }
            true
        });
        self.unacked_fec.retain(|&sequence_number| {
            if sequence_number <= received_info.largest_observed
                && !is_awaiting_packet(received_info, sequence_number)
            {
                trace!(sequence_number, "FEC packet acked");
                outcome.acked.push(sequence_number);
                return false;
            }
            true
        });
        outcome.acked.sort_unstable();
        outcome
    }

    /// Stop tracking `sequence_number`, returning what must be sent again in its place
    pub(super) fn take_for_retransmission(&mut self, sequence_number: u64) -> Option<UnackedPacket> {
        self.unacked.remove(&sequence_number)
    }

    /// Every unacked retransmittable packet, oldest first
    pub(super) fn unacked_sequence_numbers(&self) -> Vec<u64> {
        self.unacked.keys().copied().collect()
    }

    /// Give up on every outstanding FEC packet
    pub(super) fn discard_fec_packets(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.unacked_fec).into_iter().collect()
    }

    /// The oldest packet still waiting for an ack, or `next_sequence_number` if none is
    pub(super) fn least_unacked(&self, next_sequence_number: u64) -> u64 {
        let unacked = self.unacked.keys().next().copied();
        let fec = self.unacked_fec.first().copied();
        [unacked, fec]
            .into_iter()
            .flatten()
            .fold(next_sequence_number, u64::min)
    }

    pub(super) fn has_unacked_packets(&self) -> bool {
        !self.unacked.is_empty()
    }

    pub(super) fn num_unacked_packets(&self) -> usize {
        self.unacked.len()
    }

    pub(super) fn is_unacked(&self, sequence_number: u64) -> bool {
        self.unacked.contains_key(&sequence_number)
    }

    pub(super) fn entropy(&self) -> &SentEntropyManager {
        &self.entropy
    }

    pub(super) fn entropy_mut(&mut self) -> &mut SentEntropyManager {
        &mut self.entropy
    }
}

/// Cumulative entropy of every packet we sent, by sequence number
#[derive(Debug, Default)]
pub(super) struct SentEntropyManager {
    /// Each packet's own entropy and the cumulative hash through it
    packets: BTreeMap<u64, (EntropyHash, EntropyHash)>,
    hash: EntropyHash,
}

impl SentEntropyManager {
    /// Record a packet; must be called in sequence number order
    pub(super) fn record(&mut self, sequence_number: u64, entropy_hash: EntropyHash) {
        debug_assert!(self
            .packets
            .last_key_value()
            .map_or(true, |(&last, _)| last < sequence_number));
        self.hash ^= entropy_hash;
        self.packets
            .insert(sequence_number, (entropy_hash, self.hash));
        trace!(hash = self.hash, "cumulative sent entropy");
    }

    /// Cumulative entropy through `sequence_number`, zero if it is not tracked
    pub(super) fn entropy_hash(&self, sequence_number: u64) -> EntropyHash {
        self.packets
            .get(&sequence_number)
            .map_or(0, |&(_, cumulative)| cumulative)
    }

    /// Whether a peer that received everything through `largest_observed` except
    /// `missing_packets` would report `entropy_hash`
    pub(super) fn is_valid_entropy(
        &self,
        largest_observed: u64,
        missing_packets: &BTreeSet<u64>,
        entropy_hash: EntropyHash,
    ) -> bool {
        let Some(&(_, mut expected)) = self.packets.get(&largest_observed) else {
            // Nothing acknowledged yet
            return largest_observed == 0;
        };
        for missing in missing_packets {
            let Some(&(own, _)) = self.packets.get(missing) else {
                warn!(missing, "missing packet has no recorded entropy");
                return false;
            };
            expected ^= own;
        }
        if entropy_hash != expected {
            warn!(entropy_hash, expected, "invalid entropy hash");
            return false;
        }
        true
    }

    /// Forget entropy of packets below `sequence_number`
    pub(super) fn clear_entropy_before(&mut self, sequence_number: u64) {
        self.packets = self.packets.split_off(&sequence_number);
    }
}
