//! Forward error correction groups
//!
//! The payloads of a run of consecutive data packets are XORed together and sent as an extra
//! FEC packet, so that any single lost packet of the run can be rebuilt.

use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::debug;

use crate::{FecData, MAX_PACKET_SIZE};

/// XOR parity over the protected payloads of one FEC group
///
/// Used by the sender to produce the redundancy and by the receiver to revive a lost packet.
#[derive(Debug, Default)]
pub(crate) struct FecGroup {
    received_packets: BTreeSet<u64>,
    /// First protected packet; only known once the FEC packet arrived
    min_protected_packet: Option<u64>,
    /// Last protected packet; only known once the FEC packet arrived
    max_protected_packet: Option<u64>,
    payload_parity: Vec<u8>,
    /// XOR of the entropy flags seen so far
    entropy_parity: bool,
}

impl FecGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fold a protected data packet into the group
    ///
    /// Returns `false` for duplicates, packets outside the group, and oversized payloads.
    pub(crate) fn update(&mut self, sequence_number: u64, entropy_flag: bool, payload: &[u8]) -> bool {
        if self.received_packets.contains(&sequence_number) {
            return false;
        }
        if let (Some(min), Some(max)) = (self.min_protected_packet, self.max_protected_packet) {
            if sequence_number < min || sequence_number > max {
                debug!(sequence_number, min, max, "FEC group does not cover received packet");
                return false;
            }
        }
        if !self.update_parity(payload) {
            return false;
        }
        self.received_packets.insert(sequence_number);
        self.entropy_parity ^= entropy_flag;
        true
    }

    /// Fold the group's FEC packet in, fixing the protected range to
    /// `fec.fec_group..fec_sequence_number`
    pub(crate) fn update_fec(
        &mut self,
        fec_sequence_number: u64,
        fec_entropy_flag: bool,
        fec: &FecData,
    ) -> bool {
        if self.min_protected_packet.is_some() {
            return false;
        }
        if let Some(&stray) = self
            .received_packets
            .iter()
            .find(|&&x| x < fec.fec_group || x >= fec_sequence_number)
        {
            debug!(stray, "FEC group does not cover received packet");
            return false;
        }
        if !self.update_parity(&fec.redundancy) {
            return false;
        }
        self.min_protected_packet = Some(fec.fec_group);
        self.max_protected_packet = Some(fec_sequence_number - 1);
        self.entropy_parity ^= fec_entropy_flag;
        true
    }

    /// Exactly one protected packet is missing and the FEC packet arrived
    pub(crate) fn can_revive(&self) -> bool {
        self.num_missing_packets() == Some(1)
    }

    /// Every protected packet arrived
    pub(crate) fn is_finished(&self) -> bool {
        self.num_missing_packets() == Some(0)
    }

    /// Rebuild the missing packet
    ///
    /// Returns its sequence number, its entropy flag and its payload, zero-padded to the
    /// longest payload in the group.
    pub(crate) fn revive(&mut self) -> Option<(u64, bool, Bytes)> {
        if !self.can_revive() {
            return None;
        }
        let (min, max) = (self.min_protected_packet?, self.max_protected_packet?);
        let missing = (min..=max).find(|x| !self.received_packets.contains(x))?;
        self.received_packets.insert(missing);
        Some((
            missing,
            self.entropy_parity,
            Bytes::copy_from_slice(&self.payload_parity),
        ))
    }

    /// Whether every packet this group protects is below `sequence_number`
    pub(crate) fn protects_packets_before(&self, sequence_number: u64) -> bool {
        if let Some(max) = self.max_protected_packet {
            return max < sequence_number;
        }
        // Without the FEC packet, judge by what arrived
        self.received_packets
            .first()
            .is_some_and(|&first| first < sequence_number)
    }

    pub(crate) fn num_received_packets(&self) -> usize {
        self.received_packets.len()
    }

    pub(crate) fn entropy_parity(&self) -> bool {
        self.entropy_parity
    }

    pub(crate) fn payload_parity(&self) -> &[u8] {
        &self.payload_parity
    }

    fn num_missing_packets(&self) -> Option<u64> {
        let (min, max) = (self.min_protected_packet?, self.max_protected_packet?);
        Some((max - min + 1).saturating_sub(self.received_packets.len() as u64))
    }

    fn update_parity(&mut self, payload: &[u8]) -> bool {
        if payload.len() > MAX_PACKET_SIZE {
            debug!(len = payload.len(), "illegal FEC payload size");
            return false;
        }
        if self.payload_parity.len() < payload.len() {
            self.payload_parity.resize(payload.len(), 0);
        }
        for (parity, byte) in self.payload_parity.iter_mut().zip(payload) {
            *parity ^= byte;
        }
        true
    }
}
