use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::{
    config::TransportConfig,
    fec::FecGroup,
    frame::{ConnectionCloseFrame, Frame, RetransmittableFrames, StreamFrame},
    framer::{
        min_stream_frame_size, serialized_frame_length, BuildError, Framer,
        ReceivedEntropyHashCalculator, STREAM_PAYLOAD_LENGTH_SIZE,
    },
    packet::{
        packet_header_size, start_of_fec_protected_data, FecData, GuidLength, PacketHeader,
        PublicHeader, SequenceNumberLength, SerializedPacket, VERSION_SIZE,
    },
    Guid, Side, StreamId,
};

/// Packs frames into packets, assigning sequence numbers, entropy bits and FEC groups
pub(super) struct PacketCreator {
    guid: Guid,
    guid_length: GuidLength,
    max_packet_length: usize,
    max_packets_per_fec_group: usize,
    /// Last sequence number handed out
    sequence_number: u64,
    send_version_in_packet: bool,
    /// Length used by the packet being built
    sequence_number_length: SequenceNumberLength,
    /// Length computed after the latest write; adopted once the current packet is serialized
    next_sequence_number_length: SequenceNumberLength,
    /// First sequence number of the open FEC group
    fec_group_number: u64,
    fec_group: Option<FecGroup>,
    /// Size of the packet being built, header included; recomputed whenever no frames are queued
    packet_size: usize,
    queued_frames: Vec<Frame>,
    queued_retransmittable_frames: Vec<Frame>,
    rng: StdRng,
}

impl PacketCreator {
    pub(super) fn new(guid: Guid, side: Side, config: &TransportConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            guid,
            guid_length: config.send_guid_length,
            max_packet_length: config.max_packet_length,
            max_packets_per_fec_group: config.max_packets_per_fec_group,
            sequence_number: 0,
            send_version_in_packet: side.is_client(),
            sequence_number_length: SequenceNumberLength::Six,
            next_sequence_number_length: SequenceNumberLength::Six,
            fec_group_number: 0,
            fec_group: None,
            packet_size: 0,
            queued_frames: Vec::new(),
            queued_retransmittable_frames: Vec::new(),
            rng,
        }
    }

    /// Last sequence number assigned to a packet
    pub(super) fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    #[cfg(test)]
    pub(super) fn set_sequence_number(&mut self, x: u64) {
        self.sequence_number = x;
    }

    /// Length of the sequence number in the packet being built
    pub(super) fn sequence_number_length(&self) -> SequenceNumberLength {
        self.sequence_number_length
    }

    /// Choose the sequence number length from how far the peer lags behind and how many
    /// packets fit in one round trip
    ///
    /// Takes effect one packet later, see [`serialize_packet`](Self::serialize_packet).
    pub(super) fn update_sequence_number_length(
        &mut self,
        least_packet_awaited_by_peer: u64,
        bytes_per_round_trip: u64,
    ) {
        let current_delta = (self.max_packets_per_fec_group as u64 + self.sequence_number + 1)
            .saturating_sub(least_packet_awaited_by_peer);
        let congestion_window = bytes_per_round_trip / self.max_packet_length.max(1) as u64;
        let delta = current_delta.max(congestion_window);
        self.next_sequence_number_length = SequenceNumberLength::min_for(delta.saturating_mul(4));
    }

    /// The server confirmed the version; later packets leave it out
    pub(super) fn stop_sending_version(&mut self) {
        if !self.send_version_in_packet {
            return;
        }
        self.send_version_in_packet = false;
        if !self.queued_frames.is_empty() {
            self.packet_size -= VERSION_SIZE;
        }
    }

    pub(super) fn has_pending_frames(&self) -> bool {
        !self.queued_frames.is_empty()
    }

    pub(super) fn has_room_for_stream_frame(
        &mut self,
        framer: &Framer,
        stream_id: StreamId,
        offset: u64,
    ) -> bool {
        self.bytes_free(framer)
            > min_stream_frame_size(stream_id, offset, !self.stream_frames_carry_length())
    }

    /// Build a stream frame carrying as much of `data` as fits in the current packet
    ///
    /// Returns the frame and the number of bytes of `data` it carries.
    pub(super) fn create_stream_frame(
        &mut self,
        framer: &Framer,
        stream_id: StreamId,
        data: &Bytes,
        offset: u64,
        fin: bool,
    ) -> (Frame, usize) {
        debug_assert!(self.has_room_for_stream_frame(framer, stream_id, offset));
        if data.is_empty() {
            debug_assert!(fin);
            let frame = StreamFrame {
                stream_id,
                fin: true,
                offset,
                data: Bytes::new(),
            };
            return (Frame::Stream(frame), 0);
        }
        // Sized as the last frame of the packet; a frame that does not take all the room left
        // costs two more bytes, which it then has.
        let free_bytes = self.bytes_free(framer);
        let room = free_bytes
            - min_stream_frame_size(stream_id, offset, !self.stream_frames_carry_length());
        let consumed = room.min(data.len());
        let frame = StreamFrame {
            stream_id,
            fin: fin && consumed == data.len(),
            offset,
            data: data.slice(..consumed),
        };
        (Frame::Stream(frame), consumed)
    }

    /// Queue `frame` for the packet being built
    ///
    /// Returns `false` if the frame does not fit; the packet should be serialized and the frame
    /// offered again.
    pub(super) fn add_frame(
        &mut self,
        framer: &Framer,
        frame: Frame,
        save_retransmittable_frames: bool,
    ) -> bool {
        let free_bytes = self.bytes_free(framer);
        let frame_len = serialized_frame_length(
            &frame,
            free_bytes,
            self.queued_frames.is_empty(),
            !self.stream_frames_carry_length(),
            self.sequence_number_length,
        );
        if frame_len == 0 {
            return false;
        }
        self.maybe_start_fec();
        self.packet_size += frame_len;
        // A stream frame followed by anything else gains a length prefix
        if self.has_unprefixed_trailing_stream_frame() {
            self.packet_size += STREAM_PAYLOAD_LENGTH_SIZE;
        }
        if save_retransmittable_frames && frame.is_retransmittable() {
            self.queued_retransmittable_frames.push(frame.clone());
        }
        self.queued_frames.push(frame);
        true
    }

    /// Serialize the queued frames into a packet
    ///
    /// The sequence number length computed by the latest
    /// [`update_sequence_number_length`](Self::update_sequence_number_length) is adopted for the
    /// following packet, unless that would change the length inside an open FEC group.
    pub(super) fn serialize_packet(
        &mut self,
        framer: &mut Framer,
        entropy: &dyn ReceivedEntropyHashCalculator,
    ) -> Result<SerializedPacket, BuildError> {
        debug_assert!(!self.queued_frames.is_empty());
        let entropy_flag = self.rng.gen::<bool>();
        let fec_group = self.fec_group.as_ref().map(|_| self.fec_group_number);
        let header = self.fill_packet_header(fec_group, false, entropy_flag);
        let frames = std::mem::take(&mut self.queued_frames);
        let retransmittable = std::mem::take(&mut self.queued_retransmittable_frames);
        let max_plaintext_size = framer.max_plaintext_size(self.max_packet_length);
        let result = framer.build_data_packet(&header, &frames, max_plaintext_size, entropy);
        self.packet_size = 0;

        let mut serialized = result?;
        if let Some(group) = self.fec_group.as_mut() {
            let start = start_of_fec_protected_data(
                header.public_header.guid_length,
                header.public_header.version_flag,
                header.public_header.sequence_number_length,
            );
            group.update(
                header.packet_sequence_number,
                header.entropy_flag,
                &serialized.packet.data()[start..],
            );
        }
        if !retransmittable.is_empty() {
            serialized.retransmittable_frames = Some(RetransmittableFrames {
                frames: retransmittable,
                ..RetransmittableFrames::default()
            });
        }
        self.maybe_latch_sequence_number_length();
        trace!(
            sequence_number = serialized.sequence_number,
            len = serialized.packet.len(),
            "serialized packet"
        );
        Ok(serialized)
    }

    /// Whether the open FEC group should be closed with an FEC packet now
    pub(super) fn should_send_fec(&self, force_close: bool) -> bool {
        self.fec_group.as_ref().is_some_and(|group| {
            group.num_received_packets() > 0
                && (force_close || group.num_received_packets() >= self.max_packets_per_fec_group)
        })
    }

    /// Serialize the FEC packet closing the open group
    pub(super) fn serialize_fec(&mut self, framer: &mut Framer) -> Result<SerializedPacket, BuildError> {
        debug_assert!(self.queued_frames.is_empty());
        let Some(group) = self.fec_group.take() else {
            return Err(BuildError::MissingFecGroup);
        };
        debug_assert!(group.num_received_packets() > 0);
        // FEC packets carry the parity of the protected entropy bits
        let header = self.fill_packet_header(Some(self.fec_group_number), true, group.entropy_parity());
        let fec = FecData {
            fec_group: self.fec_group_number,
            redundancy: Bytes::copy_from_slice(group.payload_parity()),
        };
        self.fec_group_number = 0;
        self.packet_size = 0;
        let serialized = framer.build_fec_packet(&header, &fec)?;
        self.maybe_latch_sequence_number_length();
        debug!(
            sequence_number = serialized.sequence_number,
            fec_group = fec.fec_group,
            "serialized FEC packet"
        );
        Ok(serialized)
    }

    /// Serialize `frames` on their own, outside any FEC group and with the sequence number
    /// length of the packet they were first sent in
    pub(super) fn reserialize_all_frames(
        &mut self,
        framer: &mut Framer,
        entropy: &dyn ReceivedEntropyHashCalculator,
        frames: &[Frame],
        original_length: SequenceNumberLength,
    ) -> Result<SerializedPacket, BuildError> {
        let start_length = self.sequence_number_length;
        let start_next_length = self.next_sequence_number_length;
        let start_max_packets_per_fec_group = self.max_packets_per_fec_group;
        let start_fec_group = self.fec_group.take();
        self.sequence_number_length = original_length;
        self.next_sequence_number_length = original_length;
        self.max_packets_per_fec_group = 0;

        let result = self.serialize_all_frames(framer, entropy, frames);

        self.sequence_number_length = start_length;
        self.next_sequence_number_length = start_next_length;
        self.max_packets_per_fec_group = start_max_packets_per_fec_group;
        self.fec_group = start_fec_group;
        result
    }

    /// Serialize a packet holding nothing but `frame`
    ///
    /// Frames queued for the current packet are discarded.
    pub(super) fn serialize_connection_close(
        &mut self,
        framer: &mut Framer,
        entropy: &dyn ReceivedEntropyHashCalculator,
        frame: ConnectionCloseFrame,
    ) -> Result<SerializedPacket, BuildError> {
        if !self.queued_frames.is_empty() {
            debug!(
                count = self.queued_frames.len(),
                "discarding queued frames for connection close"
            );
            self.queued_frames.clear();
            self.queued_retransmittable_frames.clear();
        }
        self.serialize_all_frames(framer, entropy, &[Frame::ConnectionClose(frame)])
    }

    fn serialize_all_frames(
        &mut self,
        framer: &mut Framer,
        entropy: &dyn ReceivedEntropyHashCalculator,
        frames: &[Frame],
    ) -> Result<SerializedPacket, BuildError> {
        debug_assert!(self.queued_frames.is_empty());
        for frame in frames {
            if !self.add_frame(framer, frame.clone(), false) {
                self.queued_frames.clear();
                return Err(BuildError::TooLarge(
                    framer.max_plaintext_size(self.max_packet_length),
                ));
            }
        }
        self.serialize_packet(framer, entropy)
    }

    fn fill_packet_header(
        &mut self,
        fec_group: Option<u64>,
        fec_flag: bool,
        entropy_flag: bool,
    ) -> PacketHeader {
        self.sequence_number += 1;
        let public_header = PublicHeader {
            guid_length: self.guid_length,
            version_flag: self.send_version_in_packet,
            sequence_number_length: self.sequence_number_length,
            ..PublicHeader::new(self.guid)
        };
        PacketHeader {
            entropy_flag,
            fec_flag,
            fec_group,
            ..PacketHeader::new(public_header, self.sequence_number)
        }
    }

    fn maybe_start_fec(&mut self) {
        if self.max_packets_per_fec_group > 0 && self.fec_group.is_none() {
            debug_assert!(self.queued_frames.is_empty());
            // The group starts with the next packet
            self.fec_group_number = self.sequence_number + 1;
            self.fec_group = Some(FecGroup::new());
        }
    }

    /// Packets of one FEC group must share a sequence number length
    fn maybe_latch_sequence_number_length(&mut self) {
        if self
            .fec_group
            .as_ref()
            .map_or(true, |group| group.num_received_packets() == 0)
        {
            self.sequence_number_length = self.next_sequence_number_length;
        }
    }

    fn bytes_free(&mut self, framer: &Framer) -> usize {
        let max_plaintext_size = framer.max_plaintext_size(self.max_packet_length);
        let mut packet_size = self.packet_size();
        if self.has_unprefixed_trailing_stream_frame() {
            packet_size += STREAM_PAYLOAD_LENGTH_SIZE;
        }
        max_plaintext_size.saturating_sub(packet_size)
    }

    fn packet_size(&mut self) -> usize {
        if self.queued_frames.is_empty() {
            self.packet_size = packet_header_size(
                self.guid_length,
                self.send_version_in_packet,
                self.sequence_number_length,
                self.max_packets_per_fec_group != 0,
            );
        }
        self.packet_size
    }

    /// A revived packet is zero-padded to the longest payload of its group, so inside FEC groups
    /// no stream frame may run to the end of the packet
    fn stream_frames_carry_length(&self) -> bool {
        self.max_packets_per_fec_group > 0
    }

    fn has_unprefixed_trailing_stream_frame(&self) -> bool {
        !self.stream_frames_carry_length()
            && matches!(self.queued_frames.last(), Some(Frame::Stream(_)))
    }
}
