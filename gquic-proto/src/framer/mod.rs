//! Conversion between packets on the wire and frames
//!
//! A [`Framer`] is stateful: it remembers the last sequence number it accepted (to expand
//! truncated sequence numbers), the last full guid it wrote (to expand truncated guids), the
//! negotiated version and the keys for each encryption level.

use bytes::{BufMut, Bytes};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    coding::{BufExt, BufMutExt},
    crypto::{Decrypter, EncryptionLevel, Encrypter, NullDecrypter, NullEncrypter},
    frame::{
        AckFrame, CongestionFeedbackFrame, ConnectionCloseFrame, Frame, GoAwayFrame,
        RstStreamFrame, StreamFrame,
    },
    packet::{
        packet_entropy_hash, start_of_encrypted_data, FecData, GuidLength, Packet, PacketHeader,
        PublicHeader, PublicResetPacket, SequenceNumberLength, SerializedPacket,
        PRIVATE_FLAGS_ENTROPY, PRIVATE_FLAGS_FEC, PRIVATE_FLAGS_FEC_GROUP, PRIVATE_FLAGS_MAX,
        PUBLIC_FLAGS_MAX, PUBLIC_FLAGS_RST, PUBLIC_FLAGS_VERSION, VERSION_SIZE,
    },
    EntropyHash, ErrorCode, Guid, Side, Version, MAX_PACKET_SIZE,
};

mod frames;
pub(crate) use frames::{
    min_stream_frame_size, serialized_frame_length, STREAM_PAYLOAD_LENGTH_SIZE,
};


/// Receives the pieces of a packet as the [`Framer`] parses them
///
/// Methods returning `bool` can stop processing of the current packet by returning `false`;
/// that is not an error.
#[allow(unused_variables)]
pub trait FramerVisitor {
    /// Parsing failed; see [`Framer::error`] and [`Framer::detailed_error`]
    fn on_error(&mut self, error: ErrorCode, detail: &'static str) {}

    /// A server saw a client announce `received_version`, which differs from the framer's
    ///
    /// Return `true` to adopt the version and continue processing the packet.
    fn on_protocol_version_mismatch(&mut self, received_version: Version) -> bool {
        false
    }

    /// A new packet is about to be processed
    fn on_packet(&mut self) {}

    /// A public reset packet was parsed
    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {}

    /// A version negotiation packet was parsed; its versions are in `header.versions`
    fn on_version_negotiation_packet(&mut self, header: &PublicHeader) {}

    /// A packet reconstructed from FEC data is about to be processed
    fn on_revived_packet(&mut self) {}

    /// The public header was parsed; nothing is authenticated yet
    fn on_unauthenticated_public_header(&mut self, header: &PublicHeader) -> bool {
        true
    }

    /// The sequence number was parsed; nothing is authenticated yet
    fn on_unauthenticated_header(&mut self, header: &PacketHeader) -> bool {
        true
    }

    /// The packet decrypted successfully and its private header was parsed
    fn on_packet_header(&mut self, header: &PacketHeader) -> bool;

    /// The FEC-protected part of a packet inside an FEC group
    fn on_fec_protected_payload(&mut self, payload: &[u8]) {}

    /// A stream frame was parsed
    fn on_stream_frame(&mut self, frame: StreamFrame) -> bool {
        true
    }

    /// An ack frame was parsed
    fn on_ack_frame(&mut self, frame: AckFrame) -> bool {
        true
    }

    /// A congestion feedback frame was parsed
    fn on_congestion_feedback_frame(&mut self, frame: CongestionFeedbackFrame) -> bool {
        true
    }

    /// A RST_STREAM frame was parsed
    fn on_rst_stream_frame(&mut self, frame: RstStreamFrame) -> bool {
        true
    }

    /// A CONNECTION_CLOSE frame was parsed
    fn on_connection_close_frame(&mut self, frame: ConnectionCloseFrame) -> bool {
        true
    }

    /// A GOAWAY frame was parsed
    fn on_go_away_frame(&mut self, frame: GoAwayFrame) -> bool {
        true
    }

    /// The payload of an FEC packet
    fn on_fec_data(&mut self, fec: FecData) {}

    /// Every frame of the packet was delivered
    fn on_packet_complete(&mut self) {}
}

/// Computes the cumulative entropy of received packets, for truncated acks
pub trait ReceivedEntropyHashCalculator {
    /// Entropy of every received packet up to and including `sequence_number`
    fn entropy_hash(&self, sequence_number: u64) -> EntropyHash;
}

/// Reasons a packet could not be serialized
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum BuildError {
    /// The frames need more room than the packet offers
    #[error("frames need more than {0} bytes")]
    TooLarge(usize),
    /// The header's sequence number length cannot express the ack's least unacked delta
    #[error("sequence number length too small for least unacked delta {0}")]
    LeastUnackedDeltaTooLarge(u64),
    /// Acks cannot report sequence number 0 as missing
    #[error("ack reports sequence number 0 missing")]
    MissingPacketZero,
    /// FEC packets must name the group they protect
    #[error("FEC packet without FEC group")]
    MissingFecGroup,
}

/// Serializes and parses packets for one endpoint of one connection
pub struct Framer {
    side: Side,
    version: Version,
    supported_versions: Vec<Version>,
    error: ErrorCode,
    detailed_error: &'static str,
    /// Sequence number of the last packet that decrypted successfully
    last_sequence_number: u64,
    /// Completes truncated guids on incoming packets
    last_serialized_guid: Guid,
    decrypter: Box<dyn Decrypter>,
    alternative_decrypter: Option<Box<dyn Decrypter>>,
    /// Whether a successful alternative decrypter replaces the primary for good
    alternative_decrypter_latch: bool,
    encrypters: [Option<Box<dyn Encrypter>>; 3],
}

impl Framer {
    /// Create a framer speaking the first of `supported_versions`, with null crypto installed
    pub fn new(supported_versions: &[Version], side: Side) -> Self {
        debug_assert!(!supported_versions.is_empty());
        Self {
            side,
            version: supported_versions[0],
            supported_versions: supported_versions.to_vec(),
            error: ErrorCode::NoError,
            detailed_error: "",
            last_sequence_number: 0,
            last_serialized_guid: Guid(0),
            decrypter: Box::new(NullDecrypter),
            alternative_decrypter: None,
            alternative_decrypter_latch: false,
            encrypters: [Some(Box::new(NullEncrypter)), None, None],
        }
    }

    /// Version used to parse and build packets
    pub fn version(&self) -> Version {
        self.version
    }

    /// Switch to another version, e.g. after negotiation
    pub fn set_version(&mut self, version: Version) {
        debug_assert!(self.is_supported_version(version));
        self.version = version;
    }

    /// Versions this framer may be switched to
    pub fn supported_versions(&self) -> &[Version] {
        &self.supported_versions
    }

    /// Whether `version` is among [`supported_versions`](Self::supported_versions)
    pub fn is_supported_version(&self, version: Version) -> bool {
        self.supported_versions.contains(&version)
    }

    /// Side of the connection this framer serves
    pub fn side(&self) -> Side {
        self.side
    }

    /// Error raised by the last failed parse
    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Explanation of [`error`](Self::error)
    pub fn detailed_error(&self) -> &'static str {
        self.detailed_error
    }

    /// Install the encrypter for `level`
    pub fn set_encrypter(&mut self, level: EncryptionLevel, encrypter: Box<dyn Encrypter>) {
        self.encrypters[level.index()] = Some(encrypter);
    }

    /// Whether an encrypter for `level` is installed
    pub fn has_encrypter(&self, level: EncryptionLevel) -> bool {
        self.encrypters[level.index()].is_some()
    }

    /// Replace the primary decrypter
    pub fn set_decrypter(&mut self, decrypter: Box<dyn Decrypter>) {
        self.decrypter = decrypter;
    }

    /// Install a decrypter to try when the primary one fails
    ///
    /// With `latch_once_used`, the first success makes it the primary decrypter for good;
    /// otherwise each success swaps it with the primary so it is tried first next time.
    pub fn set_alternative_decrypter(
        &mut self,
        decrypter: Box<dyn Decrypter>,
        latch_once_used: bool,
    ) {
        self.alternative_decrypter = Some(decrypter);
        self.alternative_decrypter_latch = latch_once_used;
    }

    #[cfg(test)]
    pub(crate) fn alternative_decrypter(&self) -> Option<&dyn Decrypter> {
        self.alternative_decrypter.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn set_last_sequence_number(&mut self, x: u64) {
        self.last_sequence_number = x;
    }

    #[cfg(test)]
    pub(crate) fn set_last_serialized_guid(&mut self, x: Guid) {
        self.last_serialized_guid = x;
    }

    /// Largest plaintext that fits in `ciphertext_size` under every installed encrypter
    pub fn max_plaintext_size(&self, ciphertext_size: usize) -> usize {
        self.encrypters
            .iter()
            .flatten()
            .map(|e| e.max_plaintext_size(ciphertext_size))
            .fold(ciphertext_size, usize::min)
    }

    /// Parse and authenticate `packet`, reporting its contents to `visitor`
    ///
    /// Returns `false` if the packet was malformed or could not be decrypted; the reason is in
    /// [`error`](Self::error). A visitor asking to stop does not count as failure, except from
    /// [`FramerVisitor::on_unauthenticated_header`].
    pub fn process_packet(&mut self, visitor: &mut dyn FramerVisitor, packet: &[u8]) -> bool {
        visitor.on_packet();
        let mut buf = packet;
        let public_header = match self.process_public_header(&mut buf) {
            Ok(x) => x,
            Err(detail) => {
                self.detailed_error = detail;
                return self.raise_error(visitor, ErrorCode::InvalidPacketHeader);
            }
        };

        if !visitor.on_unauthenticated_public_header(&public_header) {
            return true;
        }

        if self.side.is_server() && public_header.version_flag {
            let announced = public_header.versions[0];
            if announced != self.version {
                if !visitor.on_protocol_version_mismatch(announced) {
                    return true;
                }
                self.version = announced;
            }
        }

        if self.side.is_client() && public_header.version_flag {
            self.process_version_negotiation_packet(visitor, public_header, buf)
        } else if public_header.reset_flag {
            self.process_public_reset_packet(visitor, public_header, buf)
        } else {
            self.process_data_packet(visitor, public_header, packet, buf)
        }
    }

    /// Deliver the frames of a packet recovered from FEC data
    pub fn process_revived_packet(
        &mut self,
        visitor: &mut dyn FramerVisitor,
        header: &mut PacketHeader,
        payload: Bytes,
    ) -> bool {
        visitor.on_revived_packet();
        header.entropy_hash =
            packet_entropy_hash(header.packet_sequence_number, header.entropy_flag);
        if !visitor.on_packet_header(header) {
            return true;
        }
        if payload.len() > MAX_PACKET_SIZE {
            self.detailed_error = "Revived packet too large.";
            return self.raise_error(visitor, ErrorCode::PacketTooLarge);
        }
        if !self.process_frame_data(visitor, header, payload) {
            return false;
        }
        visitor.on_packet_complete();
        true
    }

    fn process_public_header(&mut self, buf: &mut &[u8]) -> Result<PublicHeader, &'static str> {
        let flags = buf
            .read::<u8>()
            .map_err(|_| "Unable to read public flags.")?;
        if flags > PUBLIC_FLAGS_MAX {
            return Err("Illegal public flags value.");
        }
        let reset_flag = flags & PUBLIC_FLAGS_RST != 0;
        let version_flag = flags & PUBLIC_FLAGS_VERSION != 0;
        if reset_flag && version_flag {
            return Err("Got version flag in reset packet");
        }

        let guid_length = GuidLength::from_public_flags(flags);
        let wire_guid = buf
            .read_uint(guid_length.bytes())
            .map_err(|_| "Unable to read GUID.")?;
        let guid = Guid((self.last_serialized_guid.0 & guid_length.retained_mask()) | wire_guid);

        let mut versions = Vec::new();
        if version_flag && self.side.is_server() {
            let tag = buf
                .read::<u32>()
                .map_err(|_| "Unable to read protocol version.")?;
            versions.push(Version::from_tag(tag));
        }

        Ok(PublicHeader {
            guid,
            guid_length,
            reset_flag,
            version_flag,
            sequence_number_length: SequenceNumberLength::from_public_flags(flags),
            versions,
        })
    }

    fn process_version_negotiation_packet(
        &mut self,
        visitor: &mut dyn FramerVisitor,
        mut header: PublicHeader,
        mut buf: &[u8],
    ) -> bool {
        debug_assert!(self.side.is_client());
        // Require at least one version so that an empty packet is an error
        loop {
            match buf.read::<u32>() {
                Ok(tag) => header.versions.push(Version::from_tag(tag)),
                Err(_) => {
                    self.detailed_error = "Unable to read supported version in negotiation.";
                    return self.raise_error(visitor, ErrorCode::InvalidVersionNegotiationPacket);
                }
            }
            if buf.is_empty() {
                break;
            }
        }
        visitor.on_version_negotiation_packet(&header);
        true
    }

    fn process_public_reset_packet(
        &mut self,
        visitor: &mut dyn FramerVisitor,
        public_header: PublicHeader,
        mut buf: &[u8],
    ) -> bool {
        let Ok(nonce_proof) = buf.read::<u64>() else {
            self.detailed_error = "Unable to read nonce proof.";
            return self.raise_error(visitor, ErrorCode::InvalidPublicRstPacket);
        };
        let Ok(rejected_sequence_number) = buf.read_uint(SequenceNumberLength::Six.bytes()) else {
            self.detailed_error = "Unable to read rejected sequence number.";
            return self.raise_error(visitor, ErrorCode::InvalidPublicRstPacket);
        };
        visitor.on_public_reset_packet(&PublicResetPacket {
            public_header,
            nonce_proof,
            rejected_sequence_number,
        });
        true
    }

    fn process_data_packet(
        &mut self,
        visitor: &mut dyn FramerVisitor,
        public_header: PublicHeader,
        packet: &[u8],
        mut buf: &[u8],
    ) -> bool {
        let sequence_number_length = public_header.sequence_number_length;
        let mut header = PacketHeader::new(public_header, 0);
        let Ok(wire) = buf.read_uint(sequence_number_length.bytes()) else {
            self.detailed_error = "Unable to read sequence number.";
            return self.raise_error(visitor, ErrorCode::InvalidPacketHeader);
        };
        header.packet_sequence_number =
            self.calculate_packet_sequence_number_from_wire(sequence_number_length, wire);
        if header.packet_sequence_number == 0 {
            self.detailed_error = "Packet sequence numbers cannot be 0.";
            return self.raise_error(visitor, ErrorCode::InvalidPacketHeader);
        }

        if !visitor.on_unauthenticated_header(&header) {
            return false;
        }

        let header_len = packet.len() - buf.len();
        let Some(plaintext) =
            self.decrypt_payload(header.packet_sequence_number, &packet[..header_len], buf)
        else {
            self.detailed_error = "Unable to decrypt payload.";
            return self.raise_error(visitor, ErrorCode::DecryptionFailure);
        };
        let mut payload = Bytes::from(plaintext);

        if let Err(detail) = self.process_private_header(&mut header, &mut payload) {
            self.detailed_error = detail;
            return self.raise_error(visitor, ErrorCode::InvalidPacketHeader);
        }

        if !visitor.on_packet_header(&header) {
            return true;
        }

        if packet.len() > MAX_PACKET_SIZE {
            self.detailed_error = "Packet too large.";
            return self.raise_error(visitor, ErrorCode::PacketTooLarge);
        }

        if !header.fec_flag {
            if header.fec_group.is_some() {
                visitor.on_fec_protected_payload(&payload);
            }
            if !self.process_frame_data(visitor, &header, payload) {
                return false;
            }
        } else {
            let Some(fec_group) = header.fec_group else {
                self.detailed_error = "FEC packet without FEC group.";
                return self.raise_error(visitor, ErrorCode::InvalidFecData);
            };
            visitor.on_fec_data(FecData {
                fec_group,
                redundancy: payload,
            });
        }

        visitor.on_packet_complete();
        true
    }

    fn process_private_header(
        &mut self,
        header: &mut PacketHeader,
        payload: &mut Bytes,
    ) -> Result<(), &'static str> {
        let flags = payload
            .read::<u8>()
            .map_err(|_| "Unable to read private flags.")?;
        if flags > PRIVATE_FLAGS_MAX {
            return Err("Illegal private flags value.");
        }
        header.entropy_flag = flags & PRIVATE_FLAGS_ENTROPY != 0;
        header.fec_flag = flags & PRIVATE_FLAGS_FEC != 0;
        if flags & PRIVATE_FLAGS_FEC_GROUP != 0 {
            let offset = payload
                .read::<u8>()
                .map_err(|_| "Unable to read first fec protected packet offset.")?;
            if u64::from(offset) >= header.packet_sequence_number {
                return Err("First fec protected packet offset must be less than the sequence number.");
            }
            header.fec_group = Some(header.packet_sequence_number - u64::from(offset));
        }
        header.entropy_hash =
            packet_entropy_hash(header.packet_sequence_number, header.entropy_flag);
        // Only authenticated sequence numbers may influence future reconstruction
        self.last_sequence_number = header.packet_sequence_number;
        Ok(())
    }

    fn decrypt_payload(
        &mut self,
        sequence_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        if let Some(plaintext) =
            self.decrypter
                .decrypt_packet(sequence_number, associated_data, ciphertext)
        {
            return Some(plaintext);
        }
        let alternative = self.alternative_decrypter.as_mut()?;
        let plaintext = alternative.decrypt_packet(sequence_number, associated_data, ciphertext)?;
        if self.alternative_decrypter_latch {
            if let Some(alternative) = self.alternative_decrypter.take() {
                trace!("latching alternative decrypter");
                self.decrypter = alternative;
            }
        } else {
            std::mem::swap(&mut self.decrypter, alternative);
        }
        Some(plaintext)
    }

    fn process_frame_data(
        &mut self,
        visitor: &mut dyn FramerVisitor,
        header: &PacketHeader,
        mut payload: Bytes,
    ) -> bool {
        if payload.is_empty() {
            self.detailed_error = "Packet has no frames.";
            return self.raise_error(visitor, ErrorCode::MissingPayload);
        }
        while !payload.is_empty() {
            let Ok(frame_type) = payload.read::<u8>() else {
                break;
            };
            let (code, result) = if frame_type & frames::SPECIAL_FRAME_MASK != 0 {
                if frame_type & frames::STREAM_FRAME_FLAG != 0 {
                    let frame = frames::decode_stream_frame(frame_type, &mut payload);
                    (ErrorCode::InvalidStreamData, frame.map(|x| visitor.on_stream_frame(x)))
                } else if frame_type & frames::ACK_FRAME_FLAG != 0 {
                    let frame = frames::decode_ack_frame(header, frame_type, &mut payload);
                    (ErrorCode::InvalidAckData, frame.map(|x| visitor.on_ack_frame(x)))
                } else {
                    let frame = frames::decode_congestion_feedback_frame(&mut payload);
                    (
                        ErrorCode::InvalidCongestionFeedbackData,
                        frame.map(|x| visitor.on_congestion_feedback_frame(x)),
                    )
                }
            } else {
                match frame_type {
                    // Padding runs to the end of the packet
                    frames::PADDING_FRAME => return true,
                    frames::RST_STREAM_FRAME => {
                        let frame = frames::decode_rst_stream_frame(&mut payload);
                        (
                            ErrorCode::InvalidRstStreamData,
                            frame.map(|x| visitor.on_rst_stream_frame(x)),
                        )
                    }
                    frames::CONNECTION_CLOSE_FRAME => {
                        let frame = frames::decode_connection_close_frame(&mut payload);
                        (
                            ErrorCode::InvalidConnectionCloseData,
                            frame.map(|x| visitor.on_connection_close_frame(x)),
                        )
                    }
                    frames::GOAWAY_FRAME => {
                        let frame = frames::decode_go_away_frame(&mut payload);
                        (ErrorCode::InvalidGoAwayData, frame.map(|x| visitor.on_go_away_frame(x)))
                    }
                    _ => (ErrorCode::InvalidFrameData, Err("Illegal frame type.")),
                }
            };
            match result {
                Ok(true) => {}
                Ok(false) => {
                    trace!("visitor asked to stop processing frames");
                    return true;
                }
                Err(detail) => {
                    debug!(frame_type, detail, "unable to process frame");
                    self.detailed_error = detail;
                    return self.raise_error(visitor, code);
                }
            }
        }
        true
    }

    fn raise_error(&mut self, visitor: &mut dyn FramerVisitor, error: ErrorCode) -> bool {
        debug!(%error, detail = self.detailed_error, "framer error");
        self.error = error;
        visitor.on_error(error, self.detailed_error);
        false
    }

    /// Expand a truncated sequence number to the candidate closest to the next expected one
    pub(crate) fn calculate_packet_sequence_number_from_wire(
        &self,
        length: SequenceNumberLength,
        wire: u64,
    ) -> u64 {
        // The new sequence number might have wrapped to the next epoch, or it might have
        // reverse wrapped to the previous epoch, or it might remain in the same epoch.
        let epoch_delta = 1u64 << (8 * length.bytes());
        let next = self.last_sequence_number.wrapping_add(1);
        let epoch = self.last_sequence_number & !(epoch_delta - 1);
        let prev_epoch = epoch.wrapping_sub(epoch_delta);
        let next_epoch = epoch.wrapping_add(epoch_delta);
        closest_to(
            next,
            epoch.wrapping_add(wire),
            closest_to(
                next,
                prev_epoch.wrapping_add(wire),
                next_epoch.wrapping_add(wire),
            ),
        )
    }

    /// Serialize a data packet holding `frames`, using at most `packet_size` bytes
    ///
    /// An ack too large for the space left is truncated, which needs `entropy` to recompute
    /// the received entropy for the lowered largest observed sequence number.
    pub fn build_data_packet(
        &mut self,
        header: &PacketHeader,
        frames: &[Frame],
        packet_size: usize,
        entropy: &dyn ReceivedEntropyHashCalculator,
    ) -> Result<SerializedPacket, BuildError> {
        let mut buf = Vec::with_capacity(packet_size);
        let header_len = self.append_packet_header(header, &mut buf);
        for (i, frame) in frames.iter().enumerate() {
            // Revived FEC packets end in zero padding; grouped stream frames keep their length
            let last_frame_in_packet = i == frames.len() - 1 && header.fec_group.is_none();
            match frame {
                Frame::Padding => {
                    buf.put_u8(frames::PADDING_FRAME);
                    if buf.len() < packet_size {
                        buf.resize(packet_size, 0);
                    }
                }
                Frame::Stream(x) => frames::encode_stream_frame(x, last_frame_in_packet, &mut buf),
                Frame::Ack(x) => frames::encode_ack_frame(header, x, packet_size, entropy, &mut buf)?,
                Frame::CongestionFeedback(x) => {
                    frames::encode_congestion_feedback_frame(x, &mut buf)
                }
                Frame::RstStream(x) => frames::encode_rst_stream_frame(x, &mut buf),
                Frame::ConnectionClose(x) => frames::encode_connection_close_frame(x, &mut buf),
                Frame::GoAway(x) => frames::encode_go_away_frame(x, &mut buf),
            }
            if buf.len() > packet_size {
                return Err(BuildError::TooLarge(packet_size));
            }
        }
        Ok(SerializedPacket {
            sequence_number: header.packet_sequence_number,
            sequence_number_length: header.public_header.sequence_number_length,
            packet: Packet::new(Bytes::from(buf), header_len, false),
            entropy_hash: packet_entropy_hash(header.packet_sequence_number, header.entropy_flag),
            retransmittable_frames: None,
        })
    }

    /// Serialize an FEC packet carrying `fec.redundancy`
    pub fn build_fec_packet(
        &mut self,
        header: &PacketHeader,
        fec: &FecData,
    ) -> Result<SerializedPacket, BuildError> {
        if header.fec_group.is_none() {
            return Err(BuildError::MissingFecGroup);
        }
        let mut buf = Vec::new();
        let header_len = self.append_packet_header(header, &mut buf);
        buf.put_slice(&fec.redundancy);
        Ok(SerializedPacket {
            sequence_number: header.packet_sequence_number,
            sequence_number_length: header.public_header.sequence_number_length,
            packet: Packet::new(Bytes::from(buf), header_len, true),
            entropy_hash: packet_entropy_hash(header.packet_sequence_number, header.entropy_flag),
            retransmittable_frames: None,
        })
    }

    /// Serialize an unauthenticated public reset
    pub fn build_public_reset_packet(packet: &PublicResetPacket) -> Bytes {
        let mut buf = Vec::with_capacity(1 + 8 + 8 + 6);
        buf.write(PUBLIC_FLAGS_RST | GuidLength::Eight.flags());
        buf.write(packet.public_header.guid.0);
        buf.write(packet.nonce_proof);
        buf.write_uint(
            packet.rejected_sequence_number,
            SequenceNumberLength::Six.bytes(),
        );
        Bytes::from(buf)
    }

    /// Serialize a version negotiation packet listing `versions`
    pub fn build_version_negotiation_packet(guid: Guid, versions: &[Version]) -> Bytes {
        let mut buf = Vec::with_capacity(1 + 8 + VERSION_SIZE * versions.len());
        buf.write(PUBLIC_FLAGS_VERSION | GuidLength::Eight.flags());
        buf.write(guid.0);
        for version in versions {
            buf.write(version.tag());
        }
        Bytes::from(buf)
    }

    /// Encrypt `packet` at `level`, keeping its header in the clear
    ///
    /// Returns `None` if no encrypter is installed for `level` or encryption failed.
    pub fn encrypt_packet(
        &mut self,
        level: EncryptionLevel,
        sequence_number: u64,
        packet: &Packet,
    ) -> Option<Bytes> {
        let Some(encrypter) = self.encrypters[level.index()].as_ref() else {
            debug!(?level, "no encrypter installed");
            self.error = ErrorCode::EncryptionFailure;
            return None;
        };
        let Some(ciphertext) = encrypter.encrypt_packet(
            sequence_number,
            packet.associated_data(),
            packet.plaintext(),
        ) else {
            self.error = ErrorCode::EncryptionFailure;
            return None;
        };
        let mut buf = Vec::with_capacity(packet.associated_data().len() + ciphertext.len());
        buf.put_slice(packet.associated_data());
        buf.put_slice(&ciphertext);
        Some(Bytes::from(buf))
    }

    /// Read the guid of a packet without parsing anything else
    ///
    /// Only packets carrying the full eight-byte guid can be attributed this way.
    pub fn read_guid_from_packet(packet: &[u8]) -> Option<Guid> {
        let mut buf = packet;
        let flags = buf.read::<u8>().ok()?;
        if flags > PUBLIC_FLAGS_MAX || GuidLength::from_public_flags(flags) != GuidLength::Eight {
            return None;
        }
        buf.read::<u64>().ok().map(Guid)
    }

    /// Returns the offset of the private flags byte
    fn append_packet_header(&mut self, header: &PacketHeader, buf: &mut Vec<u8>) -> usize {
        let public = &header.public_header;
        let mut flags = public.sequence_number_length.public_flags() | public.guid_length.flags();
        if public.reset_flag {
            flags |= PUBLIC_FLAGS_RST;
        }
        if public.version_flag {
            flags |= PUBLIC_FLAGS_VERSION;
        }
        buf.write(flags);
        buf.write_uint(public.guid.0, public.guid_length.bytes());
        self.last_serialized_guid = public.guid;
        if public.version_flag {
            debug_assert!(self.side.is_client());
            buf.write(self.version.tag());
        }
        buf.write_uint(
            header.packet_sequence_number,
            public.sequence_number_length.bytes(),
        );
        let header_len = buf.len();
        debug_assert_eq!(
            header_len,
            start_of_encrypted_data(
                public.guid_length,
                public.version_flag,
                public.sequence_number_length
            )
        );

        let mut private_flags = 0;
        if header.entropy_flag {
            private_flags |= PRIVATE_FLAGS_ENTROPY;
        }
        if header.fec_group.is_some() {
            private_flags |= PRIVATE_FLAGS_FEC_GROUP;
        }
        if header.fec_flag {
            private_flags |= PRIVATE_FLAGS_FEC;
        }
        buf.write::<u8>(private_flags);
        if let Some(fec_group) = header.fec_group {
            // Offset from this packet back to the first packet of its group
            debug_assert!(header.packet_sequence_number >= fec_group);
            debug_assert!(header.packet_sequence_number - fec_group < 255);
            buf.write((header.packet_sequence_number - fec_group) as u8);
        }
        header_len
    }
}

fn closest_to(target: u64, a: u64, b: u64) -> u64 {
    let delta = |x: u64| x.max(target) - x.min(target);
    if delta(a) < delta(b) {
        a
    } else {
        b
    }
}
