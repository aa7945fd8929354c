use std::{
    collections::{BTreeMap, VecDeque},
    fmt, mem,
    net::SocketAddr,
    sync::Arc,
};

use bytes::{Buf, Bytes};
use tracing::{debug, error, trace, warn};

use crate::{
    config::TransportConfig,
    congestion::TransmissionType,
    crypto::{Decrypter, EncryptionLevel, Encrypter},
    fec::FecGroup,
    frame::{
        AckFrame, CongestionFeedbackFrame, ConnectionCloseFrame, Frame, GoAwayFrame,
        RstStreamFrame, StreamFrame,
    },
    framer::{Framer, FramerVisitor},
    io::{Clock, PacketWriter, WriteResult},
    packet::{FecData, Packet, PacketHeader, PublicHeader, PublicResetPacket},
    Duration, ErrorCode, Guid, Instant, RstStreamErrorCode, Side, StreamId, Version,
    MAX_PACKET_GAP,
};

mod congestion_manager;
use congestion_manager::CongestionManager;

mod packet_creator;
use packet_creator::PacketCreator;

mod received;
use received::ReceivedPacketManager;

mod sent;
use sent::SentPacketManager;

mod stats;
pub use stats::ConnectionStats;

mod timer;
pub(crate) use timer::Timer;
use timer::TimerTable;

/// Receive-side FEC groups kept at once; older ones are dropped
const MAX_FEC_GROUPS: usize = 2;
/// Data on this stream is part of the crypto handshake
const CRYPTO_STREAM_ID: StreamId = StreamId(1);

/// Protocol state and logic for a single connection
///
/// A `Connection` is fed datagrams through [`process_udp_packet`](Self::process_udp_packet),
/// writes its own datagrams through the [`PacketWriter`] it owns, and reports what happened
/// through [`poll`](Self::poll). The host calls [`handle_timeout`](Self::handle_timeout) once
/// the instant returned by [`poll_timeout`](Self::poll_timeout) has passed.
pub struct Connection {
    config: Arc<TransportConfig>,
    guid: Guid,
    side: Side,
    self_address: SocketAddr,
    peer_address: SocketAddr,
    clock: Box<dyn Clock>,
    writer: Box<dyn PacketWriter>,
    framer: Framer,
    creator: PacketCreator,
    received: ReceivedPacketManager,
    sent: SentPacketManager,
    congestion: CongestionManager,
    /// Receive-side FEC groups by first protected sequence number
    fec_groups: BTreeMap<u64, FecGroup>,
    /// Header of the last packet accepted
    last_header: Option<PacketHeader>,
    /// Frames of the packet being processed
    last: LastPacket,
    /// Acks in packets up to this one are stale
    largest_seen_packet_with_ack: u64,
    version_negotiation_state: VersionNegotiationState,
    /// Level new packets are encrypted at
    encryption_level: EncryptionLevel,
    /// Serialized packets waiting for the writer or the congestion controller, oldest first
    queued_packets: VecDeque<QueuedPacket>,
    /// Retransmittable frames waiting to be bundled into the next packet
    queued_control_frames: VecDeque<Frame>,
    should_send_ack: bool,
    pending_feedback: Option<CongestionFeedbackFrame>,
    pending_version_negotiation_packet: bool,
    /// Packets that failed to decrypt, retried once new keys are installed
    undecryptable_packets: VecDeque<Bytes>,
    write_blocked: bool,
    connected: bool,
    consecutive_rto_count: u32,
    time_of_last_received_packet: Instant,
    time_of_last_sent_packet: Instant,
    timers: TimerTable,
    events: VecDeque<Event>,
    stats: ConnectionStats,
    /// The encrypted connection close packet, replayed by the time-wait list
    close_packet: Option<Bytes>,
}

impl Connection {
    /// Create a connection between `self_address` and `peer_address`
    ///
    /// A client announces the first of the configured versions in its packets until the server
    /// confirms it.
    pub fn new(
        guid: Guid,
        side: Side,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        config: Arc<TransportConfig>,
        clock: Box<dyn Clock>,
        writer: Box<dyn PacketWriter>,
    ) -> Self {
        let now = clock.now();
        let framer = Framer::new(&config.supported_versions, side);
        let creator = PacketCreator::new(guid, side, &config);
        let congestion = CongestionManager::new(
            &*config.congestion_controller_factory,
            now,
            config.max_packet_length,
        );
        let mut this = Self {
            guid,
            side,
            self_address,
            peer_address,
            clock,
            writer,
            framer,
            creator,
            received: ReceivedPacketManager::new(),
            sent: SentPacketManager::default(),
            congestion,
            fec_groups: BTreeMap::new(),
            last_header: None,
            last: LastPacket::default(),
            largest_seen_packet_with_ack: 0,
            version_negotiation_state: VersionNegotiationState::StartNegotiation,
            encryption_level: EncryptionLevel::None,
            queued_packets: VecDeque::new(),
            queued_control_frames: VecDeque::new(),
            should_send_ack: false,
            pending_feedback: None,
            pending_version_negotiation_packet: false,
            undecryptable_packets: VecDeque::new(),
            write_blocked: false,
            connected: true,
            consecutive_rto_count: 0,
            time_of_last_received_packet: now,
            time_of_last_sent_packet: now,
            timers: TimerTable::default(),
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            close_packet: None,
            config,
        };
        this.timers
            .set(Timer::Idle, now + this.config.idle_timeout);
        debug!(%guid, ?side, version = %this.framer.version(), "connection created");
        this
    }

    /// Returns the next time at which `handle_timeout` should be called
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.peek()
    }

    /// Returns application-facing events
    ///
    /// Connections should be polled for events after every call that feeds them input.
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Process timer expirations up to the current time
    pub fn handle_timeout(&mut self) {
        let now = self.clock.now();
        while let Some(timer) = self.timers.expire_before(now) {
            trace!(?timer, "timeout");
            match timer {
                Timer::Ack => self.send_ack(),
                Timer::Retransmission => self.on_retransmission_timeout(),
                Timer::Send => {
                    if !self.write_blocked {
                        self.on_can_write();
                    }
                }
                Timer::Idle => self.on_idle_timeout(),
            }
        }
    }

    /// Process one datagram received from `peer_address` on `self_address`
    pub fn process_udp_packet(
        &mut self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        packet: &[u8],
    ) {
        if !self.connected {
            return;
        }
        self.stats.bytes_received += packet.len() as u64;
        self.stats.packets_received += 1;
        let address_migrating =
            self_address != self.self_address || peer_address != self.peer_address;

        self.last = LastPacket {
            size: packet.len(),
            address_migrating,
            ..LastPacket::default()
        };
        if !self.process_packet_data(packet) {
            // The packet may have been protected with keys that are not installed yet
            if self.encryption_level != EncryptionLevel::ForwardSecure
                && self.framer.error() == ErrorCode::DecryptionFailure
                && self.undecryptable_packets.len() < self.config.max_undecryptable_packets
            {
                trace!("queueing undecryptable packet");
                self.undecryptable_packets
                    .push_back(Bytes::copy_from_slice(packet));
            } else {
                self.stats.packets_dropped += 1;
            }
            debug!(error = %self.framer.error(), "unable to process packet");
            return;
        }
        self.maybe_process_undecryptable_packets();
        self.maybe_process_revived_packet();
    }

    /// Send as much of `data` as the congestion controller allows
    ///
    /// `data` starts at `offset` in the stream. Acks and control frames waiting to be sent are
    /// bundled ahead of the stream data.
    pub fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        mut data: Bytes,
        offset: u64,
        fin: bool,
    ) -> ConsumedData {
        let mut consumed = ConsumedData::default();
        if !self.connected || (data.is_empty() && !fin) {
            return consumed;
        }
        let is_handshake = stream_id == CRYPTO_STREAM_ID;
        // A delayed ack can ride along instead of being sent on its own
        if self.timers.is_set(Timer::Ack) {
            self.queue_ack();
        }
        self.add_pending_frames();

        if !self
            .creator
            .has_room_for_stream_frame(&self.framer, stream_id, offset)
        {
            self.serialize_and_send_packet();
        }
        while self.can_write(TransmissionType::NotRetransmission, true, is_handshake) {
            let frame_offset = offset + consumed.bytes_consumed as u64;
            let (frame, len) =
                self.creator
                    .create_stream_frame(&self.framer, stream_id, &data, frame_offset, fin);
            let added = self.creator.add_frame(&self.framer, frame, true);
            debug_assert!(added);
            consumed.bytes_consumed += len;
            consumed.fin_consumed = fin && len == data.len();
            data.advance(len);
            if !self.creator.has_room_for_stream_frame(
                &self.framer,
                stream_id,
                frame_offset + len as u64,
            ) {
                self.serialize_and_send_packet();
            }
            if data.is_empty() {
                break;
            }
        }
        self.flush();
        trace!(
            %stream_id,
            bytes = consumed.bytes_consumed,
            fin = consumed.fin_consumed,
            "consumed stream data"
        );
        consumed
    }

    /// Abruptly terminate a stream
    pub fn send_rst_stream(&mut self, stream_id: StreamId, error_code: RstStreamErrorCode) {
        self.add_control_frame(Frame::RstStream(RstStreamFrame {
            stream_id,
            error_code,
            error_details: Bytes::new(),
        }));
    }

    /// Tell the peer that no streams beyond `last_good_stream_id` will be processed
    pub fn send_go_away(
        &mut self,
        error_code: ErrorCode,
        last_good_stream_id: StreamId,
        reason: impl Into<Bytes>,
    ) {
        self.add_control_frame(Frame::GoAway(GoAwayFrame {
            error_code,
            last_good_stream_id,
            reason_phrase: reason.into(),
        }));
    }

    /// Close the connection, telling the peer why
    pub fn send_connection_close(&mut self, error: ErrorCode) {
        self.send_connection_close_with_details(error, Bytes::new());
    }

    /// Close the connection, telling the peer why in more detail
    ///
    /// The close packet is only written if the writer is not blocked; it is kept either way
    /// for [`take_close_packet`](Self::take_close_packet).
    pub fn send_connection_close_with_details(
        &mut self,
        error: ErrorCode,
        details: impl Into<Bytes>,
    ) {
        if !self.connected {
            return;
        }
        let details = details.into();
        debug!(%error, ?details, "sending connection close");
        self.send_connection_close_packet(ConnectionCloseFrame {
            error_code: error,
            error_details: details,
        });
        self.close_connection(error, false);
    }

    /// The writer may accept packets again
    ///
    /// Flushes queued packets and pending frames. Returns `false` if the writer blocked again.
    pub fn on_can_write(&mut self) -> bool {
        self.write_blocked = false;
        self.write_queued_packets();
        if self.can_write(TransmissionType::NotRetransmission, true, false) {
            self.send_queued_frames();
            if self.connected && !self.write_blocked {
                self.events.push_back(Event::CanWrite);
            }
        }
        !self.write_blocked
    }

    /// Install the encrypter for `level`
    pub fn set_encrypter(&mut self, level: EncryptionLevel, encrypter: Box<dyn Encrypter>) {
        self.framer.set_encrypter(level, encrypter);
    }

    /// Level at which new packets are encrypted
    pub fn set_default_encryption_level(&mut self, level: EncryptionLevel) {
        debug!(?level, "default encryption level");
        self.encryption_level = level;
    }

    /// Replace the primary decrypter, retrying packets that failed to decrypt
    pub fn set_decrypter(&mut self, decrypter: Box<dyn Decrypter>) {
        self.framer.set_decrypter(decrypter);
        self.maybe_process_undecryptable_packets();
    }

    /// Install a decrypter to try when the primary one fails, retrying packets that failed to
    /// decrypt
    ///
    /// See [`Framer::set_alternative_decrypter`].
    pub fn set_alternative_decrypter(
        &mut self,
        decrypter: Box<dyn Decrypter>,
        latch_once_used: bool,
    ) {
        self.framer
            .set_alternative_decrypter(decrypter, latch_once_used);
        self.maybe_process_undecryptable_packets();
    }

    /// Take the encrypted connection close packet, once the connection sent one
    pub fn take_close_packet(&mut self) -> Option<Bytes> {
        self.close_packet.take()
    }

    /// Connection identifier
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Whether this is the client or the server end
    pub fn side(&self) -> Side {
        self.side
    }

    /// Version packets are currently parsed and built with
    pub fn version(&self) -> Version {
        self.framer.version()
    }

    /// Progress of version negotiation
    pub fn version_negotiation_state(&self) -> VersionNegotiationState {
        self.version_negotiation_state
    }

    /// Level at which new packets are encrypted
    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the writer reported itself blocked
    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    /// Whether packets or frames are waiting to be sent
    pub fn has_queued_data(&self) -> bool {
        !self.queued_packets.is_empty() || self.has_pending_frames()
    }

    /// Local address
    pub fn self_address(&self) -> SocketAddr {
        self.self_address
    }

    /// Address of the peer
    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    /// Connection statistics
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats;
        stats.rtt = self.congestion.smoothed_rtt();
        stats
    }

    #[cfg(test)]
    pub(crate) fn sent_entropy_hash(&self, sequence_number: u64) -> crate::EntropyHash {
        self.sent.entropy().entropy_hash(sequence_number)
    }

    #[cfg(test)]
    pub(crate) fn received_entropy_hash(&self, sequence_number: u64) -> crate::EntropyHash {
        crate::framer::ReceivedEntropyHashCalculator::entropy_hash(&self.received, sequence_number)
    }

    #[cfg(test)]
    pub(crate) fn sequence_number(&self) -> u64 {
        self.creator.sequence_number()
    }

    #[cfg(test)]
    pub(crate) fn num_queued_packets(&self) -> usize {
        self.queued_packets.len()
    }

    #[cfg(test)]
    pub(crate) fn num_undecryptable_packets(&self) -> usize {
        self.undecryptable_packets.len()
    }

    #[cfg(test)]
    pub(crate) fn num_unacked_packets(&self) -> usize {
        self.sent.num_unacked_packets()
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, timer: Timer) -> Option<Instant> {
        self.timers.get(timer)
    }

    fn process_packet_data(&mut self, packet: &[u8]) -> bool {
        let processed = self.with_visitor(|framer, visitor| framer.process_packet(visitor, packet));
        self.on_packet_processed();
        processed
    }

    /// Run the framer with a visitor borrowing the state it needs
    fn with_visitor<R>(&mut self, f: impl FnOnce(&mut Framer, &mut PacketVisitor<'_>) -> R) -> R {
        let mut visitor = PacketVisitor {
            guid: self.guid,
            side: self.side,
            version: self.framer.version(),
            supported_versions: &self.config.supported_versions,
            state: &mut self.version_negotiation_state,
            creator: &mut self.creator,
            received: &self.received,
            sent: &self.sent,
            fec_groups: &mut self.fec_groups,
            stats: &mut self.stats,
            events: &mut self.events,
            last_header: &mut self.last_header,
            largest_seen_packet_with_ack: self.largest_seen_packet_with_ack,
            last: &mut self.last,
        };
        f(&mut self.framer, &mut visitor)
    }

    /// Act on what the visitor collected
    fn on_packet_processed(&mut self) {
        let last = mem::take(&mut self.last);
        if let Some(close) = last.close {
            if close.send_packet {
                self.send_connection_close_with_details(close.error, close.details);
            } else {
                self.close_connection(close.error, close.from_peer);
            }
            return;
        }
        if let Some(versions) = last.version_negotiation {
            self.on_version_negotiation_packet(&versions);
            return;
        }
        if last.send_version_negotiation {
            self.pending_version_negotiation_packet = true;
            self.send_version_negotiation_packet();
            return;
        }
        if last.complete {
            self.on_packet_complete(last);
        }
    }

    fn on_packet_complete(&mut self, last: LastPacket) {
        if !self.connected {
            return;
        }
        let Some(header) = self.last_header.clone() else {
            return;
        };
        let now = self.clock.now();
        self.time_of_last_received_packet = now;
        let sequence_number = header.packet_sequence_number;
        trace!(
            sequence_number,
            revived = last.revived,
            acks = last.ack_frames.len(),
            streams = last.stream_frames.len(),
            "got packet"
        );
        // Must precede ack processing, which moves our least unacked forward
        let should_instigate_ack = self.should_last_packet_instigate_ack(&last);

        self.congestion.record_incoming_packet(
            last.size as u64,
            sequence_number,
            now,
            last.revived,
        );
        self.received.record_packet_received(&header, now);

        if !last.stream_frames.is_empty() {
            self.events
                .push_back(Event::StreamFrames(last.stream_frames));
        }
        for frame in last.go_away_frames {
            debug!(error = %frame.error_code, last_good = %frame.last_good_stream_id, "peer going away");
            self.events.push_back(Event::GoAway(frame));
        }
        for frame in last.rst_stream_frames {
            self.events.push_back(Event::RstStream(frame));
        }
        for ack in &last.ack_frames {
            self.process_ack_frame(ack, sequence_number, now);
        }
        for feedback in &last.congestion_frames {
            self.congestion
                .on_incoming_congestion_feedback(feedback, now);
        }
        if let Some(close) = last.close_frames.first() {
            debug!(error = %close.error_code, details = ?close.error_details, "peer closed connection");
            self.close_connection(close.error_code, true);
            return;
        }
        if !self.connected {
            return;
        }

        if should_instigate_ack {
            if self.received.has_missing_packets() {
                self.send_ack();
            } else if !self.timers.is_set(Timer::Ack) {
                self.timers
                    .set(Timer::Ack, now + self.config.delayed_ack_time);
            }
        }
        if !last.ack_frames.is_empty() {
            // The ack may have opened the congestion window
            let delay = self.congestion.time_until_send(
                now,
                TransmissionType::NotRetransmission,
                true,
                false,
            );
            if delay == Some(Duration::ZERO) && !self.write_blocked {
                self.timers.stop(Timer::Send);
                self.on_can_write();
            }
        }
    }

    /// Whether the packet carried something the peer needs acknowledged
    fn should_last_packet_instigate_ack(&self, last: &LastPacket) -> bool {
        if !last.stream_frames.is_empty()
            || !last.go_away_frames.is_empty()
            || !last.rst_stream_frames.is_empty()
        {
            return true;
        }
        // The peer may still wait for packets we no longer intend to send; an ack carries our
        // least unacked to it
        last.ack_frames
            .last()
            .and_then(|ack| ack.received_info.missing_packets.first())
            .is_some_and(|&first_missing| self.least_unacked() > first_missing)
    }

    fn process_ack_frame(&mut self, ack: &AckFrame, sequence_number: u64, now: Instant) {
        self.largest_seen_packet_with_ack = sequence_number;
        self.received
            .update_packet_information_received_by_peer(ack);
        self.received
            .update_packet_information_sent_by_peer(ack);
        self.close_fec_groups_before(ack.sent_info.least_unacked + 1);
        self.sent
            .entropy_mut()
            .clear_entropy_before(self.received.least_packet_awaited_by_peer().saturating_sub(1));

        let outcome = self.sent.on_ack(ack);
        self.congestion.on_incoming_ack_frame(ack, now);
        if !outcome.acked.is_empty() {
            self.consecutive_rto_count = 0;
            self.timers.stop(Timer::Retransmission);
            if self.sent.has_unacked_packets() {
                let delay = self.congestion.retransmission_delay(0);
                self.timers.set(Timer::Retransmission, now + delay);
            }
            self.events
                .push_back(Event::PacketsAcked(outcome.acked));
        }
        for sequence_number in outcome.nacked {
            self.retransmit_packet(sequence_number, TransmissionType::NackRetransmission);
        }
    }

    fn close_fec_groups_before(&mut self, sequence_number: u64) {
        let current = self.last_header.as_ref().and_then(|x| x.fec_group);
        self.fec_groups.retain(|&number, group| {
            Some(number) == current || !group.protects_packets_before(sequence_number)
        });
    }

    fn maybe_process_revived_packet(&mut self) {
        if !self.connected {
            return;
        }
        let Some(number) = self.last_header.as_ref().and_then(|x| x.fec_group) else {
            return;
        };
        let Some(group) = self.fec_groups.get_mut(&number) else {
            return;
        };
        let Some((sequence_number, entropy_flag, payload)) = group.revive() else {
            return;
        };
        self.fec_groups.remove(&number);
        debug!(sequence_number, "revived packet from FEC data");
        self.stats.packets_revived += 1;
        let mut header = PacketHeader {
            entropy_flag,
            ..PacketHeader::new(PublicHeader::new(self.guid), sequence_number)
        };
        self.last = LastPacket {
            size: payload.len(),
            revived: true,
            ..LastPacket::default()
        };
        self.with_visitor(|framer, visitor| {
            framer.process_revived_packet(visitor, &mut header, payload)
        });
        self.on_packet_processed();
    }

    fn maybe_process_undecryptable_packets(&mut self) {
        while self.connected {
            let Some(packet) = self.undecryptable_packets.pop_front() else {
                break;
            };
            trace!("retrying undecryptable packet");
            self.last = LastPacket {
                size: packet.len(),
                ..LastPacket::default()
            };
            if !self.process_packet_data(&packet)
                && self.framer.error() == ErrorCode::DecryptionFailure
            {
                self.undecryptable_packets.push_front(packet);
                break;
            }
        }
        // No further keys will be installed
        if self.encryption_level == EncryptionLevel::ForwardSecure {
            self.stats.packets_dropped += self.undecryptable_packets.len() as u64;
            self.undecryptable_packets.clear();
        }
    }

    fn on_version_negotiation_packet(&mut self, versions: &[Version]) {
        if self.version_negotiation_state != VersionNegotiationState::StartNegotiation {
            trace!("ignoring version negotiation packet");
            return;
        }
        if versions.contains(&self.framer.version()) {
            warn!(version = %self.framer.version(), "server rejected a version it supports");
            self.close_connection(ErrorCode::InvalidVersionNegotiationPacket, false);
            return;
        }
        // Our preference order decides among the versions both sides speak
        let Some(version) = self
            .config
            .supported_versions
            .iter()
            .copied()
            .find(|x| versions.contains(x))
        else {
            self.send_connection_close_with_details(
                ErrorCode::InvalidVersion,
                "no common version found",
            );
            return;
        };
        debug!(%version, "switching version after negotiation");
        self.framer.set_version(version);
        self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;
        for sequence_number in self.sent.unacked_sequence_numbers() {
            self.retransmit_packet(sequence_number, TransmissionType::RtoRetransmission);
        }
    }

    fn send_version_negotiation_packet(&mut self) {
        if self.write_blocked {
            return;
        }
        let packet =
            Framer::build_version_negotiation_packet(self.guid, &self.config.supported_versions);
        debug!(versions = ?self.config.supported_versions, "sending version negotiation packet");
        match self
            .writer
            .write_packet(&packet, self.self_address.ip(), self.peer_address)
        {
            WriteResult::Ok { .. } => self.pending_version_negotiation_packet = false,
            WriteResult::Blocked => {
                self.write_blocked = true;
                if self.writer.is_write_blocked_data_buffered() {
                    self.pending_version_negotiation_packet = false;
                }
            }
            WriteResult::Error(code) => {
                warn!(code, "failed to write version negotiation packet");
                self.close_connection(ErrorCode::PacketWriteError, false);
            }
        }
    }

    fn on_retransmission_timeout(&mut self) {
        for sequence_number in self.sent.discard_fec_packets() {
            self.congestion.abandoning_packet(sequence_number);
        }
        if !self.sent.has_unacked_packets() {
            return;
        }
        self.stats.rto_count += 1;
        self.consecutive_rto_count += 1;
        debug!(
            unacked = self.sent.num_unacked_packets(),
            consecutive = self.consecutive_rto_count,
            "retransmission timeout"
        );
        for sequence_number in self.sent.unacked_sequence_numbers() {
            self.retransmit_packet(sequence_number, TransmissionType::RtoRetransmission);
        }
        if self.connected
            && self.sent.has_unacked_packets()
            && !self.timers.is_set(Timer::Retransmission)
        {
            let delay = self
                .congestion
                .retransmission_delay(self.consecutive_rto_count);
            self.timers
                .set(Timer::Retransmission, self.clock.now() + delay);
        }
    }

    fn on_idle_timeout(&mut self) {
        let now = self.clock.now();
        let last_activity = self
            .time_of_last_received_packet
            .max(self.time_of_last_sent_packet);
        let idle = now.saturating_duration_since(last_activity);
        if idle >= self.config.idle_timeout {
            debug!(?idle, "idle timeout");
            self.send_connection_close(ErrorCode::ConnectionTimedOut);
            return;
        }
        self.timers
            .set(Timer::Idle, now + (self.config.idle_timeout - idle));
    }

    /// Send the frames of `sequence_number` again under a new sequence number
    fn retransmit_packet(&mut self, sequence_number: u64, transmission_type: TransmissionType) {
        let Some(unacked) = self.sent.take_for_retransmission(sequence_number) else {
            return;
        };
        self.congestion.abandoning_packet(sequence_number);
        let serialized = match self.creator.reserialize_all_frames(
            &mut self.framer,
            &self.received,
            &unacked.frames.frames,
            unacked.sequence_number_length,
        ) {
            Ok(x) => x,
            Err(e) => {
                error!(sequence_number, "failed to reserialize packet: {e}");
                self.send_connection_close_with_details(
                    ErrorCode::InternalError,
                    "failed to reserialize packet",
                );
                return;
            }
        };
        debug!(
            old = sequence_number,
            new = serialized.sequence_number,
            ?transmission_type,
            "retransmitting"
        );
        let encryption_level = unacked.frames.encryption_level;
        self.sent.add_retransmittable(
            serialized.sequence_number,
            unacked.frames,
            unacked.sequence_number_length,
            unacked.number_retransmissions + 1,
        );
        self.send_or_queue_packet(
            QueuedPacket {
                sequence_number: serialized.sequence_number,
                packet: serialized.packet,
                encryption_level,
                has_retransmittable_data: true,
                transmission_type,
            },
            serialized.entropy_hash,
        );
    }

    fn add_control_frame(&mut self, frame: Frame) {
        if !self.connected {
            return;
        }
        self.queued_control_frames.push_back(frame);
        self.send_queued_frames();
    }

    fn has_pending_frames(&self) -> bool {
        self.should_send_ack
            || self.pending_feedback.is_some()
            || !self.queued_control_frames.is_empty()
    }

    /// Schedule an ack, and congestion feedback if the receive algorithm has any, for the next
    /// packet
    fn queue_ack(&mut self) {
        self.timers.stop(Timer::Ack);
        self.pending_feedback = self.congestion.generate_congestion_feedback();
        self.should_send_ack = true;
    }

    fn send_ack(&mut self) {
        self.queue_ack();
        self.send_queued_frames();
    }

    fn send_queued_frames(&mut self) {
        self.add_pending_frames();
        self.flush();
    }

    /// Move pending acks and control frames into packets while the congestion controller
    /// allows it
    fn add_pending_frames(&mut self) {
        while self.has_pending_frames() {
            // Only retransmittable data counts against the congestion window
            let retransmittable = !self.should_send_ack && self.pending_feedback.is_none();
            if !self.can_write(TransmissionType::NotRetransmission, retransmittable, false) {
                break;
            }
            if !self.add_next_pending_frame() {
                self.serialize_and_send_packet();
            }
        }
    }

    /// Returns `false` if the packet being built is full
    fn add_next_pending_frame(&mut self) -> bool {
        let (frame, save) = if self.should_send_ack {
            (Frame::Ack(self.create_ack_frame()), false)
        } else if let Some(feedback) = self.pending_feedback {
            (Frame::CongestionFeedback(feedback), false)
        } else if let Some(frame) = self.queued_control_frames.front() {
            (frame.clone(), true)
        } else {
            return true;
        };
        let was_empty = !self.creator.has_pending_frames();
        if !self.creator.add_frame(&self.framer, frame, save) && !was_empty {
            return false;
        }
        if was_empty && !self.creator.has_pending_frames() {
            error!("frame too large for an empty packet");
        }
        if self.should_send_ack {
            self.should_send_ack = false;
        } else if self.pending_feedback.is_some() {
            self.pending_feedback = None;
        } else {
            self.queued_control_frames.pop_front();
        }
        true
    }

    fn create_ack_frame(&mut self) -> AckFrame {
        let mut ack = AckFrame::default();
        ack.sent_info.least_unacked = self.least_unacked();
        ack.sent_info.entropy_hash = self
            .sent
            .entropy()
            .entropy_hash(ack.sent_info.least_unacked - 1);
        self.received
            .update_received_packet_info(&mut ack, self.clock.now());
        ack
    }

    pub(crate) fn least_unacked(&self) -> u64 {
        self.sent.least_unacked(self.creator.sequence_number() + 1)
    }

    /// Send whatever the packet being built holds, and close the FEC group
    fn flush(&mut self) {
        if self.creator.has_pending_frames() {
            self.serialize_and_send_packet();
        }
        if self.connected && self.creator.should_send_fec(true) {
            self.serialize_and_send_fec();
        }
    }

    fn serialize_and_send_packet(&mut self) {
        if !self.creator.has_pending_frames() {
            return;
        }
        match self
            .creator
            .serialize_packet(&mut self.framer, &self.received)
        {
            Ok(packet) => self.on_serialized_packet(packet),
            Err(e) => {
                error!("failed to serialize packet: {e}");
                self.send_connection_close_with_details(
                    ErrorCode::InternalError,
                    "failed to serialize packet",
                );
                return;
            }
        }
        if self.connected && self.creator.should_send_fec(false) {
            self.serialize_and_send_fec();
        }
    }

    fn serialize_and_send_fec(&mut self) {
        match self.creator.serialize_fec(&mut self.framer) {
            Ok(packet) => self.on_serialized_packet(packet),
            Err(e) => error!("failed to serialize FEC packet: {e}"),
        }
    }

    fn on_serialized_packet(&mut self, mut packet: crate::SerializedPacket) {
        let sequence_number = packet.sequence_number;
        let has_retransmittable_data = packet.retransmittable_frames.is_some();
        if let Some(mut frames) = packet.retransmittable_frames.take() {
            frames.encryption_level = self.encryption_level;
            self.sent.add_retransmittable(
                sequence_number,
                frames,
                packet.sequence_number_length,
                0,
            );
        } else if packet.packet.is_fec() {
            self.sent.add_fec(sequence_number);
        }
        self.send_or_queue_packet(
            QueuedPacket {
                sequence_number,
                packet: packet.packet,
                encryption_level: self.encryption_level,
                has_retransmittable_data,
                transmission_type: TransmissionType::NotRetransmission,
            },
            packet.entropy_hash,
        );
    }

    /// Returns `false` if the packet had to be queued
    fn send_or_queue_packet(&mut self, packet: QueuedPacket, entropy_hash: crate::EntropyHash) -> bool {
        self.sent
            .entropy_mut()
            .record(packet.sequence_number, entropy_hash);
        // Packets leave in sequence number order
        if !self.queued_packets.is_empty() || !self.write_packet(&packet, false) {
            trace!(sequence_number = packet.sequence_number, "queueing packet");
            self.queued_packets.push_back(packet);
            return false;
        }
        true
    }

    fn write_queued_packets(&mut self) {
        if self.pending_version_negotiation_packet {
            self.send_version_negotiation_packet();
        }
        while !self.write_blocked {
            let Some(packet) = self.queued_packets.pop_front() else {
                break;
            };
            if !self.write_packet(&packet, false) {
                self.queued_packets.push_front(packet);
                break;
            }
        }
    }

    /// Returns `true` if the packet was written or is not worth sending any more
    ///
    /// `force` skips the congestion controller.
    fn write_packet(&mut self, packet: &QueuedPacket, force: bool) -> bool {
        if self.should_discard_packet(packet) {
            return true;
        }
        if self.write_blocked {
            return false;
        }
        if !force
            && !self.can_write(
                packet.transmission_type,
                packet.has_retransmittable_data,
                false,
            )
        {
            return false;
        }
        let Some(encrypted) = self.encrypt_packet(packet) else {
            return false;
        };
        self.write_encrypted(packet, &encrypted)
    }

    fn should_discard_packet(&mut self, packet: &QueuedPacket) -> bool {
        let sequence_number = packet.sequence_number;
        if !self.connected {
            trace!(sequence_number, "not sending packet on closed connection");
            return true;
        }
        // The peer no longer accepts null encryption
        if self.encryption_level == EncryptionLevel::ForwardSecure
            && packet.encryption_level == EncryptionLevel::None
        {
            debug!(sequence_number, "dropping null encrypted packet");
            self.sent.take_for_retransmission(sequence_number);
            return true;
        }
        if packet.has_retransmittable_data && !self.sent.is_unacked(sequence_number) {
            trace!(sequence_number, "dropping stale retransmission");
            return true;
        }
        false
    }

    fn encrypt_packet(&mut self, packet: &QueuedPacket) -> Option<Bytes> {
        let encrypted = self.framer.encrypt_packet(
            packet.encryption_level,
            packet.sequence_number,
            &packet.packet,
        );
        if encrypted.is_none() {
            error!(
                sequence_number = packet.sequence_number,
                level = ?packet.encryption_level,
                "failed to encrypt packet"
            );
            self.close_connection(ErrorCode::EncryptionFailure, false);
        }
        encrypted
    }

    fn write_encrypted(&mut self, packet: &QueuedPacket, encrypted: &Bytes) -> bool {
        let now = self.clock.now();
        let sequence_number = packet.sequence_number;
        match self
            .writer
            .write_packet(encrypted, self.self_address.ip(), self.peer_address)
        {
            WriteResult::Ok { .. } => {}
            WriteResult::Blocked => {
                self.write_blocked = true;
                trace!(sequence_number, "write blocked");
                // A writer that buffered the packet will send it on its own
                if !self.writer.is_write_blocked_data_buffered() {
                    return false;
                }
            }
            WriteResult::Error(code) => {
                warn!(sequence_number, code, "failed to write packet");
                self.close_connection(ErrorCode::PacketWriteError, false);
                return false;
            }
        }
        trace!(sequence_number, len = encrypted.len(), "packet sent");

        self.time_of_last_sent_packet = now;
        if packet.has_retransmittable_data && !self.timers.is_set(Timer::Retransmission) {
            let delay = self
                .congestion
                .retransmission_delay(self.consecutive_rto_count);
            self.timers.set(Timer::Retransmission, now + delay);
        }
        let bytes_per_round_trip = self
            .congestion
            .bandwidth_estimate()
            .to_bytes_per_period(self.congestion.smoothed_rtt());
        self.creator.update_sequence_number_length(
            self.received.least_packet_awaited_by_peer(),
            bytes_per_round_trip,
        );
        let len = encrypted.len() as u64;
        self.congestion.sent_packet(
            sequence_number,
            now,
            len,
            packet.transmission_type,
            packet.has_retransmittable_data,
        );
        self.stats.bytes_sent += len;
        self.stats.packets_sent += 1;
        if packet.transmission_type.is_retransmission() {
            self.stats.bytes_retransmitted += len;
            self.stats.packets_retransmitted += 1;
        }
        true
    }

    /// Whether a packet may be written now
    ///
    /// Arms the send timer if the congestion controller asks for a delay.
    fn can_write(
        &mut self,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
        is_handshake: bool,
    ) -> bool {
        if !self.connected || self.write_blocked || self.timers.is_set(Timer::Send) {
            return false;
        }
        let now = self.clock.now();
        match self.congestion.time_until_send(
            now,
            transmission_type,
            has_retransmittable_data,
            is_handshake,
        ) {
            // Nothing may be sent until an ack arrives
            None => false,
            Some(delay) if delay.is_zero() => true,
            Some(delay) => {
                self.timers.set(Timer::Send, now + delay);
                false
            }
        }
    }

    fn send_connection_close_packet(&mut self, frame: ConnectionCloseFrame) {
        let serialized =
            match self
                .creator
                .serialize_connection_close(&mut self.framer, &self.received, frame)
            {
                Ok(x) => x,
                Err(e) => {
                    error!("failed to serialize connection close: {e}");
                    return;
                }
            };
        self.sent
            .entropy_mut()
            .record(serialized.sequence_number, serialized.entropy_hash);
        let packet = QueuedPacket {
            sequence_number: serialized.sequence_number,
            packet: serialized.packet,
            encryption_level: self.encryption_level,
            has_retransmittable_data: false,
            transmission_type: TransmissionType::NotRetransmission,
        };
        let Some(encrypted) = self.encrypt_packet(&packet) else {
            return;
        };
        self.close_packet = Some(encrypted.clone());
        if !self.write_blocked {
            self.write_encrypted(&packet, &encrypted);
        }
    }

    /// Enter the closed state; never undone
    fn close_connection(&mut self, error: ErrorCode, from_peer: bool) {
        if !self.connected {
            return;
        }
        debug!(%error, from_peer, "connection closed");
        self.connected = false;
        self.timers.reset();
        self.events
            .push_back(Event::ConnectionClosed { error, from_peer });
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("guid", &self.guid)
            .field("side", &self.side)
            .field("connected", &self.connected)
            .finish()
    }
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// Stream data arrived, all from one packet
    StreamFrames(Vec<StreamFrame>),
    /// The peer reset a stream
    RstStream(RstStreamFrame),
    /// The peer will open no new streams
    GoAway(GoAwayFrame),
    /// The peer acknowledged these packets
    PacketsAcked(Vec<u64>),
    /// Both sides now speak this version
    VersionNegotiated(Version),
    /// Queued data went out and more may be written
    CanWrite,
    /// The connection was closed
    ///
    /// Emitted exactly once, whether the peer or this end closed the connection.
    ConnectionClosed {
        /// Reason for the close
        error: ErrorCode,
        /// Whether the peer closed the connection
        from_peer: bool,
    },
}

/// Progress of version negotiation
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VersionNegotiationState {
    /// Nothing was exchanged yet
    StartNegotiation,
    /// A version negotiation packet was sent (server) or received (client)
    NegotiationInProgress,
    /// Both sides agreed on a version
    NegotiatedVersion,
}

/// How much of the data handed to [`Connection::send_stream_data`] was sent or queued
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ConsumedData {
    /// Bytes taken from the front of the data
    pub bytes_consumed: usize,
    /// Whether the fin went out with them
    pub fin_consumed: bool,
}

struct QueuedPacket {
    sequence_number: u64,
    packet: Packet,
    encryption_level: EncryptionLevel,
    has_retransmittable_data: bool,
    transmission_type: TransmissionType,
}

/// A fatal condition found while the framer was running
struct PendingClose {
    error: ErrorCode,
    details: &'static str,
    /// Tell the peer with a connection close packet
    send_packet: bool,
    from_peer: bool,
}

impl PendingClose {
    fn send(error: ErrorCode, details: &'static str) -> Self {
        Self {
            error,
            details,
            send_packet: true,
            from_peer: false,
        }
    }

    fn silent(error: ErrorCode, from_peer: bool) -> Self {
        Self {
            error,
            details: "",
            send_packet: false,
            from_peer,
        }
    }
}

/// What the framer delivered for one packet, acted on once parsing finished
#[derive(Default)]
struct LastPacket {
    size: usize,
    revived: bool,
    address_migrating: bool,
    /// Every frame was delivered
    complete: bool,
    stream_frames: Vec<StreamFrame>,
    ack_frames: Vec<AckFrame>,
    congestion_frames: Vec<CongestionFeedbackFrame>,
    rst_stream_frames: Vec<RstStreamFrame>,
    go_away_frames: Vec<GoAwayFrame>,
    close_frames: Vec<ConnectionCloseFrame>,
    /// Versions offered by a version negotiation packet
    version_negotiation: Option<Vec<Version>>,
    send_version_negotiation: bool,
    close: Option<PendingClose>,
}

/// Receives a packet's contents from the framer on behalf of a [`Connection`]
struct PacketVisitor<'a> {
    guid: Guid,
    side: Side,
    version: Version,
    supported_versions: &'a [Version],
    state: &'a mut VersionNegotiationState,
    creator: &'a mut PacketCreator,
    received: &'a ReceivedPacketManager,
    sent: &'a SentPacketManager,
    fec_groups: &'a mut BTreeMap<u64, FecGroup>,
    stats: &'a mut ConnectionStats,
    events: &'a mut VecDeque<Event>,
    last_header: &'a mut Option<PacketHeader>,
    largest_seen_packet_with_ack: u64,
    last: &'a mut LastPacket,
}

impl PacketVisitor<'_> {
    fn validate_ack_frame(&self, ack: &AckFrame, sequence_number: u64) -> bool {
        let received_info = &ack.received_info;
        let largest_observed = received_info.largest_observed;
        if largest_observed > self.creator.sequence_number() {
            warn!(largest_observed, "peer observed unsent packet");
            return false;
        }
        if largest_observed < self.received.peer_largest_observed_packet() {
            warn!(
                largest_observed,
                previous = self.received.peer_largest_observed_packet(),
                "peer's largest observed packet decreased"
            );
            return false;
        }
        let least_unacked = ack.sent_info.least_unacked;
        if least_unacked < self.received.peer_least_packet_awaiting_ack() {
            warn!(
                least_unacked,
                previous = self.received.peer_least_packet_awaiting_ack(),
                "peer's least unacked decreased"
            );
            return false;
        }
        if least_unacked > sequence_number {
            warn!(least_unacked, sequence_number, "peer's least unacked beyond its packet");
            return false;
        }
        if let Some(&last) = received_info.missing_packets.last() {
            if last > largest_observed {
                warn!(last, largest_observed, "peer's missing packet beyond largest observed");
                return false;
            }
        }
        if let Some(&first) = received_info.missing_packets.first() {
            if first < self.received.least_packet_awaited_by_peer() {
                warn!(
                    first,
                    least_awaited = self.received.least_packet_awaited_by_peer(),
                    "peer's missing packet was acked before"
                );
                return false;
            }
        }
        self.sent.entropy().is_valid_entropy(
            largest_observed,
            &received_info.missing_packets,
            received_info.entropy_hash,
        )
    }

    /// Receive-side FEC group of the current packet, created on demand
    fn fec_group(&mut self) -> Option<&mut FecGroup> {
        let number = self.last_header.as_ref()?.fec_group?;
        if !self.fec_groups.contains_key(&number) && self.fec_groups.len() >= MAX_FEC_GROUPS {
            let (&lowest, _) = self.fec_groups.first_key_value()?;
            if number < lowest {
                // Seen before and dropped
                return None;
            }
            self.fec_groups.remove(&lowest);
        }
        Some(self.fec_groups.entry(number).or_default())
    }

    fn current_sequence_number(&self) -> u64 {
        self.last_header
            .as_ref()
            .map_or(0, |x| x.packet_sequence_number)
    }

    fn negotiated(&mut self, version: Version) {
        *self.state = VersionNegotiationState::NegotiatedVersion;
        debug!(%version, "version negotiated");
        self.events
            .push_back(Event::VersionNegotiated(version));
    }
}

impl FramerVisitor for PacketVisitor<'_> {
    fn on_protocol_version_mismatch(&mut self, received_version: Version) -> bool {
        if self.side.is_client() {
            error!("client saw a version mismatch");
            self.last.close = Some(PendingClose::silent(ErrorCode::InternalError, false));
            return false;
        }
        let supported = self.supported_versions.contains(&received_version);
        match *self.state {
            VersionNegotiationState::StartNegotiation => {
                if !supported {
                    debug!(%received_version, "client offered unsupported version");
                    self.last.send_version_negotiation = true;
                    *self.state = VersionNegotiationState::NegotiationInProgress;
                    return false;
                }
            }
            VersionNegotiationState::NegotiationInProgress => {
                if !supported {
                    return false;
                }
            }
            // Sent by the client before it learned the negotiated version
            VersionNegotiationState::NegotiatedVersion => return false,
        }
        self.negotiated(received_version);
        true
    }

    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {
        debug!(
            rejected = packet.rejected_sequence_number,
            "public reset received"
        );
        self.last.close = Some(PendingClose::silent(ErrorCode::PublicReset, true));
    }

    fn on_version_negotiation_packet(&mut self, header: &PublicHeader) {
        if self.side.is_server() {
            error!("server received a version negotiation packet");
            self.last.close = Some(PendingClose::silent(ErrorCode::InternalError, false));
            return;
        }
        self.last.version_negotiation = Some(header.versions.clone());
    }

    fn on_packet_header(&mut self, header: &PacketHeader) -> bool {
        // Undone below once the packet is accepted
        self.stats.packets_dropped += 1;
        let sequence_number = header.packet_sequence_number;
        if header.public_header.guid != self.guid {
            debug!(guid = %header.public_header.guid, "ignoring packet for another guid");
            return false;
        }
        if self.current_sequence_number().abs_diff(sequence_number) > MAX_PACKET_GAP {
            debug!(sequence_number, "packet out of bounds");
            self.last.close = Some(PendingClose::send(
                ErrorCode::InvalidPacketHeader,
                "packet sequence number out of bounds",
            ));
            return false;
        }
        if !self.received.is_awaiting_packet(sequence_number) {
            trace!(sequence_number, "duplicate or abandoned packet");
            return false;
        }
        if self.last.address_migrating {
            self.last.close = Some(PendingClose::send(
                ErrorCode::ErrorMigratingAddress,
                "address migration is not supported",
            ));
            return false;
        }
        if *self.state != VersionNegotiationState::NegotiatedVersion {
            if self.side.is_server() {
                // Packets carry the version until negotiation completes
                let Some(&version) = header.public_header.versions.first() else {
                    warn!("packet without version flag before version negotiation");
                    self.last.close = Some(PendingClose::silent(ErrorCode::InvalidVersion, false));
                    return false;
                };
                self.negotiated(version);
            } else {
                // The server stopped sending the version, so it agreed to ours
                self.creator.stop_sending_version();
                self.negotiated(self.version);
            }
        }
        self.stats.packets_dropped -= 1;
        *self.last_header = Some(header.clone());
        true
    }

    fn on_fec_protected_payload(&mut self, payload: &[u8]) {
        let Some(header) = self.last_header.clone() else {
            return;
        };
        if let Some(group) = self.fec_group() {
            group.update(header.packet_sequence_number, header.entropy_flag, payload);
        }
    }

    fn on_stream_frame(&mut self, frame: StreamFrame) -> bool {
        self.last.stream_frames.push(frame);
        true
    }

    fn on_ack_frame(&mut self, frame: AckFrame) -> bool {
        let sequence_number = self.current_sequence_number();
        if sequence_number <= self.largest_seen_packet_with_ack {
            debug!(sequence_number, "ignoring stale ack frame");
            return true;
        }
        if !self.validate_ack_frame(&frame, sequence_number) {
            self.last.close = Some(PendingClose::send(ErrorCode::InvalidAckData, "invalid ack data"));
            return false;
        }
        self.last.ack_frames.push(frame);
        true
    }

    fn on_congestion_feedback_frame(&mut self, frame: CongestionFeedbackFrame) -> bool {
        self.last.congestion_frames.push(frame);
        true
    }

    fn on_rst_stream_frame(&mut self, frame: RstStreamFrame) -> bool {
        self.last.rst_stream_frames.push(frame);
        true
    }

    fn on_connection_close_frame(&mut self, frame: ConnectionCloseFrame) -> bool {
        self.last.close_frames.push(frame);
        true
    }

    fn on_go_away_frame(&mut self, frame: GoAwayFrame) -> bool {
        self.last.go_away_frames.push(frame);
        true
    }

    fn on_fec_data(&mut self, fec: FecData) {
        let Some(header) = self.last_header.clone() else {
            return;
        };
        if let Some(group) = self.fec_group() {
            group.update_fec(header.packet_sequence_number, header.entropy_flag, &fec);
        }
    }

    fn on_packet_complete(&mut self) {
        self.last.complete = true;
    }
}
