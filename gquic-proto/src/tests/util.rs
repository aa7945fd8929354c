use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io::{self, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    str,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use crate::{
    congestion::{
        Bandwidth, CongestionControllerFactory, ReceiveAlgorithm, SendAlgorithm, TransmissionType,
    },
    framer::{Framer, FramerVisitor, ReceivedEntropyHashCalculator},
    io::{Clock, PacketWriter, WriteResult},
    AckFrame, CongestionFeedbackFrame, Connection, ConnectionCloseFrame, Duration, EntropyHash,
    ErrorCode, Event, FecData, Frame, GoAwayFrame, Guid, Instant, PacketHeader, PublicHeader,
    PublicResetPacket, RstStreamFrame, Side, StreamFrame, TransportConfig, Version,
};

pub(crate) const GUID: Guid = Guid(0x0123_4567_89ab_cdef);

pub(crate) fn client_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), 7890)
}

pub(crate) fn server_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433)
}

/// Deterministic config using `congestion` on both sides
pub(crate) fn config(congestion: &TestCongestion) -> TransportConfig {
    let mut config = TransportConfig::default();
    config
        .rng_seed(Some([42; 32]))
        .congestion_controller_factory(Arc::new(congestion.clone()));
    config
}

/// A client and a server connection joined by an in-memory link
pub(crate) struct Pair {
    pub(crate) clock: MockClock,
    pub(crate) client: Connection,
    pub(crate) server: Connection,
    pub(crate) client_writer: RecordingWriter,
    pub(crate) server_writer: RecordingWriter,
    pub(crate) client_congestion: TestCongestion,
    pub(crate) server_congestion: TestCongestion,
}

impl Pair {
    pub(crate) fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build a pair, letting `f` adjust the config of both sides
    pub(crate) fn with_config(f: impl Fn(&mut TransportConfig)) -> Self {
        Self::with_configs(&f, &f)
    }

    pub(crate) fn with_configs(
        client: impl Fn(&mut TransportConfig),
        server: impl Fn(&mut TransportConfig),
    ) -> Self {
        let clock = MockClock::new();
        let client_congestion = TestCongestion::default();
        let server_congestion = TestCongestion::default();
        let client_writer = RecordingWriter::default();
        let server_writer = RecordingWriter::default();

        let mut client_config = config(&client_congestion);
        client(&mut client_config);
        let mut server_config = config(&server_congestion);
        server(&mut server_config);

        let client = Connection::new(
            GUID,
            Side::Client,
            client_addr(),
            server_addr(),
            Arc::new(client_config),
            Box::new(clock.clone()),
            Box::new(client_writer.clone()),
        );
        let server = Connection::new(
            GUID,
            Side::Server,
            server_addr(),
            client_addr(),
            Arc::new(server_config),
            Box::new(clock.clone()),
            Box::new(server_writer.clone()),
        );
        Self {
            clock,
            client,
            server,
            client_writer,
            server_writer,
            client_congestion,
            server_congestion,
        }
    }

    /// Feed everything the client wrote to the server; returns the number of packets
    pub(crate) fn deliver_to_server(&mut self) -> usize {
        let packets = self.client_writer.take_packets();
        for packet in &packets {
            self.server
                .process_udp_packet(server_addr(), client_addr(), packet);
        }
        packets.len()
    }

    /// Feed everything the server wrote to the client; returns the number of packets
    pub(crate) fn deliver_to_client(&mut self) -> usize {
        let packets = self.server_writer.take_packets();
        for packet in &packets {
            self.client
                .process_udp_packet(client_addr(), server_addr(), packet);
        }
        packets.len()
    }

    /// Exchange packets until both sides are quiet, firing delayed acks along the way
    pub(crate) fn drive(&mut self) {
        for _ in 0..100 {
            let mut delivered = self.deliver_to_server() + self.deliver_to_client();
            if delivered == 0 {
                let delayed_ack = [&self.client, &self.server]
                    .iter()
                    .filter_map(|conn| conn.timer_deadline(crate::connection::Timer::Ack))
                    .min();
                let Some(deadline) = delayed_ack else {
                    return;
                };
                self.clock.set(deadline);
                self.client.handle_timeout();
                self.server.handle_timeout();
                delivered = self.deliver_to_server() + self.deliver_to_client();
                if delivered == 0 {
                    return;
                }
            }
        }
        panic!("connections never went quiet");
    }
}

pub(crate) fn events(conn: &mut Connection) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = conn.poll() {
        events.push(event);
    }
    events
}

/// Stream frames surfaced by `events`, in order
pub(crate) fn stream_frames(events: &[Event]) -> Vec<StreamFrame> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::StreamFrames(frames) => Some(frames.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub(crate) fn close_event(events: &[Event]) -> Option<(ErrorCode, bool)> {
    events.iter().find_map(|event| match *event {
        Event::ConnectionClosed { error, from_peer } => Some((error, from_peer)),
        _ => None,
    })
}

/// A clock that only moves when told to
#[derive(Clone)]
pub(crate) struct MockClock(Rc<Cell<Instant>>);

impl MockClock {
    pub(crate) fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }

    pub(crate) fn set(&self, now: Instant) {
        self.0.set(now);
    }

    pub(crate) fn now_for_test(&self) -> Instant {
        self.0.get()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.0.get()
    }
}

/// Keeps every datagram written, and can be told to block or fail
#[derive(Clone, Default)]
pub(crate) struct RecordingWriter(Rc<RefCell<WriterState>>);

#[derive(Default)]
struct WriterState {
    packets: VecDeque<(Bytes, SocketAddr)>,
    blocked: bool,
    buffer_when_blocked: bool,
    error: Option<i32>,
}

impl RecordingWriter {
    pub(crate) fn take_packets(&self) -> Vec<Bytes> {
        self.0
            .borrow_mut()
            .packets
            .drain(..)
            .map(|(packet, _)| packet)
            .collect()
    }

    pub(crate) fn take_packets_with_destination(&self) -> Vec<(Bytes, SocketAddr)> {
        self.0.borrow_mut().packets.drain(..).collect()
    }

    pub(crate) fn num_packets(&self) -> usize {
        self.0.borrow().packets.len()
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.0.borrow_mut().blocked = blocked;
    }

    pub(crate) fn set_buffer_when_blocked(&self, buffer: bool) {
        self.0.borrow_mut().buffer_when_blocked = buffer;
    }

    pub(crate) fn set_error(&self, error: Option<i32>) {
        self.0.borrow_mut().error = error;
    }
}

impl PacketWriter for RecordingWriter {
    fn write_packet(
        &mut self,
        buf: &[u8],
        _self_address: IpAddr,
        peer_address: SocketAddr,
    ) -> WriteResult {
        let mut state = self.0.borrow_mut();
        if let Some(code) = state.error {
            return WriteResult::Error(code);
        }
        if state.blocked {
            if state.buffer_when_blocked {
                state
                    .packets
                    .push_back((Bytes::copy_from_slice(buf), peer_address));
            }
            return WriteResult::Blocked;
        }
        state
            .packets
            .push_back((Bytes::copy_from_slice(buf), peer_address));
        WriteResult::Ok {
            bytes_written: buf.len(),
        }
    }

    fn is_write_blocked_data_buffered(&self) -> bool {
        self.0.borrow().buffer_when_blocked
    }
}

/// Scripted congestion control that records what it is told
#[derive(Clone, Default)]
pub(crate) struct TestCongestion(Arc<Mutex<CongestionState>>);

#[derive(Default)]
pub(crate) struct CongestionState {
    /// Returned by `time_until_send`; `Some(ZERO)` unless a test says otherwise
    pub(crate) delay: Option<Option<Duration>>,
    pub(crate) retransmission_delay: Duration,
    pub(crate) sent: Vec<(u64, TransmissionType, bool)>,
    pub(crate) acked: Vec<u64>,
    pub(crate) losses: usize,
    pub(crate) abandoned: Vec<u64>,
    pub(crate) feedback: Vec<CongestionFeedbackFrame>,
    /// Offered by the receive side with each ack
    pub(crate) offer_feedback: Option<CongestionFeedbackFrame>,
    pub(crate) revived: Vec<u64>,
}

impl TestCongestion {
    pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, CongestionState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = Some(delay);
    }
}

impl CongestionControllerFactory for TestCongestion {
    fn build_sender(&self, _: Instant, _: usize) -> Box<dyn SendAlgorithm> {
        Box::new(self.clone())
    }

    fn build_receiver(&self) -> Box<dyn ReceiveAlgorithm> {
        Box::new(self.clone())
    }
}

impl SendAlgorithm for TestCongestion {
    fn on_incoming_congestion_feedback(&mut self, feedback: &CongestionFeedbackFrame, _: Instant) {
        self.state().feedback.push(*feedback);
    }

    fn on_incoming_ack(&mut self, sequence_number: u64, _: u64, _: Option<Duration>) {
        self.state().acked.push(sequence_number);
    }

    fn on_incoming_loss(&mut self, _: Instant) {
        self.state().losses += 1;
    }

    fn sent_packet(
        &mut self,
        _: Instant,
        sequence_number: u64,
        _: u64,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool {
        self.state()
            .sent
            .push((sequence_number, transmission_type, has_retransmittable_data));
        true
    }

    fn abandoning_packet(&mut self, sequence_number: u64, _: u64) {
        self.state().abandoned.push(sequence_number);
    }

    fn time_until_send(&mut self, _: Instant, _: TransmissionType, _: bool, _: bool) -> Option<Duration> {
        self.state().delay.unwrap_or(Some(Duration::ZERO))
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        Bandwidth::ZERO
    }

    fn smoothed_rtt(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn retransmission_delay(&self) -> Duration {
        self.state().retransmission_delay
    }
}

impl ReceiveAlgorithm for TestCongestion {
    fn generate_congestion_feedback(&mut self) -> Option<CongestionFeedbackFrame> {
        self.state().offer_feedback
    }

    fn record_incoming_packet(&mut self, _: u64, sequence_number: u64, _: Instant, revived: bool) {
        if revived {
            self.state().revived.push(sequence_number);
        }
    }
}

/// Reports zero cumulative entropy for everything
pub(crate) struct NoEntropy;

impl ReceivedEntropyHashCalculator for NoEntropy {
    fn entropy_hash(&self, _: u64) -> EntropyHash {
        0
    }
}

/// Everything a framer reported for one packet
#[derive(Default)]
pub(crate) struct PacketRecorder {
    pub(crate) error: Option<ErrorCode>,
    pub(crate) public_reset: Option<PublicResetPacket>,
    pub(crate) version_negotiation: Option<Vec<Version>>,
    pub(crate) header: Option<PacketHeader>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) fec_protected_payloads: Vec<Bytes>,
    pub(crate) fec_data: Vec<FecData>,
}

impl PacketRecorder {
    pub(crate) fn process(framer: &mut Framer, packet: &[u8]) -> Self {
        let mut recorder = Self::default();
        framer.process_packet(&mut recorder, packet);
        recorder
    }

    pub(crate) fn stream_frames(&self) -> Vec<StreamFrame> {
        self.frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Stream(x) => Some(x.clone()),
                _ => None,
            })
            .collect()
    }
}

impl FramerVisitor for PacketRecorder {
    fn on_error(&mut self, error: ErrorCode, _: &'static str) {
        self.error = Some(error);
    }

    fn on_protocol_version_mismatch(&mut self, _: Version) -> bool {
        true
    }

    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {
        self.public_reset = Some(packet.clone());
    }

    fn on_version_negotiation_packet(&mut self, header: &PublicHeader) {
        self.version_negotiation = Some(header.versions.clone());
    }

    fn on_packet_header(&mut self, header: &PacketHeader) -> bool {
        self.header = Some(header.clone());
        true
    }

    fn on_fec_protected_payload(&mut self, payload: &[u8]) {
        self.fec_protected_payloads
            .push(Bytes::copy_from_slice(payload));
    }

    fn on_stream_frame(&mut self, frame: StreamFrame) -> bool {
        self.frames.push(Frame::Stream(frame));
        true
    }

    fn on_ack_frame(&mut self, frame: AckFrame) -> bool {
        self.frames.push(Frame::Ack(frame));
        true
    }

    fn on_congestion_feedback_frame(&mut self, frame: CongestionFeedbackFrame) -> bool {
        self.frames.push(Frame::CongestionFeedback(frame));
        true
    }

    fn on_rst_stream_frame(&mut self, frame: RstStreamFrame) -> bool {
        self.frames.push(Frame::RstStream(frame));
        true
    }

    fn on_connection_close_frame(&mut self, frame: ConnectionCloseFrame) -> bool {
        self.frames.push(Frame::ConnectionClose(frame));
        true
    }

    fn on_go_away_frame(&mut self, frame: GoAwayFrame) -> bool {
        self.frames.push(Frame::GoAway(frame));
        true
    }

    fn on_fec_data(&mut self, fec: FecData) {
        self.fec_data.push(fec);
    }
}

pub(crate) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
