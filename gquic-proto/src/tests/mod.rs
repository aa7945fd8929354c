use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;

use crate::{
    connection::Timer,
    crypto::{Decrypter, EncryptionLevel, Encrypter},
    frame::{AckFrame, Frame},
    framer::Framer,
    packet::{PacketHeader, PublicHeader, PublicResetPacket},
    ConsumedData, Dispatcher, Duration, ErrorCode, Event, Guid, RstStreamErrorCode, Side,
    StreamFrame, StreamId, TimeWaitListManager, Version, VersionNegotiationState,
    MAX_PACKET_SIZE,
};

mod util;
pub(crate) use util::*;

const STREAM: StreamId = StreamId(3);

#[test]
fn stream_data_round_trip() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    let consumed = pair
        .client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, true);
    assert_eq!(
        consumed,
        ConsumedData {
            bytes_consumed: 5,
            fin_consumed: true
        }
    );
    assert_eq!(pair.deliver_to_server(), 1);

    let server_events = events(&mut pair.server);
    assert_matches!(server_events[0], Event::VersionNegotiated(Version::V12));
    let frames = stream_frames(&server_events);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].stream_id, STREAM);
    assert_eq!(&frames[0].data[..], b"hello");
    assert!(frames[0].fin);
    assert_eq!(
        pair.server.version_negotiation_state(),
        VersionNegotiationState::NegotiatedVersion
    );

    // The ack waits for the delayed ack timer
    assert_eq!(pair.server_writer.num_packets(), 0);
    let deadline = pair.server.poll_timeout().unwrap();
    pair.clock.set(deadline);
    pair.server.handle_timeout();
    assert_eq!(pair.deliver_to_client(), 1);

    let client_events = events(&mut pair.client);
    assert!(client_events
        .iter()
        .any(|x| matches!(x, Event::VersionNegotiated(Version::V12))));
    assert!(client_events
        .iter()
        .any(|x| matches!(x, Event::PacketsAcked(acked) if acked == &[1])));
    assert_eq!(pair.client.num_unacked_packets(), 0);
    assert_eq!(pair.client.timer_deadline(Timer::Retransmission), None);
    assert_eq!(
        pair.client.version_negotiation_state(),
        VersionNegotiationState::NegotiatedVersion
    );
}

#[test]
fn sent_and_received_entropy_agree() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    for i in 0..5u64 {
        pair.client
            .send_stream_data(STREAM, Bytes::from_static(b"data"), i * 4, false);
    }
    assert_eq!(pair.deliver_to_server(), 5);
    for n in 1..=5 {
        assert_eq!(
            pair.client.sent_entropy_hash(n),
            pair.server.received_entropy_hash(n),
            "through {n}"
        );
    }
    pair.drive();
    assert_eq!(pair.client.num_unacked_packets(), 0);
}

/// Send one small stream packet from the client and deliver only it
fn send_and_deliver_only_latest(pair: &mut Pair, offset: u64) {
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"x"), offset, false);
    let latest = pair.client_writer.take_packets().pop().unwrap();
    pair.server
        .process_udp_packet(server_addr(), client_addr(), &latest);
    assert_eq!(pair.deliver_to_client(), 1);
}

#[test]
fn nacks_limit_retransmissions_per_ack() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    for offset in 0..12 {
        pair.client
            .send_stream_data(STREAM, Bytes::from_static(b"x"), offset, false);
    }
    let packets = pair.client_writer.take_packets();
    assert_eq!(packets.len(), 12);
    // Only the twelfth packet arrives, so the server acks at once, reporting 1 through 11 missing
    pair.server
        .process_udp_packet(server_addr(), client_addr(), &packets[11]);
    assert_eq!(pair.deliver_to_client(), 1);
    assert_eq!(pair.client.stats().packets_retransmitted, 0);

    send_and_deliver_only_latest(&mut pair, 12);
    assert_eq!(pair.client.stats().packets_retransmitted, 0);

    // Third nack
    send_and_deliver_only_latest(&mut pair, 13);
    assert_eq!(pair.client.stats().packets_retransmitted, 10);
    assert_eq!(
        pair.client_congestion.state().abandoned,
        (1..=10).collect::<Vec<_>>()
    );

    // Fourth nack of packet 11; the retransmissions have only been nacked once
    send_and_deliver_only_latest(&mut pair, 14);
    assert_eq!(pair.client.stats().packets_retransmitted, 11);
    assert_eq!(pair.client_congestion.state().abandoned.last(), Some(&11));
    assert!(pair.client.is_connected());
    assert!(pair.server.is_connected());
}

#[test]
fn retransmission_timeout() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    let start = pair.clock.now_for_test();
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    assert_eq!(pair.client_writer.take_packets().len(), 1);
    let deadline = pair
        .client
        .timer_deadline(Timer::Retransmission)
        .unwrap();
    assert_eq!(deadline, start + Duration::from_millis(500));

    pair.clock.set(deadline);
    pair.client.handle_timeout();
    let stats = pair.client.stats();
    assert_eq!(stats.rto_count, 1);
    assert_eq!(stats.packets_retransmitted, 1);
    // Backed off
    assert_eq!(
        pair.client.timer_deadline(Timer::Retransmission),
        Some(deadline + Duration::from_secs(1))
    );
    assert_eq!(pair.client.sequence_number(), 2);
    assert_eq!(pair.client.least_unacked(), 2);

    assert_eq!(pair.deliver_to_server(), 1);
    let frames = stream_frames(&events(&mut pair.server));
    assert_eq!(&frames[0].data[..], b"hello");
    pair.drive();
    assert_eq!(pair.client.num_unacked_packets(), 0);
    assert_eq!(pair.client.timer_deadline(Timer::Retransmission), None);
}

#[test]
fn idle_timeout() {
    let _guard = subscribe();
    let mut pair = Pair::with_config(|config| {
        config.idle_timeout(Duration::from_secs(10));
    });
    let start = pair.clock.now_for_test();

    // Activity pushes the deadline back
    pair.clock.advance(Duration::from_secs(5));
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"ping"), 0, false);
    pair.drive();
    assert_eq!(pair.client.num_unacked_packets(), 0);
    let active = pair.clock.now_for_test();
    pair.clock.set(start + Duration::from_secs(10));
    pair.client.handle_timeout();
    assert!(pair.client.is_connected());
    assert_eq!(
        pair.client.timer_deadline(Timer::Idle),
        Some(active + Duration::from_secs(10))
    );

    pair.clock.set(active + Duration::from_secs(10));
    pair.client.handle_timeout();
    assert!(!pair.client.is_connected());
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::ConnectionTimedOut, false))
    );
    assert_eq!(pair.client.poll_timeout(), None);
    let close_packet = pair.client.take_close_packet().unwrap();
    let written = pair.client_writer.take_packets();
    assert_eq!(written.last(), Some(&close_packet));

    pair.server
        .process_udp_packet(server_addr(), client_addr(), &close_packet);
    assert_eq!(
        close_event(&events(&mut pair.server)),
        Some((ErrorCode::ConnectionTimedOut, true))
    );
}

#[test]
fn retransmissions_keep_connection_alive() {
    let _guard = subscribe();
    let mut pair = Pair::with_config(|config| {
        config.idle_timeout(Duration::from_secs(10));
    });
    let start = pair.clock.now_for_test();
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"lost"), 0, false);
    pair.client_writer.take_packets();

    // The peer never answers; only timeouts drive the client
    let mut last_sent = start;
    for _ in 0..100 {
        let deadline = pair.client.poll_timeout().unwrap();
        pair.clock.set(deadline);
        pair.client.handle_timeout();
        if !pair.client.is_connected() {
            break;
        }
        if !pair.client_writer.take_packets().is_empty() {
            last_sent = deadline;
        }
    }
    assert!(!pair.client.is_connected());
    assert!(pair.client.stats().rto_count > 0);
    assert!(last_sent > start + Duration::from_secs(10));
    assert_eq!(
        pair.clock.now_for_test(),
        last_sent + Duration::from_secs(10)
    );
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::ConnectionTimedOut, false))
    );
}

#[test]
fn version_negotiation() {
    let _guard = subscribe();
    let mut pair = Pair::with_configs(
        |config| {
            config.supported_versions(vec![Version::V11, Version::V12]);
        },
        |config| {
            config.supported_versions(vec![Version::V12]);
        },
    );
    assert_eq!(pair.client.version(), Version::V11);
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, true);
    pair.deliver_to_server();
    assert_eq!(
        pair.server.version_negotiation_state(),
        VersionNegotiationState::NegotiationInProgress
    );
    assert!(events(&mut pair.server).is_empty());

    let packets = pair.server_writer.take_packets();
    assert_eq!(packets.len(), 1);
    let recorder = PacketRecorder::process(
        &mut Framer::new(&[Version::V11, Version::V12], Side::Client),
        &packets[0],
    );
    assert_eq!(recorder.version_negotiation, Some(vec![Version::V12]));

    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packets[0]);
    assert_eq!(pair.client.version(), Version::V12);
    assert_eq!(
        pair.client.version_negotiation_state(),
        VersionNegotiationState::NegotiationInProgress
    );
    // The data went out again under the new version
    assert_eq!(pair.client.stats().packets_retransmitted, 1);

    pair.drive();
    let server_events = events(&mut pair.server);
    assert_matches!(server_events[0], Event::VersionNegotiated(Version::V12));
    assert_eq!(&stream_frames(&server_events)[0].data[..], b"hello");
    assert!(events(&mut pair.client)
        .iter()
        .any(|x| matches!(x, Event::VersionNegotiated(Version::V12))));
    assert_eq!(
        pair.client.version_negotiation_state(),
        VersionNegotiationState::NegotiatedVersion
    );
    assert_eq!(pair.client.num_unacked_packets(), 0);
    assert!(pair.client.is_connected() && pair.server.is_connected());
}

#[test]
fn version_negotiation_listing_our_version() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    let packet = Framer::build_version_negotiation_packet(GUID, &[Version::V12, Version::V11]);
    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packet);
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::InvalidVersionNegotiationPacket, false))
    );
}

#[test]
fn version_negotiation_without_common_version() {
    let _guard = subscribe();
    let mut pair = Pair::with_config(|config| {
        config.supported_versions(vec![Version::V11]);
    });
    let packet = Framer::build_version_negotiation_packet(GUID, &[Version::V12]);
    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packet);
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::InvalidVersion, false))
    );
    assert!(pair.client.take_close_packet().is_some());
}

#[test]
fn fec_revives_lost_packet() {
    fec_revival(0);
}

#[test]
fn fec_revives_short_packet() {
    // The revived payload is padded to the longest packet of the group
    fec_revival(1);
}

/// Send 1500 bytes in an FEC group of two and lose data packet `lost`
fn fec_revival(lost: usize) {
    let _guard = subscribe();
    let mut pair = Pair::with_config(|config| {
        config.max_packets_per_fec_group(2);
    });
    let data = Bytes::from((0..1500).map(|x| x as u8).collect::<Vec<u8>>());
    let consumed = pair
        .client
        .send_stream_data(STREAM, data.clone(), 0, true);
    assert_eq!(consumed.bytes_consumed, data.len());
    let packets = pair.client_writer.take_packets();
    // Two data packets and the FEC packet protecting them
    assert_eq!(packets.len(), 3);
    assert!(packets[1].len() < packets[0].len());

    for (i, packet) in packets.iter().enumerate() {
        if i != lost {
            pair.server
                .process_udp_packet(server_addr(), client_addr(), packet);
        }
    }
    assert_eq!(pair.server.stats().packets_revived, 1);
    assert_eq!(pair.server_congestion.state().revived, [lost as u64 + 1]);

    let mut frames = stream_frames(&events(&mut pair.server));
    assert_eq!(frames.len(), 2);
    frames.sort_by_key(|x| x.offset);
    let received = frames
        .iter()
        .flat_map(|x| x.data.iter().copied())
        .collect::<Vec<u8>>();
    assert_eq!(received, &data[..]);
    assert!(frames[1].fin);
    assert!(!frames[0].fin);

    pair.drive();
    assert_eq!(pair.client.num_unacked_packets(), 0);
}

/// Inverts every byte and appends the key, which decryption checks
struct XorEncrypter(u8);

impl Encrypter for XorEncrypter {
    fn encrypt_packet(&self, _: u64, _: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
        let mut out = plaintext.iter().map(|x| x ^ self.0).collect::<Vec<_>>();
        out.push(self.0);
        Some(out)
    }

    fn max_plaintext_size(&self, ciphertext_size: usize) -> usize {
        ciphertext_size.saturating_sub(1)
    }

    fn ciphertext_size(&self, plaintext_size: usize) -> usize {
        plaintext_size + 1
    }
}

struct XorDecrypter(u8);

impl Decrypter for XorDecrypter {
    fn decrypt_packet(&self, _: u64, _: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let (&key, body) = ciphertext.split_last()?;
        if key != self.0 {
            return None;
        }
        Some(body.iter().map(|x| x ^ key).collect())
    }
}

#[test]
fn undecryptable_packets_wait_for_keys() {
    let _guard = subscribe();
    let mut pair = Pair::with_config(|config| {
        config.max_undecryptable_packets(1);
    });
    pair.client
        .set_encrypter(EncryptionLevel::Initial, Box::new(XorEncrypter(0x5a)));
    pair.client
        .set_default_encryption_level(EncryptionLevel::Initial);
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"world"), 5, false);
    assert_eq!(pair.deliver_to_server(), 2);
    assert_eq!(pair.server.num_undecryptable_packets(), 1);
    // The queue holds one packet; the other was dropped
    assert_eq!(pair.server.stats().packets_dropped, 1);
    assert!(events(&mut pair.server).is_empty());

    pair.server.set_decrypter(Box::new(XorDecrypter(0x5a)));
    assert_eq!(pair.server.num_undecryptable_packets(), 0);
    let frames = stream_frames(&events(&mut pair.server));
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].data[..], b"hello");
}

#[test]
fn invalid_ack_closes_connection() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    pair.client_writer.take_packets();

    // Claims to have seen packets the client never sent
    let mut ack = AckFrame::default();
    ack.sent_info.least_unacked = 1;
    ack.received_info.largest_observed = 5;
    let packet = build_server_packet(1, &[Frame::Ack(ack)]);
    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packet);
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::InvalidAckData, false))
    );
    let written = pair.client_writer.take_packets();
    assert_eq!(written.len(), 1);
    let recorder = PacketRecorder::process(
        &mut Framer::new(crate::DEFAULT_SUPPORTED_VERSIONS, Side::Server),
        &written[0],
    );
    assert_matches!(
        &recorder.frames[..],
        [Frame::ConnectionClose(close)] if close.error_code == ErrorCode::InvalidAckData
    );

    // Closed for good
    let packet = build_server_packet(2, &[]);
    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packet);
    assert!(events(&mut pair.client).is_empty());
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"more"), 5, false);
    assert_eq!(pair.client_writer.num_packets(), 0);
}

#[test]
fn packet_far_out_of_bounds() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    let packet = build_server_packet(10_000, &[Frame::Padding]);
    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packet);
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::InvalidPacketHeader, false))
    );
}

/// A null-encrypted server-to-client packet carrying `frames`
fn build_server_packet(sequence_number: u64, frames: &[Frame]) -> Bytes {
    let mut framer = Framer::new(crate::DEFAULT_SUPPORTED_VERSIONS, Side::Server);
    let header = PacketHeader::new(PublicHeader::new(GUID), sequence_number);
    let size = framer.max_plaintext_size(MAX_PACKET_SIZE);
    let packet = framer
        .build_data_packet(&header, frames, size, &NoEntropy)
        .unwrap();
    framer
        .encrypt_packet(EncryptionLevel::None, sequence_number, &packet.packet)
        .unwrap()
}

#[test]
fn public_reset_closes_connection() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    let packet = Framer::build_public_reset_packet(&PublicResetPacket {
        public_header: PublicHeader {
            reset_flag: true,
            ..PublicHeader::new(GUID)
        },
        nonce_proof: 7,
        rejected_sequence_number: 1,
    });
    pair.client
        .process_udp_packet(client_addr(), server_addr(), &packet);
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::PublicReset, true))
    );
    assert_eq!(pair.client_writer.num_packets(), 0);
    assert!(pair.client.take_close_packet().is_none());
}

#[test]
fn address_migration_is_refused() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    let packet = pair.client_writer.take_packets().pop().unwrap();
    let moved = "127.0.0.9:7890".parse().unwrap();
    pair.server
        .process_udp_packet(server_addr(), moved, &packet);
    assert_eq!(
        close_event(&events(&mut pair.server)),
        Some((ErrorCode::ErrorMigratingAddress, false))
    );
}

#[test]
fn control_frames() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client
        .send_rst_stream(STREAM, RstStreamErrorCode::StreamCancelled);
    pair.client
        .send_go_away(ErrorCode::PeerGoingAway, StreamId(5), "bye");
    pair.drive();
    let server_events = events(&mut pair.server);
    assert!(server_events.iter().any(|x| matches!(
        x,
        Event::RstStream(frame)
            if frame.stream_id == STREAM && frame.error_code == RstStreamErrorCode::StreamCancelled
    )));
    assert!(server_events.iter().any(|x| matches!(
        x,
        Event::GoAway(frame) if frame.last_good_stream_id == StreamId(5) && &frame.reason_phrase[..] == b"bye"
    )));
    // Control frames are retransmittable, so they were acknowledged
    assert_eq!(pair.client.num_unacked_packets(), 0);
}

#[test]
fn congestion_delay_holds_data() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client_congestion
        .set_delay(Some(Duration::from_millis(10)));
    let consumed = pair
        .client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    assert_eq!(consumed, ConsumedData::default());
    let deadline = pair.client.timer_deadline(Timer::Send).unwrap();

    pair.client_congestion.set_delay(Some(Duration::ZERO));
    pair.clock.set(deadline);
    pair.client.handle_timeout();
    assert!(events(&mut pair.client)
        .iter()
        .any(|x| matches!(x, Event::CanWrite)));
    let consumed = pair
        .client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    assert_eq!(consumed.bytes_consumed, 5);

    // An infinite delay waits for an ack, without a timer
    pair.client_congestion.set_delay(None);
    let consumed = pair
        .client
        .send_stream_data(STREAM, Bytes::from_static(b"more"), 5, false);
    assert_eq!(consumed.bytes_consumed, 0);
    assert_eq!(pair.client.timer_deadline(Timer::Send), None);
}

#[test]
fn write_blocked_packets_flush_in_order() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client_writer.set_blocked(true);
    let consumed = pair
        .client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    assert_eq!(consumed.bytes_consumed, 5);
    assert!(pair.client.is_write_blocked());
    assert_eq!(pair.client.num_queued_packets(), 1);
    // Nothing more is accepted while blocked
    let consumed = pair
        .client
        .send_stream_data(STREAM, Bytes::from_static(b"world"), 5, false);
    assert_eq!(consumed.bytes_consumed, 0);

    pair.client_writer.set_blocked(false);
    assert!(pair.client.on_can_write());
    assert_eq!(pair.client.num_queued_packets(), 0);
    assert!(events(&mut pair.client)
        .iter()
        .any(|x| matches!(x, Event::CanWrite)));
    assert_eq!(pair.client_writer.num_packets(), 1);
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"world"), 5, false);
    pair.drive();
    let frames = stream_frames(&events(&mut pair.server));
    assert_eq!(
        frames.iter().map(|x| x.offset).collect::<Vec<_>>(),
        [0, 5]
    );
}

#[test]
fn write_blocked_with_buffering_writer() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client_writer.set_blocked(true);
    pair.client_writer.set_buffer_when_blocked(true);
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    assert!(pair.client.is_write_blocked());
    // The writer kept the packet, so nothing is queued
    assert_eq!(pair.client.num_queued_packets(), 0);
    assert_eq!(pair.client.stats().packets_sent, 1);
    assert_eq!(pair.client_writer.num_packets(), 1);
}

#[test]
fn write_error_closes_connection() {
    let _guard = subscribe();
    let mut pair = Pair::new();
    pair.client_writer.set_error(Some(5));
    pair.client
        .send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    assert_eq!(
        close_event(&events(&mut pair.client)),
        Some((ErrorCode::PacketWriteError, false))
    );
}

fn build_client_packet(guid: Guid, sequence_number: u64) -> Bytes {
    let mut framer = Framer::new(crate::DEFAULT_SUPPORTED_VERSIONS, Side::Client);
    let header = PacketHeader::new(PublicHeader::new(guid), sequence_number);
    let frame = Frame::Stream(StreamFrame {
        stream_id: STREAM,
        fin: false,
        offset: 0,
        data: Bytes::from_static(b"stale"),
    });
    let size = framer.max_plaintext_size(MAX_PACKET_SIZE);
    let packet = framer
        .build_data_packet(&header, &[frame], size, &NoEntropy)
        .unwrap();
    framer
        .encrypt_packet(EncryptionLevel::None, sequence_number, &packet.packet)
        .unwrap()
}

#[test]
fn time_wait_answers_powers_of_two() {
    let _guard = subscribe();
    let clock = MockClock::new();
    let writer = RecordingWriter::default();
    let mut time_wait = TimeWaitListManager::new(
        crate::DEFAULT_SUPPORTED_VERSIONS,
        Box::new(writer.clone()),
        Box::new(clock.clone()),
    );
    let guid = Guid(45);
    time_wait.add_guid_to_time_wait(guid, Version::V12, None);
    assert!(time_wait.is_guid_in_time_wait(guid));

    let mut answered = Vec::new();
    for sequence_number in 1..=4 {
        let packet = build_client_packet(guid, sequence_number);
        time_wait.process_packet(server_addr().ip(), client_addr(), guid, &packet);
        if writer.num_packets() > 0 {
            answered.push(sequence_number);
            let (response, destination) = writer
                .take_packets_with_destination()
                .pop()
                .unwrap();
            assert_eq!(destination, client_addr());
            let recorder = PacketRecorder::process(
                &mut Framer::new(crate::DEFAULT_SUPPORTED_VERSIONS, Side::Client),
                &response,
            );
            assert_eq!(recorder.error, None);
            let reset = recorder.public_reset.unwrap();
            assert_eq!(reset.public_header.guid, guid);
            assert_eq!(reset.rejected_sequence_number, sequence_number);
        }
    }
    assert_eq!(answered, [1, 2, 4]);
}

#[test]
fn time_wait_replays_close_packet_and_expires() {
    let _guard = subscribe();
    let clock = MockClock::new();
    let start = clock.now_for_test();
    let writer = RecordingWriter::default();
    let mut time_wait = TimeWaitListManager::new(
        crate::DEFAULT_SUPPORTED_VERSIONS,
        Box::new(writer.clone()),
        Box::new(clock.clone()),
    );
    let close = Bytes::from_static(b"close packet");
    time_wait.add_guid_to_time_wait(Guid(1), Version::V12, Some(close.clone()));
    clock.advance(Duration::from_secs(3));
    time_wait.add_guid_to_time_wait(Guid(2), Version::V12, None);

    time_wait.process_packet(
        server_addr().ip(),
        client_addr(),
        Guid(1),
        &build_client_packet(Guid(1), 1),
    );
    assert_eq!(writer.take_packets(), [close]);

    assert_eq!(time_wait.poll_timeout(), start + Duration::from_secs(5));
    clock.set(start + Duration::from_secs(5));
    time_wait.handle_timeout();
    assert!(!time_wait.is_guid_in_time_wait(Guid(1)));
    assert!(time_wait.is_guid_in_time_wait(Guid(2)));
    assert_eq!(time_wait.poll_timeout(), start + Duration::from_secs(8));

    clock.set(start + Duration::from_secs(8));
    time_wait.handle_timeout();
    assert!(time_wait.is_empty());
    assert_eq!(time_wait.poll_timeout(), start + Duration::from_secs(13));
}

#[test]
fn time_wait_queues_while_blocked() {
    let _guard = subscribe();
    let clock = MockClock::new();
    let writer = RecordingWriter::default();
    let mut time_wait = TimeWaitListManager::new(
        crate::DEFAULT_SUPPORTED_VERSIONS,
        Box::new(writer.clone()),
        Box::new(clock),
    );
    for guid in [Guid(1), Guid(2)] {
        time_wait.add_guid_to_time_wait(guid, Version::V12, None);
    }
    writer.set_blocked(true);
    for guid in [Guid(1), Guid(2)] {
        time_wait.process_packet(
            server_addr().ip(),
            client_addr(),
            guid,
            &build_client_packet(guid, 1),
        );
    }
    assert!(time_wait.is_write_blocked());
    assert_eq!(writer.num_packets(), 0);

    writer.set_blocked(false);
    assert!(time_wait.on_can_write());
    let guids = writer
        .take_packets()
        .iter()
        .map(|x| Framer::read_guid_from_packet(x).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(guids, [Guid(1), Guid(2)]);
}

#[test]
fn dispatcher_routes_and_retires_connections() {
    let _guard = subscribe();
    let clock = MockClock::new();
    let congestion = TestCongestion::default();
    let config = Arc::new(config(&congestion));
    let server_writer = RecordingWriter::default();
    let mut dispatcher = Dispatcher::new(config.clone(), server_writer.clone(), clock.clone());

    let client_writer = RecordingWriter::default();
    let mut client = crate::Connection::new(
        GUID,
        Side::Client,
        client_addr(),
        server_addr(),
        config,
        Box::new(clock.clone()),
        Box::new(client_writer.clone()),
    );
    client.send_stream_data(STREAM, Bytes::from_static(b"hello"), 0, false);
    for packet in client_writer.take_packets() {
        dispatcher.process_packet(server_addr(), client_addr(), &packet);
    }
    assert_eq!(dispatcher.num_connections(), 1);
    let mut events = Vec::new();
    while let Some(x) = dispatcher.poll() {
        assert_eq!(x.guid, GUID);
        events.push(x.event);
    }
    assert_eq!(&stream_frames(&events)[0].data[..], b"hello");

    // The application answers through the dispatcher
    dispatcher.with_connection(GUID, |conn| {
        conn.send_stream_data(STREAM, Bytes::from_static(b"hi"), 0, true)
    });
    for packet in server_writer.take_packets() {
        client.process_udp_packet(client_addr(), server_addr(), &packet);
    }
    assert_eq!(&stream_frames(&util::events(&mut client))[0].data[..], b"hi");

    dispatcher.shutdown();
    assert_eq!(dispatcher.num_connections(), 0);
    assert!(dispatcher.time_wait().is_guid_in_time_wait(GUID));
    let mut events = Vec::new();
    while let Some(x) = dispatcher.poll() {
        events.push(x.event);
    }
    assert_eq!(
        close_event(&events),
        Some((ErrorCode::PeerGoingAway, false))
    );
    let close_packet = server_writer.take_packets().pop().unwrap();

    // Late packets get the close packet again
    client.send_stream_data(STREAM, Bytes::from_static(b"late"), 5, false);
    for packet in client_writer.take_packets() {
        dispatcher.process_packet(server_addr(), client_addr(), &packet);
    }
    assert_eq!(server_writer.take_packets(), [close_packet.clone()]);

    client.process_udp_packet(client_addr(), server_addr(), &close_packet);
    assert_eq!(
        close_event(&util::events(&mut client)),
        Some((ErrorCode::PeerGoingAway, true))
    );
}

#[test]
fn dispatcher_ignores_short_guids() {
    let _guard = subscribe();
    let clock = MockClock::new();
    let writer = RecordingWriter::default();
    let mut dispatcher = Dispatcher::new(
        Arc::new(config(&TestCongestion::default())),
        writer.clone(),
        clock,
    );
    dispatcher.process_packet(server_addr(), client_addr(), &[0x00]);
    assert_eq!(dispatcher.num_connections(), 0);
    assert!(dispatcher.poll().is_none());
    assert_eq!(writer.num_packets(), 0);
}
