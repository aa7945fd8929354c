use bytes::{BufMut, Bytes};
use tracing::trace;

use super::{BuildError, ReceivedEntropyHashCalculator};
use crate::{
    coding::{BufExt, BufMutExt},
    congestion::Bandwidth,
    frame::{
        AckFrame, CongestionFeedbackFrame, ConnectionCloseFrame, Frame, GoAwayFrame,
        ReceivedPacketInfo, RstStreamFrame, SentPacketInfo, StreamFrame,
    },
    packet::{PacketHeader, SequenceNumberLength},
    Duration, ErrorCode, RstStreamErrorCode, StreamId,
};

pub(super) const SPECIAL_FRAME_MASK: u8 = 0xe0;
pub(super) const STREAM_FRAME_FLAG: u8 = 0x80;
pub(super) const ACK_FRAME_FLAG: u8 = 0x40;
const CONGESTION_FEEDBACK_FRAME_FLAG: u8 = 0x20;

pub(super) const PADDING_FRAME: u8 = 0;
pub(super) const RST_STREAM_FRAME: u8 = 1;
pub(super) const CONNECTION_CLOSE_FRAME: u8 = 2;
pub(super) const GOAWAY_FRAME: u8 = 3;

// Stream frame type byte: 1FDOOOSS
const STREAM_FIN_FLAG: u8 = 0x40;
const STREAM_DATA_LENGTH_FLAG: u8 = 0x20;
const STREAM_OFFSET_SHIFT: u8 = 2;
const STREAM_OFFSET_MASK: u8 = 0x07;
const STREAM_ID_LENGTH_MASK: u8 = 0x03;

// Ack frame type byte: 01NTLLMM
const ACK_HAS_NACKS_FLAG: u8 = 0x20;
const ACK_TRUNCATED_FLAG: u8 = 0x10;
const ACK_LARGEST_OBSERVED_SHIFT: u8 = 2;

const FEEDBACK_TCP: u8 = 0;
// Type 1 is inter-arrival feedback, which is not supported
const FEEDBACK_FIX_RATE: u8 = 2;

const FRAME_TYPE_SIZE: usize = 1;
const ENTROPY_HASH_SIZE: usize = 1;
const DELTA_TIME_SIZE: usize = 4;
const NUM_MISSING_RANGES_SIZE: usize = 1;
const ERROR_CODE_SIZE: usize = 4;
const STREAM_ID_SIZE: usize = 4;
const ERROR_DETAILS_LENGTH_SIZE: usize = 2;
/// Length prefix of stream data that is not the last frame in its packet
pub(crate) const STREAM_PAYLOAD_LENGTH_SIZE: usize = 2;

/// An ack names at most this many nack ranges
const MAX_NACK_RANGES: usize = 255;
/// Encodes an unknown delta time
const INVALID_DELTA_TIME: u32 = u32::MAX;
/// The TCP receive window travels in units of 16 bytes
const RECEIVE_WINDOW_SHIFT: u32 = 4;

fn stream_id_size(id: StreamId) -> usize {
    (1..4).find(|&i| id.0 >> (8 * i) == 0).unwrap_or(4)
}

/// No offset bytes for offset zero, otherwise between two and eight
fn stream_offset_size(offset: u64) -> usize {
    if offset == 0 {
        return 0;
    }
    (2..8).find(|&i| offset >> (8 * i) == 0).unwrap_or(8)
}

/// Size of a stream frame carrying no data
pub(crate) fn min_stream_frame_size(
    stream_id: StreamId,
    offset: u64,
    last_frame_in_packet: bool,
) -> usize {
    FRAME_TYPE_SIZE
        + stream_id_size(stream_id)
        + stream_offset_size(offset)
        + if last_frame_in_packet {
            0
        } else {
            STREAM_PAYLOAD_LENGTH_SIZE
        }
}

/// Size of an ack frame with no nack ranges
pub(crate) fn min_ack_frame_size(
    sequence_number_length: SequenceNumberLength,
    largest_observed_length: SequenceNumberLength,
) -> usize {
    FRAME_TYPE_SIZE
        + ENTROPY_HASH_SIZE
        + sequence_number_length.bytes()
        + ENTROPY_HASH_SIZE
        + largest_observed_length.bytes()
        + DELTA_TIME_SIZE
}

/// Runs of missing packets, as `(first, extra)` where the run covers `first..=first + extra`
struct NackRanges {
    ranges: Vec<(u64, u64)>,
    /// Largest gap between consecutive missing packets, or from the last one to the largest
    /// observed; decides the width of encoded deltas
    max_delta: u64,
}

impl NackRanges {
    fn new(info: &ReceivedPacketInfo) -> Self {
        let mut ranges = Vec::new();
        let mut max_delta = 0;
        let mut iter = info.missing_packets.iter().copied();
        let Some(mut last_missing) = iter.next() else {
            return Self { ranges, max_delta };
        };
        let mut cur_range_length = 0;
        for missing in iter {
            if cur_range_length != u64::from(u8::MAX) && missing == last_missing + 1 {
                cur_range_length += 1;
            } else {
                ranges.push((last_missing - cur_range_length, cur_range_length));
                cur_range_length = 0;
            }
            max_delta = max_delta.max(missing - last_missing);
            last_missing = missing;
        }
        ranges.push((last_missing - cur_range_length, cur_range_length));
        max_delta = max_delta.max(info.largest_observed.saturating_sub(last_missing));
        Self { ranges, max_delta }
    }
}

/// Encoded size of `frame`, ignoring truncation
pub(crate) fn compute_frame_length(
    frame: &Frame,
    last_frame_in_packet: bool,
    sequence_number_length: SequenceNumberLength,
) -> usize {
    match frame {
        Frame::Stream(x) => {
            min_stream_frame_size(x.stream_id, x.offset, last_frame_in_packet) + x.data.len()
        }
        Frame::Ack(x) => {
            let nacks = NackRanges::new(&x.received_info);
            let largest_observed_length =
                SequenceNumberLength::min_for(x.received_info.largest_observed);
            let missing_length = SequenceNumberLength::min_for(nacks.max_delta);
            let mut len = min_ack_frame_size(sequence_number_length, largest_observed_length);
            if !nacks.ranges.is_empty() {
                len += NUM_MISSING_RANGES_SIZE
                    + (missing_length.bytes() + 1) * nacks.ranges.len();
            }
            len
        }
        Frame::CongestionFeedback(x) => {
            FRAME_TYPE_SIZE
                + 1
                + match x {
                    CongestionFeedbackFrame::Tcp { .. } => 2 + 2,
                    CongestionFeedbackFrame::FixRate { .. } => 4,
                }
        }
        Frame::RstStream(x) => {
            FRAME_TYPE_SIZE
                + STREAM_ID_SIZE
                + ERROR_CODE_SIZE
                + ERROR_DETAILS_LENGTH_SIZE
                + x.error_details.len()
        }
        Frame::ConnectionClose(x) => {
            FRAME_TYPE_SIZE + ERROR_CODE_SIZE + ERROR_DETAILS_LENGTH_SIZE + x.error_details.len()
        }
        Frame::GoAway(x) => {
            FRAME_TYPE_SIZE
                + ERROR_CODE_SIZE
                + STREAM_ID_SIZE
                + ERROR_DETAILS_LENGTH_SIZE
                + x.reason_phrase.len()
        }
        Frame::Padding => 0,
    }
}

/// Bytes `frame` will occupy in a packet with `free_bytes` left, or 0 if it does not belong
///
/// Padding takes whatever is left. Only the first frame of a packet may be truncated, and only
/// acks can be.
pub(crate) fn serialized_frame_length(
    frame: &Frame,
    free_bytes: usize,
    first_frame: bool,
    last_frame: bool,
    sequence_number_length: SequenceNumberLength,
) -> usize {
    if let Frame::Padding = frame {
        return free_bytes;
    }
    let len = compute_frame_length(frame, last_frame, sequence_number_length);
    if len <= free_bytes {
        return len;
    }
    if !first_frame {
        return 0;
    }
    let can_truncate = matches!(frame, Frame::Ack(_))
        && free_bytes >= min_ack_frame_size(SequenceNumberLength::Six, SequenceNumberLength::Six);
    if can_truncate {
        trace!(len, free_bytes, "truncating large frame");
        return free_bytes;
    }
    len
}

pub(super) fn encode_stream_frame(frame: &StreamFrame, last_frame_in_packet: bool, buf: &mut Vec<u8>) {
    let id_len = stream_id_size(frame.stream_id);
    let offset_len = stream_offset_size(frame.offset);
    let mut ty = STREAM_FRAME_FLAG;
    if frame.fin {
        ty |= STREAM_FIN_FLAG;
    }
    if !last_frame_in_packet {
        ty |= STREAM_DATA_LENGTH_FLAG;
    }
    // Offset widths 2..=8 map to codes 1..=7
    let offset_code = offset_len.saturating_sub(1) as u8;
    ty |= offset_code << STREAM_OFFSET_SHIFT;
    ty |= (id_len - 1) as u8;
    buf.write(ty);
    buf.write_uint(u64::from(frame.stream_id.0), id_len);
    buf.write_uint(frame.offset, offset_len);
    if last_frame_in_packet {
        buf.put_slice(&frame.data);
    } else {
        buf.write_string16(&frame.data);
    }
}

pub(super) fn decode_stream_frame(ty: u8, buf: &mut Bytes) -> Result<StreamFrame, &'static str> {
    let id_len = usize::from(ty & STREAM_ID_LENGTH_MASK) + 1;
    let mut offset_len = usize::from((ty >> STREAM_OFFSET_SHIFT) & STREAM_OFFSET_MASK);
    // There is no encoding for a one-byte offset
    if offset_len > 0 {
        offset_len += 1;
    }
    let has_data_length = ty & STREAM_DATA_LENGTH_FLAG != 0;
    let fin = ty & STREAM_FIN_FLAG != 0;

    let stream_id = buf
        .read_uint(id_len)
        .map_err(|_| "Unable to read stream_id.")?;
    let offset = buf
        .read_uint(offset_len)
        .map_err(|_| "Unable to read offset.")?;
    let data = if has_data_length {
        buf.read_string16()
            .map_err(|_| "Unable to read frame data.")?
    } else {
        std::mem::take(buf)
    };
    Ok(StreamFrame {
        stream_id: StreamId(stream_id as u32),
        fin,
        offset,
        data,
    })
}

pub(super) fn encode_ack_frame(
    header: &PacketHeader,
    frame: &AckFrame,
    packet_size: usize,
    entropy: &dyn ReceivedEntropyHashCalculator,
    buf: &mut Vec<u8>,
) -> Result<(), BuildError> {
    let sequence_number_length = header.public_header.sequence_number_length;
    let received = &frame.received_info;
    // Sequence numbers start at 1, and range arithmetic relies on it
    if received.missing_packets.first() == Some(&0) {
        return Err(BuildError::MissingPacketZero);
    }
    let nacks = NackRanges::new(received);
    let largest_observed_length = SequenceNumberLength::min_for(received.largest_observed);
    let missing_length = SequenceNumberLength::min_for(nacks.max_delta);

    let available_range_bytes = packet_size
        .saturating_sub(buf.len())
        .saturating_sub(min_ack_frame_size(sequence_number_length, largest_observed_length))
        .saturating_sub(NUM_MISSING_RANGES_SIZE);
    let max_num_ranges =
        (available_range_bytes / (missing_length.bytes() + 1)).min(MAX_NACK_RANGES);
    let truncated = nacks.ranges.len() > max_num_ranges;
    if truncated {
        trace!(
            from = nacks.ranges.len(),
            to = max_num_ranges,
            "truncating ack"
        );
    }

    let mut ty = ACK_FRAME_FLAG;
    if !nacks.ranges.is_empty() {
        ty |= ACK_HAS_NACKS_FLAG;
    }
    if truncated {
        ty |= ACK_TRUNCATED_FLAG;
    }
    ty |= largest_observed_length.flags() << ACK_LARGEST_OBSERVED_SHIFT;
    ty |= missing_length.flags();
    buf.write(ty);

    buf.write(frame.sent_info.entropy_hash);
    let least_unacked_delta = header
        .packet_sequence_number
        .saturating_sub(frame.sent_info.least_unacked);
    if least_unacked_delta >> (8 * sequence_number_length.bytes()) != 0 {
        return Err(BuildError::LeastUnackedDeltaTooLarge(least_unacked_delta));
    }
    buf.write_uint(least_unacked_delta, sequence_number_length.bytes());

    // Ranges from the highest down; a truncated ack drops the highest ones and claims only
    // what lies below them
    let mut ranges = nacks.ranges.iter().rev();
    let mut largest_observed = received.largest_observed;
    let mut entropy_hash = received.entropy_hash;
    if truncated {
        let dropped = nacks.ranges.len() - max_num_ranges;
        if let Some(&(first, _)) = ranges.nth(dropped - 1) {
            largest_observed = first - 1;
            entropy_hash = entropy.entropy_hash(largest_observed);
        }
    }
    buf.write(entropy_hash);
    buf.write_uint(largest_observed, largest_observed_length.bytes());
    let delta_time = received
        .delta_time_largest_observed
        .map_or(INVALID_DELTA_TIME, |x| {
            u32::try_from(x.as_micros()).unwrap_or(INVALID_DELTA_TIME - 1)
        });
    buf.write(delta_time);

    if nacks.ranges.is_empty() {
        return Ok(());
    }
    buf.write(nacks.ranges.len().min(max_num_ranges) as u8);
    let mut last_written = largest_observed;
    for &(first, extra) in ranges {
        // A delta of zero means the range ends right below the previous one
        buf.write_uint(
            last_written.saturating_sub(first + extra),
            missing_length.bytes(),
        );
        buf.write(extra as u8);
        last_written = first - 1;
    }
    Ok(())
}

pub(super) fn decode_ack_frame(
    header: &PacketHeader,
    ty: u8,
    buf: &mut Bytes,
) -> Result<AckFrame, &'static str> {
    let sent_entropy = buf
        .read::<u8>()
        .map_err(|_| "Unable to read entropy hash for sent packets.")?;
    let least_unacked_delta = buf
        .read_uint(header.public_header.sequence_number_length.bytes())
        .map_err(|_| "Unable to read least unacked delta.")?;
    let least_unacked = header
        .packet_sequence_number
        .checked_sub(least_unacked_delta)
        .ok_or("Invalid least unacked delta.")?;

    let missing_length = SequenceNumberLength::from_flags(ty);
    let largest_observed_length = SequenceNumberLength::from_flags(ty >> ACK_LARGEST_OBSERVED_SHIFT);
    let is_truncated = ty & ACK_TRUNCATED_FLAG != 0;
    let has_nacks = ty & ACK_HAS_NACKS_FLAG != 0;

    let mut received = ReceivedPacketInfo {
        is_truncated,
        ..ReceivedPacketInfo::default()
    };
    received.entropy_hash = buf
        .read::<u8>()
        .map_err(|_| "Unable to read entropy hash for received packets.")?;
    received.largest_observed = buf
        .read_uint(largest_observed_length.bytes())
        .map_err(|_| "Unable to read largest observed.")?;
    let delta_time = buf
        .read::<u32>()
        .map_err(|_| "Unable to read delta time largest observed.")?;
    received.delta_time_largest_observed = match delta_time {
        INVALID_DELTA_TIME => None,
        x => Some(Duration::from_micros(u64::from(x))),
    };

    if has_nacks {
        let num_ranges = buf
            .read::<u8>()
            .map_err(|_| "Unable to read num missing packet ranges.")?;
        let mut last = received.largest_observed;
        for _ in 0..num_ranges {
            let delta = buf
                .read_uint(missing_length.bytes())
                .map_err(|_| "Unable to read missing sequence number delta.")?;
            let extra = buf
                .read::<u8>()
                .map_err(|_| "Unable to read missing sequence number range.")?;
            let top = last
                .checked_sub(delta)
                .ok_or("Invalid missing sequence number delta.")?;
            let bottom = top
                .checked_sub(u64::from(extra))
                .filter(|&x| x > 0)
                .ok_or("Invalid missing sequence number range.")?;
            received.missing_packets.extend(bottom..=top);
            // Ranges cannot touch, so the next one ends at least one below this one
            last = bottom - 1;
        }
    }

    Ok(AckFrame {
        sent_info: SentPacketInfo {
            entropy_hash: sent_entropy,
            least_unacked,
        },
        received_info: received,
    })
}

pub(super) fn encode_congestion_feedback_frame(frame: &CongestionFeedbackFrame, buf: &mut Vec<u8>) {
    buf.write(CONGESTION_FEEDBACK_FRAME_FLAG);
    match *frame {
        CongestionFeedbackFrame::Tcp {
            accumulated_number_of_lost_packets,
            receive_window,
        } => {
            buf.write(FEEDBACK_TCP);
            buf.write(accumulated_number_of_lost_packets);
            let window = u16::try_from(receive_window >> RECEIVE_WINDOW_SHIFT).unwrap_or(u16::MAX);
            buf.write(window);
        }
        CongestionFeedbackFrame::FixRate { bitrate } => {
            buf.write(FEEDBACK_FIX_RATE);
            let rate = u32::try_from(bitrate.to_bytes_per_second()).unwrap_or(u32::MAX);
            buf.write(rate);
        }
    }
}

pub(super) fn decode_congestion_feedback_frame(
    buf: &mut Bytes,
) -> Result<CongestionFeedbackFrame, &'static str> {
    let ty = buf
        .read::<u8>()
        .map_err(|_| "Unable to read congestion feedback type.")?;
    match ty {
        FEEDBACK_TCP => {
            let accumulated_number_of_lost_packets = buf
                .read::<u16>()
                .map_err(|_| "Unable to read accumulated number of lost packets.")?;
            let window = buf
                .read::<u16>()
                .map_err(|_| "Unable to read receive window.")?;
            Ok(CongestionFeedbackFrame::Tcp {
                accumulated_number_of_lost_packets,
                receive_window: u64::from(window) << RECEIVE_WINDOW_SHIFT,
            })
        }
        FEEDBACK_FIX_RATE => {
            let rate = buf
                .read::<u32>()
                .map_err(|_| "Unable to read bitrate.")?;
            Ok(CongestionFeedbackFrame::FixRate {
                bitrate: Bandwidth::from_bytes_per_second(u64::from(rate)),
            })
        }
        _ => Err("Illegal congestion feedback type."),
    }
}

pub(super) fn encode_rst_stream_frame(frame: &RstStreamFrame, buf: &mut Vec<u8>) {
    buf.write(RST_STREAM_FRAME);
    buf.write(frame.stream_id.0);
    buf.write(u32::from(frame.error_code));
    buf.write_string16(&frame.error_details);
}

pub(super) fn decode_rst_stream_frame(buf: &mut Bytes) -> Result<RstStreamFrame, &'static str> {
    let stream_id = buf
        .read::<u32>()
        .map_err(|_| "Unable to read stream_id.")?;
    let code = buf
        .read::<u32>()
        .map_err(|_| "Unable to read rst stream error code.")?;
    let error_code = RstStreamErrorCode::from_u32(code).ok_or("Invalid rst stream error code.")?;
    let error_details = buf
        .read_string16()
        .map_err(|_| "Unable to read rst stream error details.")?;
    Ok(RstStreamFrame {
        stream_id: StreamId(stream_id),
        error_code,
        error_details,
    })
}

pub(super) fn encode_connection_close_frame(frame: &ConnectionCloseFrame, buf: &mut Vec<u8>) {
    buf.write(CONNECTION_CLOSE_FRAME);
    buf.write(u32::from(frame.error_code));
    buf.write_string16(&frame.error_details);
}

pub(super) fn decode_connection_close_frame(
    buf: &mut Bytes,
) -> Result<ConnectionCloseFrame, &'static str> {
    let code = buf
        .read::<u32>()
        .map_err(|_| "Unable to read connection close error code.")?;
    let error_code = ErrorCode::from_u32(code).ok_or("Invalid error code.")?;
    let error_details = buf
        .read_string16()
        .map_err(|_| "Unable to read connection close error details.")?;
    Ok(ConnectionCloseFrame {
        error_code,
        error_details,
    })
}

pub(super) fn encode_go_away_frame(frame: &GoAwayFrame, buf: &mut Vec<u8>) {
    buf.write(GOAWAY_FRAME);
    buf.write(u32::from(frame.error_code));
    buf.write(frame.last_good_stream_id.0);
    buf.write_string16(&frame.reason_phrase);
}

pub(super) fn decode_go_away_frame(buf: &mut Bytes) -> Result<GoAwayFrame, &'static str> {
    let code = buf
        .read::<u32>()
        .map_err(|_| "Unable to read go away error code.")?;
    let error_code = ErrorCode::from_u32(code).ok_or("Invalid error code.")?;
    let last_good_stream_id = buf
        .read::<u32>()
        .map_err(|_| "Unable to read last good stream id.")?;
    let reason_phrase = buf
        .read_string16()
        .map_err(|_| "Unable to read goaway reason.")?;
    Ok(GoAwayFrame {
        error_code,
        last_good_stream_id: StreamId(last_good_stream_id),
        reason_phrase,
    })
}
