use std::{collections::BTreeSet, fmt};

use bytes::Bytes;

use crate::{
    congestion::Bandwidth, crypto::EncryptionLevel, Duration, EntropyHash, ErrorCode,
    RstStreamErrorCode, StreamId,
};

/// Kind of a frame, as encoded in its type byte
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameType {
    /// The rest of the packet is padding
    Padding,
    /// Abrupt termination of one stream
    RstStream,
    /// Termination of the whole connection
    ConnectionClose,
    /// The sender will open no new streams
    GoAway,
    /// Stream payload
    Stream,
    /// Acknowledgment
    Ack,
    /// Receiver-side congestion information
    CongestionFeedback,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameType::Padding => "PADDING",
            FrameType::RstStream => "RST_STREAM",
            FrameType::ConnectionClose => "CONNECTION_CLOSE",
            FrameType::GoAway => "GOAWAY",
            FrameType::Stream => "STREAM",
            FrameType::Ack => "ACK",
            FrameType::CongestionFeedback => "CONGESTION_FEEDBACK",
        };
        f.write_str(s)
    }
}

/// A unit of content inside a data packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// Fills the rest of the packet
    Padding,
    /// Stream payload
    Stream(StreamFrame),
    /// Acknowledgment
    Ack(AckFrame),
    /// Receiver-side congestion information
    CongestionFeedback(CongestionFeedbackFrame),
    /// Abrupt termination of one stream
    RstStream(RstStreamFrame),
    /// Termination of the whole connection
    ConnectionClose(ConnectionCloseFrame),
    /// The sender will open no new streams
    GoAway(GoAwayFrame),
}

impl Frame {
    /// The kind of frame
    pub fn ty(&self) -> FrameType {
        match self {
            Frame::Padding => FrameType::Padding,
            Frame::Stream(_) => FrameType::Stream,
            Frame::Ack(_) => FrameType::Ack,
            Frame::CongestionFeedback(_) => FrameType::CongestionFeedback,
            Frame::RstStream(_) => FrameType::RstStream,
            Frame::ConnectionClose(_) => FrameType::ConnectionClose,
            Frame::GoAway(_) => FrameType::GoAway,
        }
    }

    /// Whether loss of the frame requires sending it again
    ///
    /// Acks and feedback are regenerated from fresh state instead.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::CongestionFeedback(_)
        )
    }
}

/// A contiguous range of stream data
#[derive(Clone, Eq, PartialEq)]
pub struct StreamFrame {
    /// Stream the data belongs to
    pub stream_id: StreamId,
    /// Whether this is the end of the stream
    pub fin: bool,
    /// Stream offset of the first byte
    pub offset: u64,
    /// Payload
    pub data: Bytes,
}

impl fmt::Debug for StreamFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFrame")
            .field("stream_id", &self.stream_id)
            .field("fin", &self.fin)
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish()
    }
}

/// What the sender of an ack says about its own outgoing packets
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SentPacketInfo {
    /// Cumulative entropy of all packets the sender sent below `least_unacked`
    pub entropy_hash: EntropyHash,
    /// Smallest sequence number the sender still waits to see acknowledged
    pub least_unacked: u64,
}

/// What the sender of an ack has received
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReceivedPacketInfo {
    /// Cumulative entropy of packets received up to `largest_observed`, missing ones excluded
    pub entropy_hash: EntropyHash,
    /// Largest sequence number received
    pub largest_observed: u64,
    /// Time between receiving `largest_observed` and sending this ack; `None` when unknown
    pub delta_time_largest_observed: Option<Duration>,
    /// Packets below `largest_observed` that have not arrived
    pub missing_packets: BTreeSet<u64>,
    /// Whether the nack ranges did not all fit and `largest_observed` was lowered
    pub is_truncated: bool,
}

impl ReceivedPacketInfo {
    /// Whether `sequence_number` is neither missing nor beyond the largest observed
    pub fn is_acked(&self, sequence_number: u64) -> bool {
        sequence_number <= self.largest_observed
            && !self.missing_packets.contains(&sequence_number)
    }
}

/// Acknowledgment of received packets plus the sender's own least unacked packet
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AckFrame {
    /// Sender-side state
    pub sent_info: SentPacketInfo,
    /// Receiver-side state
    pub received_info: ReceivedPacketInfo,
}

/// Receiver-generated input for the peer's congestion controller
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CongestionFeedbackFrame {
    /// Feedback for a TCP-like sender
    Tcp {
        /// Packets the receiver has seen lost so far
        accumulated_number_of_lost_packets: u16,
        /// Receive window in bytes, a multiple of 16 on the wire
        receive_window: u64,
    },
    /// Feedback for a fixed-rate sender
    FixRate {
        /// Rate the receiver asks the sender to use
        bitrate: Bandwidth,
    },
}

/// Abrupt termination of one stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RstStreamFrame {
    /// Stream being reset
    pub stream_id: StreamId,
    /// Reason
    pub error_code: RstStreamErrorCode,
    /// Free-form explanation
    pub error_details: Bytes,
}

/// Termination of the whole connection
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionCloseFrame {
    /// Reason
    pub error_code: ErrorCode,
    /// Free-form explanation
    pub error_details: Bytes,
}

/// Announcement that the sender will open no new streams
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GoAwayFrame {
    /// Reason
    pub error_code: ErrorCode,
    /// Highest stream id the sender processed
    pub last_good_stream_id: StreamId,
    /// Free-form explanation
    pub reason_phrase: Bytes,
}

/// The retransmittable frames of a sent packet, with the level they were encrypted at
#[derive(Debug, Clone, Default)]
pub struct RetransmittableFrames {
    /// Frames to send again on loss
    pub frames: Vec<Frame>,
    /// Level the frames were first encrypted at; retransmissions must keep it
    pub encryption_level: EncryptionLevel,
}

impl RetransmittableFrames {
    pub(crate) fn has_stream_frames(&self) -> bool {
        self.frames.iter().any(|f| matches!(f, Frame::Stream(_)))
    }
}
