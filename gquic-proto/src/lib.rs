//! Low-level protocol logic for the QUIC_VERSION_12 generation of the QUIC protocol
//!
//! gquic-proto contains a fully deterministic implementation of the protocol logic. It contains
//! no event loop and reads time only through the [`Clock`] it is handed. Datagrams leave through
//! a [`PacketWriter`], which may be a plain UDP socket or anything else able to carry them.
//!
//! The most important types are [`Framer`], which turns packets into frames and back,
//! [`Connection`], which holds the per-connection state machine (acknowledgments, entropy
//! verification, retransmission, forward error correction and version negotiation), and
//! [`TimeWaitListManager`], which answers packets for connections that were recently closed.
//! [`Dispatcher`] ties them together on a server socket.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_arguments)]

use std::{fmt, ops};

mod coding;
mod fec;
mod io;
pub use crate::io::{Clock, PacketWriter, SystemClock, WriteResult};
mod packet;
pub use crate::packet::{
    packet_entropy_hash, FecData, GuidLength, Packet, PacketHeader, PublicHeader,
    PublicResetPacket, SequenceNumberLength, SerializedPacket,
};
#[cfg(test)]
mod tests;
mod transport_error;
pub use crate::transport_error::{ErrorCode, RstStreamErrorCode};
mod version;
pub use crate::version::{Version, DEFAULT_SUPPORTED_VERSIONS};

pub mod congestion;

mod config;
pub use crate::config::TransportConfig;

mod connection;
pub use crate::connection::{
    Connection, ConnectionStats, ConsumedData, Event, VersionNegotiationState,
};

pub mod crypto;

mod dispatcher;
pub use crate::dispatcher::{Dispatcher, DispatcherEvent};

mod frame;
pub use crate::frame::{
    AckFrame, CongestionFeedbackFrame, ConnectionCloseFrame, Frame, FrameType, GoAwayFrame,
    ReceivedPacketInfo, RetransmittableFrames, RstStreamFrame, SentPacketInfo, StreamFrame,
};

mod framer;
pub use crate::framer::{BuildError, Framer, FramerVisitor, ReceivedEntropyHashCalculator};

mod time_wait;
pub use crate::time_wait::TimeWaitListManager;

pub(crate) use std::time::{Duration, Instant};

/// Largest datagram either side will send or accept
pub const MAX_PACKET_SIZE: usize = 1200;

/// Sequence numbers further than this from the last accepted packet are refused
const MAX_PACKET_GAP: u64 = 5000;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Connection identifier carried in the public header
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Guid(pub u64);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Guid {
    fn from(x: u64) -> Self {
        Self(x)
    }
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

impl From<u32> for StreamId {
    fn from(x: u32) -> Self {
        Self(x)
    }
}

/// One-byte running XOR of per-packet entropy bits
pub type EntropyHash = u8;
