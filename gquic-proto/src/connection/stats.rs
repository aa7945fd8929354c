//! Connection statistics

use crate::Duration;

/// Connection statistics
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// Bytes handed to the packet writer, retransmissions included
    pub bytes_sent: u64,
    /// Packets handed to the packet writer, retransmissions included
    pub packets_sent: u64,
    /// Bytes of every datagram received, whether it could be processed or not
    pub bytes_received: u64,
    /// Datagrams received, whether they could be processed or not
    pub packets_received: u64,
    /// Bytes sent again under new sequence numbers
    pub bytes_retransmitted: u64,
    /// Packets sent again under new sequence numbers
    pub packets_retransmitted: u64,
    /// Received packets that were discarded, usually because they failed to decrypt
    pub packets_dropped: u64,
    /// Lost packets reconstructed from FEC data
    pub packets_revived: u64,
    /// Times the retransmission timer fired
    pub rto_count: u64,
    /// Current round trip time estimate of the send algorithm
    pub rtt: Duration,
}
