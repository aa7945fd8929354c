use std::{
    collections::VecDeque,
    fmt,
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::{
    framer::{Framer, FramerVisitor},
    io::{Clock, PacketWriter, WriteResult},
    packet::{PacketHeader, PublicHeader, PublicResetPacket},
    Duration, Guid, Instant, Side, Version,
};

/// How long a closed connection's guid keeps being answered
const TIME_WAIT_PERIOD: Duration = Duration::from_secs(5);
/// Nonce proof sent in public resets until real proofs exist
const PUBLIC_RESET_NONCE_PROOF: u64 = 1010101;

/// Answers packets addressed to recently closed connections
///
/// Each guid stays for a fixed period after it was added. Packets for it are answered with the
/// connection's close packet, or with a public reset if there is none, but only on the first,
/// second, fourth, eighth... packet so a misbehaving peer cannot turn us into an amplifier.
pub struct TimeWaitListManager {
    framer: Framer,
    writer: Box<dyn PacketWriter>,
    clock: Box<dyn Clock>,
    guids: FxHashMap<Guid, GuidData>,
    /// Guids in the order they were added
    added: VecDeque<(Guid, Instant)>,
    /// Responses the writer refused, oldest first
    pending: VecDeque<QueuedResponse>,
    write_blocked: bool,
    cleanup: Instant,
}

impl TimeWaitListManager {
    /// Create an empty list answering with `writer`
    pub fn new(
        supported_versions: &[Version],
        writer: Box<dyn PacketWriter>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let cleanup = clock.now() + TIME_WAIT_PERIOD;
        Self {
            framer: Framer::new(supported_versions, Side::Server),
            writer,
            clock,
            guids: FxHashMap::default(),
            added: VecDeque::new(),
            pending: VecDeque::new(),
            write_blocked: false,
            cleanup,
        }
    }

    /// Start answering packets for `guid`
    ///
    /// `version` is the version the connection spoke; `close_packet`, if any, is sent instead of
    /// a public reset.
    pub fn add_guid_to_time_wait(
        &mut self,
        guid: Guid,
        version: Version,
        close_packet: Option<Bytes>,
    ) {
        if self.guids.contains_key(&guid) {
            warn!(%guid, "guid already in time wait");
            return;
        }
        debug!(%guid, %version, "adding guid to time wait");
        let now = self.clock.now();
        self.guids.insert(
            guid,
            GuidData {
                num_packets: 0,
                version,
                close_packet,
            },
        );
        self.added.push_back((guid, now));
    }

    /// Whether packets for `guid` are answered here
    pub fn is_guid_in_time_wait(&self, guid: Guid) -> bool {
        self.guids.contains_key(&guid)
    }

    /// Number of guids in time wait
    pub fn len(&self) -> usize {
        self.guids.len()
    }

    /// Whether no guid is in time wait
    pub fn is_empty(&self) -> bool {
        self.guids.is_empty()
    }

    /// Handle a packet for a guid in time wait
    ///
    /// Only the public and unauthenticated headers are parsed; the payload is never decrypted.
    pub fn process_packet(
        &mut self,
        self_address: IpAddr,
        peer_address: SocketAddr,
        guid: Guid,
        packet: &[u8],
    ) {
        let Some(data) = self.guids.get(&guid) else {
            debug!(%guid, "packet for guid not in time wait");
            return;
        };
        // Parse the way the connection did
        self.framer.set_version(data.version);
        let mut visitor = HeaderVisitor::default();
        self.framer.process_packet(&mut visitor, packet);
        let Some(header) = visitor.header else {
            return;
        };
        let guid = header.public_header.guid;
        let Some(data) = self.guids.get_mut(&guid) else {
            return;
        };
        data.num_packets += 1;
        if !data.num_packets.is_power_of_two() {
            trace!(%guid, num_packets = data.num_packets, "not answering packet");
            return;
        }
        let packet = match &data.close_packet {
            Some(close) => close.clone(),
            None => Framer::build_public_reset_packet(&PublicResetPacket {
                public_header: PublicHeader {
                    reset_flag: true,
                    ..PublicHeader::new(guid)
                },
                nonce_proof: PUBLIC_RESET_NONCE_PROOF,
                rejected_sequence_number: header.packet_sequence_number,
            }),
        };
        debug!(%guid, %peer_address, rejected = header.packet_sequence_number, "answering packet in time wait");
        self.send_or_queue(QueuedResponse {
            packet,
            self_address,
            peer_address,
        });
    }

    /// The writer may accept packets again
    ///
    /// Returns `false` if it blocked again before every queued response was written.
    pub fn on_can_write(&mut self) -> bool {
        self.write_blocked = false;
        while let Some(response) = self.pending.pop_front() {
            if !self.write(&response) {
                self.pending.push_front(response);
                break;
            }
        }
        !self.write_blocked
    }

    /// Whether the writer reported itself blocked
    pub fn is_write_blocked(&self) -> bool {
        self.write_blocked
    }

    /// Returns the next time at which `handle_timeout` should be called
    pub fn poll_timeout(&self) -> Instant {
        self.cleanup
    }

    /// Remove guids whose time is up
    pub fn handle_timeout(&mut self) {
        let now = self.clock.now();
        if now < self.cleanup {
            return;
        }
        while let Some(&(guid, added)) = self.added.front() {
            if now.saturating_duration_since(added) < TIME_WAIT_PERIOD {
                break;
            }
            trace!(%guid, "guid leaving time wait");
            self.added.pop_front();
            self.guids.remove(&guid);
        }
        self.cleanup = match self.added.front() {
            Some(&(_, added)) => added + TIME_WAIT_PERIOD,
            None => now + TIME_WAIT_PERIOD,
        };
    }

    fn send_or_queue(&mut self, response: QueuedResponse) {
        // Responses leave in the order they were generated
        if !self.pending.is_empty() || !self.write(&response) {
            self.pending.push_back(response);
        }
    }

    /// Returns `true` once the response needs no further attempts
    fn write(&mut self, response: &QueuedResponse) -> bool {
        if self.write_blocked {
            return false;
        }
        match self.writer.write_packet(
            &response.packet,
            response.self_address,
            response.peer_address,
        ) {
            WriteResult::Ok { .. } => true,
            WriteResult::Blocked => {
                self.write_blocked = true;
                self.writer.is_write_blocked_data_buffered()
            }
            WriteResult::Error(code) => {
                // Nothing depends on the answer reaching the peer
                debug!(code, peer = %response.peer_address, "failed to write time wait response");
                true
            }
        }
    }
}

impl fmt::Debug for TimeWaitListManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeWaitListManager")
            .field("guids", &self.guids.len())
            .field("pending", &self.pending.len())
            .field("write_blocked", &self.write_blocked)
            .finish()
    }
}

#[derive(Debug)]
struct GuidData {
    num_packets: u64,
    version: Version,
    close_packet: Option<Bytes>,
}

#[derive(Debug)]
struct QueuedResponse {
    packet: Bytes,
    self_address: IpAddr,
    peer_address: SocketAddr,
}

/// Captures the header and stops the framer before decryption
#[derive(Default)]
struct HeaderVisitor {
    header: Option<PacketHeader>,
}

impl FramerVisitor for HeaderVisitor {
    fn on_protocol_version_mismatch(&mut self, _: Version) -> bool {
        false
    }

    fn on_unauthenticated_header(&mut self, header: &PacketHeader) -> bool {
        self.header = Some(header.clone());
        false
    }

    fn on_packet_header(&mut self, _: &PacketHeader) -> bool {
        false
    }
}
