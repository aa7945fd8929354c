use bytes::Bytes;

use crate::{frame::RetransmittableFrames, EntropyHash, Guid, Version};

pub(crate) const PUBLIC_FLAGS_VERSION: u8 = 0x01;
pub(crate) const PUBLIC_FLAGS_RST: u8 = 0x02;
const PUBLIC_FLAGS_GUID_MASK: u8 = 0x0c;
const PUBLIC_FLAGS_SEQUENCE_NUMBER_SHIFT: u8 = 4;
pub(crate) const PUBLIC_FLAGS_MAX: u8 = 0x3f;

pub(crate) const PRIVATE_FLAGS_ENTROPY: u8 = 0x01;
pub(crate) const PRIVATE_FLAGS_FEC_GROUP: u8 = 0x02;
pub(crate) const PRIVATE_FLAGS_FEC: u8 = 0x04;
pub(crate) const PRIVATE_FLAGS_MAX: u8 = 0x07;

pub(crate) const PUBLIC_FLAGS_SIZE: usize = 1;
pub(crate) const PRIVATE_FLAGS_SIZE: usize = 1;
pub(crate) const FEC_GROUP_OFFSET_SIZE: usize = 1;
pub(crate) const VERSION_SIZE: usize = 4;
pub(crate) const PUBLIC_RESET_NONCE_SIZE: usize = 8;

/// Number of guid bytes present in a public header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GuidLength {
    /// The guid is implied by the socket 4-tuple
    Zero,
    /// Low byte only
    One,
    /// Low four bytes only
    Four,
    /// Full guid
    Eight,
}

impl GuidLength {
    /// Encoded size in bytes
    pub fn bytes(self) -> usize {
        match self {
            GuidLength::Zero => 0,
            GuidLength::One => 1,
            GuidLength::Four => 4,
            GuidLength::Eight => 8,
        }
    }

    pub(crate) fn flags(self) -> u8 {
        match self {
            GuidLength::Zero => 0x00,
            GuidLength::One => 0x04,
            GuidLength::Four => 0x08,
            GuidLength::Eight => 0x0c,
        }
    }

    pub(crate) fn from_public_flags(flags: u8) -> Self {
        match flags & PUBLIC_FLAGS_GUID_MASK {
            0x00 => GuidLength::Zero,
            0x04 => GuidLength::One,
            0x08 => GuidLength::Four,
            _ => GuidLength::Eight,
        }
    }

    /// Bits of the last full guid kept when a truncated one is read
    pub(crate) fn retained_mask(self) -> u64 {
        match self {
            GuidLength::Zero => u64::MAX,
            GuidLength::One => 0xffff_ffff_ffff_ff00,
            GuidLength::Four => 0xffff_ffff_0000_0000,
            GuidLength::Eight => 0,
        }
    }
}

/// Number of low-order sequence number bytes present in a packet header
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SequenceNumberLength {
    /// One byte
    One,
    /// Two bytes
    Two,
    /// Four bytes
    Four,
    /// Six bytes
    Six,
}

impl SequenceNumberLength {
    /// Encoded size in bytes
    pub fn bytes(self) -> usize {
        match self {
            SequenceNumberLength::One => 1,
            SequenceNumberLength::Two => 2,
            SequenceNumberLength::Four => 4,
            SequenceNumberLength::Six => 6,
        }
    }

    /// The two-bit code used in public flags and ack type bytes
    pub(crate) fn flags(self) -> u8 {
        match self {
            SequenceNumberLength::One => 0,
            SequenceNumberLength::Two => 1,
            SequenceNumberLength::Four => 2,
            SequenceNumberLength::Six => 3,
        }
    }

    pub(crate) fn from_flags(flags: u8) -> Self {
        match flags & 0x03 {
            0 => SequenceNumberLength::One,
            1 => SequenceNumberLength::Two,
            2 => SequenceNumberLength::Four,
            _ => SequenceNumberLength::Six,
        }
    }

    pub(crate) fn public_flags(self) -> u8 {
        self.flags() << PUBLIC_FLAGS_SEQUENCE_NUMBER_SHIFT
    }

    pub(crate) fn from_public_flags(flags: u8) -> Self {
        Self::from_flags(flags >> PUBLIC_FLAGS_SEQUENCE_NUMBER_SHIFT)
    }

    /// Smallest encoding able to represent `x`
    pub fn min_for(x: u64) -> Self {
        if x < 1 << 8 {
            SequenceNumberLength::One
        } else if x < 1 << 16 {
            SequenceNumberLength::Two
        } else if x < 1 << 32 {
            SequenceNumberLength::Four
        } else {
            SequenceNumberLength::Six
        }
    }
}

/// The unencrypted leading part of every packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PublicHeader {
    /// Connection the packet belongs to
    pub guid: Guid,
    /// How many guid bytes appear on the wire
    pub guid_length: GuidLength,
    /// Set on public reset packets
    pub reset_flag: bool,
    /// Set while the client is still announcing its version, and on version negotiation packets
    pub version_flag: bool,
    /// How many sequence number bytes appear on the wire
    pub sequence_number_length: SequenceNumberLength,
    /// Announced version (client to server) or supported versions (version negotiation)
    pub versions: Vec<Version>,
}

impl PublicHeader {
    /// Header for a packet carrying the full guid and a six-byte sequence number
    pub fn new(guid: Guid) -> Self {
        Self {
            guid,
            guid_length: GuidLength::Eight,
            reset_flag: false,
            version_flag: false,
            sequence_number_length: SequenceNumberLength::Six,
            versions: Vec::new(),
        }
    }
}

/// Full header of a data or FEC packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    /// Unencrypted part
    pub public_header: PublicHeader,
    /// Full reconstructed sequence number
    pub packet_sequence_number: u64,
    /// This packet's entropy bit
    pub entropy_flag: bool,
    /// `entropy_flag` shifted into place, see [`packet_entropy_hash`]
    pub entropy_hash: EntropyHash,
    /// Whether the payload is FEC redundancy rather than frames
    pub fec_flag: bool,
    /// First sequence number of the FEC group protecting this packet
    pub fec_group: Option<u64>,
}

impl PacketHeader {
    /// Header for a data packet outside any FEC group
    pub fn new(public_header: PublicHeader, packet_sequence_number: u64) -> Self {
        Self {
            public_header,
            packet_sequence_number,
            entropy_flag: false,
            entropy_hash: 0,
            fec_flag: false,
            fec_group: None,
        }
    }
}

/// Unauthenticated packet telling the receiver its connection state is gone
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PublicResetPacket {
    /// Header; always carries the full guid and the reset flag
    pub public_header: PublicHeader,
    /// Opaque proof supplied by the resetting endpoint
    pub nonce_proof: u64,
    /// Sequence number of the packet that provoked the reset
    pub rejected_sequence_number: u64,
}

/// Redundancy carried by an FEC packet
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FecData {
    /// First sequence number of the protected group
    pub fec_group: u64,
    /// XOR of the protected payloads
    pub redundancy: Bytes,
}

/// A serialized packet that is not encrypted yet
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    header_len: usize,
    is_fec: bool,
}

impl Packet {
    pub(crate) fn new(data: Bytes, header_len: usize, is_fec: bool) -> Self {
        debug_assert!(header_len <= data.len());
        Self {
            data,
            header_len,
            is_fec,
        }
    }

    /// Public flags through sequence number; authenticated but not encrypted
    pub fn associated_data(&self) -> &[u8] {
        &self.data[..self.header_len]
    }

    /// Private flags and everything after them
    pub fn plaintext(&self) -> &[u8] {
        &self.data[self.header_len..]
    }

    /// The whole serialized packet
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Serialized length before encryption
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet carries FEC redundancy
    pub fn is_fec(&self) -> bool {
        self.is_fec
    }
}

/// A freshly built data or FEC packet with the bookkeeping needed to send it
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    /// Sequence number assigned to the packet
    pub sequence_number: u64,
    /// Wire length of the sequence number
    pub sequence_number_length: SequenceNumberLength,
    /// Serialized packet
    pub packet: Packet,
    /// This packet's entropy contribution
    pub entropy_hash: EntropyHash,
    /// Frames to resend if the packet is lost
    pub retransmittable_frames: Option<RetransmittableFrames>,
}

/// Entropy contribution of one packet: its entropy bit rotated by the sequence number
pub fn packet_entropy_hash(sequence_number: u64, entropy_flag: bool) -> EntropyHash {
    u8::from(entropy_flag) << (sequence_number % 8)
}

/// Size of the complete packet header, private flags and FEC group offset included
pub(crate) fn packet_header_size(
    guid_length: GuidLength,
    include_version: bool,
    sequence_number_length: SequenceNumberLength,
    in_fec_group: bool,
) -> usize {
    start_of_encrypted_data(guid_length, include_version, sequence_number_length)
        + PRIVATE_FLAGS_SIZE
        + if in_fec_group { FEC_GROUP_OFFSET_SIZE } else { 0 }
}

/// Offset of the first encrypted byte (the private flags)
pub(crate) fn start_of_encrypted_data(
    guid_length: GuidLength,
    include_version: bool,
    sequence_number_length: SequenceNumberLength,
) -> usize {
    PUBLIC_FLAGS_SIZE
        + guid_length.bytes()
        + if include_version { VERSION_SIZE } else { 0 }
        + sequence_number_length.bytes()
}

/// Offset of the bytes XORed into an FEC group
pub(crate) fn start_of_fec_protected_data(
    guid_length: GuidLength,
    include_version: bool,
    sequence_number_length: SequenceNumberLength,
) -> usize {
    packet_header_size(guid_length, include_version, sequence_number_length, true)
}
