use std::fmt;

macro_rules! errors {
    {$(#[$outer:meta])* $ty:ident; $($name:ident($val:literal) $desc:expr;)*} => {
        $(#[$outer])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum $ty {
            $(#[doc = $desc] $name = $val,)*
        }

        impl $ty {
            /// Interpret a code read off the wire
            pub fn from_u32(x: u32) -> Option<Self> {
                match x {
                    $($val => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Human-readable explanation of the code
            pub fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $desc,)*
                }
            }
        }

        impl From<$ty> for u32 {
            fn from(x: $ty) -> u32 {
                x as u32
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.description())
            }
        }

        impl std::error::Error for $ty {}
    }
}

errors! {
    /// Reasons a connection is closed, carried in CONNECTION_CLOSE and GOAWAY frames
    ErrorCode;
    NoError(0) "no error";
    InternalError(1) "the endpoint encountered an internal error and cannot continue";
    StreamDataAfterTermination(2) "stream data was received after the stream terminated";
    InvalidPacketHeader(3) "the packet header could not be parsed";
    InvalidFrameData(4) "a frame of unknown type was received";
    InvalidFecData(5) "FEC data is malformed";
    InvalidRstStreamData(6) "a RST_STREAM frame is malformed";
    InvalidConnectionCloseData(7) "a CONNECTION_CLOSE frame is malformed";
    InvalidGoAwayData(8) "a GOAWAY frame is malformed";
    InvalidAckData(9) "an ACK frame is malformed or inconsistent with what was sent";
    InvalidCongestionFeedbackData(10) "a congestion feedback frame is malformed";
    InvalidVersionNegotiationPacket(11) "a version negotiation packet is malformed or lists the version we sent";
    InvalidPublicRstPacket(12) "a public reset packet is malformed";
    DecryptionFailure(13) "the packet could not be decrypted";
    EncryptionFailure(14) "the packet could not be encrypted";
    PacketTooLarge(15) "the packet exceeds the maximum packet size";
    PacketForNonexistentStream(16) "data was received for a stream that does not exist";
    PeerGoingAway(17) "the peer is going away";
    InvalidStreamId(18) "a stream id is invalid";
    TooManyOpenStreams(19) "too many streams are open";
    PublicReset(20) "the peer reset the connection with a public reset packet";
    InvalidVersion(21) "no mutually supported version could be agreed";
    StreamRstBeforeHeadersDecompressed(22) "a stream was reset before its headers were decompressed";
    InvalidHeaderId(23) "a header id is invalid";
    InvalidNegotiatedValue(24) "a negotiated value is invalid";
    DecompressionFailure(25) "header decompression failed";
    ConnectionTimedOut(26) "the connection saw no network activity within the idle timeout";
    ErrorMigratingAddress(27) "the peer's address changed in an unsupported way";
    PacketWriteError(28) "the packet writer failed to write a packet";
    HandshakeFailed(29) "the crypto handshake failed";
    CryptoTagsOutOfOrder(30) "handshake message tags are out of order";
    CryptoTooManyEntries(31) "handshake message has too many entries";
    CryptoInvalidValueLength(32) "handshake message value has an invalid length";
    CryptoMessageAfterHandshakeComplete(33) "a handshake message arrived after the handshake completed";
    InvalidCryptoMessageType(34) "handshake message type is invalid";
    InvalidCryptoMessageParameter(35) "handshake message parameter is invalid";
    CryptoMessageParameterNotFound(36) "handshake message parameter is missing";
    CryptoMessageParameterNoOverlap(37) "handshake message parameters have no overlap";
    CryptoMessageIndexNotFound(38) "handshake message index is missing";
    CryptoInternalError(39) "internal crypto error";
    CryptoVersionNotSupported(40) "crypto version is not supported";
    CryptoNoSupport(41) "no crypto support available";
    CryptoTooManyRejects(42) "too many handshake rejections";
    ProofInvalid(43) "the server proof is invalid";
    CryptoDuplicateTag(44) "handshake message contains a duplicate tag";
    CryptoEncryptionLevelIncorrect(45) "handshake message arrived at the wrong encryption level";
    CryptoServerConfigExpired(46) "the server config has expired";
    InvalidStreamData(47) "a STREAM frame is malformed";
    CryptoSymmetricKeySetupFailed(48) "symmetric key setup failed";
    MissingPayload(49) "the packet carried no frames";
}

errors! {
    /// Reasons a single stream is reset, carried in RST_STREAM frames
    RstStreamErrorCode;
    NoError(0) "no error";
    ErrorProcessingStream(1) "there was an error processing the stream";
    MultipleTerminationOffsets(2) "the sender sent data beyond a previously sent fin";
    BadApplicationPayload(3) "the stream payload could not be interpreted";
    StreamConnectionError(4) "the connection the stream belongs to failed";
    StreamPeerGoingAway(5) "the peer is going away";
    StreamCancelled(6) "the stream was cancelled";
}
