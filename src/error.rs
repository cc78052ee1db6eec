//! Error types and the policy of §7: parse errors are recovered locally,
//! invalid arguments are surfaced to the caller, handshake errors are fatal
//! to the process in this core (a production variant would return a
//! `Result` instead of panicking — see spec.md §7).

use failure::Fail;

/// A datagram failed to parse as a well-formed packet. The caller must
/// drop the datagram and continue; this is never propagated to the
/// application.
#[derive(Debug, Fail)]
pub enum PacketParseError {
    #[fail(display = "datagram truncated: needed {} bytes, had {}", needed, had)]
    Truncated { needed: usize, had: usize },
    #[fail(display = "unknown frame type byte 0x{:02x}", _0)]
    UnknownFrameType(u8),
    #[fail(display = "unknown long-header packet type byte 0x{:02x}", _0)]
    UnknownPacketType(u8),
    #[fail(display = "declared length {} exceeds {} remaining bytes", declared, remaining)]
    LengthOverrun { declared: usize, remaining: usize },
    #[fail(display = "unsupported protocol version 0x{:02x}", _0)]
    UnsupportedVersion(u8),
}

/// A field value supplied at packet/frame construction time was out of the
/// range the wire format can represent.
#[derive(Debug, Fail)]
pub enum InvalidArgument {
    #[fail(display = "stream id {} exceeds 255", _0)]
    StreamIdOutOfRange(u64),
    #[fail(display = "offset {} exceeds 2^64-1", _0)]
    OffsetOutOfRange(u128),
    #[fail(display = "length {} exceeds 2^16-1", _0)]
    LengthOutOfRange(usize),
    #[fail(display = "connection id {} exceeds 2^32-1", _0)]
    ConnectionIdOutOfRange(u64),
    #[fail(display = "packet number {} exceeds 2^32-1", _0)]
    PacketNumberOutOfRange(u64),
    #[fail(display = "reason string of {} bytes exceeds 255", _0)]
    ReasonTooLong(usize),
}

/// The handshake FSM was driven out of sequence (e.g. `connect()` on a
/// socket that is not `DISCONNECTED`). Fatal to the process in this core;
/// see spec.md §7.
#[derive(Debug, Fail)]
pub enum HandshakeError {
    #[fail(
        display = "cannot {} from connection state {:?}",
        attempted_action, state
    )]
    WrongState {
        attempted_action: &'static str,
        state: crate::controller::ConnectionState,
    },
}
