//! A simplified, QUIC-like reliable transport layered over a connectionless
//! datagram socket.
//!
//! The crate is sans-io at its core (`controller`, `packetizer`,
//! `congestion`, `stream`, `packet`, `frame`, `codec` never touch a real
//! socket) with a blocking façade (`socket`) on top that drives the state
//! machine over a `DatagramTransport`.

#[macro_use]
extern crate slog;

pub mod cid;
pub mod codec;
pub mod congestion;
pub mod controller;
pub mod error;
pub mod frame;
pub mod packet;
pub mod packetizer;
pub mod socket;
pub mod stream;
pub mod transport;

pub use cid::ConnectionId;
pub use error::{HandshakeError, InvalidArgument, PacketParseError};
pub use socket::QuicSocket;

/// Private, self-compatible protocol version. Not IETF QUIC.
pub const VERSION: u8 = 0x01;

/// Maximum size of a datagram we consider safe to send without
/// path-MTU discovery.
pub const SAFE_DATAGRAM_PAYLOAD: usize = 512;

/// Byte length of a long header (§4.1).
pub const LONG_HEADER_SIZE: usize = 19;

/// Byte length of a short header (§4.1).
pub const SHORT_HEADER_SIZE: usize = 9;

/// Fixed byte overhead of a STREAM frame, excluding its data.
pub const STREAM_FRAME_SIZE: usize = 12;

/// Largest chunk of application bytes that fits in one stream-data packet.
pub const MAX_PAYLOAD: usize = SAFE_DATAGRAM_PAYLOAD - LONG_HEADER_SIZE - STREAM_FRAME_SIZE;

/// Reordering threshold for loss detection (RFC 9002 default).
pub const REORDERING_THRESHOLD: u32 = 3;

/// Which end of the connection we are.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// Identifier of an application stream. Fixed at 8 bits per spec.md §4.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u8);

impl StreamId {
    pub fn new(id: u8) -> Result<Self, error::InvalidArgument> {
        Ok(StreamId(id))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The automatically-created stream used by `QUICNetworkController` when a
/// STREAM frame for an unknown stream arrives (§9 Open Question 3).
pub const DEFAULT_STREAM: StreamId = StreamId(1);

/// Tunable protocol constants, mirroring `quinn-proto::endpoint::Config`:
/// the spec's literal values live here as `Default` rather than scattered
/// as magic numbers, so a caller can override them the way quinn-proto
/// callers override `reordering_threshold`/`initial_window`/etc.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Bytes assumed per datagram for congestion-window arithmetic.
    pub default_mss: u64,
    /// Initial congestion window, in bytes.
    pub initial_window: u64,
    /// Floor the congestion window is never reduced below.
    pub minimum_window: u64,
    /// Packet-number gap that declares an in-flight packet lost.
    pub reordering_threshold: u32,
    /// Largest chunk of application bytes per stream-data packet.
    pub max_payload: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_mss: congestion::MAX_DATAGRAM,
            initial_window: congestion::INITIAL_CWND,
            minimum_window: congestion::MIN_CWND,
            reordering_threshold: REORDERING_THRESHOLD,
            max_payload: MAX_PAYLOAD,
        }
    }
}
