//! `QuicSocket`: the only surface applications see (spec.md §4.7/§6).
//!
//! Grounded on `examples/original_source/QUIC/QUICSocket.py` — `connect`,
//! `listen`, `accept` swapping controller state into a fresh socket and
//! resetting the listener to LISTENING_INITIAL, the `close`/`release`
//! distinction, and the `__repr__` diagnostic.

use std::net::SocketAddr;

use rand::thread_rng;

use crate::cid::ConnectionId;
use crate::controller::{ConnectionState, NetworkController};
use crate::error::HandshakeError;
use crate::transport::{bind_udp, DatagramTransport};
use crate::{Config, Side, StreamId};

/// A connected or listening endpoint. Exclusively owns one
/// `NetworkController` and one datagram transport (spec.md §3 "Ownership").
pub struct QuicSocket<T: DatagramTransport> {
    controller: NetworkController,
    transport: T,
    log: slog::Logger,
    config: Config,
}

impl<T: DatagramTransport> QuicSocket<T> {
    /// Wraps an already-bound transport under a fresh controller with a
    /// randomly minted local connection id, using the default `Config`.
    pub fn new(side: Side, transport: T, log: slog::Logger) -> Self {
        Self::with_config(side, transport, log, Config::default())
    }

    /// As `new`, but with caller-supplied tunable constants (cwnd sizing,
    /// reordering threshold, max payload) in place of the spec's defaults.
    pub fn with_config(side: Side, transport: T, log: slog::Logger, config: Config) -> Self {
        let local_cid = ConnectionId::random(&mut thread_rng());
        QuicSocket {
            controller: NetworkController::with_config(side, local_cid, log.clone(), &config),
            transport,
            log,
            config,
        }
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Synchronous handshake: sends the client INITIAL, then spin-drains
    /// until CONNECTED (spec.md §5 "accept and connect spin-drain").
    pub fn connect(&mut self, addr: SocketAddr, now: u64) -> Result<(), HandshakeError> {
        self.controller.connect(&self.transport, addr, now)?;
        while self.controller.state() != ConnectionState::Connected {
            self.controller.drain(&self.transport, now);
        }
        Ok(())
    }

    /// Enters LISTENING_INITIAL. Does not block.
    pub fn listen(&mut self) -> Result<(), HandshakeError> {
        self.controller.listen()
    }

    pub fn send(&mut self, stream_id: StreamId, data: &[u8], now: u64) -> bool {
        self.controller
            .send_stream_data(stream_id, data, &self.transport, now)
    }

    pub fn recv(&mut self, stream_id: StreamId, n: usize, now: u64) -> (Vec<u8>, bool) {
        self.controller
            .read_stream_data(stream_id, n, &self.transport, now)
    }

    /// Sends CONNECTION_CLOSE and transitions to CLOSED (spec.md §6).
    pub fn close(&mut self, now: u64) -> Result<(), HandshakeError> {
        self.controller.close(&self.transport, now)
    }

    /// Local-only close, used to acknowledge a peer-initiated close.
    pub fn release(&mut self) {
        self.controller.release();
    }
}

impl<T: DatagramTransport> std::fmt::Display for QuicSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "QuicSocket {{ state: {:?}, local_cid: {}, peer_cid: {:?}, peer_addr: {:?} }}",
            self.controller.state(),
            self.controller.local_cid(),
            self.controller.peer_cid(),
            self.controller.peer_addr(),
        )
    }
}

impl QuicSocket<std::net::UdpSocket> {
    /// Binds a wildcard UDP socket and enters LISTENING_INITIAL (spec.md §6
    /// `listen(port)`).
    pub fn listen_udp(port: u16, log: slog::Logger) -> std::io::Result<Self> {
        let transport = bind_udp(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let mut socket = QuicSocket::new(Side::Server, transport, log);
        socket
            .listen()
            .expect("freshly constructed socket is DISCONNECTED");
        Ok(socket)
    }

    /// Accepts one connection: waits for the client's INITIAL on the
    /// listening socket, binds a fresh per-connection port and uses it to
    /// finish the handshake (spec.md §4.5 "the server binds a per-connection
    /// datagram socket on first INITIAL"), then moves the finished state
    /// into a fresh socket and resets `self` to LISTENING_INITIAL with a
    /// fresh controller (spec.md §4.7).
    pub fn accept(&mut self, now: u64) -> std::io::Result<Self> {
        while self.controller.await_client_initial(&self.transport).is_none() {}

        let peer_addr = self
            .controller
            .peer_addr()
            .expect("await_client_initial learned a peer address");
        let per_connection_transport = bind_udp(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        per_connection_transport.connect(peer_addr)?;

        // The reply and the rest of the handshake go out over the new
        // socket; the client adopts this address as soon as it sees the
        // reply (`NetworkController::drain`'s peer-address learning), so the
        // listening socket is free again the moment this call returns.
        self.controller.send_connection_response(&per_connection_transport, now);
        while self.controller.state() != ConnectionState::Connected {
            self.controller.drain(&per_connection_transport, now);
        }

        let connected = NetworkController::with_config(
            Side::Server,
            self.controller.local_cid(),
            self.log.clone(),
            &self.config,
        );
        let finished = std::mem::replace(&mut self.controller, connected);
        self.controller
            .listen()
            .expect("fresh controller is DISCONNECTED");

        Ok(QuicSocket {
            controller: finished,
            transport: per_connection_transport,
            log: self.log.clone(),
            config: self.config,
        })
    }
}
