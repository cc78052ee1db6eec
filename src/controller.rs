//! Network controller: handshake FSM, packet dispatch, acknowledgement
//! bookkeeping, and retransmission wiring (spec.md §4.5/§4.6).
//!
//! Grounded on `quinn-proto::{Connection::handle_packet,
//! Connection::handle_connected_inner, Endpoint::handle_decode}` — the
//! `match state { State::Handshake(..) => ..., State::Established => ... }`
//! shape, simplified to this protocol's CRYPTO-free INITIAL/HANDSHAKE
//! packets (mere packet type drives the FSM, no TLS transcript).

use std::net::SocketAddr;

use fnv::FnvHashSet;

use crate::cid::ConnectionId;
use crate::congestion::CongestionController;
use crate::error::HandshakeError;
use crate::frame::Frame;
use crate::packet::{Header, LongType, Packet};
use crate::packetizer::{HeaderContext, Packetizer};
use crate::stream::Streams;
use crate::transport::DatagramTransport;
use crate::{Config, Side, StreamId, DEFAULT_STREAM};

/// Handshake phase, per spec.md §4.5's transition table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Initializing,
    ListeningInitial,
    ListeningHandshake,
    Connected,
    Closed,
}

/// All state owned by one end of one connection: handshake FSM, peer
/// identity, per-stream tables, the packet-number counter, and the
/// congestion controller. Exclusively owned by one `QuicSocket` (spec.md §3
/// "Ownership").
pub struct NetworkController {
    side: Side,
    state: ConnectionState,
    local_cid: ConnectionId,
    peer_cid: Option<ConnectionId>,
    peer_addr: Option<SocketAddr>,

    server_initial_received: bool,
    server_handshake_received: bool,
    client_initial_received: bool,
    client_handshake_received: bool,

    largest_acked: Option<u32>,
    received_pns: FnvHashSet<u32>,
    ack_only_pns: FnvHashSet<u32>,
    peer_issued_close: bool,
    buffered_packets: Vec<Packet>,

    pub packetizer: Packetizer,
    pub congestion: CongestionController,
    pub streams: Streams,
    log: slog::Logger,
}

impl NetworkController {
    pub fn new(side: Side, local_cid: ConnectionId, log: slog::Logger) -> Self {
        Self::with_config(side, local_cid, log, &Config::default())
    }

    pub fn with_config(
        side: Side,
        local_cid: ConnectionId,
        log: slog::Logger,
        config: &Config,
    ) -> Self {
        NetworkController {
            side,
            state: ConnectionState::Disconnected,
            local_cid,
            peer_cid: None,
            peer_addr: None,
            server_initial_received: false,
            server_handshake_received: false,
            client_initial_received: false,
            client_handshake_received: false,
            largest_acked: None,
            received_pns: FnvHashSet::default(),
            ack_only_pns: FnvHashSet::default(),
            peer_issued_close: false,
            buffered_packets: Vec::new(),
            packetizer: Packetizer::with_config(log.clone(), config),
            congestion: CongestionController::with_config(log.clone(), config),
            streams: Streams::default(),
            log,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer_issued_close(&self) -> bool {
        self.peer_issued_close
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_cid(&self) -> ConnectionId {
        self.local_cid
    }

    pub fn peer_cid(&self) -> Option<ConnectionId> {
        self.peer_cid
    }

    fn header_ctx(&self) -> HeaderContext {
        HeaderContext {
            dst_cid: self.peer_cid.unwrap_or(ConnectionId(0)),
            src_cid: self.local_cid,
        }
    }

    fn ack_eliciting_send(
        &mut self,
        transport: &dyn DatagramTransport,
        addr: SocketAddr,
        packet: Packet,
        now: u64,
    ) {
        let bytes = packet.encode();
        let pn = packet.header.packet_number();
        let _ = transport.send_to(&bytes, addr);
        self.congestion.send_cc(pn, packet, bytes.len() as u64, now);
    }

    fn non_eliciting_send(
        &mut self,
        transport: &dyn DatagramTransport,
        addr: SocketAddr,
        packet: Packet,
        now: u64,
    ) {
        let bytes = packet.encode();
        let pn = packet.header.packet_number();
        let _ = transport.send_to(&bytes, addr);
        self.congestion.send_non_eliciting(pn, packet, now);
    }

    /// `connect()`: DISCONNECTED -> INITIALIZING, sends the client INITIAL.
    pub fn connect(
        &mut self,
        transport: &dyn DatagramTransport,
        addr: SocketAddr,
        now: u64,
    ) -> Result<(), HandshakeError> {
        if self.state != ConnectionState::Disconnected {
            return Err(HandshakeError::WrongState {
                attempted_action: "connect",
                state: self.state,
            });
        }
        // The kernel 5-tuple is associated later, once the handshake
        // actually settles on a peer address (spec.md §6) -- a server may
        // still rebind to a fresh per-connection port partway through
        // (spec.md §4.5), and an eagerly-connected socket would silently
        // drop that reply.
        self.peer_addr = Some(addr);
        self.state = ConnectionState::Initializing;
        let ctx = self.header_ctx();
        let pkt = self.packetizer.new_initial(ctx);
        debug!(self.log, "sending client INITIAL"; "cid" => self.local_cid.0);
        self.non_eliciting_send(transport, addr, pkt, now);
        Ok(())
    }

    /// `listen()`: DISCONNECTED -> LISTENING_INITIAL.
    pub fn listen(&mut self) -> Result<(), HandshakeError> {
        if self.state != ConnectionState::Disconnected {
            return Err(HandshakeError::WrongState {
                attempted_action: "listen",
                state: self.state,
            });
        }
        self.state = ConnectionState::ListeningInitial;
        Ok(())
    }

    /// `close()`: CONNECTED -> CLOSED, emitting a CONNECTION_CLOSE.
    pub fn close(
        &mut self,
        transport: &dyn DatagramTransport,
        now: u64,
    ) -> Result<(), HandshakeError> {
        if self.state != ConnectionState::Connected {
            return Err(HandshakeError::WrongState {
                attempted_action: "close",
                state: self.state,
            });
        }
        let addr = self.peer_addr.expect("connected implies a peer address");
        let ctx = self.header_ctx();
        let pkt = self
            .packetizer
            .new_connection_close(ctx, 0, b"bye")
            .expect("fixed reason fits in a u8 length");
        warn!(self.log, "sending CONNECTION_CLOSE");
        self.non_eliciting_send(transport, addr, pkt, now);
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Local-only close: no wire traffic, used when acknowledging a peer
    /// close (spec.md §6 `release()`).
    pub fn release(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Non-blocking: checks for one client INITIAL on the listening socket
    /// and, if one is queued, learns the peer's cid/address and advances to
    /// LISTENING_HANDSHAKE -- but does not send the response. Spec.md §4.5:
    /// the per-connection socket must exist before the INITIAL+HANDSHAKE
    /// reply goes out, so the caller binds one between this call and
    /// `send_connection_response`. Returns the learned peer address once
    /// this happens.
    pub fn await_client_initial(&mut self, transport: &dyn DatagramTransport) -> Option<SocketAddr> {
        if self.state != ConnectionState::ListeningInitial {
            return None;
        }
        let mut buf = [0u8; 2048];
        let (n, from) = match transport.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(_) => return None,
        };
        let pkt = match Packet::parse(&buf[..n]) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(self.log, "dropping malformed datagram"; "error" => %e);
                return None;
            }
        };
        let Header::Long { ty: LongType::Initial, src_cid, .. } = pkt.header else {
            trace!(self.log, "dropping non-INITIAL datagram while awaiting client INITIAL");
            return None;
        };
        self.peer_cid = Some(src_cid);
        self.peer_addr = Some(from);
        self.client_initial_received = true;
        self.state = ConnectionState::ListeningHandshake;
        debug!(self.log, "server learned peer cid"; "peer_cid" => src_cid.0, "peer_addr" => %from);
        Some(from)
    }

    /// Sends the server's [INITIAL, HANDSHAKE] response pair to the address
    /// learned by `await_client_initial` (spec.md §4.2).
    pub fn send_connection_response(&mut self, transport: &dyn DatagramTransport, now: u64) {
        let addr = self
            .peer_addr
            .expect("await_client_initial must learn a peer address first");
        let ctx = self.header_ctx();
        for response in self.packetizer.new_connection_response(ctx) {
            self.non_eliciting_send(transport, addr, response, now);
        }
    }

    /// Drains every datagram currently queued on `transport` and processes
    /// it; stops on the first `WouldBlock` (spec.md §4.6).
    pub fn drain(&mut self, transport: &dyn DatagramTransport, now: u64) {
        let mut buf = [0u8; 2048];
        loop {
            match transport.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.learn_peer_addr(from);
                    match Packet::parse(&buf[..n]) {
                        Ok(pkt) => self.ingest(pkt, transport, from, now),
                        Err(e) => {
                            debug!(self.log, "dropping malformed datagram"; "error" => %e);
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        self.process_buffered(now);
        self.detect_losses(transport, now);
        self.maybe_ack(transport, now);
    }

    /// Adopts `from` as the peer address. A client keeps adopting the
    /// freshest sender address until CONNECTED, since the server may
    /// rebind to a new per-connection port partway through the handshake
    /// (spec.md §4.5); a server learns the client's address once and keeps
    /// it (no migration support).
    fn learn_peer_addr(&mut self, from: SocketAddr) {
        match self.side {
            Side::Client if self.state != ConnectionState::Connected => {
                self.peer_addr = Some(from);
            }
            _ => {
                self.peer_addr.get_or_insert(from);
            }
        }
    }

    /// Classifies one packet by header type, per the long-before-short
    /// ordering invariant (spec.md §4.6): a long-header packet always
    /// drives the FSM immediately; a short-header packet is buffered while
    /// not CONNECTED.
    fn ingest(&mut self, pkt: Packet, transport: &dyn DatagramTransport, from: SocketAddr, now: u64) {
        if pkt.header.is_long() {
            self.handle_long_header(pkt, transport, from, now);
        } else if self.state == ConnectionState::Connected {
            self.handle_short_header(pkt, now);
        } else {
            trace!(self.log, "buffering short-header packet before handshake completes");
            self.buffered_packets.push(pkt);
        }
    }

    fn process_buffered(&mut self, now: u64) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let pending = std::mem::take(&mut self.buffered_packets);
        for pkt in pending {
            self.handle_short_header(pkt, now);
        }
    }

    fn handle_long_header(
        &mut self,
        pkt: Packet,
        transport: &dyn DatagramTransport,
        from: SocketAddr,
        now: u64,
    ) {
        let (ty, src_cid, packet_number) = match &pkt.header {
            Header::Long {
                ty,
                src_cid,
                packet_number,
                ..
            } => (*ty, *src_cid, *packet_number),
            Header::Short { .. } => unreachable!("caller only passes long headers"),
        };
        self.peer_cid.get_or_insert(src_cid);
        if pkt.is_ack_eliciting() {
            self.received_pns.insert(packet_number);
        }

        match (self.side, self.state, ty) {
            (Side::Client, ConnectionState::Initializing, LongType::Initial) => {
                self.server_initial_received = true;
                // A HANDSHAKE that arrived before this INITIAL was buffered
                // (spec.md §4.5 "buffer, stay"); now that the phase
                // condition holds, replay it to finish the transition.
                if let Some(pos) = self.buffered_packets.iter().position(|p| {
                    matches!(p.header, Header::Long { ty: LongType::Handshake, .. })
                }) {
                    let buffered = self.buffered_packets.remove(pos);
                    self.handle_long_header(buffered, transport, from, now);
                }
            }
            (Side::Client, ConnectionState::Initializing, LongType::Handshake) => {
                if self.server_initial_received {
                    self.client_handshake_received = true;
                    self.state = ConnectionState::Connected;
                    debug!(self.log, "client handshake complete"; "peer_addr" => %from);
                    // Associate the kernel 5-tuple now that the peer address
                    // has settled (spec.md §6).
                    let _ = transport.connect(from);
                    let ctx = self.header_ctx();
                    let response = self.packetizer.new_handshake(ctx);
                    self.non_eliciting_send(transport, from, response, now);
                } else {
                    trace!(self.log, "buffering out-of-phase client HANDSHAKE");
                    self.buffered_packets.push(pkt);
                }
            }
            (Side::Server, ConnectionState::ListeningInitial, LongType::Initial) => {
                self.client_initial_received = true;
                self.state = ConnectionState::ListeningHandshake;
                debug!(self.log, "server learned peer cid"; "peer_cid" => src_cid.0);
                let ctx = self.header_ctx();
                for response in self.packetizer.new_connection_response(ctx) {
                    self.non_eliciting_send(transport, from, response, now);
                }
            }
            (Side::Server, ConnectionState::ListeningHandshake, LongType::Handshake) => {
                self.client_handshake_received = true;
                self.state = ConnectionState::Connected;
                debug!(self.log, "server handshake complete");
            }
            _ => {
                trace!(self.log, "long-header packet outside expected phase"; "ty" => ?ty, "state" => ?self.state);
            }
        }
    }

    /// The four handshake-progress booleans from spec.md §3's data model,
    /// surfaced for diagnostics (`QuicSocket`'s `Display` impl).
    pub fn handshake_progress(&self) -> (bool, bool, bool, bool) {
        (
            self.server_initial_received,
            self.server_handshake_received,
            self.client_initial_received,
            self.client_handshake_received,
        )
    }

    fn handle_short_header(&mut self, pkt: Packet, now: u64) {
        let packet_number = pkt.header.packet_number();
        let ack_only = pkt.frames.len() == 1 && matches!(pkt.frames[0], Frame::Ack(_));
        if pkt.is_ack_eliciting() {
            self.received_pns.insert(packet_number);
        } else if ack_only {
            self.ack_only_pns.insert(packet_number);
        }

        for frame in pkt.frames {
            match frame {
                Frame::Stream(f) => {
                    if !self.streams.has_recv(f.stream_id) && f.stream_id != DEFAULT_STREAM {
                        trace!(self.log, "auto-creating receive stream"; "stream" => f.stream_id.0);
                    }
                    self.streams.recv_mut(f.stream_id).on_frame(f);
                }
                Frame::Ack(ack) => self.handle_ack(ack, now),
                Frame::ConnectionClose(_) => {
                    warn!(self.log, "peer issued CONNECTION_CLOSE");
                    self.peer_issued_close = true;
                }
                Frame::Crypto(_) | Frame::Padding => {}
            }
        }
    }

    fn handle_ack(&mut self, ack: crate::frame::Ack, now: u64) {
        let decoded = ack.decode_ranges();
        self.largest_acked = Some(
            self.largest_acked
                .map(|prev| prev.max(ack.largest_acked))
                .unwrap_or(ack.largest_acked),
        );

        let popped = self.congestion.on_ack(&decoded, now);
        for (_, record) in popped {
            // If the packet we just had acknowledged was itself only an ACK,
            // the peer has now seen it: the peer-numbered pns it named can
            // stop being re-announced (§9 Open Question 4). `popped`'s keys
            // are our own sent-packet numbers, not the peer's, so the set to
            // purge has to come from decoding that ACK's own ranges.
            if let [Frame::Ack(acked_ack)] = record.packet_ref.frames.as_slice() {
                for peer_pn in acked_ack.decode_ranges() {
                    self.ack_only_pns.remove(&peer_pn);
                    self.received_pns.remove(&peer_pn);
                }
            }
        }
    }

    /// Runs loss detection against the current `largest_acked` and
    /// retransmits anything declared lost.
    pub fn detect_losses(&mut self, transport: &dyn DatagramTransport, now: u64) {
        let Some(largest_acked) = self.largest_acked else {
            return;
        };
        let addr = match self.peer_addr {
            Some(a) => a,
            None => return,
        };
        let lost = self.congestion.detect_and_handle_loss(largest_acked, now);
        if lost.is_empty() {
            return;
        }
        debug!(self.log, "retransmitting lost packets"; "count" => lost.len());
        let retransmitted = self.packetizer.retransmit(&lost);
        for pkt in retransmitted {
            self.ack_eliciting_send(transport, addr, pkt, now);
        }
    }

    /// Emits an ACK for the current received-pn set if there is anything to
    /// acknowledge (spec.md §4.6 "Acknowledgement emission").
    fn maybe_ack(&mut self, transport: &dyn DatagramTransport, now: u64) {
        let Some(addr) = self.peer_addr else {
            return;
        };
        if self.state != ConnectionState::Connected {
            return;
        }
        let received: Vec<u32> = self.received_pns.iter().copied().collect();
        let dst_cid = self.peer_cid.unwrap_or(ConnectionId(0));
        if let Some(pkt) = self.packetizer.new_ack(dst_cid, &received, 0) {
            self.non_eliciting_send(transport, addr, pkt, now);
        }
    }

    /// Segments `data` and submits it through the congestion controller,
    /// spin-draining incoming datagrams between cwnd-denied submissions
    /// (spec.md §4.6 `send_stream_data`).
    pub fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        transport: &dyn DatagramTransport,
        now: u64,
    ) -> bool {
        self.drain(transport, now);
        if self.peer_issued_close {
            return false;
        }
        let Some(addr) = self.peer_addr else {
            return false;
        };
        let dst_cid = self.peer_cid.unwrap_or(ConnectionId(0));
        let mut queue = self
            .packetizer
            .new_stream_data(stream_id, data, dst_cid, &mut self.streams);
        while !queue.is_empty() {
            let mut i = 0;
            while i < queue.len() {
                if self.congestion.can_send() {
                    let pkt = queue.remove(i);
                    self.ack_eliciting_send(transport, addr, pkt, now);
                } else {
                    i += 1;
                }
            }
            if queue.is_empty() {
                break;
            }
            // cwnd is exhausted; drain incoming acks to free room (spec.md
            // §4.6: "between attempts, drain incoming datagrams again").
            // `drain` itself runs loss detection against any new ACKs.
            self.drain(transport, now);
        }
        true
    }

    /// Drains, then returns up to `n` contiguous bytes plus the peer-closed
    /// flag (spec.md §4.6 `read_stream_data`).
    pub fn read_stream_data(
        &mut self,
        stream_id: StreamId,
        n: usize,
        transport: &dyn DatagramTransport,
        now: u64,
    ) -> (Vec<u8>, bool) {
        self.drain(transport, now);
        let data = self.streams.recv_mut(stream_id).read(n);
        (data, self.peer_issued_close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::ChannelTransport;

    fn log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            SocketAddr::from(([127, 0, 0, 1], 9200)),
            SocketAddr::from(([127, 0, 0, 1], 9201)),
        )
    }

    fn connected_pair() -> (NetworkController, NetworkController, ChannelTransport, ChannelTransport, SocketAddr) {
        let (client_addr, server_addr) = addrs();
        let (client_transport, server_transport) = ChannelTransport::pair(client_addr, server_addr);
        let mut client = NetworkController::new(Side::Client, ConnectionId(1), log());
        let mut server = NetworkController::new(Side::Server, ConnectionId(2), log());
        server.listen().unwrap();
        client.connect(&client_transport, server_addr, 0).unwrap();
        server.drain(&server_transport, 0);
        client.drain(&client_transport, 0);
        server.drain(&server_transport, 0);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(server.state(), ConnectionState::Connected);
        (client, server, client_transport, server_transport, server_addr)
    }

    /// A `with_config` controller uses the caller-supplied congestion
    /// constants instead of the spec's defaults (§2 "Configuration").
    #[test]
    fn custom_config_changes_initial_cwnd() {
        let config = Config {
            initial_window: 4096,
            ..Config::default()
        };
        let nc = NetworkController::with_config(Side::Client, ConnectionId(1), log(), &config);
        assert_eq!(nc.congestion.congestion_window, 4096);
    }

    /// Loss detection runs as part of every `drain`, not only inside
    /// `send_stream_data`'s retry loop: an ACK that arrives while the
    /// application is only reading must still trigger retransmission.
    #[test]
    fn drain_alone_detects_and_retransmits_loss() {
        let (mut client, _server, client_transport, server_transport, server_addr) =
            connected_pair();

        // Client transmits several stream-data packets.
        for _ in 0..6 {
            client.send_stream_data(StreamId(1), b"x", &client_transport, 1);
        }
        // The sent-packet map also holds non-ack-eliciting records (the
        // handshake INITIAL/HANDSHAKE and any ACKs sent in response to the
        // server); loss detection only ever applies to the ack-eliciting,
        // in-flight stream-data packets, so filter down to those.
        let sent_pns: Vec<u32> = client
            .congestion
            .sent_packets
            .iter()
            .filter(|(_, info)| info.ack_eliciting && info.in_flight)
            .map(|(&pn, _)| pn)
            .collect();
        assert_eq!(sent_pns.len(), 6);

        // Simulate the server acking everything except the first stream-data
        // packet sent, with enough of a gap to cross the reordering
        // threshold, then deliver that ACK straight to the client's
        // transport.
        let lowest = *sent_pns.iter().min().unwrap();
        let acked: Vec<u32> = sent_pns.iter().copied().filter(|&pn| pn != lowest).collect();
        let ack = crate::frame::Ack::from_received_set(&acked, 0).unwrap();
        let pkt = Packet::new(
            Header::Short {
                dst_cid: client.local_cid(),
                packet_number: 999,
            },
            vec![Frame::Ack(ack)],
        );
        server_transport.send_to(&pkt.encode(), server_addr).ok();

        // Reading (not sending) must still observe the loss and retransmit.
        let (_, _) = client.read_stream_data(StreamId(1), 0, &client_transport, 2);
        assert!(!client.congestion.sent_packets.contains_key(&lowest));
    }
}
