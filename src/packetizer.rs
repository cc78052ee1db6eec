//! Assembles typed packets from intent and assigns packet numbers
//! (spec.md §4.2).
//!
//! Grounded on `quinn-proto::Connection::{get_tx_number, transmit,
//! transmit_handshake, next_packet}` — a monotone counter plus per-call
//! packet construction, simplified to this protocol's fixed frame set.

use crate::cid::ConnectionId;
use crate::congestion::SentPacket;
use crate::error::InvalidArgument;
use crate::frame::{Ack, ConnectionClose, Frame, StreamFrame};
use crate::packet::{Header, LongType, Packet};
use crate::stream::Streams;
use crate::{Config, StreamId, VERSION};

/// Connection identifiers needed to stamp a header; cheap to copy per
/// packet since both are plain 32-bit integers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderContext {
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
}

pub struct Packetizer {
    next_pn: u32,
    max_payload: usize,
    log: slog::Logger,
}

impl Packetizer {
    pub fn new(log: slog::Logger) -> Self {
        Self::with_config(log, &Config::default())
    }

    pub fn with_config(log: slog::Logger, config: &Config) -> Self {
        Packetizer {
            next_pn: 0,
            max_payload: config.max_payload,
            log,
        }
    }

    fn alloc_pn(&mut self) -> u32 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn new_initial(&mut self, ctx: HeaderContext) -> Packet {
        let pn = self.alloc_pn();
        trace!(self.log, "building INITIAL"; "pn" => pn);
        Packet::new(
            Header::Long {
                ty: LongType::Initial,
                version: VERSION,
                dst_cid: ctx.dst_cid,
                src_cid: ctx.src_cid,
                packet_number: pn,
            },
            vec![],
        )
    }

    pub fn new_handshake(&mut self, ctx: HeaderContext) -> Packet {
        let pn = self.alloc_pn();
        trace!(self.log, "building HANDSHAKE"; "pn" => pn);
        Packet::new(
            Header::Long {
                ty: LongType::Handshake,
                version: VERSION,
                dst_cid: ctx.dst_cid,
                src_cid: ctx.src_cid,
                packet_number: pn,
            },
            vec![],
        )
    }

    /// The server's response to a client INITIAL: an [INITIAL, HANDSHAKE]
    /// pair (spec.md §4.2).
    pub fn new_connection_response(&mut self, ctx: HeaderContext) -> [Packet; 2] {
        [self.new_initial(ctx), self.new_handshake(ctx)]
    }

    pub fn new_connection_close(
        &mut self,
        ctx: HeaderContext,
        error_code: u8,
        reason: &[u8],
    ) -> Result<Packet, InvalidArgument> {
        let pn = self.alloc_pn();
        let close = ConnectionClose::new(error_code, reason.to_vec())?;
        debug!(self.log, "building CONNECTION_CLOSE"; "pn" => pn);
        Ok(Packet::new(
            Header::Short {
                dst_cid: ctx.dst_cid,
                packet_number: pn,
            },
            vec![Frame::ConnectionClose(close)],
        ))
    }

    /// Segments `data` into chunks of at most `MAX_PAYLOAD`, each becoming
    /// its own short-header packet carrying one STREAM frame at the
    /// stream's current send offset. Chunk order preserves byte order.
    pub fn new_stream_data(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        dst_cid: ConnectionId,
        streams: &mut Streams,
    ) -> Vec<Packet> {
        if data.is_empty() {
            return Vec::new();
        }
        let mut packets = Vec::new();
        for chunk in data.chunks(self.max_payload) {
            let pn = self.alloc_pn();
            let offset = streams.send_mut(stream_id).advance(chunk.len());
            let frame = StreamFrame::new(stream_id, offset, chunk.to_vec())
                .expect("chunk length bounded by MAX_PAYLOAD <= u16::MAX");
            trace!(self.log, "building stream-data packet"; "pn" => pn, "stream" => stream_id.0, "offset" => offset, "len" => chunk.len());
            packets.push(Packet::new(
                Header::Short {
                    dst_cid,
                    packet_number: pn,
                },
                vec![Frame::Stream(frame)],
            ));
        }
        packets
    }

    /// Encodes `received` as a range-compressed ACK frame packet. Returns
    /// `None` when there is nothing to acknowledge yet.
    pub fn new_ack(
        &mut self,
        dst_cid: ConnectionId,
        received: &[u32],
        ack_delay: u32,
    ) -> Option<Packet> {
        let ack = Ack::from_received_set(received, ack_delay)?;
        let pn = self.alloc_pn();
        trace!(self.log, "building ACK"; "pn" => pn, "largest_acked" => ack.largest_acked);
        Some(Packet::new(
            Header::Short {
                dst_cid,
                packet_number: pn,
            },
            vec![Frame::Ack(ack)],
        ))
    }

    /// Reuses the frames of each lost record under a fresh, larger packet
    /// number. Preserves the header's connection id and type.
    pub fn retransmit(&mut self, lost: &[(u32, SentPacket)]) -> Vec<Packet> {
        lost.iter()
            .map(|(old_pn, record)| {
                let new_pn = self.alloc_pn();
                debug!(self.log, "retransmitting"; "old_pn" => old_pn, "new_pn" => new_pn);
                let header = match &record.packet_ref.header {
                    Header::Short { dst_cid, .. } => Header::Short {
                        dst_cid: *dst_cid,
                        packet_number: new_pn,
                    },
                    Header::Long {
                        ty,
                        version,
                        dst_cid,
                        src_cid,
                        ..
                    } => Header::Long {
                        ty: *ty,
                        version: *version,
                        dst_cid: *dst_cid,
                        src_cid: *src_cid,
                        packet_number: new_pn,
                    },
                };
                Packet::new(header, record.packet_ref.frames.clone())
            })
            .collect()
    }
}
