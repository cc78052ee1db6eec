//! Packet headers, wire layout, and the total parser (spec.md §4.1).
//!
//! Grounded on `quinn-proto::packet::{Header, Packet, PartialDecode}` — a
//! tagged enum over long/short headers dispatched on the first byte's high
//! bit, simplified to the fixed 19/9-byte layouts this protocol uses (no
//! variable-length connection ids, no varint packet numbers).

use crate::cid::ConnectionId;
use crate::codec::{BufMutExt, Cursor};
use crate::error::{InvalidArgument, PacketParseError};
use crate::frame::{parse_frames, Frame};
use crate::VERSION;

pub const TYPE_INITIAL: u8 = 0xC0;
pub const TYPE_ZERO_RTT: u8 = 0xD0;
pub const TYPE_HANDSHAKE: u8 = 0xE0;
pub const TYPE_RETRY: u8 = 0xF0;
pub const TYPE_DATA: u8 = 0x40;

const LONG_HEADER_BIT: u8 = 0x80;
const CID_LEN: u8 = 4;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LongType {
    Initial,
    Handshake,
    Retry,
}

impl LongType {
    fn first_byte(self) -> u8 {
        match self {
            LongType::Initial => TYPE_INITIAL,
            LongType::Handshake => TYPE_HANDSHAKE,
            LongType::Retry => TYPE_RETRY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long {
        ty: LongType,
        version: u8,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        packet_number: u32,
    },
    Short {
        dst_cid: ConnectionId,
        packet_number: u32,
    },
}

impl Header {
    pub fn is_long(&self) -> bool {
        matches!(self, Header::Long { .. })
    }

    pub fn dst_cid(&self) -> ConnectionId {
        match self {
            Header::Long { dst_cid, .. } => *dst_cid,
            Header::Short { dst_cid, .. } => *dst_cid,
        }
    }

    pub fn packet_number(&self) -> u32 {
        match self {
            Header::Long { packet_number, .. } => *packet_number,
            Header::Short { packet_number, .. } => *packet_number,
        }
    }

    /// Encodes the header. `payload_length` is only meaningful for long
    /// headers and is filled in by `Packet::encode` once the frames are
    /// serialized.
    fn encode(&self, buf: &mut Vec<u8>, payload_length: u16) {
        match self {
            Header::Long {
                ty,
                version,
                dst_cid,
                src_cid,
                packet_number,
            } => {
                buf.put_u8_be(ty.first_byte());
                buf.put_u8_be(*version);
                buf.put_u8_be(CID_LEN);
                buf.put_u32_be(dst_cid.0);
                buf.put_u8_be(CID_LEN);
                buf.put_u32_be(src_cid.0);
                buf.put_u8_be(CID_LEN);
                buf.put_u32_be(*packet_number);
                buf.put_u16_be(payload_length);
            }
            Header::Short {
                dst_cid,
                packet_number,
            } => {
                buf.put_u8_be(TYPE_DATA);
                buf.put_u32_be(dst_cid.0);
                buf.put_u32_be(*packet_number);
            }
        }
    }

    fn parse(cur: &mut Cursor) -> Result<Header, PacketParseError> {
        let first = cur.get_u8()?;
        if first & LONG_HEADER_BIT != 0 {
            let ty = match first {
                TYPE_INITIAL => LongType::Initial,
                TYPE_HANDSHAKE => LongType::Handshake,
                TYPE_RETRY => LongType::Retry,
                TYPE_ZERO_RTT => return Err(PacketParseError::UnknownPacketType(first)),
                other => return Err(PacketParseError::UnknownPacketType(other)),
            };
            let version = cur.get_u8()?;
            if version != VERSION {
                return Err(PacketParseError::UnsupportedVersion(version));
            }
            let dst_cid_len = cur.get_u8()?;
            if dst_cid_len != CID_LEN {
                return Err(PacketParseError::LengthOverrun {
                    declared: dst_cid_len as usize,
                    remaining: cur.remaining(),
                });
            }
            let dst_cid = ConnectionId(cur.get_u32()?);
            let src_cid_len = cur.get_u8()?;
            if src_cid_len != CID_LEN {
                return Err(PacketParseError::LengthOverrun {
                    declared: src_cid_len as usize,
                    remaining: cur.remaining(),
                });
            }
            let src_cid = ConnectionId(cur.get_u32()?);
            let pkt_num_len = cur.get_u8()?;
            if pkt_num_len != CID_LEN {
                return Err(PacketParseError::LengthOverrun {
                    declared: pkt_num_len as usize,
                    remaining: cur.remaining(),
                });
            }
            let packet_number = cur.get_u32()?;
            let payload_length = cur.get_u16()? as usize;
            if payload_length > cur.remaining() {
                return Err(PacketParseError::LengthOverrun {
                    declared: payload_length,
                    remaining: cur.remaining(),
                });
            }
            Ok(Header::Long {
                ty,
                version,
                dst_cid,
                src_cid,
                packet_number,
            })
        } else if first == TYPE_DATA {
            let dst_cid = ConnectionId(cur.get_u32()?);
            let packet_number = cur.get_u32()?;
            Ok(Header::Short {
                dst_cid,
                packet_number,
            })
        } else {
            Err(PacketParseError::UnknownPacketType(first))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn new(header: Header, frames: Vec<Frame>) -> Self {
        Packet { header, frames }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// `packet.raw()` = `header.raw() ++ concat(frame.raw() for each
    /// frame)` (spec.md §4.1 encoder contract).
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for frame in &self.frames {
            frame.encode(&mut payload);
        }
        let mut buf = Vec::with_capacity(
            if self.header.is_long() {
                crate::LONG_HEADER_SIZE
            } else {
                crate::SHORT_HEADER_SIZE
            } + payload.len(),
        );
        self.header.encode(&mut buf, payload.len() as u16);
        buf.extend_from_slice(&payload);
        buf
    }

    /// Total parse: never reads beyond the datagram's bounds. A structural
    /// violation drops the whole datagram (spec.md §4.1/§7).
    pub fn parse(datagram: &[u8]) -> Result<Packet, PacketParseError> {
        let mut cur = Cursor::new(datagram);
        let header = Header::parse(&mut cur)?;
        let frames = parse_frames(&mut cur)?;
        Ok(Packet { header, frames })
    }
}

/// Validates that a connection id fits the 32-bit field (spec.md §4.1
/// field-value constraints).
pub fn check_cid(value: u64) -> Result<ConnectionId, InvalidArgument> {
    ConnectionId::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Ack, ConnectionClose, StreamFrame};
    use crate::StreamId;

    fn long_header() -> Header {
        Header::Long {
            ty: LongType::Initial,
            version: VERSION,
            dst_cid: ConnectionId(1),
            src_cid: ConnectionId(2),
            packet_number: 0,
        }
    }

    fn short_header() -> Header {
        Header::Short {
            dst_cid: ConnectionId(7),
            packet_number: 3,
        }
    }

    #[test]
    fn long_header_round_trip() {
        let pkt = Packet::new(long_header(), vec![]);
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), crate::LONG_HEADER_SIZE);
        assert_eq!(Packet::parse(&bytes).unwrap(), pkt);
    }

    #[test]
    fn short_header_wire_layout_matches_fixture() {
        use hex_literal::hex;
        // type=DATA(0x40) | dst_cid=7 | packet_number=3 — 9 bytes total.
        let expected = hex!("40 00000007 00000003");
        let pkt = Packet::new(short_header(), vec![]);
        assert_eq!(pkt.encode(), expected.to_vec());
    }

    #[test]
    fn short_header_with_stream_frame_round_trip() {
        let frame = Frame::Stream(StreamFrame::new(StreamId(1), 0, b"Hello".to_vec()).unwrap());
        let pkt = Packet::new(short_header(), vec![frame]);
        let bytes = pkt.encode();
        assert_eq!(Packet::parse(&bytes).unwrap(), pkt);
    }

    #[test]
    fn ack_and_close_packets_round_trip() {
        let ack_pkt = Packet::new(
            short_header(),
            vec![Frame::Ack(Ack::from_received_set(&[1, 2, 3], 5).unwrap())],
        );
        assert_eq!(Packet::parse(&ack_pkt.encode()).unwrap(), ack_pkt);

        let close_pkt = Packet::new(
            short_header(),
            vec![Frame::ConnectionClose(
                ConnectionClose::new(1, b"bye".to_vec()).unwrap(),
            )],
        );
        assert_eq!(Packet::parse(&close_pkt.encode()).unwrap(), close_pkt);
    }

    #[test]
    fn truncated_datagram_fails_to_parse() {
        let pkt = Packet::new(long_header(), vec![]);
        let bytes = pkt.encode();
        assert!(Packet::parse(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = Packet::new(long_header(), vec![]).encode();
        bytes[1] = 0xee;
        assert!(matches!(
            Packet::parse(&bytes),
            Err(PacketParseError::UnsupportedVersion(0xee))
        ));
    }

    #[test]
    fn is_ack_eliciting_reflects_frames() {
        let p1 = Packet::new(short_header(), vec![Frame::Padding]);
        assert!(!p1.is_ack_eliciting());
        let p2 = Packet::new(
            short_header(),
            vec![Frame::Stream(
                StreamFrame::new(StreamId(1), 0, vec![1]).unwrap(),
            )],
        );
        assert!(p2.is_ack_eliciting());
    }
}
