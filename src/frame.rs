//! Frame wire format and the ACK-range algorithm (spec.md §4.1/§4.2).
//!
//! Grounded on `quinn-proto::frame::{Iter, Ack, Stream}` — a tagged sum
//! type parsed by a single dispatch loop rather than a class hierarchy
//! (§9 Design Notes).

use crate::codec::{BufMutExt, Cursor};
use crate::error::{InvalidArgument, PacketParseError};
use crate::StreamId;

pub const TYPE_CRYPTO: u8 = 0x06;
pub const TYPE_ACK: u8 = 0x02;
pub const TYPE_STREAM: u8 = 0x08;
pub const TYPE_PADDING: u8 = 0x00;
pub const TYPE_CONNECTION_CLOSE: u8 = 0x1c;

/// One ACK range: a contiguous run of acknowledged packet numbers,
/// expressed relative to the end of the previous (higher) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub gap: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub largest_acked: u32,
    pub ack_delay: u32,
    pub first_range: u32,
    pub ranges: Vec<AckRange>,
}

impl Ack {
    /// Builds an ACK frame from a set of received packet numbers, per the
    /// encoding algorithm in spec.md §4.2. Returns `None` for an empty set.
    pub fn from_received_set(received: &[u32], ack_delay: u32) -> Option<Ack> {
        if received.is_empty() {
            return None;
        }
        let mut sorted = received.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        // Walk left to right building maximal runs of consecutive integers.
        let mut runs: Vec<(u32, u32)> = Vec::new(); // (first, last) inclusive
        let mut run_start = sorted[0];
        let mut prev = sorted[0];
        for &pn in &sorted[1..] {
            if pn == prev + 1 {
                prev = pn;
            } else {
                runs.push((run_start, prev));
                run_start = pn;
                prev = pn;
            }
        }
        runs.push((run_start, prev));

        // The rightmost (largest) run becomes largest_acked/first_range and
        // is removed from the ranges list.
        let (last_first, last_last) = runs.pop().unwrap();
        let largest_acked = last_last;
        let first_range = last_last - last_first;

        // Remaining ranges are emitted in descending order of packet
        // numbers: gap is relative to the end of the previous (higher) run,
        // length is the run's packet count (unlike `first_range`, which is
        // count-1 — see spec.md §8 scenario S4).
        let mut ranges = Vec::new();
        let mut prev_run_first = last_first;
        for &(first, last) in runs.iter().rev() {
            let gap = prev_run_first - last - 1;
            let length = last - first + 1;
            ranges.push(AckRange { gap, length });
            prev_run_first = first;
        }

        Some(Ack {
            largest_acked,
            ack_delay,
            first_range,
            ranges,
        })
    }

    /// Decodes the set of acknowledged packet numbers, per spec.md §4.2.
    pub fn decode_ranges(&self) -> Vec<u32> {
        let mut acked = Vec::new();
        let lo = self.largest_acked.saturating_sub(self.first_range);
        for pn in lo..=self.largest_acked {
            acked.push(pn);
        }
        let mut pn_end = lo; // lowest pn of the previous (higher) run
        for range in &self.ranges {
            // Top of this run, relative to the bottom of the previous run.
            let top = pn_end - 1 - range.gap;
            let bottom = top + 1 - range.length;
            for pn in bottom..=top {
                acked.push(pn);
            }
            pn_end = bottom;
        }
        acked.sort_unstable();
        acked
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8_be(TYPE_ACK);
        buf.put_u32_be(self.largest_acked);
        buf.put_u32_be(self.ack_delay);
        buf.put_u32_be(self.ranges.len() as u32);
        buf.put_u32_be(self.first_range);
        for r in &self.ranges {
            buf.put_u32_be(r.gap);
            buf.put_u32_be(r.length);
        }
    }

    fn parse(cur: &mut Cursor) -> Result<Ack, PacketParseError> {
        let largest_acked = cur.get_u32()?;
        let ack_delay = cur.get_u32()?;
        let range_count = cur.get_u32()?;
        let first_range = cur.get_u32()?;
        let mut ranges = Vec::with_capacity(range_count as usize);
        for _ in 0..range_count {
            let gap = cur.get_u32()?;
            let length = cur.get_u32()?;
            ranges.push(AckRange { gap, length });
        }
        Ok(Ack {
            largest_acked,
            ack_delay,
            first_range,
            ranges,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl StreamFrame {
    pub fn new(stream_id: StreamId, offset: u64, data: Vec<u8>) -> Result<Self, InvalidArgument> {
        if data.len() > u16::MAX as usize {
            return Err(InvalidArgument::LengthOutOfRange(data.len()));
        }
        Ok(StreamFrame {
            stream_id,
            offset,
            data,
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8_be(TYPE_STREAM);
        buf.put_u8_be(self.stream_id.0);
        buf.put_u64_be(self.offset);
        buf.put_u16_be(self.data.len() as u16);
        buf.extend_from_slice(&self.data);
    }

    fn parse(cur: &mut Cursor) -> Result<StreamFrame, PacketParseError> {
        let stream_id = StreamId(cur.get_u8()?);
        let offset = cur.get_u64()?;
        let length = cur.get_u16()? as usize;
        let data = cur.take(length)?.to_vec();
        Ok(StreamFrame {
            stream_id,
            offset,
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl CryptoFrame {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8_be(TYPE_CRYPTO);
        buf.put_u64_be(self.offset);
        buf.put_u16_be(self.data.len() as u16);
        buf.extend_from_slice(&self.data);
    }

    fn parse(cur: &mut Cursor) -> Result<CryptoFrame, PacketParseError> {
        let offset = cur.get_u64()?;
        let length = cur.get_u16()? as usize;
        let data = cur.take(length)?.to_vec();
        Ok(CryptoFrame { offset, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    pub error_code: u8,
    pub reason: Vec<u8>,
}

impl ConnectionClose {
    pub fn new(error_code: u8, reason: Vec<u8>) -> Result<Self, InvalidArgument> {
        if reason.len() > u8::MAX as usize {
            return Err(InvalidArgument::ReasonTooLong(reason.len()));
        }
        Ok(ConnectionClose { error_code, reason })
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8_be(TYPE_CONNECTION_CLOSE);
        buf.put_u8_be(self.error_code);
        buf.put_u8_be(self.reason.len() as u8);
        buf.extend_from_slice(&self.reason);
    }

    fn parse(cur: &mut Cursor) -> Result<ConnectionClose, PacketParseError> {
        let error_code = cur.get_u8()?;
        let reason_len = cur.get_u8()? as usize;
        let reason = cur.take(reason_len)?.to_vec();
        Ok(ConnectionClose { error_code, reason })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stream(StreamFrame),
    Ack(Ack),
    Crypto(CryptoFrame),
    Padding,
    ConnectionClose(ConnectionClose),
}

impl Frame {
    /// Ack-eliciting iff the frame is anything other than ACK, PADDING, or
    /// CONNECTION_CLOSE (glossary).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding | Frame::ConnectionClose(_))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Stream(f) => f.encode(buf),
            Frame::Ack(f) => f.encode(buf),
            Frame::Crypto(f) => f.encode(buf),
            Frame::Padding => buf.put_u8_be(TYPE_PADDING),
            Frame::ConnectionClose(f) => f.encode(buf),
        }
    }

    fn parse(cur: &mut Cursor) -> Result<Frame, PacketParseError> {
        let ty = cur.get_u8()?;
        match ty {
            TYPE_PADDING => Ok(Frame::Padding),
            TYPE_STREAM => Ok(Frame::Stream(StreamFrame::parse(cur)?)),
            TYPE_CRYPTO => Ok(Frame::Crypto(CryptoFrame::parse(cur)?)),
            TYPE_ACK => Ok(Frame::Ack(Ack::parse(cur)?)),
            TYPE_CONNECTION_CLOSE => Ok(Frame::ConnectionClose(ConnectionClose::parse(cur)?)),
            other => Err(PacketParseError::UnknownFrameType(other)),
        }
    }
}

/// Parses every frame out of a packet payload. Total: never reads beyond
/// `cur`'s bounds (spec.md §4.1 parser contract).
pub fn parse_frames(cur: &mut Cursor) -> Result<Vec<Frame>, PacketParseError> {
    let mut frames = Vec::new();
    while !cur.is_empty() {
        frames.push(Frame::parse(cur)?);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_round_trip_s4() {
        let received: Vec<u32> = vec![1, 2, 3, 6, 7, 8, 9, 13, 14, 15, 18, 19];
        let ack = Ack::from_received_set(&received, 0).unwrap();
        assert_eq!(ack.largest_acked, 19);
        assert_eq!(ack.first_range, 1);
        assert_eq!(
            ack.ranges,
            vec![
                AckRange { gap: 2, length: 3 },
                AckRange { gap: 3, length: 4 },
                AckRange { gap: 2, length: 3 },
            ]
        );
        let mut decoded = ack.decode_ranges();
        decoded.sort_unstable();
        let mut expected = received.clone();
        expected.sort_unstable();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn ack_empty_set_is_none() {
        assert!(Ack::from_received_set(&[], 0).is_none());
    }

    #[test]
    fn ack_single_range() {
        let received: Vec<u32> = vec![5];
        let ack = Ack::from_received_set(&received, 0).unwrap();
        assert_eq!(ack.largest_acked, 5);
        assert_eq!(ack.first_range, 0);
        assert!(ack.ranges.is_empty());
        assert_eq!(ack.decode_ranges(), vec![5]);
    }

    #[test]
    fn ack_wire_round_trip() {
        let received: Vec<u32> = (0..6).chain(10..15).collect();
        let ack = Ack::from_received_set(&received, 42).unwrap();
        let mut buf = Vec::new();
        ack.encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        let frame = Frame::parse(&mut cur).unwrap();
        match frame {
            Frame::Ack(decoded) => assert_eq!(decoded, ack),
            _ => panic!("wrong frame type"),
        }
    }

    #[test]
    fn stream_frame_round_trip() {
        let f = StreamFrame::new(StreamId(1), 10, b"hello".to_vec()).unwrap();
        let mut buf = Vec::new();
        f.encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        match Frame::parse(&mut cur).unwrap() {
            Frame::Stream(decoded) => assert_eq!(decoded, f),
            _ => panic!("wrong frame type"),
        }
    }

    #[test]
    fn unknown_frame_type_errors() {
        let buf = [0xffu8];
        let mut cur = Cursor::new(&buf);
        assert!(matches!(
            Frame::parse(&mut cur),
            Err(PacketParseError::UnknownFrameType(0xff))
        ));
    }

    #[test]
    fn ack_eliciting_classification() {
        assert!(!Frame::Padding.is_ack_eliciting());
        assert!(!Frame::Ack(Ack::from_received_set(&[1], 0).unwrap()).is_ack_eliciting());
        assert!(
            !Frame::ConnectionClose(ConnectionClose::new(0, vec![]).unwrap()).is_ack_eliciting()
        );
        assert!(Frame::Stream(StreamFrame::new(StreamId(1), 0, vec![1]).unwrap())
            .is_ack_eliciting());
    }
}
