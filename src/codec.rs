//! Fixed-width big-endian get/put helpers, in the spirit of quinn-proto's
//! `coding::{BufExt, BufMutExt}` (that module wasn't in the retrieved
//! slice, so it's reconstructed here on top of `bytes::{Buf, BufMut}`).
//!
//! All integer fields in this protocol are fixed-width (spec.md Non-goals
//! exclude varints), so these helpers are thin wrappers rather than a full
//! codec DSL.

use bytes::{Buf, BufMut};

use crate::error::PacketParseError;

fn truncated(e: bytes::TryGetError) -> PacketParseError {
    PacketParseError::Truncated {
        needed: e.requested,
        had: e.available,
    }
}

/// A cursor over an immutable byte slice that tracks structural violations
/// the way the parser contract in spec.md §4.1 requires: truncation is
/// reported, never read past the end.
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    pub fn remaining(&self) -> usize {
        Buf::remaining(&self.buf)
    }

    pub fn get_u8(&mut self) -> Result<u8, PacketParseError> {
        self.buf.try_get_u8().map_err(truncated)
    }

    pub fn get_u16(&mut self) -> Result<u16, PacketParseError> {
        self.buf.try_get_u16().map_err(truncated)
    }

    pub fn get_u32(&mut self) -> Result<u32, PacketParseError> {
        self.buf.try_get_u32().map_err(truncated)
    }

    pub fn get_u64(&mut self) -> Result<u64, PacketParseError> {
        self.buf.try_get_u64().map_err(truncated)
    }

    /// Takes `n` bytes as a slice, advancing the cursor.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], PacketParseError> {
        if self.remaining() < n {
            return Err(PacketParseError::Truncated {
                needed: n,
                had: self.remaining(),
            });
        }
        let s = &self.buf[..n];
        Buf::advance(&mut self.buf, n);
        Ok(s)
    }

    pub fn is_empty(&self) -> bool {
        !Buf::has_remaining(&self.buf)
    }
}

/// Appends a big-endian integer to a growable byte buffer. Named to mirror
/// `BufMutExt::write` in the teacher.
pub trait BufMutExt {
    fn put_u8_be(&mut self, v: u8);
    fn put_u16_be(&mut self, v: u16);
    fn put_u32_be(&mut self, v: u32);
    fn put_u64_be(&mut self, v: u64);
}

impl BufMutExt for Vec<u8> {
    fn put_u8_be(&mut self, v: u8) {
        self.put_u8(v);
    }
    fn put_u16_be(&mut self, v: u16) {
        self.put_u16(v);
    }
    fn put_u32_be(&mut self, v: u32) {
        self.put_u32(v);
    }
    fn put_u64_be(&mut self, v: u64) {
        self.put_u64(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_widths() {
        let mut buf = Vec::new();
        buf.put_u8_be(0xab);
        buf.put_u16_be(0x1234);
        buf.put_u32_be(0xdead_beef);
        buf.put_u64_be(0x0102_0304_0506_0708);

        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.get_u8().unwrap(), 0xab);
        assert_eq!(cur.get_u16().unwrap(), 0x1234);
        assert_eq!(cur.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(cur.get_u64().unwrap(), 0x0102_0304_0506_0708);
        assert!(cur.is_empty());
    }

    #[test]
    fn truncation_is_reported() {
        let buf = [0u8; 1];
        let mut cur = Cursor::new(&buf);
        assert!(cur.get_u32().is_err());
    }
}
