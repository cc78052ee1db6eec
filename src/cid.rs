//! Connection identifiers (spec.md §3): a 32-bit integer minted by each
//! endpoint for its own side of a connection. Grounded on
//! `quinn-proto::packet::ConnectionId::random`, simplified from a variable
//! length byte string to a fixed `u32`.

use std::fmt;

use rand::Rng;

use crate::error::InvalidArgument;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    pub fn new(value: u64) -> Result<Self, InvalidArgument> {
        if value > u32::MAX as u64 {
            return Err(InvalidArgument::ConnectionIdOutOfRange(value));
        }
        Ok(ConnectionId(value as u32))
    }

    /// Mints a fresh, locally-unique connection id. Uniqueness within a
    /// single process is the caller's responsibility (the endpoint avoids
    /// collisions the way `Endpoint::new_cid` retries on collision).
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        ConnectionId(rng.gen())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range() {
        assert!(ConnectionId::new(1u64 << 33).is_err());
        assert!(ConnectionId::new(42).is_ok());
    }
}
