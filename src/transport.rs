//! The datagram transport boundary (spec.md §6 "External Interfaces").
//!
//! Grounded on the original `QUICSocket.py`'s `socket(AF_INET, SOCK_DGRAM)`
//! wrapper (non-blocking `recv`, `setsockopt(SO_REUSEADDR)`) translated to a
//! trait so the sans-io core never hard-wires a kernel socket, matching
//! quinn-proto's separation of `Connection`/`Endpoint` from `UdpSocket`.

use std::io;
use std::net::{SocketAddr, UdpSocket};

/// A connectionless, unreliable, non-blocking datagram transport.
pub trait DatagramTransport {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Non-blocking. Returns `Err(WouldBlock)` when nothing is queued.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Associates the kernel 5-tuple to `addr`, letting subsequent sends
    /// omit the destination (spec.md §6).
    fn connect(&self, addr: SocketAddr) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramTransport for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        UdpSocket::connect(self, addr)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a fresh non-blocking UDP socket, the way `QUICSocket` mints a
/// per-connection socket on accept.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
pub mod channel {
    //! An in-memory mock transport so the handshake/echo/close scenarios
    //! (S1/S2/S6) can run without a real kernel socket.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Inbox = std::sync::Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>;

    /// One endpoint of an in-memory pair. Datagrams sent here land in the
    /// peer's inbox; `recv_from` drains this endpoint's own inbox.
    pub struct ChannelTransport {
        local: SocketAddr,
        peer: Mutex<Option<SocketAddr>>,
        inbox: Inbox,
        peer_inbox: Inbox,
    }

    impl ChannelTransport {
        /// Builds a connected pair: `a` is addressed at `addr_a`, `b` at
        /// `addr_b`; datagrams sent by one land in the other's inbox.
        pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (ChannelTransport, ChannelTransport) {
            let inbox_a: Inbox = std::sync::Arc::new(Mutex::new(VecDeque::new()));
            let inbox_b: Inbox = std::sync::Arc::new(Mutex::new(VecDeque::new()));
            let a = ChannelTransport {
                local: addr_a,
                peer: Mutex::new(Some(addr_b)),
                inbox: inbox_a.clone(),
                peer_inbox: inbox_b.clone(),
            };
            let b = ChannelTransport {
                local: addr_b,
                peer: Mutex::new(Some(addr_a)),
                inbox: inbox_b,
                peer_inbox: inbox_a,
            };
            (a, b)
        }
    }

    impl DatagramTransport for ChannelTransport {
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            let _ = addr;
            self.peer_inbox
                .lock()
                .unwrap()
                .push_back((buf.to_vec(), self.local));
            Ok(buf.len())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut inbox = self.inbox.lock().unwrap();
            match inbox.pop_front() {
                Some((datagram, from)) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    Ok((n, from))
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram queued")),
            }
        }

        fn connect(&self, addr: SocketAddr) -> io::Result<()> {
            *self.peer.lock().unwrap() = Some(addr);
            Ok(())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
    }
}
