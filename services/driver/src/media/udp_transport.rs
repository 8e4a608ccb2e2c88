//! Non-blocking UDP sockets.
//!
//! Agents poll sockets every duty cycle; nothing blocks.  Sockets are
//! configured through `socket2` (buffer sizes, multicast membership, TTL)
//! then converted to `std::net::UdpSocket` in non-blocking mode.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// Outcome of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The full datagram was accepted by the kernel.
    Sent(usize),
    /// The kernel accepted fewer bytes than offered (or none).  The caller
    /// retries next duty cycle; the short-send counter tracks it.
    Short(usize),
}

/// One UDP socket with non-blocking send/receive.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a socket at `bind_addr`, optionally joining `multicast_group`.
    pub fn bind(
        bind_addr: SocketAddr,
        multicast_group: Option<IpAddr>,
        ttl: u32,
        sndbuf: usize,
        rcvbuf: usize,
    ) -> io::Result<UdpTransport> {
        let domain = Domain::for_address(bind_addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        if sndbuf > 0 {
            socket.set_send_buffer_size(sndbuf)?;
        }
        if rcvbuf > 0 {
            socket.set_recv_buffer_size(rcvbuf)?;
        }

        match multicast_group {
            Some(IpAddr::V4(group)) => {
                socket.bind(&bind_addr.into())?;
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
                if ttl > 0 {
                    socket.set_multicast_ttl_v4(ttl)?;
                }
                socket.set_multicast_loop_v4(true)?;
            }
            Some(IpAddr::V6(group)) => {
                socket.bind(&bind_addr.into())?;
                socket.join_multicast_v6(&group, 0)?;
            }
            None => {
                socket.bind(&bind_addr.into())?;
                if ttl > 0 {
                    socket.set_multicast_ttl_v4(ttl)?;
                }
            }
        }

        let socket: UdpSocket = socket.into();
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(UdpTransport { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a datagram.  `Short` covers both EAGAIN (zero bytes accepted)
    /// and partial acceptance.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<SendOutcome> {
        match self.socket.send_to(buf, addr) {
            Ok(sent) if sent == buf.len() => Ok(SendOutcome::Sent(sent)),
            Ok(sent) => Ok(SendOutcome::Short(sent)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::Short(0)),
            Err(e) => Err(e),
        }
    }

    /// Receive one datagram if available.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((length, addr)) => Ok(Some((length, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_transport() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None, 0, 0, 0).unwrap()
    }

    #[test]
    fn datagrams_travel_between_transports() {
        let a = loopback_transport();
        let b = loopback_transport();

        let outcome = a.send_to(b"ping", b.local_addr()).unwrap();
        assert_eq!(outcome, SendOutcome::Sent(4));

        let mut buf = [0u8; 64];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some((length, from)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..length], b"ping");
                assert_eq!(from, a.local_addr());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "datagram never arrived");
            std::thread::yield_now();
        }
    }

    #[test]
    fn empty_socket_returns_none_without_blocking() {
        let t = loopback_transport();
        let mut buf = [0u8; 64];
        assert!(t.recv_from(&mut buf).unwrap().is_none());
    }
}
