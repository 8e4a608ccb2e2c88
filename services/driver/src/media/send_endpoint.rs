//! Send channel endpoint: one UDP socket on the send side.
//!
//! Owns the socket a set of network publications transmit through, plus
//! the destination list (a single endpoint address, or several for manual
//! multi-destination-cast).  The Sender polls the same socket for control
//! frames (SM/NAK/RTT/ERR) flowing back from receivers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use cn_concurrent::AtomicCounter;

use crate::media::udp_transport::{SendOutcome, UdpTransport};
use crate::system_counters;

/// Sender-owned endpoint over one socket.
pub struct SendChannelEndpoint {
    pub id: usize,
    pub canonical_form: String,
    pub transport: Arc<UdpTransport>,
    pub is_multicast: bool,
    destinations: Vec<SocketAddr>,
    status: AtomicCounter,
}

impl SendChannelEndpoint {
    pub fn new(
        id: usize,
        canonical_form: String,
        transport: Arc<UdpTransport>,
        is_multicast: bool,
        primary_destination: Option<SocketAddr>,
        status: AtomicCounter,
    ) -> Self {
        let destinations = primary_destination.into_iter().collect();
        status.set_ordered(system_counters::CHANNEL_STATUS_ACTIVE);
        SendChannelEndpoint {
            id,
            canonical_form,
            transport,
            is_multicast,
            destinations,
            status,
        }
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    pub fn add_destination(&mut self, address: SocketAddr) {
        if !self.destinations.contains(&address) {
            self.destinations.push(address);
        }
    }

    pub fn remove_destination(&mut self, address: SocketAddr) {
        self.destinations.retain(|d| *d != address);
    }

    /// Send `buf` to every destination.  Returns the minimum bytes accepted
    /// across destinations so a short send to any of them holds the
    /// position back and the whole quantum is retried.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut min_sent = buf.len();
        for destination in &self.destinations {
            match self.transport.send_to(buf, *destination)? {
                SendOutcome::Sent(_) => {}
                SendOutcome::Short(sent) => min_sent = min_sent.min(sent),
            }
        }
        Ok(min_sent)
    }

    /// Send a control/response frame to one specific address.
    pub fn send_to(&self, buf: &[u8], address: SocketAddr) -> io::Result<usize> {
        match self.transport.send_to(buf, address)? {
            SendOutcome::Sent(sent) => Ok(sent),
            SendOutcome::Short(sent) => Ok(sent),
        }
    }

    pub fn receive(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.transport.recv_from(buf)
    }

    pub fn close(&self) {
        self.status
            .set_ordered(system_counters::CHANNEL_STATUS_CLOSING);
    }

    pub fn indicate_error(&self) {
        self.status
            .set_ordered(system_counters::CHANNEL_STATUS_ERRORED);
    }

    pub fn status_counter_id(&self) -> i32 {
        self.status.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::counters::VALUE_LENGTH;
    use cn_concurrent::AlignedBuffer;

    fn endpoint_with_destinations(dests: &[SocketAddr]) -> (SendChannelEndpoint, AlignedBuffer) {
        let mem = AlignedBuffer::with_capacity(VALUE_LENGTH);
        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None, 0, 0, 0).unwrap(),
        );
        let mut endpoint = SendChannelEndpoint::new(
            1,
            "UDP-test".to_owned(),
            transport,
            false,
            dests.first().copied(),
            AtomicCounter::new(mem.buffer(), 0),
        );
        for d in &dests[1.min(dests.len())..] {
            endpoint.add_destination(*d);
        }
        (endpoint, mem)
    }

    #[test]
    fn sends_to_all_destinations() {
        let rx_a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None, 0, 0, 0).unwrap();
        let rx_b = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None, 0, 0, 0).unwrap();
        let (endpoint, _mem) =
            endpoint_with_destinations(&[rx_a.local_addr(), rx_b.local_addr()]);

        assert_eq!(endpoint.send(b"fanout").unwrap(), 6);

        for rx in [&rx_a, &rx_b] {
            let mut buf = [0u8; 64];
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            loop {
                if let Some((length, _)) = rx.recv_from(&mut buf).unwrap() {
                    assert_eq!(&buf[..length], b"fanout");
                    break;
                }
                assert!(std::time::Instant::now() < deadline);
                std::thread::yield_now();
            }
        }
    }

    #[test]
    fn duplicate_destination_is_ignored() {
        let addr: SocketAddr = "127.0.0.1:19999".parse().unwrap();
        let (mut endpoint, _mem) = endpoint_with_destinations(&[addr]);
        endpoint.add_destination(addr);
        assert_eq!(endpoint.destinations().len(), 1);

        endpoint.remove_destination(addr);
        assert!(endpoint.destinations().is_empty());
    }
}
