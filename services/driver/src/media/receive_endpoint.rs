//! Receive channel endpoint: one (or more, with multi-destination
//! subscriptions) UDP sockets on the receive side.
//!
//! Tracks which stream ids have subscriber interest (with an optional
//! session filter) so the Receiver can decide whether an inbound SETUP or
//! unknown-session DATA frame should elicit image creation.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use cn_concurrent::AtomicCounter;

use crate::media::udp_transport::{SendOutcome, UdpTransport};
use crate::system_counters;

/// Subscriber interest in one stream on this endpoint.
#[derive(Debug, Clone, Copy)]
struct StreamInterest {
    session_id: Option<i32>,
    ref_count: usize,
}

/// Receiver-owned endpoint, possibly spanning several destinations.
pub struct ReceiveChannelEndpoint {
    pub id: usize,
    pub canonical_form: String,
    /// Unique id this endpoint reports in status messages.
    pub receiver_id: i64,
    transports: Vec<Arc<UdpTransport>>,
    interest: HashMap<i32, StreamInterest>,
    status: AtomicCounter,
}

impl ReceiveChannelEndpoint {
    pub fn new(
        id: usize,
        canonical_form: String,
        transport: Arc<UdpTransport>,
        receiver_id: i64,
        status: AtomicCounter,
    ) -> Self {
        status.set_ordered(system_counters::CHANNEL_STATUS_ACTIVE);
        ReceiveChannelEndpoint {
            id,
            canonical_form,
            receiver_id,
            transports: vec![transport],
            interest: HashMap::new(),
            status,
        }
    }

    // -----------------------------------------------------------------------
    // Stream interest
    // -----------------------------------------------------------------------

    pub fn add_stream_interest(&mut self, stream_id: i32, session_id: Option<i32>) {
        let entry = self.interest.entry(stream_id).or_insert(StreamInterest {
            session_id,
            ref_count: 0,
        });
        entry.ref_count += 1;
    }

    /// Returns `true` when this was the last interest in the stream.
    pub fn remove_stream_interest(&mut self, stream_id: i32) -> bool {
        if let Some(entry) = self.interest.get_mut(&stream_id) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                self.interest.remove(&stream_id);
                return true;
            }
        }
        false
    }

    pub fn has_interest_in(&self, stream_id: i32, session_id: i32) -> bool {
        match self.interest.get(&stream_id) {
            Some(interest) => interest
                .session_id
                .map_or(true, |wanted| wanted == session_id),
            None => false,
        }
    }

    pub fn has_any_interest(&self) -> bool {
        !self.interest.is_empty()
    }

    // -----------------------------------------------------------------------
    // Transports
    // -----------------------------------------------------------------------

    pub fn transports(&self) -> &[Arc<UdpTransport>] {
        &self.transports
    }

    /// Add a receive destination (multi-destination subscription).
    pub fn add_destination(&mut self, transport: Arc<UdpTransport>) {
        self.transports.push(transport);
    }

    pub fn remove_destination(&mut self, local_addr: SocketAddr) {
        if self.transports.len() > 1 {
            self.transports.retain(|t| t.local_addr() != local_addr);
        }
    }

    /// Send a control frame (SM/NAK/RTT) back toward the source.
    pub fn send_to(&self, buf: &[u8], address: SocketAddr) -> io::Result<usize> {
        match self.transports[0].send_to(buf, address)? {
            SendOutcome::Sent(sent) => Ok(sent),
            SendOutcome::Short(sent) => Ok(sent),
        }
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

    fn endpoint() -> (ReceiveChannelEndpoint, AlignedBuffer) {
        let mem = AlignedBuffer::with_capacity(VALUE_LENGTH);
        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None, 0, 0, 0).unwrap(),
        );
        (
            ReceiveChannelEndpoint::new(
                1,
                "UDP-test".to_owned(),
                transport,
                0xDD,
                AtomicCounter::new(mem.buffer(), 0),
            ),
            mem,
        )
    }

    #[test]
    fn interest_is_ref_counted() {
        let (mut ep, _mem) = endpoint();
        ep.add_stream_interest(42, None);
        ep.add_stream_interest(42, None);

        assert!(ep.has_interest_in(42, 100));
        assert!(!ep.remove_stream_interest(42));
        assert!(ep.has_interest_in(42, 100));
        assert!(ep.remove_stream_interest(42));
        assert!(!ep.has_interest_in(42, 100));
    }

    #[test]
    fn session_filter_limits_interest() {
        let (mut ep, _mem) = endpoint();
        ep.add_stream_interest(42, Some(5));
        assert!(ep.has_interest_in(42, 5));
        assert!(!ep.has_interest_in(42, 6));
    }

    #[test]
    fn primary_transport_is_never_removed() {
        let (mut ep, _mem) = endpoint();
        let primary = ep.transports()[0].local_addr();
        ep.remove_destination(primary);
        assert_eq!(ep.transports().len(), 1);
    }
}
