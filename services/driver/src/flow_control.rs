//! Flow control strategies for network publications.
//!
//! A strategy converts inbound status messages into a new sender limit.
//! Multicast strategies track individual receivers by receiver id and time
//! out the silent ones; the unicast default keeps no per-receiver state.
//!
//! Strategy selection comes from the channel's `fc` parameter:
//! `min`, `max`, `tagged,g:<tag>[,s:<size>]`, `pref`, or unset for the
//! per-medium default (unicast for unicast channels, max for multicast).

use std::net::SocketAddr;

use cn_logbuffer::descriptor::compute_position;
use cn_protocol::frame::StatusMessage;
use cn_protocol::uri::ChannelUri;

use crate::error::DriverError;

/// Receiver liveness timeout for multicast strategies.
pub const FLOW_CONTROL_RECEIVER_TIMEOUT_NS: i64 = 5_000_000_000;

/// Pluggable per-publication flow control.
pub trait FlowControl: Send {
    /// Apply a status message, returning the new sender limit.
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        sender_addr: SocketAddr,
        sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        now_ns: i64,
    ) -> i64;

    /// A status message carried the send-setup flag.
    fn on_trigger_send_setup(
        &mut self,
        _sm: &StatusMessage,
        _sender_addr: SocketAddr,
        _now_ns: i64,
    ) {
    }

    /// A SETUP is about to be emitted for this publication.
    fn on_setup(
        &mut self,
        _now_ns: i64,
        sender_limit: i64,
        _sender_position: i64,
    ) -> i64 {
        sender_limit
    }

    /// An ERR frame arrived from a receiver.
    fn on_error(&mut self, _error_code: i32, _sender_addr: SocketAddr, _now_ns: i64) {}

    /// Periodic tick: time out silent receivers, return the possibly
    /// shrunk sender limit.
    fn on_idle(&mut self, now_ns: i64, sender_limit: i64) -> i64;

    /// `true` when enough receivers are connected for the publication to
    /// report itself connected.
    fn has_required_receivers(&self) -> bool;

    /// Bound a retransmission so it neither exceeds the window multiple
    /// nor crosses the end of the term holding the gap.
    fn max_retransmission_length(
        &self,
        term_offset: usize,
        resend_length: usize,
        term_length: usize,
        window_multiple: usize,
    ) -> usize;
}

fn bounded_retransmission(
    term_offset: usize,
    resend_length: usize,
    term_length: usize,
    receiver_window: usize,
    window_multiple: usize,
) -> usize {
    let window_bound = receiver_window.saturating_mul(window_multiple);
    let length = resend_length.min(window_bound.max(1));
    length.min(term_length - term_offset)
}

// ---------------------------------------------------------------------------
// Unicast
// ---------------------------------------------------------------------------

/// Default strategy: track the maximum right edge seen from any receiver.
pub struct UnicastFlowControl {
    last_window: usize,
    has_receiver: bool,
}

impl UnicastFlowControl {
    pub fn new() -> Self {
        UnicastFlowControl {
            last_window: 0,
            has_receiver: false,
        }
    }
}

impl FlowControl for UnicastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        _sender_addr: SocketAddr,
        sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        _now_ns: i64,
    ) -> i64 {
        self.has_receiver = true;
        self.last_window = sm.receiver_window as usize;
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            position_bits,
            initial_term_id,
        );
        sender_limit.max(position + sm.receiver_window as i64)
    }

    fn on_idle(&mut self, _now_ns: i64, sender_limit: i64) -> i64 {
        sender_limit
    }

    fn has_required_receivers(&self) -> bool {
        self.has_receiver
    }

    fn max_retransmission_length(
        &self,
        term_offset: usize,
        resend_length: usize,
        term_length: usize,
        window_multiple: usize,
    ) -> usize {
        bounded_retransmission(
            term_offset,
            resend_length,
            term_length,
            self.last_window,
            window_multiple,
        )
    }
}

// ---------------------------------------------------------------------------
// Tracked receivers (multicast family)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct TrackedReceiver {
    receiver_id: i64,
    position: i64,
    window: i64,
    group_tag: Option<i64>,
    time_of_last_sm_ns: i64,
}

/// Which edge of the receiver group governs the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupEdge {
    Min,
    Max,
}

/// Shared implementation for min/max/tagged/preferred strategies.
pub struct GroupFlowControl {
    receivers: Vec<TrackedReceiver>,
    edge: GroupEdge,
    /// Only receivers with this tag participate in the limit.
    group_tag: Option<i64>,
    required_group_size: usize,
    /// Preferred mode: the limit follows this receiver alone.
    preferred_receiver_id: Option<i64>,
    prefer_single_receiver: bool,
    timeout_ns: i64,
    last_window: usize,
}

impl GroupFlowControl {
    fn new(
        edge: GroupEdge,
        group_tag: Option<i64>,
        required_group_size: usize,
        prefer_single_receiver: bool,
    ) -> Self {
        GroupFlowControl {
            receivers: Vec::new(),
            edge,
            group_tag,
            required_group_size,
            preferred_receiver_id: None,
            prefer_single_receiver,
            timeout_ns: FLOW_CONTROL_RECEIVER_TIMEOUT_NS,
            last_window: 0,
        }
    }

    pub fn min() -> Self {
        Self::new(GroupEdge::Min, None, 0, false)
    }

    pub fn max() -> Self {
        Self::new(GroupEdge::Max, None, 0, false)
    }

    pub fn tagged(group_tag: i64, required_group_size: usize) -> Self {
        Self::new(GroupEdge::Min, Some(group_tag), required_group_size, false)
    }

    pub fn preferred() -> Self {
        Self::new(GroupEdge::Min, None, 0, true)
    }

    fn matches_group(&self, receiver: &TrackedReceiver) -> bool {
        match self.group_tag {
            Some(tag) => receiver.group_tag == Some(tag),
            None => true,
        }
    }

    fn group_limit(&self, sender_limit: i64) -> i64 {
        if self.prefer_single_receiver {
            if let Some(id) = self.preferred_receiver_id {
                if let Some(r) = self.receivers.iter().find(|r| r.receiver_id == id) {
                    return r.position + r.window;
                }
            }
            return sender_limit;
        }

        let mut limit: Option<i64> = None;
        for r in self.receivers.iter().filter(|r| self.matches_group(r)) {
            let edge_position = r.position + r.window;
            limit = Some(match (limit, self.edge) {
                (None, _) => edge_position,
                (Some(v), GroupEdge::Min) => v.min(edge_position),
                (Some(v), GroupEdge::Max) => v.max(edge_position),
            });
        }
        limit.unwrap_or(sender_limit)
    }
}

impl FlowControl for GroupFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        _sender_addr: SocketAddr,
        sender_limit: i64,
        initial_term_id: i32,
        position_bits: u32,
        now_ns: i64,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            position_bits,
            initial_term_id,
        );
        self.last_window = sm.receiver_window as usize;

        match self
            .receivers
            .iter_mut()
            .find(|r| r.receiver_id == sm.receiver_id)
        {
            Some(receiver) => {
                receiver.position = position;
                receiver.window = sm.receiver_window as i64;
                receiver.group_tag = sm.group_tag;
                receiver.time_of_last_sm_ns = now_ns;
            }
            None => {
                self.receivers.push(TrackedReceiver {
                    receiver_id: sm.receiver_id,
                    position,
                    window: sm.receiver_window as i64,
                    group_tag: sm.group_tag,
                    time_of_last_sm_ns: now_ns,
                });
                if self.prefer_single_receiver && self.preferred_receiver_id.is_none() {
                    self.preferred_receiver_id = Some(sm.receiver_id);
                }
            }
        }

        self.group_limit(sender_limit)
    }

    fn on_idle(&mut self, now_ns: i64, sender_limit: i64) -> i64 {
        let timeout = self.timeout_ns;
        self.receivers
            .retain(|r| now_ns - r.time_of_last_sm_ns <= timeout);
        if self.prefer_single_receiver {
            if let Some(id) = self.preferred_receiver_id {
                if !self.receivers.iter().any(|r| r.receiver_id == id) {
                    // Elect a replacement from the survivors, if any.
                    self.preferred_receiver_id =
                        self.receivers.first().map(|r| r.receiver_id);
                }
            }
        }
        if self.receivers.is_empty() {
            sender_limit
        } else {
            self.group_limit(sender_limit)
        }
    }

    fn has_required_receivers(&self) -> bool {
        let in_group = self
            .receivers
            .iter()
            .filter(|r| self.matches_group(r))
            .count();
        in_group > 0 && in_group >= self.required_group_size
    }

    fn max_retransmission_length(
        &self,
        term_offset: usize,
        resend_length: usize,
        term_length: usize,
        window_multiple: usize,
    ) -> usize {
        bounded_retransmission(
            term_offset,
            resend_length,
            term_length,
            self.last_window,
            window_multiple,
        )
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Build the flow control strategy for a publication channel.
pub fn supply_flow_control(
    uri: &ChannelUri,
    is_multicast: bool,
) -> Result<Box<dyn FlowControl>, DriverError> {
    match uri.get("fc") {
        None => {
            if is_multicast {
                Ok(Box::new(GroupFlowControl::max()))
            } else {
                Ok(Box::new(UnicastFlowControl::new()))
            }
        }
        Some("min") => Ok(Box::new(GroupFlowControl::min())),
        Some("max") => Ok(Box::new(GroupFlowControl::max())),
        Some("pref") => Ok(Box::new(GroupFlowControl::preferred())),
        Some(value) if value.starts_with("tagged,g:") => {
            let params = &value["tagged,g:".len()..];
            let (tag_str, size_str) = match params.split_once(",s:") {
                Some((t, s)) => (t, Some(s)),
                None => (params, None),
            };
            let tag = tag_str.parse::<i64>().map_err(|_| {
                DriverError::InvalidChannel(format!("bad fc group tag '{value}'"))
            })?;
            let size = match size_str {
                Some(s) => s.parse::<usize>().map_err(|_| {
                    DriverError::InvalidChannel(format!("bad fc group size '{value}'"))
                })?,
                None => 0,
            };
            Ok(Box::new(GroupFlowControl::tagged(tag, size)))
        }
        Some(other) => Err(DriverError::InvalidChannel(format!(
            "unknown fc strategy '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITS: u32 = 16; // 64 KiB terms

    fn sm(receiver_id: i64, term_id: i32, term_offset: i32, window: i32) -> StatusMessage {
        StatusMessage {
            flags: 0,
            session_id: 1,
            stream_id: 2,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window,
            receiver_id,
            group_tag: None,
        }
    }

    fn sm_tagged(receiver_id: i64, term_offset: i32, window: i32, tag: i64) -> StatusMessage {
        StatusMessage {
            group_tag: Some(tag),
            ..sm(receiver_id, 0, term_offset, window)
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn unicast_tracks_max_right_edge() {
        let mut fc = UnicastFlowControl::new();
        assert!(!fc.has_required_receivers());

        let limit = fc.on_status_message(&sm(1, 0, 1024, 4096), addr(), 0, 0, BITS, 0);
        assert_eq!(limit, 1024 + 4096);
        assert!(fc.has_required_receivers());

        // A stale SM can never pull the limit backwards.
        let limit = fc.on_status_message(&sm(1, 0, 0, 1024), addr(), limit, 0, BITS, 0);
        assert_eq!(limit, 1024 + 4096);
    }

    #[test]
    fn min_multicast_follows_slowest_receiver() {
        let mut fc = GroupFlowControl::min();
        let limit = fc.on_status_message(&sm(1, 0, 8192, 4096), addr(), 0, 0, BITS, 0);
        assert_eq!(limit, 8192 + 4096);

        let limit = fc.on_status_message(&sm(2, 0, 1024, 4096), addr(), limit, 0, BITS, 0);
        assert_eq!(limit, 1024 + 4096, "slowest receiver governs");
    }

    #[test]
    fn max_multicast_ignores_slow_receivers() {
        let mut fc = GroupFlowControl::max();
        fc.on_status_message(&sm(1, 0, 1024, 4096), addr(), 0, 0, BITS, 0);
        let limit = fc.on_status_message(&sm(2, 0, 8192, 4096), addr(), 0, 0, BITS, 0);
        assert_eq!(limit, 8192 + 4096);
    }

    #[test]
    fn silent_receivers_time_out() {
        let mut fc = GroupFlowControl::min();
        fc.on_status_message(&sm(1, 0, 1024, 4096), addr(), 0, 0, BITS, 0);
        fc.on_status_message(&sm(2, 0, 8192, 4096), addr(), 0, 0, BITS, 1_000);

        // Receiver 1 goes silent past the timeout; only receiver 2 remains.
        let now = FLOW_CONTROL_RECEIVER_TIMEOUT_NS + 500;
        let limit = fc.on_idle(now, 0);
        assert_eq!(limit, 8192 + 4096);
        assert!(fc.has_required_receivers());
    }

    #[test]
    fn tagged_group_filters_and_requires_size() {
        let mut fc = GroupFlowControl::tagged(7, 2);
        fc.on_status_message(&sm_tagged(1, 1024, 4096, 7), addr(), 0, 0, BITS, 0);
        assert!(!fc.has_required_receivers(), "needs two tagged receivers");

        // Untagged receiver does not count toward the group.
        fc.on_status_message(&sm(2, 0, 64, 4096), addr(), 0, 0, BITS, 0);
        assert!(!fc.has_required_receivers());

        let limit = fc.on_status_message(&sm_tagged(3, 8192, 4096, 7), addr(), 0, 0, BITS, 0);
        assert!(fc.has_required_receivers());
        assert_eq!(limit, 1024 + 4096, "min over the tagged group only");
    }

    #[test]
    fn preferred_follows_first_receiver_until_it_dies() {
        let mut fc = GroupFlowControl::preferred();
        let limit = fc.on_status_message(&sm(10, 0, 1024, 4096), addr(), 0, 0, BITS, 0);
        assert_eq!(limit, 1024 + 4096);

        // A faster receiver arrives but is not preferred.
        let limit = fc.on_status_message(&sm(11, 0, 32768, 4096), addr(), limit, 0, BITS, 100);
        assert_eq!(limit, 1024 + 4096);

        // Preferred receiver times out: the survivor takes over.
        let now = FLOW_CONTROL_RECEIVER_TIMEOUT_NS + 50;
        fc.on_status_message(&sm(11, 0, 32768, 4096), addr(), limit, 0, BITS, now);
        let limit = fc.on_idle(now + 1, limit);
        assert_eq!(limit, 32768 + 4096);
    }

    #[test]
    fn retransmission_bounded_by_window_multiple_and_term_end() {
        let mut fc = UnicastFlowControl::new();
        fc.on_status_message(&sm(1, 0, 0, 1024), addr(), 0, 0, BITS, 0);

        // Window multiple bound.
        assert_eq!(fc.max_retransmission_length(0, 1 << 20, 65536, 4), 4096);
        // Term end bound.
        assert_eq!(fc.max_retransmission_length(65536 - 512, 4096, 65536, 4), 512);
    }

    #[test]
    fn strategy_selection_from_uri() {
        let uri = ChannelUri::parse("aeron:udp?endpoint=x:1&fc=min").unwrap();
        let fc = supply_flow_control(&uri, true).unwrap();
        assert!(!fc.has_required_receivers());

        let uri = ChannelUri::parse("aeron:udp?endpoint=x:1&fc=tagged,g:42,s:3").unwrap();
        assert!(supply_flow_control(&uri, true).is_ok());

        let uri = ChannelUri::parse("aeron:udp?endpoint=x:1&fc=warp").unwrap();
        assert!(supply_flow_control(&uri, true).is_err());
    }
}
