//! Network publication: the sender side of one outbound stream.
//!
//! The Sender exclusively owns this object and walks the log buffer from
//! the sender position, emitting DATA bounded by the flow-controlled
//! sender limit and the MTU.  Heartbeats keep the stream alive when idle;
//! SETUP frames run until the first status message arrives.  Inbound SM /
//! NAK / RTT frames are dispatched here by the Sender's endpoint poll.
//!
//! The Conductor observes progress through the sender-position and
//! sender-limit counters and a small shared atomic block, never touching
//! sender-owned state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use cn_concurrent::Position;
use cn_logbuffer::descriptor::{self, EOS_NOT_SET};
use cn_logbuffer::{term_scanner, MappedRawLog};
use cn_protocol::frame::{
    self, DataHeader, NakFrame, RttMeasurement, SetupFrame, StatusMessage,
};

use crate::flow_control::FlowControl;
use crate::media::send_endpoint::SendChannelEndpoint;
use crate::retransmit::RetransmitHandler;
use crate::system_counters::SystemCounters;

/// Cross-agent view of a publication: written by the Sender, read by the
/// Conductor.
pub struct PublicationSharedState {
    pub has_receivers: AtomicBool,
    pub time_of_last_sm_ns: AtomicI64,
}

impl PublicationSharedState {
    pub fn new() -> Self {
        PublicationSharedState {
            has_receivers: AtomicBool::new(false),
            time_of_last_sm_ns: AtomicI64::new(0),
        }
    }

    pub fn has_receivers(&self) -> bool {
        self.has_receivers.load(Ordering::Acquire)
    }

    pub fn time_of_last_sm_ns(&self) -> i64 {
        self.time_of_last_sm_ns.load(Ordering::Acquire)
    }
}

impl Default for PublicationSharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender-owned state for one outbound network stream.
pub struct NetworkPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub endpoint_id: usize,
    pub term_length: usize,
    pub position_bits: u32,
    pub mtu: usize,

    log: Arc<MappedRawLog>,
    sender_position: Position,
    sender_limit: Position,
    flow_control: Box<dyn FlowControl>,
    retransmit_handler: RetransmitHandler,
    window_multiple: usize,

    heartbeat_timeout_ns: i64,
    setup_interval_ns: i64,
    time_of_last_send_ns: i64,
    time_of_last_setup_ns: i64,
    should_send_setup: bool,
    has_received_sm: bool,

    shared: Arc<PublicationSharedState>,
    frame_scratch: Vec<u8>,
}

impl NetworkPublication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        endpoint_id: usize,
        log: Arc<MappedRawLog>,
        sender_position: Position,
        sender_limit: Position,
        flow_control: Box<dyn FlowControl>,
        retransmit_handler: RetransmitHandler,
        window_multiple: usize,
        mtu: usize,
        heartbeat_timeout_ns: i64,
        shared: Arc<PublicationSharedState>,
    ) -> Self {
        let term_length = log.term_length();
        NetworkPublication {
            registration_id,
            session_id,
            stream_id,
            initial_term_id,
            endpoint_id,
            term_length,
            position_bits: descriptor::position_bits_to_shift(term_length),
            mtu,
            log,
            sender_position,
            sender_limit,
            flow_control,
            retransmit_handler,
            window_multiple,
            heartbeat_timeout_ns,
            setup_interval_ns: heartbeat_timeout_ns,
            time_of_last_send_ns: 0,
            time_of_last_setup_ns: 0,
            should_send_setup: true,
            has_received_sm: false,
            shared,
            frame_scratch: vec![0u8; 64],
        }
    }

    pub fn shared(&self) -> Arc<PublicationSharedState> {
        Arc::clone(&self.shared)
    }

    pub fn log(&self) -> &Arc<MappedRawLog> {
        &self.log
    }

    /// Where the publisher application has appended to.
    pub fn producer_position(&self) -> i64 {
        let meta = self.log.metadata_buffer();
        let term_count = descriptor::active_term_count(&meta);
        let index = descriptor::index_by_term_count(term_count);
        let raw = descriptor::raw_tail_volatile(&meta, index);
        descriptor::compute_position(
            descriptor::term_id_from_raw_tail(raw),
            descriptor::term_offset_from_raw_tail(raw, self.term_length),
            self.position_bits,
            self.initial_term_id,
        )
    }

    pub fn sender_position_value(&self) -> i64 {
        self.sender_position.get()
    }

    /// One duty-cycle pass: retransmits, new data, heartbeats, setup.
    /// Returns bytes put on the wire.
    pub fn send(
        &mut self,
        endpoint: &SendChannelEndpoint,
        now_ns: i64,
        counters: &SystemCounters,
    ) -> usize {
        let mut bytes_sent = 0;

        bytes_sent += self.process_retransmits(endpoint, now_ns, counters);

        if self.should_send_setup
            && !self.has_received_sm
            && now_ns - self.time_of_last_setup_ns >= self.setup_interval_ns
        {
            self.send_setup(endpoint, now_ns);
        }

        let new_limit = self.flow_control.on_idle(now_ns, self.sender_limit.get());
        self.sender_limit.set_ordered(new_limit);

        let position = self.sender_position.get();
        let limit = new_limit;

        if position < limit {
            bytes_sent += self.send_data(endpoint, position, limit, now_ns, counters);
        } else if self.producer_position() > position || self.is_end_of_stream(position) {
            // Back-pressured or drained at EOS: keep the stream warm.
            self.heartbeat_if_due(endpoint, position, now_ns, counters);
        }

        if bytes_sent == 0 && self.has_received_sm {
            self.heartbeat_if_due(endpoint, self.sender_position.get(), now_ns, counters);
        }

        bytes_sent
    }

    fn send_data(
        &mut self,
        endpoint: &SendChannelEndpoint,
        position: i64,
        limit: i64,
        now_ns: i64,
        counters: &SystemCounters,
    ) -> usize {
        let term_id = descriptor::compute_term_id_from_position(
            position,
            self.position_bits,
            self.initial_term_id,
        );
        let index = descriptor::index_by_position(position, self.position_bits);
        let term = self.log.term_buffer(index);
        let offset = descriptor::compute_term_offset_from_position(position, self.position_bits)
            as usize;

        // The partition must still hold our term; if rotation lapped us the
        // publisher limit machinery has failed upstream, so send nothing.
        let raw_tail = descriptor::raw_tail_volatile(&self.log.metadata_buffer(), index);
        if descriptor::term_id_from_raw_tail(raw_tail) != term_id {
            return 0;
        }

        let window = (limit - position).min(self.mtu as i64) as usize;
        let scan = term_scanner::scan_for_availability(&term, offset, window);
        if scan.available == 0 {
            return 0;
        }

        let payload = term.as_slice(offset, scan.available);
        match endpoint.send(payload) {
            Ok(sent) if sent == scan.available => {
                self.sender_position
                    .set_ordered(position + (scan.available + scan.padding) as i64);
                self.time_of_last_send_ns = now_ns;
                counters.bytes_sent.add(scan.available as i64);
                scan.available
            }
            Ok(_) => {
                counters.short_sends.increment();
                0
            }
            Err(_) => {
                counters.errors.increment();
                0
            }
        }
    }

    fn heartbeat_if_due(
        &mut self,
        endpoint: &SendChannelEndpoint,
        position: i64,
        now_ns: i64,
        counters: &SystemCounters,
    ) {
        if now_ns - self.time_of_last_send_ns < self.heartbeat_timeout_ns {
            return;
        }

        let term_id = descriptor::compute_term_id_from_position(
            position,
            self.position_bits,
            self.initial_term_id,
        );
        let term_offset =
            descriptor::compute_term_offset_from_position(position, self.position_bits);

        let mut flags = 0u8;
        let meta = self.log.metadata_buffer();
        if self.is_end_of_stream(position) {
            flags |= frame::EOS_FLAG;
        }
        if descriptor::is_revoked(&meta) {
            flags |= frame::REVOKED_FLAG;
        }

        let mut buf = [0u8; frame::DATA_HEADER_LENGTH];
        DataHeader {
            frame_length: frame::DATA_HEADER_LENGTH as i32,
            flags,
            frame_type: frame::HDR_TYPE_DATA,
            term_offset,
            session_id: self.session_id,
            stream_id: self.stream_id,
            term_id,
            reserved_value: 0,
        }
        .encode(&mut buf);

        if endpoint.send(&buf).is_ok() {
            self.time_of_last_send_ns = now_ns;
            counters.heartbeats_sent.increment();
        }
    }

    fn send_setup(&mut self, endpoint: &SendChannelEndpoint, now_ns: i64) {
        let position = self.sender_position.get();
        let active_term_id = descriptor::compute_term_id_from_position(
            position,
            self.position_bits,
            self.initial_term_id,
        );
        let term_offset =
            descriptor::compute_term_offset_from_position(position, self.position_bits);

        let new_limit = self
            .flow_control
            .on_setup(now_ns, self.sender_limit.get(), position);
        self.sender_limit.set_ordered(new_limit);

        let mut buf = [0u8; frame::SETUP_FRAME_LENGTH];
        SetupFrame {
            flags: 0,
            term_offset,
            session_id: self.session_id,
            stream_id: self.stream_id,
            initial_term_id: self.initial_term_id,
            active_term_id,
            term_length: self.term_length as i32,
            mtu: self.mtu as i32,
            ttl: 0,
        }
        .encode(&mut buf);

        if endpoint.send(&buf).is_ok() {
            self.time_of_last_setup_ns = now_ns;
        }
    }

    fn is_end_of_stream(&self, position: i64) -> bool {
        let eos = descriptor::end_of_stream_position(&self.log.metadata_buffer());
        eos != EOS_NOT_SET && position >= eos
    }

    // -----------------------------------------------------------------------
    // Inbound control frames
    // -----------------------------------------------------------------------

    pub fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        src: SocketAddr,
        now_ns: i64,
        counters: &SystemCounters,
    ) {
        self.has_received_sm = true;
        self.should_send_setup = false;
        self.shared.has_receivers.store(true, Ordering::Release);
        self.shared
            .time_of_last_sm_ns
            .store(now_ns, Ordering::Release);
        counters.status_messages_received.increment();

        if sm.flags & frame::SEND_SETUP_FLAG != 0 {
            self.flow_control.on_trigger_send_setup(sm, src, now_ns);
            self.should_send_setup = true;
            self.has_received_sm = false;
        }

        let new_limit = self.flow_control.on_status_message(
            sm,
            src,
            self.sender_limit.get(),
            self.initial_term_id,
            self.position_bits,
            now_ns,
        );
        self.sender_limit.set_ordered(new_limit);
    }

    pub fn on_nak(
        &mut self,
        nak: &NakFrame,
        endpoint: &SendChannelEndpoint,
        now_ns: i64,
        counters: &SystemCounters,
    ) {
        counters.naks_received.increment();

        let length = self.flow_control.max_retransmission_length(
            nak.term_offset as usize,
            nak.length as usize,
            self.term_length,
            self.window_multiple,
        );

        let log = Arc::clone(&self.log);
        let mtu = self.mtu;
        let initial_term_id = self.initial_term_id;
        let position_bits = self.position_bits;
        self.retransmit_handler.on_nak(
            nak.term_id,
            nak.term_offset,
            length,
            now_ns,
            |term_id, term_offset, resend_length| {
                resend_range(
                    &log,
                    endpoint,
                    initial_term_id,
                    position_bits,
                    mtu,
                    term_id,
                    term_offset,
                    resend_length,
                    counters,
                );
            },
        );
    }

    pub fn on_rtt_measurement(
        &mut self,
        rtt: &RttMeasurement,
        src: SocketAddr,
        endpoint: &SendChannelEndpoint,
    ) {
        if rtt.is_reply() {
            return;
        }
        // Echo the receiver's timestamp back so it can compute the round
        // trip.
        let reply = RttMeasurement {
            flags: frame::RTT_REPLY_FLAG,
            session_id: self.session_id,
            stream_id: self.stream_id,
            echo_timestamp_ns: rtt.echo_timestamp_ns,
            reception_delta_ns: 0,
            receiver_id: rtt.receiver_id,
        };
        let len = reply.encode(&mut self.frame_scratch);
        let _ = endpoint.send_to(&self.frame_scratch[..len], src);
    }

    fn process_retransmits(
        &mut self,
        endpoint: &SendChannelEndpoint,
        now_ns: i64,
        counters: &SystemCounters,
    ) -> usize {
        let log = Arc::clone(&self.log);
        let mtu = self.mtu;
        let initial_term_id = self.initial_term_id;
        let position_bits = self.position_bits;
        let mut bytes = 0;
        self.retransmit_handler
            .process_timeouts(now_ns, |term_id, term_offset, length| {
                bytes += resend_range(
                    &log,
                    endpoint,
                    initial_term_id,
                    position_bits,
                    mtu,
                    term_id,
                    term_offset,
                    length,
                    counters,
                );
            });
        bytes
    }
}

/// Retransmit `[term_offset, term_offset + length)` of `term_id` in MTU
/// sized quanta.  Returns bytes sent.
#[allow(clippy::too_many_arguments)]
fn resend_range(
    log: &MappedRawLog,
    endpoint: &SendChannelEndpoint,
    initial_term_id: i32,
    _position_bits: u32,
    mtu: usize,
    term_id: i32,
    term_offset: i32,
    length: usize,
    counters: &SystemCounters,
) -> usize {
    let index = descriptor::index_by_term(initial_term_id, term_id);
    let meta = log.metadata_buffer();
    let raw_tail = descriptor::raw_tail_volatile(&meta, index);
    if descriptor::term_id_from_raw_tail(raw_tail) != term_id {
        // The term has been rotated away; the data is gone.
        return 0;
    }

    let term = log.term_buffer(index);
    let mut offset = term_offset as usize;
    let end = (term_offset as usize + length).min(log.term_length());
    let mut total = 0;

    while offset < end {
        let scan = term_scanner::scan_for_availability(&term, offset, mtu.min(end - offset));
        if scan.available == 0 {
            break;
        }
        match endpoint.send(term.as_slice(offset, scan.available)) {
            Ok(sent) if sent == scan.available => {
                total += scan.available;
                offset += scan.available + scan.padding;
            }
            _ => {
                counters.short_sends.increment();
                break;
            }
        }
    }

    if total > 0 {
        counters.retransmits_sent.increment();
        counters.retransmitted_bytes.add(total as i64);
    }
    total
}
