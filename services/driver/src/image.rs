//! Publication image: the receiver side of one inbound stream.
//!
//! Rebuilds the remote publisher's terms from DATA packets, tracks the
//! high-water mark and the contiguous rebuild position, schedules NAKs for
//! gaps, and feeds status messages (consumption position + receiver
//! window) back to the sender.
//!
//! Owned by the Receiver.  The Conductor observes it through counters and
//! a small shared atomic block, and manages subscriber position links
//! under a rarely-contended lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use cn_concurrent::Position;
use cn_logbuffer::descriptor;
use cn_logbuffer::{frame_descriptor, term_rebuilder, MappedRawLog, PARTITION_COUNT};
use cn_protocol::frame::{self, DataHeader, NakFrame, RttMeasurement, StatusMessage};

use crate::congestion::CongestionControl;
use crate::loss_detector::LossDetector;
use crate::media::receive_endpoint::ReceiveChannelEndpoint;
use crate::system_counters::SystemCounters;

// ---------------------------------------------------------------------------
// Image lifecycle
// ---------------------------------------------------------------------------

pub const IMAGE_STATE_INIT: i32 = 0;
pub const IMAGE_STATE_ACTIVE: i32 = 1;
pub const IMAGE_STATE_DRAINING: i32 = 2;
pub const IMAGE_STATE_LINGER: i32 = 3;
pub const IMAGE_STATE_DONE: i32 = 4;

/// Cross-agent view: written by the Receiver, read by the Conductor.
pub struct ImageSharedState {
    pub state: AtomicI32,
    pub time_of_last_state_change_ns: AtomicI64,
    pub time_of_last_packet_ns: AtomicI64,
    pub is_end_of_stream: AtomicI32,
    pub eos_position: AtomicI64,
    /// Total gap bytes observed, for the loss report.
    pub loss_bytes_observed: AtomicI64,
}

impl ImageSharedState {
    pub fn new(now_ns: i64) -> Self {
        ImageSharedState {
            state: AtomicI32::new(IMAGE_STATE_INIT),
            time_of_last_state_change_ns: AtomicI64::new(now_ns),
            time_of_last_packet_ns: AtomicI64::new(now_ns),
            is_end_of_stream: AtomicI32::new(0),
            eos_position: AtomicI64::new(i64::MAX),
            loss_bytes_observed: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> i32 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, state: i32, now_ns: i64) {
        self.state.store(state, Ordering::Release);
        self.time_of_last_state_change_ns
            .store(now_ns, Ordering::Release);
    }
}

/// Untethered subscriber window state, driven by the Conductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherState {
    Active,
    Linger,
    Resting,
}

/// One subscriber's position link on an image.
pub struct SubscriberPosition {
    pub subscription_registration_id: i64,
    pub counter: Position,
    pub is_tether: bool,
    pub tether_state: TetherState,
    pub time_of_last_tether_change_ns: i64,
}

impl SubscriberPosition {
    /// Only tethered subscribers participate in consumption (status
    /// messages and publisher limits); untethered ones never hold the
    /// stream back.
    pub fn drives_consumption(&self) -> bool {
        self.is_tether
    }
}

/// Receiver-owned state for one inbound stream.
pub struct PublicationImage {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub endpoint_id: usize,
    pub control_address: SocketAddr,
    pub source_identity: String,
    pub term_length: usize,
    pub position_bits: u32,
    pub is_reliable: bool,
    pub group_tag: Option<i64>,

    log: Arc<MappedRawLog>,
    hwm_position: Position,
    rebuild_position: Position,
    subscriber_positions: Arc<Mutex<Vec<SubscriberPosition>>>,
    loss_detector: LossDetector,
    congestion: Box<dyn CongestionControl>,
    receiver_id: i64,

    window_length: usize,
    last_sm_position: i64,
    last_sm_window: usize,
    next_sm_deadline_ns: i64,
    sm_timeout_ns: i64,

    naks_sent: u64,
    shared: Arc<ImageSharedState>,
    /// Positions below this lie in zeroed (or never-written) partitions.
    cleaned_limit: i64,
    frame_scratch: Vec<u8>,
}

impl PublicationImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        active_term_id: i32,
        initial_term_offset: i32,
        endpoint_id: usize,
        control_address: SocketAddr,
        source_identity: String,
        log: Arc<MappedRawLog>,
        hwm_position: Position,
        rebuild_position: Position,
        subscriber_positions: Arc<Mutex<Vec<SubscriberPosition>>>,
        loss_detector: LossDetector,
        congestion: Box<dyn CongestionControl>,
        receiver_id: i64,
        is_reliable: bool,
        group_tag: Option<i64>,
        sm_timeout_ns: i64,
        shared: Arc<ImageSharedState>,
    ) -> Self {
        let term_length = log.term_length();
        let position_bits = descriptor::position_bits_to_shift(term_length);
        let join_position = descriptor::compute_position(
            active_term_id,
            initial_term_offset,
            position_bits,
            initial_term_id,
        );
        hwm_position.set_ordered(join_position);
        rebuild_position.set_ordered(join_position);
        let window_length = congestion.initial_window_length();
        let join_term_begin = join_position - (join_position & (term_length as i64 - 1));
        let cleaned_limit = join_term_begin + (PARTITION_COUNT * term_length) as i64;

        PublicationImage {
            correlation_id,
            session_id,
            stream_id,
            initial_term_id,
            endpoint_id,
            control_address,
            source_identity,
            term_length,
            position_bits,
            is_reliable,
            group_tag,
            log,
            hwm_position,
            rebuild_position,
            subscriber_positions,
            loss_detector,
            congestion,
            receiver_id,
            window_length,
            last_sm_position: join_position,
            last_sm_window: window_length,
            next_sm_deadline_ns: 0,
            sm_timeout_ns,
            naks_sent: 0,
            shared,
            cleaned_limit,
            frame_scratch: vec![0u8; 64],
        }
    }

    pub fn shared(&self) -> Arc<ImageSharedState> {
        Arc::clone(&self.shared)
    }

    pub fn log(&self) -> &Arc<MappedRawLog> {
        &self.log
    }

    pub fn hwm_position_value(&self) -> i64 {
        self.hwm_position.get()
    }

    pub fn rebuild_position_value(&self) -> i64 {
        self.rebuild_position.get()
    }

    pub fn naks_sent(&self) -> u64 {
        self.naks_sent
    }

    // -----------------------------------------------------------------------
    // Inbound data
    // -----------------------------------------------------------------------

    /// Insert one datagram of DATA frames (or a heartbeat) at
    /// `(term_id, term_offset)`.  Returns bytes accepted.
    pub fn on_data(
        &mut self,
        header: &DataHeader,
        packet: &[u8],
        now_ns: i64,
        counters: &SystemCounters,
    ) -> usize {
        let packet_position = descriptor::compute_position(
            header.term_id,
            header.term_offset,
            self.position_bits,
            self.initial_term_id,
        );
        let rebuild = self.rebuild_position.get();

        self.shared
            .time_of_last_packet_ns
            .store(now_ns, Ordering::Release);

        if header.is_heartbeat() {
            counters.heartbeats_received.increment();
            self.hwm_position.propose_max_ordered(packet_position);
            if header.is_end_of_stream() || header.flags & frame::REVOKED_FLAG != 0 {
                self.shared.is_end_of_stream.store(1, Ordering::Release);
                self.shared
                    .eos_position
                    .fetch_min(packet_position, Ordering::AcqRel);
            }
            return 0;
        }

        // Window validation: reject wholly-stale packets and anything past
        // the receiver's advertised window by more than a term.
        let proposed = packet_position + packet.len() as i64;
        if proposed <= rebuild {
            return 0;
        }
        if proposed > self.last_sm_position + self.term_length as i64 {
            counters.invalid_packets.increment();
            return 0;
        }
        if proposed > self.cleaned_limit && !self.clean_ahead() {
            // The target partition still holds frames a subscriber may be
            // reading; the gap recovers via retransmission.
            return 0;
        }

        let index = descriptor::index_by_position(packet_position, self.position_bits);
        let term = self.log.term_buffer(index);
        term_rebuilder::insert(&term, header.term_offset as usize, packet);

        self.hwm_position.propose_max_ordered(proposed);
        if header.is_end_of_stream() {
            self.shared.is_end_of_stream.store(1, Ordering::Release);
            self.shared
                .eos_position
                .fetch_min(proposed, Ordering::AcqRel);
        }

        self.update_rebuild_position();
        counters.bytes_received.add(packet.len() as i64);
        packet.len()
    }

    /// Zero the next recycled partition once every subscriber is past it.
    /// Returns `true` if the cleaned region advanced.
    fn clean_ahead(&mut self) -> bool {
        let term_length = self.term_length as i64;
        let min_subscriber = {
            let positions = self
                .subscriber_positions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            positions
                .iter()
                .filter(|p| p.tether_state != TetherState::Resting)
                .map(|p| p.counter.get_volatile())
                .min()
                .unwrap_or_else(|| self.rebuild_position.get())
        };
        // The partition to zero holds [limit - 3T, limit - 2T).
        if min_subscriber + 2 * term_length < self.cleaned_limit {
            return false;
        }

        let index = descriptor::index_by_position(self.cleaned_limit, self.position_bits);
        let term = self.log.term_buffer(index);
        term.set_memory(0, self.term_length, 0);
        self.cleaned_limit += term_length;
        true
    }

    /// Advance the rebuild position over contiguous committed frames,
    /// rotating through term boundaries.
    fn update_rebuild_position(&mut self) {
        let hwm = self.hwm_position.get();
        let mut position = self.rebuild_position.get();

        while position < hwm {
            let index = descriptor::index_by_position(position, self.position_bits);
            let term = self.log.term_buffer(index);
            let offset =
                descriptor::compute_term_offset_from_position(position, self.position_bits)
                    as usize;

            let frame_length = frame_descriptor::frame_length_volatile(&term, offset);
            if frame_length <= 0 {
                break;
            }
            position += cn_concurrent::align(
                frame_length as usize,
                frame_descriptor::FRAME_ALIGNMENT,
            ) as i64;
        }

        self.rebuild_position.set_ordered(position);
    }

    // -----------------------------------------------------------------------
    // Outbound control
    // -----------------------------------------------------------------------

    /// Emit a status message when consumption has advanced past a quarter
    /// window, the window changed, or the SM timeout expired.
    pub fn send_pending_status_message(
        &mut self,
        endpoint: &ReceiveChannelEndpoint,
        now_ns: i64,
        counters: &SystemCounters,
    ) -> usize {
        let consumption = self.consumption_position();
        let (window, force) = self.congestion.on_track_rebuild(now_ns, consumption);
        let threshold = (window / 4) as i64;

        let due = force
            || window != self.last_sm_window
            || consumption > self.last_sm_position + threshold
            || now_ns >= self.next_sm_deadline_ns;
        if !due {
            return 0;
        }

        let term_id = descriptor::compute_term_id_from_position(
            consumption,
            self.position_bits,
            self.initial_term_id,
        );
        let term_offset =
            descriptor::compute_term_offset_from_position(consumption, self.position_bits);

        let sm = StatusMessage {
            flags: 0,
            session_id: self.session_id,
            stream_id: self.stream_id,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window as i32,
            receiver_id: self.receiver_id,
            group_tag: self.group_tag,
        };
        let len = sm.encode(&mut self.frame_scratch);
        if endpoint
            .send_to(&self.frame_scratch[..len], self.control_address)
            .is_ok()
        {
            self.last_sm_position = consumption;
            self.last_sm_window = window;
            self.window_length = window;
            self.next_sm_deadline_ns = now_ns + self.sm_timeout_ns;
            counters.status_messages_sent.increment();
            1
        } else {
            0
        }
    }

    /// Scan for gaps and emit NAKs (reliable streams) or fill the gap with
    /// padding so consumption can skip it (unreliable streams).
    pub fn process_pending_loss(
        &mut self,
        endpoint: &ReceiveChannelEndpoint,
        now_ns: i64,
        counters: &SystemCounters,
    ) -> usize {
        let rebuild = self.rebuild_position.get();
        let hwm = self.hwm_position.get();
        if rebuild >= hwm {
            return 0;
        }

        let term_id = descriptor::compute_term_id_from_position(
            rebuild,
            self.position_bits,
            self.initial_term_id,
        );
        let index = descriptor::index_by_position(rebuild, self.position_bits);
        let term = self.log.term_buffer(index);
        let rebuild_offset =
            descriptor::compute_term_offset_from_position(rebuild, self.position_bits) as usize;

        let term_begin = rebuild - rebuild_offset as i64;
        let limit_offset = (hwm - term_begin).min(self.term_length as i64) as usize;

        let mut work = 0;
        let session_id = self.session_id;
        let stream_id = self.stream_id;
        let control_address = self.control_address;
        let is_reliable = self.is_reliable;
        let mut naks = 0u64;
        let scratch = &mut self.frame_scratch;
        let shared = &self.shared;

        self.loss_detector.scan(
            &term,
            term_id,
            rebuild_offset,
            limit_offset,
            now_ns,
            |gap_term_id, gap_offset, gap_length| {
                shared
                    .loss_bytes_observed
                    .fetch_add(gap_length as i64, Ordering::AcqRel);
                if is_reliable {
                    let nak = NakFrame {
                        session_id,
                        stream_id,
                        term_id: gap_term_id,
                        term_offset: gap_offset as i32,
                        length: gap_length as i32,
                    };
                    let len = nak.encode(scratch);
                    if endpoint.send_to(&scratch[..len], control_address).is_ok() {
                        naks += 1;
                        counters.naks_sent.increment();
                    }
                } else {
                    // Unreliable: give up on the gap and let consumption
                    // pass over it.
                    frame_descriptor::write_padding_frame(
                        &term,
                        gap_offset,
                        gap_length,
                        gap_term_id,
                        session_id,
                        stream_id,
                    );
                }
                work += 1;
            },
        );

        self.naks_sent += naks;
        if !self.is_reliable && work > 0 {
            self.update_rebuild_position();
        }
        work
    }

    /// Initiate an RTT probe when congestion control asks for one.
    pub fn send_pending_rtt(
        &mut self,
        endpoint: &ReceiveChannelEndpoint,
        now_ns: i64,
    ) -> usize {
        if !self.congestion.should_measure_rtt(now_ns) {
            return 0;
        }
        let probe = RttMeasurement {
            flags: 0,
            session_id: self.session_id,
            stream_id: self.stream_id,
            echo_timestamp_ns: now_ns,
            reception_delta_ns: 0,
            receiver_id: self.receiver_id,
        };
        let len = probe.encode(&mut self.frame_scratch);
        usize::from(
            endpoint
                .send_to(&self.frame_scratch[..len], self.control_address)
                .is_ok(),
        )
    }

    /// An RTT reply from the sender.
    pub fn on_rtt_reply(&mut self, rtt: &RttMeasurement, src: SocketAddr, now_ns: i64) {
        let rtt_ns = now_ns - rtt.echo_timestamp_ns - rtt.reception_delta_ns;
        self.congestion.on_rtt_measurement(now_ns, rtt_ns.max(0), src);
    }

    /// Confirm a repeated SETUP for a live image.  A changed term length is
    /// rejected and counted.
    pub fn on_setup(&mut self, term_length: usize, now_ns: i64, counters: &SystemCounters) -> bool {
        if term_length != self.term_length {
            counters.invalid_packets.increment();
            return false;
        }
        if self.shared.state() == IMAGE_STATE_INIT {
            self.shared.set_state(IMAGE_STATE_ACTIVE, now_ns);
        }
        true
    }

    /// Min position over the subscribers that participate in flow control;
    /// falls back to the rebuild position when none do.
    pub fn consumption_position(&self) -> i64 {
        let positions = self
            .subscriber_positions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        positions
            .iter()
            .filter(|p| p.drives_consumption())
            .map(|p| p.counter.get_volatile())
            .min()
            .unwrap_or_else(|| self.rebuild_position.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::StaticWindowCongestionControl;
    use crate::loss_detector::StaticDelayGenerator;
    use crate::media::udp_transport::UdpTransport;
    use crate::system_counters::SystemCounters;
    use cn_concurrent::counters::{METADATA_LENGTH, VALUE_LENGTH};
    use cn_concurrent::{AlignedBuffer, AtomicCounter, CountersManager};
    use cn_logbuffer::descriptor::initialize;
    use cn_protocol::frame::{DATA_HEADER_LENGTH, HDR_TYPE_DATA, UNFRAGMENTED};

    const TERM_LENGTH: usize = 64 * 1024;
    const INITIAL_TERM_ID: i32 = 7;
    const SESSION_ID: i32 = 100;
    const STREAM_ID: i32 = 42;

    struct Fixture {
        image: PublicationImage,
        endpoint: ReceiveChannelEndpoint,
        counters: SystemCounters,
        positions: Arc<Mutex<Vec<SubscriberPosition>>>,
        values_mem: AlignedBuffer,
        _meta_mem: AlignedBuffer,
        _dir: tempfile::TempDir,
    }

    fn fixture(nak_delay_ns: i64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("99.logbuffer");
        let log = Arc::new(MappedRawLog::create(&log_path, TERM_LENGTH).unwrap());
        let meta = log.metadata_buffer();
        initialize(&meta, 99, INITIAL_TERM_ID, TERM_LENGTH, 4096, 1408, SESSION_ID, STREAM_ID);

        let meta_mem = AlignedBuffer::with_capacity(METADATA_LENGTH * 64);
        let values_mem = AlignedBuffer::with_capacity(VALUE_LENGTH * 64);
        let mut manager = CountersManager::new(meta_mem.buffer(), values_mem.buffer(), 0);
        let counters = SystemCounters::allocate(&mut manager, 0).unwrap();
        let hwm_id = manager.allocate(5, &[], "rcv-hwm", 0).unwrap();
        let rebuild_id = manager.allocate(6, &[], "rcv-pos", 0).unwrap();
        let sub_pos_id = manager.allocate(4, &[], "sub-pos", 0).unwrap();
        let status_id = manager.allocate(9, &[], "rcv-status", 0).unwrap();

        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap(), None, 0, 0, 0).unwrap(),
        );
        let endpoint = ReceiveChannelEndpoint::new(
            3,
            "UDP-test".to_owned(),
            transport,
            0xDD,
            manager.counter(status_id),
        );

        let positions = Arc::new(Mutex::new(vec![SubscriberPosition {
            subscription_registration_id: 1,
            counter: manager.counter(sub_pos_id),
            is_tether: true,
            tether_state: TetherState::Active,
            time_of_last_tether_change_ns: 0,
        }]));

        let image = PublicationImage::new(
            99,
            SESSION_ID,
            STREAM_ID,
            INITIAL_TERM_ID,
            INITIAL_TERM_ID,
            0,
            3,
            "127.0.0.1:9999".parse().unwrap(),
            "127.0.0.1:9999".to_owned(),
            log,
            manager.counter(hwm_id),
            manager.counter(rebuild_id),
            Arc::clone(&positions),
            LossDetector::new(Box::new(StaticDelayGenerator::new(nak_delay_ns)), 1_000),
            Box::new(StaticWindowCongestionControl::new(16 * 1024, TERM_LENGTH).unwrap()),
            0xDD,
            true,
            None,
            200_000_000,
            Arc::new(ImageSharedState::new(0)),
        );

        Fixture {
            image,
            endpoint,
            counters,
            positions,
            values_mem,
            _meta_mem: meta_mem,
            _dir: dir,
        }
    }

    fn data_packet(term_id: i32, term_offset: i32, payload: &[u8]) -> (DataHeader, Vec<u8>) {
        let frame_length = DATA_HEADER_LENGTH + payload.len();
        let aligned = cn_concurrent::align(frame_length, 32);
        let mut buf = vec![0u8; aligned];
        let header = DataHeader {
            frame_length: frame_length as i32,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset,
            session_id: SESSION_ID,
            stream_id: STREAM_ID,
            term_id,
            reserved_value: 0,
        };
        header.encode(&mut buf);
        buf[DATA_HEADER_LENGTH..DATA_HEADER_LENGTH + payload.len()].copy_from_slice(payload);
        (header, buf)
    }

    #[test]
    fn in_order_data_advances_hwm_and_rebuild_together() {
        let mut f = fixture(0);
        let (h, p) = data_packet(INITIAL_TERM_ID, 0, b"hello");
        f.image.on_data(&h, &p, 1, &f.counters);

        assert_eq!(f.image.hwm_position_value(), 64);
        assert_eq!(f.image.rebuild_position_value(), 64);
    }

    #[test]
    fn gap_holds_rebuild_while_hwm_advances() {
        let mut f = fixture(0);
        let (h_a, p_a) = data_packet(INITIAL_TERM_ID, 0, &[1u8; 32]);
        let (h_c, p_c) = data_packet(INITIAL_TERM_ID, 128, &[3u8; 32]);

        f.image.on_data(&h_a, &p_a, 1, &f.counters);
        f.image.on_data(&h_c, &p_c, 2, &f.counters);

        assert_eq!(f.image.hwm_position_value(), 192);
        assert_eq!(f.image.rebuild_position_value(), 64);

        // The missing frame lands; rebuild catches up to the hwm.
        let (h_b, p_b) = data_packet(INITIAL_TERM_ID, 64, &[2u8; 32]);
        f.image.on_data(&h_b, &p_b, 3, &f.counters);
        assert_eq!(f.image.rebuild_position_value(), 192);
    }

    #[test]
    fn nak_is_sent_for_gap_after_delay() {
        let mut f = fixture(0);
        let (h_a, p_a) = data_packet(INITIAL_TERM_ID, 0, &[1u8; 32]);
        let (h_c, p_c) = data_packet(INITIAL_TERM_ID, 128, &[3u8; 32]);
        f.image.on_data(&h_a, &p_a, 1, &f.counters);
        f.image.on_data(&h_c, &p_c, 2, &f.counters);

        let work = f.image.process_pending_loss(&f.endpoint, 10, &f.counters);
        assert_eq!(work, 1);
        assert_eq!(f.image.naks_sent(), 1);
        let reader = AtomicCounter::new(f.values_mem.buffer(), f.counters.naks_sent.id());
        assert_eq!(reader.get(), 1);
    }

    #[test]
    fn nak_for_satisfied_gap_is_not_repeated() {
        let mut f = fixture(0);
        let (h_a, p_a) = data_packet(INITIAL_TERM_ID, 0, &[1u8; 32]);
        let (h_c, p_c) = data_packet(INITIAL_TERM_ID, 128, &[3u8; 32]);
        f.image.on_data(&h_a, &p_a, 1, &f.counters);
        f.image.on_data(&h_c, &p_c, 2, &f.counters);
        f.image.process_pending_loss(&f.endpoint, 10, &f.counters);

        let (h_b, p_b) = data_packet(INITIAL_TERM_ID, 64, &[2u8; 32]);
        f.image.on_data(&h_b, &p_b, 3, &f.counters);

        assert_eq!(
            f.image.process_pending_loss(&f.endpoint, 5_000, &f.counters),
            0
        );
        assert_eq!(f.image.naks_sent(), 1);
    }

    #[test]
    fn heartbeat_advances_hwm_only_and_eos_is_latched() {
        let mut f = fixture(0);
        let (h_a, p_a) = data_packet(INITIAL_TERM_ID, 0, &[1u8; 32]);
        f.image.on_data(&h_a, &p_a, 1, &f.counters);

        let mut hb = DataHeader {
            frame_length: DATA_HEADER_LENGTH as i32,
            flags: frame::EOS_FLAG,
            frame_type: HDR_TYPE_DATA,
            term_offset: 64,
            session_id: SESSION_ID,
            stream_id: STREAM_ID,
            term_id: INITIAL_TERM_ID,
            reserved_value: 0,
        };
        let mut buf = vec![0u8; DATA_HEADER_LENGTH];
        hb.encode(&mut buf);
        hb = DataHeader::decode(&buf).unwrap();

        f.image.on_data(&hb, &buf, 2, &f.counters);
        assert_eq!(f.image.hwm_position_value(), 64);
        assert_eq!(f.image.shared().eos_position.load(Ordering::Acquire), 64);
    }

    #[test]
    fn stale_and_out_of_window_packets_are_dropped() {
        let mut f = fixture(0);
        let (h_a, p_a) = data_packet(INITIAL_TERM_ID, 0, &[1u8; 32]);
        f.image.on_data(&h_a, &p_a, 1, &f.counters);
        // Replay of the same packet: accepted by the rebuilder as a no-op,
        // but wholly-stale data must not move positions.
        f.image.on_data(&h_a, &p_a, 2, &f.counters);
        assert_eq!(f.image.hwm_position_value(), 64);

        // A term ahead of the window is rejected.
        let (h_far, p_far) = data_packet(INITIAL_TERM_ID + 1, 0, &[9u8; 32]);
        f.image.on_data(&h_far, &p_far, 3, &f.counters);
        assert_eq!(f.image.hwm_position_value(), 64);
    }

    #[test]
    fn setup_with_different_term_length_is_rejected() {
        let mut f = fixture(0);
        assert!(f.image.on_setup(TERM_LENGTH, 1, &f.counters));
        assert!(!f.image.on_setup(TERM_LENGTH * 2, 2, &f.counters));
        let reader = AtomicCounter::new(f.values_mem.buffer(), f.counters.invalid_packets.id());
        assert_eq!(reader.get(), 1);
    }

    #[test]
    fn consumption_follows_min_tethered_subscriber() {
        let mut f = fixture(0);
        let (h, p) = data_packet(INITIAL_TERM_ID, 0, &[1u8; 100]);
        f.image.on_data(&h, &p, 1, &f.counters);

        {
            let positions = f.positions.lock().unwrap();
            positions[0].counter.set_ordered(64);
        }
        assert_eq!(f.image.consumption_position(), 64);

        // An untethered resting subscriber does not hold consumption back.
        {
            let mut positions = f.positions.lock().unwrap();
            positions[0].is_tether = false;
            positions[0].tether_state = TetherState::Resting;
        }
        assert_eq!(
            f.image.consumption_position(),
            f.image.rebuild_position_value()
        );
    }
}
