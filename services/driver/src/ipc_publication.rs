//! IPC publication: a stream carried purely through shared memory.
//!
//! No wire, no sender involvement: the Conductor owns the whole lifecycle.
//! The publisher limit tracks the minimum tethered subscriber position
//! plus a term window of at most half the term length.

use std::sync::Arc;

use cn_concurrent::Position;
use cn_logbuffer::descriptor::{self, EOS_NOT_SET};
use cn_logbuffer::MappedRawLog;

use crate::image::{SubscriberPosition, TetherState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcPublicationState {
    Active,
    Draining,
    Linger,
    Done,
}

/// Conductor-owned state for one IPC stream.
pub struct IpcPublication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub channel: String,
    pub is_exclusive: bool,
    /// Tag declared via `tags=<n>`, the target of `session-id=tag:<n>`
    /// references from other channels.
    pub entity_tag: Option<i64>,

    log: Arc<MappedRawLog>,
    publisher_limit: Position,
    publisher_position: Position,
    subscriber_positions: Vec<SubscriberPosition>,
    term_window_length: usize,
    term_length: usize,
    position_bits: u32,

    pub state: IpcPublicationState,
    pub time_of_last_state_change_ns: i64,
    /// Client publication handles referencing this stream.
    pub ref_count: usize,
    unblock_timeout_ns: i64,
    last_producer_position: i64,
    time_of_last_producer_change_ns: i64,
    /// Positions below this lie in zeroed (or never-written) partitions.
    /// The publisher limit never crosses it, so appenders cannot land in a
    /// partition still holding a previous term's frames.
    cleaned_limit: i64,
}

impl IpcPublication {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        initial_term_id: i32,
        channel: String,
        is_exclusive: bool,
        entity_tag: Option<i64>,
        log: Arc<MappedRawLog>,
        publisher_limit: Position,
        publisher_position: Position,
        term_window_length: usize,
        unblock_timeout_ns: i64,
        now_ns: i64,
    ) -> Self {
        let term_length = log.term_length();
        IpcPublication {
            registration_id,
            session_id,
            stream_id,
            initial_term_id,
            channel,
            is_exclusive,
            entity_tag,
            log,
            publisher_limit,
            publisher_position,
            subscriber_positions: Vec::new(),
            term_window_length: term_window_length.min(term_length / 2),
            term_length,
            position_bits: descriptor::position_bits_to_shift(term_length),
            state: IpcPublicationState::Active,
            time_of_last_state_change_ns: now_ns,
            ref_count: 1,
            unblock_timeout_ns,
            last_producer_position: 0,
            time_of_last_producer_change_ns: now_ns,
            cleaned_limit: (cn_logbuffer::PARTITION_COUNT * term_length) as i64,
        }
    }

    pub fn log(&self) -> &Arc<MappedRawLog> {
        &self.log
    }

    pub fn publisher_limit_counter_id(&self) -> i32 {
        self.publisher_limit.id()
    }

    pub fn subscriber_positions(&self) -> &[SubscriberPosition] {
        &self.subscriber_positions
    }

    pub fn subscriber_positions_mut(&mut self) -> &mut Vec<SubscriberPosition> {
        &mut self.subscriber_positions
    }

    /// The window untethered subscribers are measured against.
    pub fn subscriber_window(&self) -> usize {
        self.term_window_length
    }

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

    /// Lowest position any consumption-driving subscriber has reached.
    pub fn consumer_position(&self) -> i64 {
        self.subscriber_positions
            .iter()
            .filter(|p| p.drives_consumption())
            .map(|p| p.counter.get_volatile())
            .min()
            .unwrap_or_else(|| self.producer_position())
    }

    /// Pull the publisher limit forward: min consumer position plus the
    /// term window, capped so appenders never reach an uncleaned
    /// partition.  Called by the Conductor each duty cycle.
    pub fn update_publisher_limit(&mut self) -> usize {
        if self.state != IpcPublicationState::Active {
            return 0;
        }
        self.clean_ahead();
        // Claims may overshoot the limit by up to one max-length message,
        // so the cap stays a margin short of the cleaned region's edge.
        let cap = self.cleaned_limit - (self.term_length / 8) as i64;
        let proposed = (self.consumer_position() + self.term_window_length as i64).min(cap);
        if self.publisher_limit.propose_max_ordered(proposed) {
            1
        } else {
            0
        }
    }

    /// Zero the next recycled partition once every reader has left it,
    /// keeping at least one cleaned term of runway ahead of the producer.
    fn clean_ahead(&mut self) {
        let term_length = self.term_length as i64;
        if self.cleaned_limit - self.producer_position() >= term_length {
            return;
        }

        // The partition to zero holds positions [limit - 3T, limit - 2T);
        // every reader must be past its end.
        let min_reader = self
            .subscriber_positions
            .iter()
            .filter(|p| p.tether_state != TetherState::Resting)
            .map(|p| p.counter.get_volatile())
            .min()
            .unwrap_or_else(|| self.producer_position());
        if min_reader + 2 * term_length < self.cleaned_limit {
            return;
        }

        let index = descriptor::index_by_position(self.cleaned_limit, self.position_bits);
        let term = self.log.term_buffer(index);
        term.set_memory(0, self.term_length, 0);
        self.cleaned_limit += term_length;
    }

    /// Refresh the publisher position counter and connected flag.
    pub fn update_publisher_position(&mut self, now_ns: i64) {
        let position = self.producer_position();
        if position != self.last_producer_position {
            self.last_producer_position = position;
            self.time_of_last_producer_change_ns = now_ns;
        }
        self.publisher_position.set_ordered(position);

        let meta = self.log.metadata_buffer();
        let connected = self
            .subscriber_positions
            .iter()
            .any(|p| p.tether_state != TetherState::Resting);
        descriptor::set_is_connected(&meta, connected);
    }

    /// A publisher stalled mid-append past the unblock timeout gets its
    /// claimed frame padded over so subscribers can progress.
    pub fn check_for_blocked_publisher(&mut self, now_ns: i64) -> bool {
        let consumer = self.consumer_position();
        let producer = self.producer_position();
        if producer <= consumer {
            return false;
        }
        if now_ns - self.time_of_last_producer_change_ns < self.unblock_timeout_ns {
            return false;
        }

        let index = descriptor::index_by_position(consumer, self.position_bits);
        let term = self.log.term_buffer(index);
        let blocked_offset =
            descriptor::compute_term_offset_from_position(consumer, self.position_bits) as usize;
        let producer_term_begin = consumer - blocked_offset as i64;
        let tail_offset =
            ((producer - producer_term_begin).min(self.term_length as i64)) as usize;

        let term_id = descriptor::compute_term_id_from_position(
            consumer,
            self.position_bits,
            self.initial_term_id,
        );
        let unblocked = cn_logbuffer::term_unblocker::unblock(
            &term,
            blocked_offset,
            tail_offset,
            term_id,
            self.session_id,
            self.stream_id,
        );
        if unblocked {
            self.time_of_last_producer_change_ns = now_ns;
        }
        unblocked
    }

    /// End-of-stream position: set when the last publisher handle closes.
    pub fn end_of_stream(&mut self) {
        let meta = self.log.metadata_buffer();
        descriptor::set_end_of_stream_position(&meta, self.producer_position());
    }

    pub fn is_drained(&self) -> bool {
        let producer = self.producer_position();
        self.subscriber_positions
            .iter()
            .filter(|p| p.drives_consumption())
            .all(|p| p.counter.get_volatile() >= producer)
    }

    pub fn is_accepting_subscribers(&self) -> bool {
        matches!(
            self.state,
            IpcPublicationState::Active | IpcPublicationState::Draining
        )
    }

    pub fn end_of_stream_position(&self) -> i64 {
        let meta = self.log.metadata_buffer();
        let eos = descriptor::end_of_stream_position(&meta);
        if eos == EOS_NOT_SET {
            i64::MAX
        } else {
            eos
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::counters::VALUE_LENGTH;
    use cn_concurrent::{AlignedBuffer, AtomicCounter};
    use cn_logbuffer::descriptor::initialize;
    use cn_logbuffer::term_appender::TermAppender;
    use cn_protocol::frame;

    const TERM_LENGTH: usize = 64 * 1024;

    struct Fixture {
        publication: IpcPublication,
        values: AlignedBuffer,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("55.logbuffer");
        let log = Arc::new(MappedRawLog::create(&log_path, TERM_LENGTH).unwrap());
        initialize(
            &log.metadata_buffer(),
            55,
            0,
            TERM_LENGTH,
            4096,
            1408,
            5,
            10,
        );

        let values = AlignedBuffer::with_capacity(VALUE_LENGTH * 8);
        let publication = IpcPublication::new(
            55,
            5,
            10,
            0,
            "aeron:ipc".to_owned(),
            false,
            None,
            log,
            AtomicCounter::new(values.buffer(), 0),
            AtomicCounter::new(values.buffer(), 1),
            TERM_LENGTH / 2,
            1_000,
            0,
        );
        Fixture {
            publication,
            values,
            _dir: dir,
        }
    }

    fn subscriber(values: &AlignedBuffer, slot: i32) -> SubscriberPosition {
        SubscriberPosition {
            subscription_registration_id: slot as i64,
            counter: AtomicCounter::new(values.buffer(), slot),
            is_tether: true,
            tether_state: TetherState::Active,
            time_of_last_tether_change_ns: 0,
        }
    }

    #[test]
    fn publisher_limit_is_min_subscriber_plus_window() {
        let mut f = fixture();
        let sub = subscriber(&f.values, 2);
        sub.counter.set_ordered(1024);
        f.publication.subscriber_positions_mut().push(sub);

        assert_eq!(f.publication.update_publisher_limit(), 1);
        let limit = AtomicCounter::new(f.values.buffer(), 0);
        assert_eq!(limit.get(), 1024 + (TERM_LENGTH / 2) as i64);
    }

    #[test]
    fn limit_never_retreats_when_subscriber_leaves() {
        let mut f = fixture();
        let sub = subscriber(&f.values, 2);
        sub.counter.set_ordered(8192);
        f.publication.subscriber_positions_mut().push(sub);
        f.publication.update_publisher_limit();

        f.publication.subscriber_positions_mut().clear();
        f.publication.update_publisher_limit();
        let limit = AtomicCounter::new(f.values.buffer(), 0);
        assert_eq!(limit.get(), 8192 + (TERM_LENGTH / 2) as i64);
    }

    #[test]
    fn untethered_subscriber_does_not_govern_limit() {
        let mut f = fixture();
        let slow = SubscriberPosition {
            is_tether: false,
            ..subscriber(&f.values, 2)
        };
        let fast = subscriber(&f.values, 3);
        fast.counter.set_ordered(32 * 1024);
        f.publication.subscriber_positions_mut().push(slow);
        f.publication.subscriber_positions_mut().push(fast);

        f.publication.update_publisher_limit();
        let limit = AtomicCounter::new(f.values.buffer(), 0);
        assert_eq!(limit.get(), (32 * 1024 + TERM_LENGTH / 2) as i64);
    }

    #[test]
    fn blocked_publisher_is_padded_out_after_timeout() {
        let mut f = fixture();
        let sub = subscriber(&f.values, 2);
        f.publication.subscriber_positions_mut().push(sub);

        // Publisher claims 64 bytes then stalls: bump the tail directly
        // without committing a frame.
        let meta = f.publication.log().metadata_buffer();
        meta.get_and_add_i64(cn_logbuffer::descriptor::tail_counter_offset(0), 64);
        assert_eq!(f.publication.producer_position(), 64);

        assert!(
            !f.publication.check_for_blocked_publisher(500),
            "unblock timeout not reached"
        );
        // The producer made no progress; past the timeout the claim is
        // padded over.
        assert!(f.publication.check_for_blocked_publisher(2_000));

        let term = f.publication.log().term_buffer(0);
        assert_eq!(
            cn_logbuffer::frame_descriptor::frame_length_volatile(&term, 0),
            64
        );
        assert!(cn_logbuffer::frame_descriptor::is_padding_frame(&term, 0));
    }

    #[test]
    fn drained_when_all_subscribers_reach_producer() {
        let mut f = fixture();
        let header = frame::default_data_header(5, 10, 0);
        let appender = TermAppender::new(
            f.publication.log().term_buffer(0),
            f.publication.log().metadata_buffer(),
            0,
        );
        appender.append_unfragmented(&header, b"data", 0);

        let sub = subscriber(&f.values, 2);
        f.publication.subscriber_positions_mut().push(sub);
        assert!(!f.publication.is_drained());

        let sub_pos = AtomicCounter::new(f.values.buffer(), 2);
        sub_pos.set_ordered(f.publication.producer_position());
        assert!(f.publication.is_drained());
    }
}
