//! Loss detector: per-image gap scanning and NAK scheduling.
//!
//! When a gap opens between the rebuild position and the high-water mark,
//! the detector waits a feedback delay before emitting a NAK (giving
//! retransmits in flight a chance to land).  An unanswered gap re-NAKs on
//! the retry delay until filled; every re-NAK resets the timer.

use cn_concurrent::AtomicBuffer;
use cn_logbuffer::term_gap_scanner;
use rand::Rng;

/// How long to wait before (re)emitting feedback for a gap.
pub trait FeedbackDelayGenerator: Send {
    fn generate_delay_ns(&mut self) -> i64;
}

/// Fixed delay: the unicast default and, per the response-control-mode
/// convention, the multicast default as well.
pub struct StaticDelayGenerator {
    delay_ns: i64,
}

impl StaticDelayGenerator {
    pub fn new(delay_ns: i64) -> Self {
        StaticDelayGenerator { delay_ns }
    }
}

impl FeedbackDelayGenerator for StaticDelayGenerator {
    fn generate_delay_ns(&mut self) -> i64 {
        self.delay_ns
    }
}

/// Randomized multicast backoff so a receiver group does not NAK in
/// lockstep.
pub struct MulticastBackoffDelayGenerator {
    max_backoff_ns: i64,
}

impl MulticastBackoffDelayGenerator {
    pub fn new(max_backoff_ns: i64) -> Self {
        MulticastBackoffDelayGenerator { max_backoff_ns }
    }
}

impl FeedbackDelayGenerator for MulticastBackoffDelayGenerator {
    fn generate_delay_ns(&mut self) -> i64 {
        rand::thread_rng().gen_range(0..=self.max_backoff_ns.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gap {
    term_id: i32,
    term_offset: usize,
    length: usize,
}

/// Gap state for one image.
pub struct LossDetector {
    delay_generator: Box<dyn FeedbackDelayGenerator>,
    retry_delay_ns: i64,
    active_gap: Option<Gap>,
    deadline_ns: i64,
}

impl LossDetector {
    pub fn new(delay_generator: Box<dyn FeedbackDelayGenerator>, retry_delay_ns: i64) -> Self {
        LossDetector {
            delay_generator,
            retry_delay_ns,
            active_gap: None,
            deadline_ns: i64::MAX,
        }
    }

    /// Scan the rebuild term for a gap and drive the NAK timer.
    ///
    /// `limit_offset` is the high-water mark clamped to this term.  Calls
    /// `on_loss(term_id, term_offset, length)` when a NAK should be sent
    /// now.  Returns `true` while a gap is outstanding.
    pub fn scan<F>(
        &mut self,
        term: &AtomicBuffer,
        term_id: i32,
        rebuild_offset: usize,
        limit_offset: usize,
        now_ns: i64,
        mut on_loss: F,
    ) -> bool
    where
        F: FnMut(i32, usize, usize),
    {
        let mut scanned_gap = None;
        term_gap_scanner::scan_for_gap(term, term_id, rebuild_offset, limit_offset, |t, o, l| {
            scanned_gap = Some(Gap {
                term_id: t,
                term_offset: o,
                length: l,
            });
        });

        match scanned_gap {
            None => {
                self.active_gap = None;
                self.deadline_ns = i64::MAX;
                false
            }
            Some(gap) => {
                if self.active_gap != Some(gap) {
                    // New (or moved) gap: arm the initial feedback delay.
                    self.active_gap = Some(gap);
                    let delay = self.delay_generator.generate_delay_ns();
                    if delay == 0 {
                        on_loss(gap.term_id, gap.term_offset, gap.length);
                        self.deadline_ns = now_ns + self.retry_delay_ns;
                    } else {
                        self.deadline_ns = now_ns + delay;
                    }
                } else if now_ns >= self.deadline_ns {
                    on_loss(gap.term_id, gap.term_offset, gap.length);
                    self.deadline_ns = now_ns + self.retry_delay_ns;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::AlignedBuffer;
    use cn_logbuffer::term_rebuilder;
    use cn_protocol::frame::{DataHeader, DATA_HEADER_LENGTH, HDR_TYPE_DATA, UNFRAGMENTED};

    fn packet(term_offset: i32, payload_len: usize) -> Vec<u8> {
        let frame_length = DATA_HEADER_LENGTH + payload_len;
        let mut buf = vec![0u8; frame_length];
        DataHeader {
            frame_length: frame_length as i32,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset,
            session_id: 1,
            stream_id: 2,
            term_id: 7,
            reserved_value: 0,
        }
        .encode(&mut buf);
        buf
    }

    fn detector(delay_ns: i64, retry_ns: i64) -> LossDetector {
        LossDetector::new(Box::new(StaticDelayGenerator::new(delay_ns)), retry_ns)
    }

    #[test]
    fn nak_emitted_after_initial_delay() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 0, &packet(0, 32));
        term_rebuilder::insert(&term, 128, &packet(128, 32));

        let mut det = detector(100, 1_000);
        let mut naks = Vec::new();

        assert!(det.scan(&term, 7, 0, 192, 0, |t, o, l| naks.push((t, o, l))));
        assert!(naks.is_empty(), "initial delay not elapsed");

        det.scan(&term, 7, 0, 192, 99, |t, o, l| naks.push((t, o, l)));
        assert!(naks.is_empty());

        det.scan(&term, 7, 0, 192, 100, |t, o, l| naks.push((t, o, l)));
        assert_eq!(naks, vec![(7, 64, 64)]);
    }

    #[test]
    fn unanswered_gap_renaks_on_retry_delay() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 128, &packet(128, 32));

        let mut det = detector(0, 500);
        let mut naks = 0;

        det.scan(&term, 7, 0, 192, 0, |_, _, _| naks += 1);
        assert_eq!(naks, 1, "zero delay emits immediately");

        det.scan(&term, 7, 0, 192, 499, |_, _, _| naks += 1);
        assert_eq!(naks, 1, "suppressed until retry delay");

        det.scan(&term, 7, 0, 192, 500, |_, _, _| naks += 1);
        assert_eq!(naks, 2);
    }

    #[test]
    fn filled_gap_clears_state() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 128, &packet(128, 32));

        let mut det = detector(0, 500);
        let mut naks = 0;
        det.scan(&term, 7, 0, 192, 0, |_, _, _| naks += 1);
        assert_eq!(naks, 1);

        // The missing frames arrive.
        term_rebuilder::insert(&term, 0, &packet(0, 32));
        term_rebuilder::insert(&term, 64, &packet(64, 32));
        assert!(!det.scan(&term, 7, 0, 192, 1_000, |_, _, _| naks += 1));
        assert_eq!(naks, 1);
    }

    #[test]
    fn moved_gap_rearms_the_delay() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 128, &packet(128, 32));

        let mut det = detector(50, 1_000);
        let mut naks = Vec::new();
        det.scan(&term, 7, 0, 192, 0, |_, o, _| naks.push(o));

        // First gap fills before the delay elapses; a later gap appears.
        term_rebuilder::insert(&term, 0, &packet(0, 32));
        term_rebuilder::insert(&term, 64, &packet(64, 32));
        term_rebuilder::insert(&term, 256, &packet(256, 32));

        det.scan(&term, 7, 0, 320, 10, |_, o, _| naks.push(o));
        assert!(naks.is_empty(), "new gap must wait its own delay");

        det.scan(&term, 7, 0, 320, 70, |_, o, _| naks.push(o));
        assert_eq!(naks, vec![192]);
    }

    #[test]
    fn multicast_backoff_stays_in_range() {
        let mut generator = MulticastBackoffDelayGenerator::new(1_000_000);
        for _ in 0..100 {
            let delay = generator.generate_delay_ns();
            assert!((0..=1_000_000).contains(&delay));
        }
    }
}
