//! Congestion control for publication images.
//!
//! Decides the receiver window advertised in status messages and when to
//! probe round-trip time.  The default static strategy keeps a fixed
//! window of `min(initial window, term length / 2)` and probes RTT at a
//! steady cadence for observability.

use std::net::SocketAddr;

/// Interval between RTT probes for the static strategy.
const RTT_MEASUREMENT_INTERVAL_NS: i64 = 1_000_000_000;

/// Pluggable congestion control per image.
pub trait CongestionControl: Send {
    fn initial_window_length(&self) -> usize;

    fn max_window_length(&self) -> usize;

    /// Called as the rebuild position advances.  Returns the window to
    /// advertise and whether an immediate status message is required.
    fn on_track_rebuild(&mut self, now_ns: i64, rebuild_position: i64) -> (usize, bool);

    /// `true` when an RTT probe should be emitted this cycle.
    fn should_measure_rtt(&mut self, now_ns: i64) -> bool;

    /// An RTT reply arrived.
    fn on_rtt_measurement(&mut self, now_ns: i64, rtt_ns: i64, sender_addr: SocketAddr);
}

/// Fixed-window congestion control.
pub struct StaticWindowCongestionControl {
    window_length: usize,
    next_rtt_deadline_ns: i64,
    last_rtt_ns: i64,
}

impl StaticWindowCongestionControl {
    /// `receiverWindow > termLength / 2` is rejected up front.
    pub fn new(initial_window_length: usize, term_length: usize) -> Result<Self, String> {
        if initial_window_length > term_length / 2 {
            return Err(format!(
                "receiver window {initial_window_length} exceeds half the term length {term_length}"
            ));
        }
        Ok(StaticWindowCongestionControl {
            window_length: initial_window_length,
            next_rtt_deadline_ns: 0,
            last_rtt_ns: 0,
        })
    }

    pub fn last_rtt_ns(&self) -> i64 {
        self.last_rtt_ns
    }
}

impl CongestionControl for StaticWindowCongestionControl {
    fn initial_window_length(&self) -> usize {
        self.window_length
    }

    fn max_window_length(&self) -> usize {
        self.window_length
    }

    fn on_track_rebuild(&mut self, _now_ns: i64, _rebuild_position: i64) -> (usize, bool) {
        (self.window_length, false)
    }

    fn should_measure_rtt(&mut self, now_ns: i64) -> bool {
        if now_ns >= self.next_rtt_deadline_ns {
            self.next_rtt_deadline_ns = now_ns + RTT_MEASUREMENT_INTERVAL_NS;
            return true;
        }
        false
    }

    fn on_rtt_measurement(&mut self, _now_ns: i64, rtt_ns: i64, _sender_addr: SocketAddr) {
        self.last_rtt_ns = rtt_ns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_larger_than_half_term_is_rejected() {
        assert!(StaticWindowCongestionControl::new(40 * 1024, 64 * 1024).is_err());
        assert!(StaticWindowCongestionControl::new(32 * 1024, 64 * 1024).is_ok());
    }

    #[test]
    fn static_window_never_changes() {
        let mut cc = StaticWindowCongestionControl::new(32 * 1024, 64 * 1024).unwrap();
        assert_eq!(cc.initial_window_length(), 32 * 1024);
        let (window, force) = cc.on_track_rebuild(100, 1 << 20);
        assert_eq!(window, 32 * 1024);
        assert!(!force);
    }

    #[test]
    fn rtt_probes_are_paced() {
        let mut cc = StaticWindowCongestionControl::new(1024, 64 * 1024).unwrap();
        assert!(cc.should_measure_rtt(0));
        assert!(!cc.should_measure_rtt(1));
        assert!(cc.should_measure_rtt(RTT_MEASUREMENT_INTERVAL_NS + 1));
    }
}
