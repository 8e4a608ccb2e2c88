//! Idle strategies for busy-polling agents.
//!
//! An agent calls `idle(work_count)` at the end of each duty cycle.  A
//! non-zero work count resets the strategy; zero applies the configured
//! waiting behavior.

use std::time::Duration;

/// How an agent behaves when a duty cycle does no work.
#[derive(Debug, Clone)]
pub enum IdleStrategy {
    /// Spin without yielding the CPU.  Lowest latency, one core per agent.
    BusySpin,
    /// `std::thread::yield_now` on every idle cycle.
    Yield,
    /// Park for a fixed duration on every idle cycle.
    Sleep(Duration),
    /// Spin, then yield, then park with doubling duration up to `max_park`.
    Backoff {
        max_spins: u32,
        max_yields: u32,
        min_park: Duration,
        max_park: Duration,
    },
}

impl IdleStrategy {
    /// The default agent strategy: a short spin/yield phase before parking.
    pub fn backoff_default() -> Self {
        IdleStrategy::Backoff {
            max_spins: 10,
            max_yields: 20,
            min_park: Duration::from_micros(1),
            max_park: Duration::from_millis(1),
        }
    }

    pub fn new_state(&self) -> IdleState {
        IdleState {
            spins: 0,
            yields: 0,
            park_for: match self {
                IdleStrategy::Backoff { min_park, .. } => *min_park,
                _ => Duration::ZERO,
            },
        }
    }
}

/// Per-agent mutable state for an [`IdleStrategy`].
#[derive(Debug)]
pub struct IdleState {
    spins: u32,
    yields: u32,
    park_for: Duration,
}

impl IdleState {
    pub fn idle(&mut self, strategy: &IdleStrategy, work_count: usize) {
        if work_count > 0 {
            self.reset(strategy);
            return;
        }

        match strategy {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Yield => std::thread::yield_now(),
            IdleStrategy::Sleep(duration) => std::thread::sleep(*duration),
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                max_park,
                ..
            } => {
                if self.spins < *max_spins {
                    self.spins += 1;
                    std::hint::spin_loop();
                } else if self.yields < *max_yields {
                    self.yields += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(self.park_for);
                    self.park_for = (self.park_for * 2).min(*max_park);
                }
            }
        }
    }

    fn reset(&mut self, strategy: &IdleStrategy) {
        self.spins = 0;
        self.yields = 0;
        if let IdleStrategy::Backoff { min_park, .. } = strategy {
            self.park_for = *min_park;
        }
    }
}
