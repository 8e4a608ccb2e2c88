//! Retransmit handler: converts inbound NAKs into bounded retransmits.
//!
//! Each distinct gap becomes an action that is DELAYED (waiting to send)
//! then LINGERING (recently sent; identical NAKs are ignored).  Concurrent
//! actions are bounded by `max_resend`; beyond that the oldest action is
//! evicted and the overflow counter incremented.

use cn_concurrent::AtomicCounter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionState {
    Delayed,
    Lingering,
}

#[derive(Debug, Clone, Copy)]
struct RetransmitAction {
    term_id: i32,
    term_offset: i32,
    length: usize,
    state: ActionState,
    deadline_ns: i64,
}

/// Per-publication retransmit state machine.
pub struct RetransmitHandler {
    actions: Vec<RetransmitAction>,
    delay_ns: i64,
    linger_ns: i64,
    max_resend: usize,
    overflow_counter: AtomicCounter,
}

impl RetransmitHandler {
    pub fn new(
        delay_ns: i64,
        linger_ns: i64,
        max_resend: usize,
        overflow_counter: AtomicCounter,
    ) -> Self {
        RetransmitHandler {
            actions: Vec::new(),
            delay_ns,
            linger_ns,
            max_resend: max_resend.max(1),
            overflow_counter,
        }
    }

    /// Handle a NAK for `(term_id, term_offset, length)`.  `length` must
    /// already be bounded by flow control's max retransmission length.
    ///
    /// With no configured delay the retransmit is dispatched immediately
    /// through `on_send` and the action lingers.
    pub fn on_nak<F>(
        &mut self,
        term_id: i32,
        term_offset: i32,
        length: usize,
        now_ns: i64,
        mut on_send: F,
    ) where
        F: FnMut(i32, i32, usize),
    {
        if self.is_active(term_id, term_offset) {
            return;
        }

        if self.actions.len() >= self.max_resend {
            // Evict the action closest to expiry to make room.
            if let Some(oldest) = self
                .actions
                .iter()
                .enumerate()
                .min_by_key(|(_, a)| a.deadline_ns)
                .map(|(i, _)| i)
            {
                self.actions.swap_remove(oldest);
            }
            self.overflow_counter.increment();
        }

        if self.delay_ns == 0 {
            on_send(term_id, term_offset, length);
            self.actions.push(RetransmitAction {
                term_id,
                term_offset,
                length,
                state: ActionState::Lingering,
                deadline_ns: now_ns + self.linger_ns,
            });
        } else {
            self.actions.push(RetransmitAction {
                term_id,
                term_offset,
                length,
                state: ActionState::Delayed,
                deadline_ns: now_ns + self.delay_ns,
            });
        }
    }

    /// Advance timers: dispatch delayed retransmits whose deadline passed
    /// and retire lingering ones.
    pub fn process_timeouts<F>(&mut self, now_ns: i64, mut on_send: F)
    where
        F: FnMut(i32, i32, usize),
    {
        let linger_ns = self.linger_ns;
        let mut expired = Vec::new();
        for (i, action) in self.actions.iter_mut().enumerate() {
            if now_ns < action.deadline_ns {
                continue;
            }
            match action.state {
                ActionState::Delayed => {
                    on_send(action.term_id, action.term_offset, action.length);
                    action.state = ActionState::Lingering;
                    action.deadline_ns = now_ns + linger_ns;
                }
                ActionState::Lingering => expired.push(i),
            }
        }
        for i in expired.into_iter().rev() {
            self.actions.swap_remove(i);
        }
    }

    pub fn active_count(&self) -> usize {
        self.actions.len()
    }

    fn is_active(&self, term_id: i32, term_offset: i32) -> bool {
        self.actions
            .iter()
            .any(|a| a.term_id == term_id && a.term_offset == term_offset)
    }
}
