//! Inter-agent command queues.
//!
//! The Conductor hands work to the Sender and Receiver through bounded
//! single-producer/single-consumer queues; agents post completions and
//! async results back through an unbounded many-producer queue.  Both are
//! non-blocking on both ends.

use crossbeam_queue::{ArrayQueue, SegQueue};

/// Bounded command queue from the Conductor to one agent.
pub struct CommandQueue<T> {
    queue: ArrayQueue<T>,
}

impl<T> CommandQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        CommandQueue {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Offer a command.  Returns it back on a full queue so the caller can
    /// apply back-pressure instead of dropping.
    pub fn offer(&self, cmd: T) -> Result<(), T> {
        self.queue.push(cmd)
    }

    pub fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Drain up to `limit` commands into `handler`, returning how many ran.
    pub fn drain<F>(&self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while count < limit {
            match self.queue.pop() {
                Some(cmd) => {
                    handler(cmd);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Remaining slots before the queue is full.
    pub fn remaining(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }
}

/// Unbounded many-producer queue into the Conductor.
pub struct TaskQueue<T> {
    queue: SegQueue<T>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        TaskQueue {
            queue: SegQueue::new(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, task: T) {
        self.queue.push(task);
    }

    pub fn poll(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn drain<F>(&self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while count < limit {
            match self.queue.pop() {
                Some(task) => {
                    handler(task);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_queue_applies_back_pressure() {
        let q = CommandQueue::with_capacity(2);
        q.offer(1).unwrap();
        q.offer(2).unwrap();
        assert_eq!(q.offer(3), Err(3));
        assert_eq!(q.remaining(), 0);

        assert_eq!(q.poll(), Some(1));
        q.offer(3).unwrap();
    }

    #[test]
    fn drain_respects_limit() {
        let q = CommandQueue::with_capacity(8);
        for i in 0..5 {
            q.offer(i).unwrap();
        }
        let mut seen = Vec::new();
        assert_eq!(q.drain(|v| seen.push(v), 3), 3);
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn task_queue_is_unbounded_fifo() {
        let q = TaskQueue::new();
        for i in 0..100 {
            q.offer(i);
        }
        let mut seen = Vec::new();
        q.drain(|v| seen.push(v), usize::MAX);
        assert_eq!(seen.len(), 100);
        assert_eq!(seen[0], 0);
        assert_eq!(seen[99], 99);
    }
}
