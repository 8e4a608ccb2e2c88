//! One-to-many broadcast: the to-clients event channel.
//!
//! The Conductor is the only transmitter; every client process runs a
//! receiver.  Unlike the ring buffer there is no back-pressure: a slow
//! client gets lapped and detects it via the tail-intent counter, losing a
//! buffer's worth of events rather than stalling the driver.
//!
//! Record layout matches the ring buffer (`length` i32, `type id` i32,
//! payload, 8-byte aligned) with type id -1 reserved for the pad record at
//! the end of the buffer.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::buffer::AtomicBuffer;
use crate::{align, is_power_of_two, CACHE_LINE_LENGTH};

/// Record type id for the wrap-around pad record.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

pub const RECORD_HEADER_LENGTH: usize = 8;
pub const RECORD_ALIGNMENT: usize = 8;

// Trailer: tail intent, tail, latest sequence.
const TAIL_INTENT_COUNTER_OFFSET: usize = 0;
const TAIL_COUNTER_OFFSET: usize = 8;
const LATEST_COUNTER_OFFSET: usize = 16;

/// Bytes of trailer metadata after the data capacity.
pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 2;

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("broadcast capacity must be a power of two plus trailer, got {0}")]
    InvalidCapacity(usize),
    #[error("message of {msg} bytes exceeds max of {max}")]
    MessageTooLong { msg: usize, max: usize },
    #[error("message type id must be positive, got {0}")]
    InvalidMsgTypeId(i32),
    #[error("receiver lapped by transmitter")]
    Lapped,
}

// ---------------------------------------------------------------------------
// Transmitter
// ---------------------------------------------------------------------------

/// Single-threaded transmitter side of the broadcast buffer.
pub struct BroadcastTransmitter {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: u64,
    max_msg_length: usize,
    tail_intent_counter: usize,
    tail_counter: usize,
    latest_counter: usize,
}

impl BroadcastTransmitter {
    pub fn new(buffer: AtomicBuffer) -> Result<Self, BroadcastError> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;
        if !is_power_of_two(capacity) {
            return Err(BroadcastError::InvalidCapacity(buffer.capacity()));
        }
        Ok(BroadcastTransmitter {
            buffer,
            capacity,
            mask: capacity as u64 - 1,
            max_msg_length: capacity / 8,
            tail_intent_counter: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_counter: capacity + TAIL_COUNTER_OFFSET,
            latest_counter: capacity + LATEST_COUNTER_OFFSET,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Transmit one message to all receivers.  Never blocks; laps slow
    /// receivers.
    pub fn transmit(&self, msg_type_id: i32, msg: &[u8]) -> Result<(), BroadcastError> {
        if msg_type_id < 1 {
            return Err(BroadcastError::InvalidMsgTypeId(msg_type_id));
        }
        if msg.len() > self.max_msg_length {
            return Err(BroadcastError::MessageTooLong {
                msg: msg.len(),
                max: self.max_msg_length,
            });
        }

        let mut tail = self.buffer.get_i64(self.tail_counter);
        let record_length = msg.len() + RECORD_HEADER_LENGTH;
        let aligned_length = align(record_length, RECORD_ALIGNMENT);
        let mut record_offset = (tail as u64 & self.mask) as usize;
        let to_end = self.capacity - record_offset;

        if aligned_length > to_end {
            // Pad to the end of the buffer and wrap.
            self.buffer
                .put_i64_ordered(self.tail_intent_counter, tail + (to_end + aligned_length) as i64);
            self.buffer.put_i32(record_offset + 4, PADDING_MSG_TYPE_ID);
            self.buffer.put_i32(record_offset, to_end as i32);
            tail += to_end as i64;
            record_offset = 0;
        } else {
            self.buffer
                .put_i64_ordered(self.tail_intent_counter, tail + aligned_length as i64);
        }

        self.buffer.put_i32(record_offset, record_length as i32);
        self.buffer.put_i32(record_offset + 4, msg_type_id);
        self.buffer
            .put_bytes(record_offset + RECORD_HEADER_LENGTH, msg);

        self.buffer
            .put_i64(self.latest_counter, tail);
        self.buffer
            .put_i64_ordered(self.tail_counter, tail + aligned_length as i64);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// Polling receiver side of the broadcast buffer.
///
/// Poll [`BroadcastReceiver::receive_next`] until `true`, inspect the
/// current record, then call [`BroadcastReceiver::validate`] to confirm the
/// record was not overwritten mid-read.
pub struct BroadcastReceiver {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: u64,
    tail_intent_counter: usize,
    tail_counter: usize,
    latest_counter: usize,
    record_offset: usize,
    cursor: i64,
    next_record: i64,
    lapped_count: AtomicI64,
}

impl BroadcastReceiver {
    pub fn new(buffer: AtomicBuffer) -> Result<Self, BroadcastError> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;
        if !is_power_of_two(capacity) {
            return Err(BroadcastError::InvalidCapacity(buffer.capacity()));
        }
        let mask = capacity as u64 - 1;
        let latest_counter = capacity + LATEST_COUNTER_OFFSET;
        let cursor = buffer.get_i64(latest_counter);

        Ok(BroadcastReceiver {
            buffer,
            capacity,
            mask,
            tail_intent_counter: capacity + TAIL_INTENT_COUNTER_OFFSET,
            tail_counter: capacity + TAIL_COUNTER_OFFSET,
            latest_counter,
            record_offset: (cursor as u64 & mask) as usize,
            cursor,
            next_record: cursor,
            lapped_count: AtomicI64::new(0),
        })
    }

    /// Number of times the transmitter has lapped this receiver.  Each lap
    /// is at least a buffer's worth of lost events.
    pub fn lapped_count(&self) -> i64 {
        self.lapped_count.load(Ordering::Relaxed)
    }

    /// Advance to the next transmission if one is available.
    pub fn receive_next(&mut self) -> bool {
        let tail = self.buffer.get_i64_volatile(self.tail_counter);
        let mut cursor = self.next_record;

        if tail <= cursor {
            return false;
        }

        if !self.validate_at(cursor) {
            self.lapped_count.fetch_add(1, Ordering::Relaxed);
            cursor = self.buffer.get_i64(self.latest_counter);
        }

        let mut record_offset = (cursor as u64 & self.mask) as usize;
        self.cursor = cursor;
        self.next_record = cursor
            + align(
                self.buffer.get_i32(record_offset) as usize,
                RECORD_ALIGNMENT,
            ) as i64;

        if self.buffer.get_i32(record_offset + 4) == PADDING_MSG_TYPE_ID {
            record_offset = 0;
            self.cursor = self.next_record;
            self.next_record += align(
                self.buffer.get_i32(record_offset) as usize,
                RECORD_ALIGNMENT,
            ) as i64;
        }

        self.record_offset = record_offset;
        true
    }

    pub fn msg_type_id(&self) -> i32 {
        self.buffer.get_i32(self.record_offset + 4)
    }

    pub fn length(&self) -> usize {
        self.buffer.get_i32(self.record_offset) as usize - RECORD_HEADER_LENGTH
    }

    pub fn offset(&self) -> usize {
        self.record_offset + RECORD_HEADER_LENGTH
    }

    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    /// `true` if the current record has not been overwritten since
    /// `receive_next`.
    pub fn validate(&self) -> bool {
        self.validate_at(self.cursor)
    }

    fn validate_at(&self, cursor: i64) -> bool {
        cursor + self.capacity as i64 > self.buffer.get_i64_volatile(self.tail_intent_counter)
    }
}

/// Receiver that copies each message into a scratch buffer before delivery,
/// guaranteeing a consistent view even when lapped mid-read.
pub struct CopyBroadcastReceiver {
    receiver: BroadcastReceiver,
    scratch: Vec<u8>,
}

impl CopyBroadcastReceiver {
    pub fn new(receiver: BroadcastReceiver) -> Self {
        CopyBroadcastReceiver {
            receiver,
            scratch: vec![0u8; 4096],
        }
    }

    /// Receive at most one message, delivering `(msg_type_id, bytes)` to the
    /// handler.  Returns the number of messages delivered, or `Lapped` if
    /// the transmitter overran this receiver mid-copy.
    pub fn receive<F>(&mut self, mut handler: F) -> Result<usize, BroadcastError>
    where
        F: FnMut(i32, &[u8]),
    {
        let last_seen_lapped = self.receiver.lapped_count();

        if !self.receiver.receive_next() {
            return Ok(0);
        }
        if last_seen_lapped != self.receiver.lapped_count() {
            return Err(BroadcastError::Lapped);
        }

        let length = self.receiver.length();
        if length > self.scratch.len() {
            return Err(BroadcastError::MessageTooLong {
                msg: length,
                max: self.scratch.len(),
            });
        }

        let msg_type_id = self.receiver.msg_type_id();
        let offset = self.receiver.offset();
        self.receiver
            .buffer
            .get_bytes(offset, &mut self.scratch[..length]);

        if !self.receiver.validate() {
            return Err(BroadcastError::Lapped);
        }

        handler(msg_type_id, &self.scratch[..length]);
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;

    const CAPACITY: usize = 1024;

    fn new_mem() -> AlignedBuffer {
        AlignedBuffer::with_capacity(CAPACITY + TRAILER_LENGTH)
    }

    #[test]
    fn transmit_and_receive_single_message() {
        let mem = new_mem();
        let tx = BroadcastTransmitter::new(mem.buffer()).unwrap();
        let rx = BroadcastReceiver::new(mem.buffer()).unwrap();
        let mut rx = CopyBroadcastReceiver::new(rx);

        tx.transmit(9, b"event").unwrap();

        let mut seen = None;
        assert_eq!(rx.receive(|t, b| seen = Some((t, b.to_vec()))).unwrap(), 1);
        assert_eq!(seen, Some((9, b"event".to_vec())));
        assert_eq!(rx.receive(|_, _| {}).unwrap(), 0);
    }

    #[test]
    fn receiver_joins_at_latest_and_sees_only_new_messages() {
        let mem = new_mem();
        let tx = BroadcastTransmitter::new(mem.buffer()).unwrap();

        tx.transmit(1, b"old").unwrap();
        let rx = BroadcastReceiver::new(mem.buffer()).unwrap();
        let mut rx = CopyBroadcastReceiver::new(rx);

        // "old" was transmitted before the receiver joined: the join cursor
        // is the last record, so it is observed once, then only new data.
        tx.transmit(2, b"new").unwrap();
        let mut types = Vec::new();
        while rx.receive(|t, _| types.push(t)).unwrap() > 0 {}
        assert_eq!(*types.last().unwrap(), 2);
    }

    #[test]
    fn wraps_and_continues_delivery() {
        let mem = new_mem();
        let tx = BroadcastTransmitter::new(mem.buffer()).unwrap();
        let rx = BroadcastReceiver::new(mem.buffer()).unwrap();
        let mut rx = CopyBroadcastReceiver::new(rx);

        let payload = [3u8; 100];
        for i in 0..50 {
            tx.transmit(7, &payload).unwrap();
            let mut got = 0;
            while got == 0 {
                got = rx.receive(|_, b| assert_eq!(b.len(), 100)).unwrap();
            }
            assert_eq!(got, 1, "message lost at {i}");
        }
    }

    #[test]
    fn slow_receiver_detects_lap() {
        let mem = new_mem();
        let tx = BroadcastTransmitter::new(mem.buffer()).unwrap();
        let rx = BroadcastReceiver::new(mem.buffer()).unwrap();
        let mut rx = CopyBroadcastReceiver::new(rx);

        // Fill the buffer several times over without consuming.
        let payload = [1u8; 64];
        for _ in 0..100 {
            tx.transmit(5, &payload).unwrap();
        }

        match rx.receive(|_, _| {}) {
            Err(BroadcastError::Lapped) => {}
            Ok(_) => {
                // First receive after a lap may land on the latest record;
                // the lap must still have been counted.
                assert!(rx.receiver.lapped_count() > 0);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
