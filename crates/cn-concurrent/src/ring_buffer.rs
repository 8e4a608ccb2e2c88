//! Many-to-one ring buffer: the to-driver command channel.
//!
//! Multiple client processes write records concurrently; the Conductor is
//! the only reader.  Producers claim space with a CAS on the tail, write the
//! record header with a *negative* length (claim marker), copy the payload,
//! then publish by storing the positive length with release semantics.  A
//! reader observing a zero or negative length stops: the record is not yet
//! committed.
//!
//! # Record layout
//! ```text
//! 0...............4...............8..............len
//! | length (i32)  | type id (i32) |  payload ...  |
//! ```
//! Records are 8-byte aligned; a type id of -1 marks padding.
//!
//! # Unblock
//! A producer that dies between claim and commit leaves the reader stuck.
//! [`ManyToOneRingBuffer::unblock`] detects the stall and converts the
//! abandoned claim into a padding record so the consumer can advance.

use crate::buffer::AtomicBuffer;
use crate::{align, is_power_of_two, CACHE_LINE_LENGTH};

/// Record type id reserved for padding records.
pub const PADDING_MSG_TYPE_ID: i32 = -1;

/// Bytes of record header preceding the payload.
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Record alignment within the ring.
pub const RECORD_ALIGNMENT: usize = 8;

// ---------------------------------------------------------------------------
// Trailer layout (one cache line per field)
// ---------------------------------------------------------------------------

// Trailer offsets are part of the shared-memory protocol: clients in any
// language locate them the same way.
pub const TAIL_POSITION_OFFSET: usize = 0;
pub const HEAD_CACHE_POSITION_OFFSET: usize = CACHE_LINE_LENGTH;
pub const HEAD_POSITION_OFFSET: usize = CACHE_LINE_LENGTH * 2;
pub const CORRELATION_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH * 3;
pub const CONSUMER_HEARTBEAT_OFFSET: usize = CACHE_LINE_LENGTH * 4;

/// Bytes of trailer metadata after the data capacity.
pub const TRAILER_LENGTH: usize = CACHE_LINE_LENGTH * 6;

#[derive(Debug, thiserror::Error)]
pub enum RingBufferError {
    #[error("ring capacity must be a power of two plus trailer, got {0}")]
    InvalidCapacity(usize),
    #[error("message of {msg} bytes exceeds max of {max}")]
    MessageTooLong { msg: usize, max: usize },
    #[error("message type id must be positive, got {0}")]
    InvalidMsgTypeId(i32),
    #[error("insufficient capacity")]
    Full,
}

/// The many-to-one ring over a shared buffer (data capacity + trailer).
pub struct ManyToOneRingBuffer {
    buffer: AtomicBuffer,
    capacity: usize,
    mask: u64,
    max_msg_length: usize,
    tail_position: usize,
    head_cache_position: usize,
    head_position: usize,
    correlation_counter: usize,
    consumer_heartbeat: usize,
}

impl ManyToOneRingBuffer {
    pub fn new(buffer: AtomicBuffer) -> Result<Self, RingBufferError> {
        let capacity = buffer.capacity() - TRAILER_LENGTH;
        if !is_power_of_two(capacity) {
            return Err(RingBufferError::InvalidCapacity(buffer.capacity()));
        }
        Ok(ManyToOneRingBuffer {
            buffer,
            capacity,
            mask: capacity as u64 - 1,
            max_msg_length: capacity / 8,
            tail_position: capacity + TAIL_POSITION_OFFSET,
            head_cache_position: capacity + HEAD_CACHE_POSITION_OFFSET,
            head_position: capacity + HEAD_POSITION_OFFSET,
            correlation_counter: capacity + CORRELATION_COUNTER_OFFSET,
            consumer_heartbeat: capacity + CONSUMER_HEARTBEAT_OFFSET,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next unique correlation id for a command on this ring.
    pub fn next_correlation_id(&self) -> i64 {
        self.buffer.get_and_add_i64(self.correlation_counter, 1)
    }

    pub fn producer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.tail_position)
    }

    pub fn consumer_position(&self) -> i64 {
        self.buffer.get_i64_volatile(self.head_position)
    }

    pub fn size(&self) -> usize {
        (self.producer_position() - self.consumer_position()) as usize
    }

    /// Millisecond heartbeat stamped by the consumer each duty cycle.
    pub fn consumer_heartbeat_time_ms(&self) -> i64 {
        self.buffer.get_i64_volatile(self.consumer_heartbeat)
    }

    pub fn update_consumer_heartbeat(&self, now_ms: i64) {
        self.buffer.put_i64_ordered(self.consumer_heartbeat, now_ms);
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Write one record.  Fails with `Full` when the consumer is too far
    /// behind to make space.
    pub fn write(&self, msg_type_id: i32, msg: &[u8]) -> Result<(), RingBufferError> {
        if msg_type_id < 1 {
            return Err(RingBufferError::InvalidMsgTypeId(msg_type_id));
        }
        if msg.len() > self.max_msg_length {
            return Err(RingBufferError::MessageTooLong {
                msg: msg.len(),
                max: self.max_msg_length,
            });
        }

        let record_length = msg.len() + RECORD_HEADER_LENGTH;
        let required = align(record_length, RECORD_ALIGNMENT);
        let record_index = self.claim_capacity(required)?;

        // Claim marker: negative length, committed by the positive store below.
        self.buffer
            .put_i32_ordered(record_index, -(record_length as i32));
        self.buffer.put_i32(record_index + 4, msg_type_id);
        self.buffer
            .put_bytes(record_index + RECORD_HEADER_LENGTH, msg);
        self.buffer
            .put_i32_ordered(record_index, record_length as i32);

        Ok(())
    }

    fn claim_capacity(&self, required: usize) -> Result<usize, RingBufferError> {
        let mask = self.mask;
        let mut head = self.buffer.get_i64_volatile(self.head_cache_position);

        loop {
            let tail = self.buffer.get_i64_volatile(self.tail_position);

            if required > self.capacity - (tail - head) as usize {
                head = self.buffer.get_i64_volatile(self.head_position);
                if required > self.capacity - (tail - head) as usize {
                    return Err(RingBufferError::Full);
                }
                self.buffer.put_i64_ordered(self.head_cache_position, head);
            }

            let tail_index = (tail as u64 & mask) as usize;
            let to_end = self.capacity - tail_index;
            let mut padding = 0usize;

            if required > to_end {
                // The record cannot straddle the wrap: pad to the end and
                // place it at the buffer start, which must be free.
                let mut head_index = (head as u64 & mask) as usize;
                if required > head_index {
                    head = self.buffer.get_i64_volatile(self.head_position);
                    head_index = (head as u64 & mask) as usize;
                    if required > head_index {
                        return Err(RingBufferError::Full);
                    }
                    self.buffer.put_i64_ordered(self.head_cache_position, head);
                }
                padding = to_end;
            }

            if self.buffer.compare_and_set_i64(
                self.tail_position,
                tail,
                tail + (required + padding) as i64,
            ) {
                if padding != 0 {
                    self.buffer.put_i32(tail_index + 4, PADDING_MSG_TYPE_ID);
                    self.buffer.put_i32_ordered(tail_index, padding as i32);
                    return Ok(0);
                }
                return Ok(tail_index);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Read up to `limit` committed records, invoking
    /// `handler(msg_type_id, buffer, payload_offset, payload_length)`.
    ///
    /// Consumed bytes are zeroed so producers and the unblocker can rely on
    /// unclaimed memory reading as zero.
    pub fn read<F>(&self, mut handler: F, limit: usize) -> usize
    where
        F: FnMut(i32, &AtomicBuffer, usize, usize),
    {
        let head = self.buffer.get_i64(self.head_position);
        let head_index = (head as u64 & self.mask) as usize;
        let max_block = self.capacity - head_index;
        let mut bytes_read = 0usize;
        let mut messages_read = 0usize;

        while bytes_read < max_block && messages_read < limit {
            let record_index = head_index + bytes_read;
            let record_length = self.buffer.get_i32_volatile(record_index);
            if record_length <= 0 {
                break;
            }

            let msg_type_id = self.buffer.get_i32(record_index + 4);
            bytes_read += align(record_length as usize, RECORD_ALIGNMENT);

            if msg_type_id == PADDING_MSG_TYPE_ID {
                continue;
            }

            messages_read += 1;
            handler(
                msg_type_id,
                &self.buffer,
                record_index + RECORD_HEADER_LENGTH,
                record_length as usize - RECORD_HEADER_LENGTH,
            );
        }

        if bytes_read > 0 {
            self.buffer.set_memory(head_index, bytes_read, 0);
            self.buffer
                .put_i64_ordered(self.head_position, head + bytes_read as i64);
        }

        messages_read
    }

    // -----------------------------------------------------------------------
    // Unblock
    // -----------------------------------------------------------------------

    /// Recover from a producer that claimed space and never committed.
    ///
    /// Returns `true` if a stuck claim was converted to padding and the
    /// consumer can make progress again.
    pub fn unblock(&self) -> bool {
        let head = self.buffer.get_i64_volatile(self.head_position);
        let tail = self.buffer.get_i64_volatile(self.tail_position);
        if head == tail {
            return false;
        }

        let mask = self.mask;
        let consumer_index = (head as u64 & mask) as usize;
        let length = self.buffer.get_i32_volatile(consumer_index);

        if length < 0 {
            // Abandoned claim at the head: commit it as padding in place.
            self.buffer.put_i32(consumer_index + 4, PADDING_MSG_TYPE_ID);
            self.buffer.put_i32_ordered(consumer_index, -length);
            return true;
        }

        if length == 0 {
            // The producer wrote nothing at all.  Scan forward for the next
            // committed record; if one exists the zero region is dead space.
            let producer_index = (tail as u64 & mask) as usize;
            let limit = if producer_index > consumer_index {
                producer_index
            } else {
                self.capacity
            };
            let mut i = consumer_index + RECORD_ALIGNMENT;
            while i < limit {
                if self.buffer.get_i32_volatile(i) != 0 {
                    self.buffer.put_i32(consumer_index + 4, PADDING_MSG_TYPE_ID);
                    self.buffer
                        .put_i32_ordered(consumer_index, (i - consumer_index) as i32);
                    return true;
                }
                i += RECORD_ALIGNMENT;
            }
        }

        false
    }
}
