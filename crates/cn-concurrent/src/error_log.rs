//! Distinct error log.
//!
//! Errors observed anywhere in the driver funnel into a shared-memory
//! region, deduplicated by description.  Each distinct error holds an
//! observation count and first/last timestamps so operators see "what and
//! how often" without log flooding.
//!
//! # Record layout
//! ```text
//! 0........4..........8............16...........24
//! | length | obs count | last ts ms | first ts ms | utf-8 description ... |
//! ```
//! Records are 8-byte aligned.  `length` is stored last with release
//! semantics; readers observing zero stop.

use std::sync::Mutex;

use crate::buffer::AtomicBuffer;
use crate::align;

const LENGTH_OFFSET: usize = 0;
const OBSERVATION_COUNT_OFFSET: usize = 4;
const LAST_OBSERVATION_OFFSET: usize = 8;
const FIRST_OBSERVATION_OFFSET: usize = 16;
/// Bytes of record header preceding the description.
pub const ENCODED_ERROR_OFFSET: usize = 24;

const RECORD_ALIGNMENT: usize = 8;

/// Thread-safe writer for the distinct error log.
///
/// Recording is off the hot path, so a mutex around the append scan is
/// acceptable and keeps the wire format free of per-writer state.
pub struct DistinctErrorLog {
    buffer: AtomicBuffer,
    write_lock: Mutex<()>,
}

impl DistinctErrorLog {
    pub fn new(buffer: AtomicBuffer) -> Self {
        DistinctErrorLog {
            buffer,
            write_lock: Mutex::new(()),
        }
    }

    /// Record an observation of `description`.
    ///
    /// Returns `false` if the log is out of space for a new distinct entry.
    pub fn record(&self, description: &str, now_ms: i64) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut offset = 0;
        loop {
            let length = self.buffer.get_i32_volatile(offset + LENGTH_OFFSET);
            if length == 0 {
                break;
            }
            let existing_len = length as usize - ENCODED_ERROR_OFFSET;
            if existing_len == description.len()
                && self.buffer.as_slice(offset + ENCODED_ERROR_OFFSET, existing_len)
                    == description.as_bytes()
            {
                self.buffer.put_i64(offset + LAST_OBSERVATION_OFFSET, now_ms);
                self.buffer
                    .get_and_add_i32(offset + OBSERVATION_COUNT_OFFSET, 1);
                return true;
            }
            offset += align(length as usize, RECORD_ALIGNMENT);
        }

        let record_length = ENCODED_ERROR_OFFSET + description.len();
        if offset + align(record_length, RECORD_ALIGNMENT) > self.buffer.capacity() {
            return false;
        }

        self.buffer.put_i64(offset + FIRST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i64(offset + LAST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i32(offset + OBSERVATION_COUNT_OFFSET, 1);
        self.buffer
            .put_bytes(offset + ENCODED_ERROR_OFFSET, description.as_bytes());
        self.buffer
            .put_i32_ordered(offset + LENGTH_OFFSET, record_length as i32);
        true
    }
}

/// One distinct error as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub observation_count: i32,
    pub first_observation_ms: i64,
    pub last_observation_ms: i64,
    pub description: String,
}

/// Read all distinct errors currently in the log.
pub fn read_errors(buffer: &AtomicBuffer) -> Vec<ErrorLogEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + ENCODED_ERROR_OFFSET <= buffer.capacity() {
        let length = buffer.get_i32_volatile(offset + LENGTH_OFFSET);
        if length == 0 {
            break;
        }
        let desc_len = length as usize - ENCODED_ERROR_OFFSET;
        entries.push(ErrorLogEntry {
            observation_count: buffer.get_i32_volatile(offset + OBSERVATION_COUNT_OFFSET),
            first_observation_ms: buffer.get_i64(offset + FIRST_OBSERVATION_OFFSET),
            last_observation_ms: buffer.get_i64(offset + LAST_OBSERVATION_OFFSET),
            description: String::from_utf8_lossy(buffer.as_slice(offset + ENCODED_ERROR_OFFSET, desc_len))
                .into_owned(),
        });
        offset += align(length as usize, RECORD_ALIGNMENT);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;

    #[test]
    fn distinct_errors_get_separate_entries() {
        let mem = AlignedBuffer::with_capacity(1024);
        let log = DistinctErrorLog::new(mem.buffer());

        assert!(log.record("socket bind failed", 10));
        assert!(log.record("invalid channel uri", 20));

        let buf = mem.buffer();
        let entries = read_errors(&buf);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].description, "socket bind failed");
        assert_eq!(entries[1].description, "invalid channel uri");
    }

    #[test]
    fn repeated_error_bumps_count_and_last_timestamp() {
        let mem = AlignedBuffer::with_capacity(1024);
        let log = DistinctErrorLog::new(mem.buffer());

        log.record("short send", 10);
        log.record("short send", 50);
        log.record("short send", 90);

        let buf = mem.buffer();
        let entries = read_errors(&buf);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].observation_count, 3);
        assert_eq!(entries[0].first_observation_ms, 10);
        assert_eq!(entries[0].last_observation_ms, 90);
    }

    #[test]
    fn full_log_rejects_new_distinct_entries() {
        let mem = AlignedBuffer::with_capacity(64);
        let log = DistinctErrorLog::new(mem.buffer());

        assert!(log.record("abcdefgh", 1));
        assert!(!log.record("a very long error message that cannot fit", 2));
        // Existing entry still updatable.
        assert!(log.record("abcdefgh", 3));
    }
}
