//! Loss report: an append-only shared-memory record of observed gaps.
//!
//! One entry per (session, stream, channel, source); repeat loss updates
//! the observation count and byte total in place.  External tooling reads
//! the file without coordination, so the entry length field is committed
//! last with release semantics.
//!
//! # Entry layout
//! ```text
//! 0         8            16          24          32      36      40
//! | obs cnt | total bytes| first ms  | last ms   | sess  | stream| len |
//! 44: channel utf-8, then source utf-8
//! ```

use cn_concurrent::{align, AtomicBuffer};

const OBSERVATION_COUNT_OFFSET: usize = 0;
const TOTAL_BYTES_OFFSET: usize = 8;
const FIRST_OBSERVATION_OFFSET: usize = 16;
const LAST_OBSERVATION_OFFSET: usize = 24;
const SESSION_ID_OFFSET: usize = 32;
const STREAM_ID_OFFSET: usize = 36;
const ENTRY_LENGTH_OFFSET: usize = 40;
const CHANNEL_OFFSET: usize = 44;

const ENTRY_ALIGNMENT: usize = 8;

/// Handle to one committed entry for in-place updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossEntryHandle {
    offset: usize,
}

/// Writer over the mapped loss-report region.
pub struct LossReport {
    buffer: AtomicBuffer,
    next_offset: usize,
}

impl LossReport {
    pub fn new(buffer: AtomicBuffer) -> Self {
        LossReport {
            buffer,
            next_offset: 0,
        }
    }

    /// Create an entry for a newly observed gap.  Returns `None` when the
    /// report is full.
    pub fn create_entry(
        &mut self,
        initial_bytes: i64,
        now_ms: i64,
        session_id: i32,
        stream_id: i32,
        channel: &str,
        source: &str,
    ) -> Option<LossEntryHandle> {
        let entry_length = CHANNEL_OFFSET + channel.len() + source.len();
        let aligned = align(entry_length, ENTRY_ALIGNMENT);
        if self.next_offset + aligned > self.buffer.capacity() {
            return None;
        }

        let offset = self.next_offset;
        self.buffer.put_i64(offset + OBSERVATION_COUNT_OFFSET, 1);
        self.buffer.put_i64(offset + TOTAL_BYTES_OFFSET, initial_bytes);
        self.buffer.put_i64(offset + FIRST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i64(offset + LAST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i32(offset + SESSION_ID_OFFSET, session_id);
        self.buffer.put_i32(offset + STREAM_ID_OFFSET, stream_id);
        self.buffer
            .put_bytes(offset + CHANNEL_OFFSET, channel.as_bytes());
        self.buffer
            .put_bytes(offset + CHANNEL_OFFSET + channel.len(), source.as_bytes());
        // Channel length doubles as the commit marker; source length is
        // derived from the entry length.
        self.buffer.put_i32_ordered(
            offset + ENTRY_LENGTH_OFFSET,
            ((channel.len() as i32) << 16) | (source.len() as i32),
        );

        self.next_offset += aligned;
        Some(LossEntryHandle { offset })
    }

    /// Record another observation of an existing gap entry.
    pub fn record_observation(&self, handle: LossEntryHandle, bytes: i64, now_ms: i64) {
        self.buffer
            .put_i64(handle.offset + LAST_OBSERVATION_OFFSET, now_ms);
        self.buffer
            .get_and_add_i64(handle.offset + TOTAL_BYTES_OFFSET, bytes);
        self.buffer
            .get_and_add_i64(handle.offset + OBSERVATION_COUNT_OFFSET, 1);
    }
}

/// One entry read back from a loss report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossReportEntry {
    pub observation_count: i64,
    pub total_bytes: i64,
    pub first_observation_ms: i64,
    pub last_observation_ms: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub source: String,
}

/// Read all committed entries.
pub fn read_entries(buffer: &AtomicBuffer) -> Vec<LossReportEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + CHANNEL_OFFSET <= buffer.capacity() {
        let lengths = buffer.get_i32_volatile(offset + ENTRY_LENGTH_OFFSET);
        if lengths == 0 {
            break;
        }
        let channel_len = (lengths >> 16) as usize;
        let source_len = (lengths & 0xFFFF) as usize;
        entries.push(LossReportEntry {
            observation_count: buffer.get_i64(offset + OBSERVATION_COUNT_OFFSET),
            total_bytes: buffer.get_i64(offset + TOTAL_BYTES_OFFSET),
            first_observation_ms: buffer.get_i64(offset + FIRST_OBSERVATION_OFFSET),
            last_observation_ms: buffer.get_i64(offset + LAST_OBSERVATION_OFFSET),
            session_id: buffer.get_i32(offset + SESSION_ID_OFFSET),
            stream_id: buffer.get_i32(offset + STREAM_ID_OFFSET),
            channel: String::from_utf8_lossy(buffer.as_slice(offset + CHANNEL_OFFSET, channel_len))
                .into_owned(),
            source: String::from_utf8_lossy(
                buffer.as_slice(offset + CHANNEL_OFFSET + channel_len, source_len),
            )
            .into_owned(),
        });
        offset += align(CHANNEL_OFFSET + channel_len + source_len, ENTRY_ALIGNMENT);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::AlignedBuffer;

    #[test]
    fn entry_create_and_update() {
        let mem = AlignedBuffer::with_capacity(1024);
        let mut report = LossReport::new(mem.buffer());

        let handle = report
            .create_entry(64, 1000, 100, 42, "aeron:udp?endpoint=h:1", "10.0.0.1:4000")
            .unwrap();
        report.record_observation(handle, 128, 2000);

        let buf = mem.buffer();
        let entries = read_entries(&buf);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].observation_count, 2);
        assert_eq!(entries[0].total_bytes, 192);
        assert_eq!(entries[0].first_observation_ms, 1000);
        assert_eq!(entries[0].last_observation_ms, 2000);
        assert_eq!(entries[0].channel, "aeron:udp?endpoint=h:1");
        assert_eq!(entries[0].source, "10.0.0.1:4000");
    }

    #[test]
    fn full_report_rejects_new_entries() {
        let mem = AlignedBuffer::with_capacity(64);
        let mut report = LossReport::new(mem.buffer());
        assert!(report.create_entry(0, 0, 1, 1, "c", "s").is_some());
        assert!(report
            .create_entry(0, 0, 1, 1, &"x".repeat(64), "s")
            .is_none());
    }
}
