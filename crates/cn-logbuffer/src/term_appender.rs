//! Term appender: the publisher side of a term partition.
//!
//! Space is claimed with a single fetch-add on the partition's packed tail
//! counter.  Three outcomes:
//! 1. The frame fits: header and payload are written, then the frame
//!    length is stored with release to publish.
//! 2. The claim straddles the term end: the first appender to trip writes
//!    a PAD frame over the remainder and reports [`TERM_TRIPPED`] so the
//!    caller rotates the log.
//! 3. The tail was already at or past the term end: [`TERM_FAILED`];
//!    the caller rotates (or is stopped by position limits upstream).

use cn_concurrent::{align, AtomicBuffer};
use cn_protocol::frame;

use crate::descriptor::{self, tail_counter_offset};
use crate::frame_descriptor::{self, DATA_HEADER_LENGTH, FRAME_ALIGNMENT};

/// The append straddled the end of the term; a PAD was written and the
/// caller must rotate.
pub const TERM_TRIPPED: i64 = -1;

/// The term was already full at claim time.
pub const TERM_FAILED: i64 = -2;

/// Appender over one term partition.
pub struct TermAppender {
    term: AtomicBuffer,
    meta: AtomicBuffer,
    tail_offset: usize,
}

impl TermAppender {
    pub fn new(term: AtomicBuffer, meta: AtomicBuffer, partition_index: usize) -> Self {
        TermAppender {
            term,
            meta,
            tail_offset: tail_counter_offset(partition_index),
        }
    }

    pub fn raw_tail_volatile(&self) -> i64 {
        self.meta.get_i64_volatile(self.tail_offset)
    }

    fn get_and_add_raw_tail(&self, aligned_length: usize) -> i64 {
        self.meta.get_and_add_i64(self.tail_offset, aligned_length as i64)
    }

    /// Append a message that fits in a single frame.
    ///
    /// Returns the resulting term offset after the frame, or
    /// [`TERM_TRIPPED`] / [`TERM_FAILED`].
    pub fn append_unfragmented(
        &self,
        header_template: &[u8; DATA_HEADER_LENGTH],
        msg: &[u8],
        reserved_value: i64,
    ) -> i64 {
        let frame_length = DATA_HEADER_LENGTH + msg.len();
        let aligned_length = align(frame_length, FRAME_ALIGNMENT);
        let raw_tail = self.get_and_add_raw_tail(aligned_length);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let term_id = descriptor::term_id_from_raw_tail(raw_tail);
        let term_length = self.term.capacity() as i64;

        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > term_length {
            return self.handle_end_of_log(header_template, term_offset, term_id);
        }

        let offset = term_offset as usize;
        self.write_header(header_template, offset, term_id, frame::UNFRAGMENTED, reserved_value);
        self.term.put_bytes(offset + DATA_HEADER_LENGTH, msg);
        frame_descriptor::frame_length_ordered(&self.term, offset, frame_length as i32);

        resulting_offset
    }

    /// Append a message split into fragments of at most `max_payload_length`
    /// bytes of payload each.  All fragments share the claimed region, so a
    /// message never straddles terms.
    pub fn append_fragmented(
        &self,
        header_template: &[u8; DATA_HEADER_LENGTH],
        msg: &[u8],
        max_payload_length: usize,
        reserved_value: i64,
    ) -> i64 {
        let num_max_payloads = msg.len() / max_payload_length;
        let remaining_payload = msg.len() - num_max_payloads * max_payload_length;
        let last_frame_length = if remaining_payload > 0 {
            align(remaining_payload + DATA_HEADER_LENGTH, FRAME_ALIGNMENT)
        } else {
            0
        };
        let required_length =
            num_max_payloads * align(max_payload_length + DATA_HEADER_LENGTH, FRAME_ALIGNMENT)
                + last_frame_length;

        let raw_tail = self.get_and_add_raw_tail(required_length);
        let term_offset = raw_tail & 0xFFFF_FFFF;
        let term_id = descriptor::term_id_from_raw_tail(raw_tail);
        let term_length = self.term.capacity() as i64;

        let resulting_offset = term_offset + required_length as i64;
        if resulting_offset > term_length {
            return self.handle_end_of_log(header_template, term_offset, term_id);
        }

        let mut flags = frame::BEGIN_FLAG;
        let mut offset = term_offset as usize;
        let mut remaining = msg;
        loop {
            let bytes_to_write = remaining.len().min(max_payload_length);
            let frame_length = bytes_to_write + DATA_HEADER_LENGTH;
            if bytes_to_write == remaining.len() {
                flags |= frame::END_FLAG;
            }

            self.write_header(header_template, offset, term_id, flags, reserved_value);
            self.term
                .put_bytes(offset + DATA_HEADER_LENGTH, &remaining[..bytes_to_write]);
            frame_descriptor::frame_length_ordered(&self.term, offset, frame_length as i32);

            remaining = &remaining[bytes_to_write..];
            if remaining.is_empty() {
                break;
            }
            flags = 0;
            offset += align(frame_length, FRAME_ALIGNMENT);
        }

        resulting_offset
    }

    fn write_header(
        &self,
        header_template: &[u8; DATA_HEADER_LENGTH],
        offset: usize,
        term_id: i32,
        flags: u8,
        reserved_value: i64,
    ) {
        self.term.put_bytes(offset, header_template);
        // Length stays zero until commit; fix up the per-frame fields.
        self.term.put_i32(offset + frame::FRAME_LENGTH_OFFSET, 0);
        self.term.put_u8(offset + frame::FLAGS_OFFSET, flags);
        self.term
            .put_i32(offset + frame::TERM_OFFSET_OFFSET, offset as i32);
        self.term.put_i32(offset + frame::TERM_ID_OFFSET, term_id);
        self.term
            .put_i64(offset + frame::RESERVED_VALUE_OFFSET, reserved_value);
    }

    fn handle_end_of_log(
        &self,
        header_template: &[u8; DATA_HEADER_LENGTH],
        term_offset: i64,
        term_id: i32,
    ) -> i64 {
        let term_length = self.term.capacity() as i64;
        if term_offset < term_length {
            let session_id = i32::from_le_bytes(
                header_template[frame::SESSION_ID_OFFSET..frame::SESSION_ID_OFFSET + 4]
                    .try_into()
                    .unwrap(),
            );
            let stream_id = i32::from_le_bytes(
                header_template[frame::STREAM_ID_OFFSET..frame::STREAM_ID_OFFSET + 4]
                    .try_into()
                    .unwrap(),
            );
            frame_descriptor::write_padding_frame(
                &self.term,
                term_offset as usize,
                (term_length - term_offset) as usize,
                term_id,
                session_id,
                stream_id,
            );
            return TERM_TRIPPED;
        }
        if term_offset == term_length {
            return TERM_TRIPPED;
        }
        TERM_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{initialize, pack_tail, LOG_META_DATA_MIN_LENGTH};
    use cn_concurrent::AlignedBuffer;

    const TERM_LENGTH: usize = 64 * 1024;
    const INITIAL_TERM_ID: i32 = 7;

    struct Fixture {
        _term_mem: AlignedBuffer,
        _meta_mem: AlignedBuffer,
        term: AtomicBuffer,
        meta: AtomicBuffer,
        header: [u8; DATA_HEADER_LENGTH],
    }

    fn fixture() -> Fixture {
        let term_mem = AlignedBuffer::with_capacity(TERM_LENGTH);
        let meta_mem = AlignedBuffer::with_capacity(LOG_META_DATA_MIN_LENGTH);
        let term = term_mem.buffer();
        let meta = meta_mem.buffer();
        initialize(&meta, 1, INITIAL_TERM_ID, TERM_LENGTH, 4096, 1408, 100, 42);
        let header = frame::default_data_header(100, 42, INITIAL_TERM_ID);
        Fixture {
            _term_mem: term_mem,
            _meta_mem: meta_mem,
            term,
            meta,
            header,
        }
    }

    #[test]
    fn unfragmented_append_publishes_aligned_frame() {
        let f = fixture();
        let appender = TermAppender::new(f.term, f.meta, 0);

        let result = appender.append_unfragmented(&f.header, b"hello", 0);
        assert_eq!(result, 64, "align(32 + 5, 32)");

        assert_eq!(frame_descriptor::frame_length_volatile(&f.term, 0), 37);
        assert_eq!(frame_descriptor::frame_flags(&f.term, 0), frame::UNFRAGMENTED);
        assert_eq!(frame_descriptor::frame_term_id(&f.term, 0), INITIAL_TERM_ID);
        assert_eq!(f.term.as_slice(DATA_HEADER_LENGTH, 5), b"hello");
    }

    #[test]
    fn consecutive_appends_pack_back_to_back() {
        let f = fixture();
        let appender = TermAppender::new(f.term, f.meta, 0);

        assert_eq!(appender.append_unfragmented(&f.header, &[0u8; 32], 0), 64);
        assert_eq!(appender.append_unfragmented(&f.header, &[0u8; 32], 0), 128);
        assert_eq!(frame_descriptor::frame_term_offset(&f.term, 64), 64);
    }

    #[test]
    fn exact_fit_to_term_end_needs_no_pad() {
        let f = fixture();
        let appender = TermAppender::new(f.term, f.meta, 0);

        // One frame that exactly reaches term end.
        let payload = vec![0u8; TERM_LENGTH - DATA_HEADER_LENGTH];
        let result = appender.append_unfragmented(&f.header, &payload, 0);
        assert_eq!(result, TERM_LENGTH as i64);
        assert!(!frame_descriptor::is_padding_frame(&f.term, 0));

        // The term is now exactly full: the next append trips with no pad
        // to write.
        assert_eq!(appender.append_unfragmented(&f.header, b"x", 0), TERM_TRIPPED);
    }

    #[test]
    fn straddling_append_writes_pad_and_trips() {
        let f = fixture();
        let appender = TermAppender::new(f.term, f.meta, 0);

        let payload = vec![0u8; TERM_LENGTH - DATA_HEADER_LENGTH - 64];
        assert_eq!(
            appender.append_unfragmented(&f.header, &payload, 0),
            (TERM_LENGTH - 64) as i64
        );

        // 64 bytes remain; a 33-byte payload needs 96 and must trip.
        assert_eq!(
            appender.append_unfragmented(&f.header, &[0u8; 33], 0),
            TERM_TRIPPED
        );
        let pad_offset = TERM_LENGTH - 64;
        assert!(frame_descriptor::is_padding_frame(&f.term, pad_offset));
        assert_eq!(
            frame_descriptor::frame_length_volatile(&f.term, pad_offset),
            64
        );

        // Appenders arriving after the trip find the term failed.
        assert_eq!(appender.append_unfragmented(&f.header, b"x", 0), TERM_FAILED);
    }

    #[test]
    fn fragmented_append_sets_begin_middle_end_flags() {
        let f = fixture();
        let appender = TermAppender::new(f.term, f.meta, 0);
        let max_payload = 1408 - DATA_HEADER_LENGTH;

        let msg = vec![7u8; 4000];
        let result = appender.append_fragmented(&f.header, &msg, max_payload, 0);
        // 2 full fragments of 1408 bytes plus align(1248 + 32, 32).
        assert_eq!(result, (1408 + 1408 + 1280) as i64);

        assert_eq!(frame_descriptor::frame_flags(&f.term, 0), frame::BEGIN_FLAG);
        assert_eq!(frame_descriptor::frame_flags(&f.term, 1408), 0);
        assert_eq!(frame_descriptor::frame_flags(&f.term, 2816), frame::END_FLAG);
        assert_eq!(frame_descriptor::frame_length_volatile(&f.term, 2816), 1248 + 32);
    }

    #[test]
    fn fragments_share_one_claim() {
        let f = fixture();
        let appender = TermAppender::new(f.term, f.meta, 0);
        let max_payload = 1408 - DATA_HEADER_LENGTH;

        appender.append_fragmented(&f.header, &[1u8; 3000], max_payload, 0);
        let raw = appender.raw_tail_volatile();
        assert_eq!(
            raw,
            pack_tail(INITIAL_TERM_ID, 1408 + 1408 + align(3000 - 2 * max_payload + 32, 32) as i32)
        );
    }
}
