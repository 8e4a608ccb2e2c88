//! Term reader: the subscriber side of a term partition.
//!
//! Reads committed frames from an offset, delivering payload fragments to
//! a handler.  A zero frame length stops the scan (nothing more is
//! published yet); PAD frames are consumed silently so the caller's
//! position still advances over them.

use cn_concurrent::{align, AtomicBuffer};
use cn_protocol::frame;

use crate::frame_descriptor::{self, DATA_HEADER_LENGTH, FRAME_ALIGNMENT};

/// Frame metadata passed to fragment handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub term_id: i32,
    pub term_offset: i32,
    pub session_id: i32,
    pub flags: u8,
    pub frame_length: i32,
}

impl FragmentHeader {
    pub fn is_begin(&self) -> bool {
        self.flags & frame::BEGIN_FLAG != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & frame::END_FLAG != 0
    }

    pub fn is_unfragmented(&self) -> bool {
        self.flags & frame::UNFRAGMENTED == frame::UNFRAGMENTED
    }
}

/// Outcome of a read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Term offset after the last consumed frame.
    pub offset: usize,
    /// Data fragments delivered (padding excluded).
    pub fragments_read: usize,
}

/// Read up to `fragment_limit` fragments from `term` starting at `offset`,
/// bounded by `limit_offset`.
pub fn read<F>(
    term: &AtomicBuffer,
    offset: usize,
    limit_offset: usize,
    fragment_limit: usize,
    mut handler: F,
) -> ReadOutcome
where
    F: FnMut(&[u8], FragmentHeader),
{
    let mut offset = offset;
    let mut fragments_read = 0;

    while fragments_read < fragment_limit && offset < limit_offset {
        let frame_length = frame_descriptor::frame_length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }

        let frame_offset = offset;
        offset += align(frame_length as usize, FRAME_ALIGNMENT);

        if frame_descriptor::is_padding_frame(term, frame_offset) {
            continue;
        }

        let header = FragmentHeader {
            term_id: frame_descriptor::frame_term_id(term, frame_offset),
            term_offset: frame_offset as i32,
            session_id: frame_descriptor::frame_session_id(term, frame_offset),
            flags: frame_descriptor::frame_flags(term, frame_offset),
            frame_length,
        };
        let payload = term.as_slice(
            frame_offset + DATA_HEADER_LENGTH,
            frame_length as usize - DATA_HEADER_LENGTH,
        );
        handler(payload, header);
        fragments_read += 1;
    }

    ReadOutcome {
        offset,
        fragments_read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{initialize, LOG_META_DATA_MIN_LENGTH};
    use crate::term_appender::TermAppender;
    use cn_concurrent::AlignedBuffer;

    const TERM_LENGTH: usize = 64 * 1024;

    fn fixture() -> (AlignedBuffer, AlignedBuffer, [u8; DATA_HEADER_LENGTH]) {
        let term_mem = AlignedBuffer::with_capacity(TERM_LENGTH);
        let meta_mem = AlignedBuffer::with_capacity(LOG_META_DATA_MIN_LENGTH);
        let meta = meta_mem.buffer();
        initialize(&meta, 1, 0, TERM_LENGTH, 4096, 1408, 1, 2);
        (term_mem, meta_mem, frame::default_data_header(1, 2, 0))
    }

    #[test]
    fn reads_committed_fragments_in_order() {
        let (term_mem, meta_mem, header) = fixture();
        let appender = TermAppender::new(term_mem.buffer(), meta_mem.buffer(), 0);
        appender.append_unfragmented(&header, b"one", 0);
        appender.append_unfragmented(&header, b"two", 0);

        let term = term_mem.buffer();
        let mut seen = Vec::new();
        let outcome = read(&term, 0, TERM_LENGTH, 10, |payload, h| {
            assert!(h.is_unfragmented());
            seen.push(payload.to_vec());
        });

        assert_eq!(outcome.fragments_read, 2);
        assert_eq!(outcome.offset, 128);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn stops_at_unpublished_frame_and_respects_limit() {
        let (term_mem, meta_mem, header) = fixture();
        let appender = TermAppender::new(term_mem.buffer(), meta_mem.buffer(), 0);
        for _ in 0..5 {
            appender.append_unfragmented(&header, b"m", 0);
        }

        let term = term_mem.buffer();
        let outcome = read(&term, 0, TERM_LENGTH, 3, |_, _| {});
        assert_eq!(outcome.fragments_read, 3);

        let rest = read(&term, outcome.offset, TERM_LENGTH, 10, |_, _| {});
        assert_eq!(rest.fragments_read, 2);
        assert_eq!(
            read(&term, rest.offset, TERM_LENGTH, 10, |_, _| {}).fragments_read,
            0
        );
    }

    #[test]
    fn padding_is_skipped_but_advances_offset() {
        let (term_mem, _, _) = fixture();
        let term = term_mem.buffer();
        frame_descriptor::write_padding_frame(&term, 0, 256, 0, 1, 2);

        let outcome = read(&term, 0, TERM_LENGTH, 10, |_, _| panic!("no data expected"));
        assert_eq!(outcome.fragments_read, 0);
        assert_eq!(outcome.offset, 256);
    }
}
