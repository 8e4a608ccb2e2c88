//! Gap scanner: finds the first hole between the rebuild position and the
//! high-water mark of an image's term.
//!
//! A gap starts at the first zero frame length and runs to the next
//! committed frame header (or the scan limit).  The loss detector turns
//! reported gaps into NAKs.

use cn_concurrent::AtomicBuffer;

use crate::frame_descriptor::{self, FRAME_ALIGNMENT};

/// Scan `term` between `rebuild_offset` and `limit_offset` for the first
/// gap.  Reports it to `on_gap(term_id, gap_offset, gap_length)` and
/// returns the gap offset, or `None` when the range is fully built.
pub fn scan_for_gap<F>(
    term: &AtomicBuffer,
    term_id: i32,
    rebuild_offset: usize,
    limit_offset: usize,
    mut on_gap: F,
) -> Option<usize>
where
    F: FnMut(i32, usize, usize),
{
    let mut offset = rebuild_offset;

    while offset < limit_offset {
        let frame_length = frame_descriptor::frame_length_volatile(term, offset);
        if frame_length <= 0 {
            break;
        }
        offset += cn_concurrent::align(frame_length as usize, FRAME_ALIGNMENT);
    }

    if offset >= limit_offset {
        return None;
    }

    let gap_begin = offset;
    let mut gap_end = gap_begin;
    while gap_end < limit_offset
        && frame_descriptor::frame_length_volatile(term, gap_end) == 0
    {
        gap_end += FRAME_ALIGNMENT;
    }

    on_gap(term_id, gap_begin, gap_end - gap_begin);
    Some(gap_begin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term_rebuilder;
    use cn_concurrent::AlignedBuffer;
    use cn_protocol::frame::{DataHeader, DATA_HEADER_LENGTH, HDR_TYPE_DATA, UNFRAGMENTED};

    fn packet(term_offset: i32, payload_len: usize) -> Vec<u8> {
        let frame_length = DATA_HEADER_LENGTH + payload_len;
        let mut buf = vec![0u8; frame_length];
        DataHeader {
            frame_length: frame_length as i32,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset,
            session_id: 1,
            stream_id: 2,
            term_id: 7,
            reserved_value: 0,
        }
        .encode(&mut buf);
        buf
    }

    #[test]
    fn contiguous_range_has_no_gap() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 0, &packet(0, 32));
        term_rebuilder::insert(&term, 64, &packet(64, 32));

        let mut gaps = Vec::new();
        let found = scan_for_gap(&term, 7, 0, 128, |t, o, l| gaps.push((t, o, l)));
        assert_eq!(found, None);
        assert!(gaps.is_empty());
    }

    #[test]
    fn missing_middle_frame_is_reported() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        // Frames at 0 and 128; 64..128 missing.
        term_rebuilder::insert(&term, 0, &packet(0, 32));
        term_rebuilder::insert(&term, 128, &packet(128, 32));

        let mut gaps = Vec::new();
        let found = scan_for_gap(&term, 7, 0, 192, |t, o, l| gaps.push((t, o, l)));
        assert_eq!(found, Some(64));
        assert_eq!(gaps, vec![(7, 64, 64)]);
    }

    #[test]
    fn gap_extends_to_limit_when_tail_is_missing() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 0, &packet(0, 32));

        let mut gaps = Vec::new();
        scan_for_gap(&term, 7, 0, 256, |t, o, l| gaps.push((t, o, l)));
        assert_eq!(gaps, vec![(7, 64, 192)]);
    }

    #[test]
    fn scan_starts_at_rebuild_offset() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        term_rebuilder::insert(&term, 128, &packet(128, 32));

        let mut gaps = Vec::new();
        let found = scan_for_gap(&term, 7, 64, 192, |t, o, l| gaps.push((t, o, l)));
        assert_eq!(found, Some(64));
        assert_eq!(gaps, vec![(7, 64, 64)]);
    }
}
