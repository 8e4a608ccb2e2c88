//! Term unblocker.
//!
//! A publisher that claims space (frame length still zero) and then stalls
//! past the unblock timeout leaves every consumer stuck at its offset.  The
//! driver overwrites the claimed region with a PAD frame so consumers can
//! progress; the stalled publisher's eventual commit is harmless because
//! readers have already passed the region.

use cn_concurrent::AtomicBuffer;

use crate::frame_descriptor;

/// Overwrite the claimed-but-unpublished region `[blocked_offset,
/// tail_offset)` with a PAD frame.  Returns `true` if the region was
/// unblocked.
pub fn unblock(
    term: &AtomicBuffer,
    blocked_offset: usize,
    tail_offset: usize,
    term_id: i32,
    session_id: i32,
    stream_id: i32,
) -> bool {
    if tail_offset <= blocked_offset {
        return false;
    }
    if frame_descriptor::frame_length_volatile(term, blocked_offset) != 0 {
        return false;
    }

    frame_descriptor::write_padding_frame(
        term,
        blocked_offset,
        tail_offset - blocked_offset,
        term_id,
        session_id,
        stream_id,
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term_reader;
    use cn_concurrent::AlignedBuffer;

    #[test]
    fn unblocks_claimed_region() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();

        // A claim of 96 bytes at offset 64 that never committed: readers at
        // 64 see frame length zero while the tail is at 160.
        assert!(unblock(&term, 64, 160, 7, 1, 2));

        let outcome = term_reader::read(&term, 64, 4096, 10, |_, _| panic!("padding only"));
        assert_eq!(outcome.offset, 160, "consumer can now pass the region");
    }

    #[test]
    fn committed_frame_is_not_overwritten() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        frame_descriptor::frame_length_ordered(&term, 64, 96);

        assert!(!unblock(&term, 64, 160, 7, 1, 2));
    }

    #[test]
    fn noop_when_tail_has_not_passed_offset() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();
        assert!(!unblock(&term, 64, 64, 7, 1, 2));
    }
}
