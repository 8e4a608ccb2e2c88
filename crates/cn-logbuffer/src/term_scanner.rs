//! Term scanner: the Sender's view of how much is ready to transmit.
//!
//! Scans committed frames from an offset, accumulating whole frames up to
//! a maximum (the MTU-bounded send quantum).  A padding frame contributes
//! only its header to the transmitted bytes; the remainder of the pad is
//! reported separately so the caller can advance its position past it.

use cn_concurrent::{align, AtomicBuffer};

use crate::frame_descriptor::{self, DATA_HEADER_LENGTH, FRAME_ALIGNMENT};

/// Result of a scan: `available` bytes to transmit starting at the scan
/// offset, then `padding` bytes to skip over without transmitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    pub available: usize,
    pub padding: usize,
}

/// Scan `term` from `offset` for committed frames, bounded by `max_length`.
pub fn scan_for_availability(term: &AtomicBuffer, offset: usize, max_length: usize) -> ScanResult {
    let max_length = max_length.min(term.capacity() - offset);
    let mut available = 0;
    let mut padding = 0;

    loop {
        let frame_offset = offset + available;
        let frame_length = frame_descriptor::frame_length_volatile(term, frame_offset);
        if frame_length <= 0 {
            break;
        }

        let mut aligned_length = align(frame_length as usize, FRAME_ALIGNMENT);
        if frame_descriptor::is_padding_frame(term, frame_offset) {
            padding = aligned_length - DATA_HEADER_LENGTH;
            aligned_length = DATA_HEADER_LENGTH;
        }

        available += aligned_length;
        if available > max_length {
            available -= aligned_length;
            padding = 0;
            break;
        }

        if padding > 0 || available == max_length {
            break;
        }
    }

    ScanResult { available, padding }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{initialize, LOG_META_DATA_MIN_LENGTH};
    use crate::term_appender::TermAppender;
    use cn_concurrent::AlignedBuffer;
    use cn_protocol::frame;

    const TERM_LENGTH: usize = 64 * 1024;

    fn appender_fixture() -> (AlignedBuffer, AlignedBuffer, [u8; DATA_HEADER_LENGTH]) {
        let term_mem = AlignedBuffer::with_capacity(TERM_LENGTH);
        let meta_mem = AlignedBuffer::with_capacity(LOG_META_DATA_MIN_LENGTH);
        let meta = meta_mem.buffer();
        initialize(&meta, 1, 0, TERM_LENGTH, 4096, 1408, 1, 2);
        (term_mem, meta_mem, frame::default_data_header(1, 2, 0))
    }

    #[test]
    fn empty_term_has_nothing_available() {
        let (term_mem, _, _) = appender_fixture();
        let result = scan_for_availability(&term_mem.buffer(), 0, 1408);
        assert_eq!(result, ScanResult { available: 0, padding: 0 });
    }

    #[test]
    fn accumulates_frames_up_to_max_length() {
        let (term_mem, meta_mem, header) = appender_fixture();
        let appender = TermAppender::new(term_mem.buffer(), meta_mem.buffer(), 0);

        // Three 64-byte frames committed.
        for _ in 0..3 {
            appender.append_unfragmented(&header, &[0u8; 32], 0);
        }

        let term = term_mem.buffer();
        assert_eq!(
            scan_for_availability(&term, 0, 1408),
            ScanResult { available: 192, padding: 0 }
        );
        // Bounded at two frames.
        assert_eq!(
            scan_for_availability(&term, 0, 130),
            ScanResult { available: 128, padding: 0 }
        );
    }

    #[test]
    fn stops_at_uncommitted_frame() {
        let (term_mem, meta_mem, header) = appender_fixture();
        let appender = TermAppender::new(term_mem.buffer(), meta_mem.buffer(), 0);
        appender.append_unfragmented(&header, &[0u8; 32], 0);

        let term = term_mem.buffer();
        let result = scan_for_availability(&term, 0, 4096);
        assert_eq!(result.available, 64);
    }

    #[test]
    fn padding_frame_transmits_header_only() {
        let (term_mem, _, _) = appender_fixture();
        let term = term_mem.buffer();
        frame_descriptor::write_padding_frame(&term, 0, 256, 0, 1, 2);

        let result = scan_for_availability(&term, 0, 4096);
        assert_eq!(
            result,
            ScanResult {
                available: DATA_HEADER_LENGTH,
                padding: 256 - DATA_HEADER_LENGTH
            }
        );
    }
}
