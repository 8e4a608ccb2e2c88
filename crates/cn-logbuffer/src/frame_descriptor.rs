//! Frame header access within term buffers.
//!
//! Frames in a term use the DATA header layout from the wire protocol.
//! The frame length field is the commit point: written last with release
//! semantics by appenders and rebuilders, read first with acquire by
//! scanners.  A zero length means "not yet published".

use cn_concurrent::AtomicBuffer;
use cn_protocol::frame;

pub use cn_protocol::frame::{DATA_HEADER_LENGTH, FRAME_ALIGNMENT};

/// Committed frame length, acquire.
#[inline]
pub fn frame_length_volatile(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32_volatile(offset + frame::FRAME_LENGTH_OFFSET)
}

/// Publish a frame by storing its length, release.
#[inline]
pub fn frame_length_ordered(term: &AtomicBuffer, offset: usize, length: i32) {
    term.put_i32_ordered(offset + frame::FRAME_LENGTH_OFFSET, length);
}

#[inline]
pub fn frame_type(term: &AtomicBuffer, offset: usize) -> u16 {
    term.get_u16(offset + frame::TYPE_OFFSET)
}

#[inline]
pub fn frame_flags(term: &AtomicBuffer, offset: usize) -> u8 {
    term.get_u8(offset + frame::FLAGS_OFFSET)
}

#[inline]
pub fn frame_term_id(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + frame::TERM_ID_OFFSET)
}

#[inline]
pub fn frame_term_offset(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + frame::TERM_OFFSET_OFFSET)
}

#[inline]
pub fn frame_session_id(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32(offset + frame::SESSION_ID_OFFSET)
}

#[inline]
pub fn is_padding_frame(term: &AtomicBuffer, offset: usize) -> bool {
    frame_type(term, offset) == frame::HDR_TYPE_PAD
}

/// Write a PAD frame header covering `length` bytes at `offset`.
///
/// The header is fully written before the length is released so scanners
/// never observe a half-written pad.
pub fn write_padding_frame(
    term: &AtomicBuffer,
    offset: usize,
    length: usize,
    term_id: i32,
    session_id: i32,
    stream_id: i32,
) {
    let mut header = [0u8; DATA_HEADER_LENGTH];
    frame::DataHeader {
        frame_length: 0,
        flags: frame::UNFRAGMENTED,
        frame_type: frame::HDR_TYPE_PAD,
        term_offset: offset as i32,
        session_id,
        stream_id,
        term_id,
        reserved_value: 0,
    }
    .encode(&mut header);
    term.put_bytes(offset, &header);
    frame_length_ordered(term, offset, length as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_concurrent::AlignedBuffer;

    #[test]
    fn zero_length_means_unpublished() {
        let mem = AlignedBuffer::with_capacity(256);
        let term = mem.buffer();
        assert_eq!(frame_length_volatile(&term, 0), 0);
    }

    #[test]
    fn padding_frame_is_recognized() {
        let mem = AlignedBuffer::with_capacity(256);
        let term = mem.buffer();
        write_padding_frame(&term, 64, 128, 7, 100, 42);
        assert!(is_padding_frame(&term, 64));
        assert_eq!(frame_length_volatile(&term, 64), 128);
        assert_eq!(frame_term_id(&term, 64), 7);
        assert_eq!(frame_term_offset(&term, 64), 64);
    }
}
