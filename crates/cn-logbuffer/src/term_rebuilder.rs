//! Term rebuilder: the Receiver's write path into an image's term.
//!
//! Inbound DATA packets (which may arrive out of order or repeated) are
//! copied into the term at their stated offset.  The frame length is the
//! last thing stored, with release, so local subscribers scanning the term
//! observe either nothing or the complete frame.  Re-insertion over an
//! already-built frame is harmless: the bytes are identical.

use cn_concurrent::AtomicBuffer;
use cn_protocol::frame;

/// Copy one packet (a complete frame, header included) into the term at
/// `term_offset`.
pub fn insert(term: &AtomicBuffer, term_offset: usize, packet: &[u8]) {
    if term.get_i32_volatile(term_offset) == 0 {
        // Body first, then everything after the length field of the header,
        // then publish via the length.
        term.put_bytes(
            term_offset + frame::FRAME_LENGTH_OFFSET + 4,
            &packet[frame::FRAME_LENGTH_OFFSET + 4..],
        );
        let frame_length = i32::from_le_bytes(packet[0..4].try_into().unwrap());
        term.put_i32_ordered(term_offset, frame_length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_descriptor;
    use cn_concurrent::AlignedBuffer;
    use cn_protocol::frame::{DataHeader, DATA_HEADER_LENGTH, HDR_TYPE_DATA, UNFRAGMENTED};

    fn packet(term_offset: i32, payload: &[u8]) -> Vec<u8> {
        let frame_length = DATA_HEADER_LENGTH + payload.len();
        let mut buf = vec![0u8; frame_length];
        DataHeader {
            frame_length: frame_length as i32,
            flags: UNFRAGMENTED,
            frame_type: HDR_TYPE_DATA,
            term_offset,
            session_id: 100,
            stream_id: 42,
            term_id: 7,
            reserved_value: 0,
        }
        .encode(&mut buf);
        buf[DATA_HEADER_LENGTH..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn insert_publishes_complete_frame() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();

        insert(&term, 64, &packet(64, b"payload"));

        assert_eq!(
            frame_descriptor::frame_length_volatile(&term, 64),
            (DATA_HEADER_LENGTH + 7) as i32
        );
        assert_eq!(term.as_slice(64 + DATA_HEADER_LENGTH, 7), b"payload");
    }

    #[test]
    fn out_of_order_inserts_fill_gaps_in_place() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();

        insert(&term, 64, &packet(64, b"second"));
        assert_eq!(frame_descriptor::frame_length_volatile(&term, 0), 0);

        insert(&term, 0, &packet(0, b"first!"));
        assert_eq!(term.as_slice(DATA_HEADER_LENGTH, 6), b"first!");
        assert_eq!(term.as_slice(64 + DATA_HEADER_LENGTH, 6), b"second");
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let mem = AlignedBuffer::with_capacity(4096);
        let term = mem.buffer();

        insert(&term, 0, &packet(0, b"original"));
        insert(&term, 0, &packet(0, b"replaced"));
        assert_eq!(term.as_slice(DATA_HEADER_LENGTH, 8), b"original");
    }
}
