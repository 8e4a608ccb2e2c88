//! Fragment reassembly.
//!
//! Messages larger than the MTU arrive as BEGIN / middle / END fragments
//! within one term.  The assembler buffers them back into whole messages;
//! single-fragment messages pass straight through.  A frame claiming both
//! BEGIN and END mid-assembly aborts the partial message: fragments of one
//! message never interleave with another on the same image, so the
//! partial data can only be garbage.

use cn_logbuffer::term_reader::FragmentHeader;

/// Reassembles fragmented messages from `poll` callbacks.
#[derive(Default)]
pub struct FragmentAssembler {
    buffer: Vec<u8>,
    in_progress: bool,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns the complete message when one finishes.
    pub fn on_fragment(&mut self, payload: &[u8], header: FragmentHeader) -> Option<Vec<u8>> {
        if header.is_unfragmented() {
            self.in_progress = false;
            self.buffer.clear();
            return Some(payload.to_vec());
        }

        if header.is_begin() {
            self.buffer.clear();
            self.buffer.extend_from_slice(payload);
            self.in_progress = true;
            return None;
        }

        if !self.in_progress {
            // Middle or end without a begin: a partial view of an old
            // message; drop it.
            return None;
        }

        self.buffer.extend_from_slice(payload);
        if header.is_end() {
            self.in_progress = false;
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_protocol::frame::{BEGIN_FLAG, END_FLAG, UNFRAGMENTED};

    fn header(flags: u8) -> FragmentHeader {
        FragmentHeader {
            term_id: 0,
            term_offset: 0,
            session_id: 1,
            flags,
            frame_length: 64,
        }
    }

    #[test]
    fn single_fragment_passes_through() {
        let mut assembler = FragmentAssembler::new();
        let message = assembler.on_fragment(b"whole", header(UNFRAGMENTED));
        assert_eq!(message.as_deref(), Some(&b"whole"[..]));
    }

    #[test]
    fn three_fragments_reassemble_in_order() {
        let mut assembler = FragmentAssembler::new();
        assert!(assembler.on_fragment(b"aa", header(BEGIN_FLAG)).is_none());
        assert!(assembler.on_fragment(b"bb", header(0)).is_none());
        let message = assembler.on_fragment(b"cc", header(END_FLAG));
        assert_eq!(message.as_deref(), Some(&b"aabbcc"[..]));
    }

    #[test]
    fn unfragmented_mid_assembly_drops_partial() {
        let mut assembler = FragmentAssembler::new();
        assembler.on_fragment(b"aa", header(BEGIN_FLAG));
        let message = assembler.on_fragment(b"solo", header(UNFRAGMENTED));
        assert_eq!(message.as_deref(), Some(&b"solo"[..]));

        // The abandoned partial must not leak into the next message.
        assert!(assembler.on_fragment(b"xx", header(0)).is_none());
    }

    #[test]
    fn tail_without_begin_is_dropped() {
        let mut assembler = FragmentAssembler::new();
        assert!(assembler.on_fragment(b"late", header(END_FLAG)).is_none());
    }
}
