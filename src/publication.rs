//! Client publication handle.
//!
//! Appends messages to the shared log buffer.  The driver's Conductor
//! governs how far ahead of consumption the publisher may run through the
//! publisher-limit counter; the appender itself is lock-free against
//! other publishers on the same (non-exclusive) stream.

use std::sync::Arc;

use cn_concurrent::AtomicCounter;
use cn_logbuffer::descriptor::{self, EOS_NOT_SET};
use cn_logbuffer::term_appender::{TermAppender, TERM_FAILED, TERM_TRIPPED};
use cn_logbuffer::MappedRawLog;
use cn_protocol::frame::DATA_HEADER_LENGTH;

/// Why an offer did not accept the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The publisher reached its position limit; retry later.
    BackPressured,
    /// No connected subscriber is consuming the stream.
    NotConnected,
    /// A term rotated under the offer; retry immediately.
    AdminAction,
    /// The publication has been closed or revoked.
    Closed,
    /// The stream reached the maximum position for its term length.
    MaxPositionExceeded,
    /// The message exceeds the maximum of an eighth of the term length.
    MessageTooLong,
}

/// A publisher's handle on one stream.
pub struct Publication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    log: Arc<MappedRawLog>,
    position_limit: AtomicCounter,
    term_length: usize,
    position_bits: u32,
    initial_term_id: i32,
    max_payload_length: usize,
    max_message_length: usize,
    max_position: i64,
}

impl Publication {
    pub(crate) fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        log: Arc<MappedRawLog>,
        position_limit: AtomicCounter,
    ) -> Self {
        let meta = log.metadata_buffer();
        let term_length = descriptor::term_length(&meta);
        let position_bits = descriptor::position_bits_to_shift(term_length);
        let initial_term_id = descriptor::initial_term_id(&meta);
        let mtu = descriptor::mtu_length(&meta);
        Publication {
            registration_id,
            session_id,
            stream_id,
            log,
            position_limit,
            term_length,
            position_bits,
            initial_term_id,
            max_payload_length: mtu - DATA_HEADER_LENGTH,
            max_message_length: term_length / 8,
            max_position: descriptor::compute_max_position(term_length, position_bits),
        }
    }

    /// The publisher's current position.
    pub fn position(&self) -> i64 {
        let meta = self.log.metadata_buffer();
        let term_count = descriptor::active_term_count(&meta);
        let index = descriptor::index_by_term_count(term_count);
        let raw = descriptor::raw_tail_volatile(&meta, index);
        descriptor::compute_position(
            descriptor::term_id_from_raw_tail(raw),
            descriptor::term_offset_from_raw_tail(raw, self.term_length),
            self.position_bits,
            self.initial_term_id,
        )
    }

    pub fn position_limit(&self) -> i64 {
        self.position_limit.get_volatile()
    }

    pub fn is_connected(&self) -> bool {
        descriptor::is_connected(&self.log.metadata_buffer())
    }

    /// Offer a message for transmission.  Returns the stream position
    /// after the message on success.
    pub fn offer(&mut self, msg: &[u8]) -> Result<i64, OfferOutcome> {
        if msg.len() > self.max_message_length {
            return Err(OfferOutcome::MessageTooLong);
        }

        let meta = self.log.metadata_buffer();
        if descriptor::is_revoked(&meta) {
            return Err(OfferOutcome::Closed);
        }

        let term_count = descriptor::active_term_count(&meta);
        let index = descriptor::index_by_term_count(term_count);
        let appender = TermAppender::new(self.log.term_buffer(index), meta, index);

        let raw_tail = appender.raw_tail_volatile();
        let term_id = descriptor::term_id_from_raw_tail(raw_tail);
        let term_offset = descriptor::term_offset_from_raw_tail(raw_tail, self.term_length);
        let position = descriptor::compute_position(
            term_id,
            term_offset,
            self.position_bits,
            self.initial_term_id,
        );

        let eos = descriptor::end_of_stream_position(&meta);
        if eos != EOS_NOT_SET && position >= eos {
            return Err(OfferOutcome::Closed);
        }
        if position >= self.max_position {
            return Err(OfferOutcome::MaxPositionExceeded);
        }

        let limit = self.position_limit.get_volatile();
        if position >= limit {
            return if descriptor::is_connected(&meta) {
                Err(OfferOutcome::BackPressured)
            } else {
                Err(OfferOutcome::NotConnected)
            };
        }

        let header = descriptor::default_frame_header(&meta);
        let result = if msg.len() <= self.max_payload_length {
            appender.append_unfragmented(&header, msg, 0)
        } else {
            appender.append_fragmented(&header, msg, self.max_payload_length, 0)
        };

        match result {
            // Either this appender tripped the term end or another one
            // did; the rotation CAS is idempotent across racing appenders.
            TERM_TRIPPED | TERM_FAILED => {
                descriptor::rotate_log(&meta, term_count, term_id);
                Err(OfferOutcome::AdminAction)
            }
            resulting_offset => Ok(descriptor::compute_position(
                term_id,
                resulting_offset as i32,
                self.position_bits,
                self.initial_term_id,
            )),
        }
    }
}
