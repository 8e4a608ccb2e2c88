//! Log buffer metadata layout and position arithmetic.
//!
//! The metadata section trails the three term partitions in the mapped
//! file.  Each tail counter packs `(term id << 32) | term offset` so a
//! single fetch-add claims space and identifies the term it landed in.
//!
//! Single-writer discipline per field: tails are written by appenders,
//! `end-of-stream position` by the owning publisher, `is-connected` by the
//! Conductor, the rest are immutable after initialization.

use cn_concurrent::AtomicBuffer;
use cn_protocol::frame;

use crate::PARTITION_COUNT;

// ---------------------------------------------------------------------------
// Metadata field offsets
// ---------------------------------------------------------------------------

pub const TERM_TAIL_COUNTERS_OFFSET: usize = 0;
pub const LOG_ACTIVE_TERM_COUNT_OFFSET: usize = 24;
pub const LOG_END_OF_STREAM_POSITION_OFFSET: usize = 32;
pub const LOG_IS_CONNECTED_OFFSET: usize = 40;
pub const LOG_ACTIVE_TRANSPORT_COUNT_OFFSET: usize = 44;
pub const LOG_CORRELATION_ID_OFFSET: usize = 48;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = 56;
pub const LOG_MTU_LENGTH_OFFSET: usize = 60;
pub const LOG_TERM_LENGTH_OFFSET: usize = 64;
pub const LOG_PAGE_SIZE_OFFSET: usize = 68;
pub const LOG_RECEIVER_WINDOW_LENGTH_OFFSET: usize = 72;
pub const LOG_SOCKET_SNDBUF_OFFSET: usize = 76;
pub const LOG_SOCKET_RCVBUF_OFFSET: usize = 80;
pub const LOG_MAX_RESEND_OFFSET: usize = 84;
pub const LOG_ENTITY_TAG_OFFSET: usize = 88;
pub const LOG_RESPONSE_CORRELATION_ID_OFFSET: usize = 96;
pub const LOG_LINGER_TIMEOUT_NS_OFFSET: usize = 104;
pub const LOG_UNTETHERED_WINDOW_LIMIT_TIMEOUT_NS_OFFSET: usize = 112;
pub const LOG_UNTETHERED_LINGER_TIMEOUT_NS_OFFSET: usize = 120;
pub const LOG_UNTETHERED_RESTING_TIMEOUT_NS_OFFSET: usize = 128;
pub const LOG_IS_REVOKED_OFFSET: usize = 136;
pub const LOG_IS_SPARSE_OFFSET: usize = 140;
pub const LOG_IS_TETHER_OFFSET: usize = 141;
pub const LOG_IS_REJOIN_OFFSET: usize = 142;
pub const LOG_IS_RELIABLE_OFFSET: usize = 143;
pub const LOG_IS_GROUP_OFFSET: usize = 144;
pub const LOG_IS_RESPONSE_OFFSET: usize = 145;
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: usize = 192;

/// Minimum bytes the metadata section must span.
pub const LOG_META_DATA_MIN_LENGTH: usize = 256;

/// Sentinel for an unset end-of-stream position.
pub const EOS_NOT_SET: i64 = i64::MAX;

// ---------------------------------------------------------------------------
// Tail packing
// ---------------------------------------------------------------------------

#[inline]
pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as i64 & 0xFFFF_FFFF)
}

#[inline]
pub fn term_id_from_raw_tail(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// The term offset within `raw_tail`, saturated at `term_length` when
/// appenders have overshot the end of the term.
#[inline]
pub fn term_offset_from_raw_tail(raw_tail: i64, term_length: usize) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length as i64) as i32
}

#[inline]
pub fn tail_counter_offset(index: usize) -> usize {
    TERM_TAIL_COUNTERS_OFFSET + index * 8
}

// ---------------------------------------------------------------------------
// Position arithmetic
// ---------------------------------------------------------------------------

/// Number of bits to shift a term count to get a position.
#[inline]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    term_length.trailing_zeros()
}

/// The stream position of `(term_id, term_offset)`.
#[inline]
pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = (term_id as i64) - (initial_term_id as i64);
    (term_count << position_bits_to_shift) + term_offset as i64
}

/// The stream position at which `term_id` begins.
#[inline]
pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_position(term_id, 0, position_bits_to_shift, initial_term_id)
}

#[inline]
pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) + initial_term_id as i64) as i32
}

#[inline]
pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    (position & ((1i64 << position_bits_to_shift) - 1)) as i32
}

/// The highest position an exclusive publisher may ever reach: the last
/// whole term before `(term_id - initial_term_id)` would produce an
/// out-of-order partition index.
#[inline]
pub fn compute_max_position(term_length: usize, position_bits_to_shift: u32) -> i64 {
    let max_term_count = (1i64 << 31) - 1;
    (max_term_count << position_bits_to_shift) + term_length as i64
}

// ---------------------------------------------------------------------------
// Partition indexing
// ---------------------------------------------------------------------------

#[inline]
pub fn index_by_term_count(term_count: i32) -> usize {
    (term_count.rem_euclid(PARTITION_COUNT as i32)) as usize
}

#[inline]
pub fn index_by_term(initial_term_id: i32, active_term_id: i32) -> usize {
    index_by_term_count(active_term_id.wrapping_sub(initial_term_id))
}

#[inline]
pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) % PARTITION_COUNT as i64) as usize
}

// ---------------------------------------------------------------------------
// Metadata accessors
// ---------------------------------------------------------------------------

pub fn initialize(
    meta: &AtomicBuffer,
    correlation_id: i64,
    initial_term_id: i32,
    term_length: usize,
    page_size: usize,
    mtu: usize,
    session_id: i32,
    stream_id: i32,
) {
    meta.put_i64(LOG_CORRELATION_ID_OFFSET, correlation_id);
    meta.put_i32(LOG_INITIAL_TERM_ID_OFFSET, initial_term_id);
    meta.put_i32(LOG_TERM_LENGTH_OFFSET, term_length as i32);
    meta.put_i32(LOG_PAGE_SIZE_OFFSET, page_size as i32);
    meta.put_i32(LOG_MTU_LENGTH_OFFSET, mtu as i32);
    meta.put_i64(LOG_END_OF_STREAM_POSITION_OFFSET, EOS_NOT_SET);

    // Tail for the first partition is live; the other two hold the term id
    // their first rotation will CAS against.
    meta.put_i64(tail_counter_offset(0), pack_tail(initial_term_id, 0));
    for i in 1..PARTITION_COUNT {
        let expected_term_id = initial_term_id + i as i32 - PARTITION_COUNT as i32;
        meta.put_i64(tail_counter_offset(i), pack_tail(expected_term_id, 0));
    }

    let header = frame::default_data_header(session_id, stream_id, initial_term_id);
    meta.put_bytes(LOG_DEFAULT_FRAME_HEADER_OFFSET, &header);
}

pub fn correlation_id(meta: &AtomicBuffer) -> i64 {
    meta.get_i64(LOG_CORRELATION_ID_OFFSET)
}

pub fn initial_term_id(meta: &AtomicBuffer) -> i32 {
    meta.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
}

pub fn term_length(meta: &AtomicBuffer) -> usize {
    meta.get_i32(LOG_TERM_LENGTH_OFFSET) as usize
}

pub fn page_size(meta: &AtomicBuffer) -> usize {
    meta.get_i32(LOG_PAGE_SIZE_OFFSET) as usize
}

pub fn mtu_length(meta: &AtomicBuffer) -> usize {
    meta.get_i32(LOG_MTU_LENGTH_OFFSET) as usize
}

pub fn active_term_count(meta: &AtomicBuffer) -> i32 {
    meta.get_i32_volatile(LOG_ACTIVE_TERM_COUNT_OFFSET)
}

pub fn cas_active_term_count(meta: &AtomicBuffer, expected: i32, update: i32) -> bool {
    meta.compare_and_set_i32(LOG_ACTIVE_TERM_COUNT_OFFSET, expected, update)
}

pub fn raw_tail_volatile(meta: &AtomicBuffer, index: usize) -> i64 {
    meta.get_i64_volatile(tail_counter_offset(index))
}

pub fn is_connected(meta: &AtomicBuffer) -> bool {
    meta.get_i32_volatile(LOG_IS_CONNECTED_OFFSET) == 1
}

pub fn set_is_connected(meta: &AtomicBuffer, connected: bool) {
    meta.put_i32_ordered(LOG_IS_CONNECTED_OFFSET, i32::from(connected));
}

pub fn active_transport_count(meta: &AtomicBuffer) -> i32 {
    meta.get_i32_volatile(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET)
}

pub fn set_active_transport_count(meta: &AtomicBuffer, count: i32) {
    meta.put_i32_ordered(LOG_ACTIVE_TRANSPORT_COUNT_OFFSET, count);
}

pub fn end_of_stream_position(meta: &AtomicBuffer) -> i64 {
    meta.get_i64_volatile(LOG_END_OF_STREAM_POSITION_OFFSET)
}

/// Set the end-of-stream position.  Monotonic: once set it never moves
/// backwards.
pub fn set_end_of_stream_position(meta: &AtomicBuffer, position: i64) {
    let current = end_of_stream_position(meta);
    if current == EOS_NOT_SET || position < current {
        meta.put_i64_ordered(LOG_END_OF_STREAM_POSITION_OFFSET, position);
    }
}

/// Entity tag declared on the publication's channel (`tags=<n>`), or zero
/// when untagged.
pub fn entity_tag(meta: &AtomicBuffer) -> i64 {
    meta.get_i64(LOG_ENTITY_TAG_OFFSET)
}

pub fn set_entity_tag(meta: &AtomicBuffer, tag: i64) {
    meta.put_i64(LOG_ENTITY_TAG_OFFSET, tag);
}

pub fn is_revoked(meta: &AtomicBuffer) -> bool {
    meta.get_i32_volatile(LOG_IS_REVOKED_OFFSET) == 1
}

pub fn set_is_revoked(meta: &AtomicBuffer) {
    meta.put_i32_ordered(LOG_IS_REVOKED_OFFSET, 1);
}

pub fn default_frame_header(meta: &AtomicBuffer) -> [u8; frame::DATA_HEADER_LENGTH] {
    let mut header = [0u8; frame::DATA_HEADER_LENGTH];
    meta.get_bytes(LOG_DEFAULT_FRAME_HEADER_OFFSET, &mut header);
    header
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

/// Rotate the log to the next term.
///
/// Prepares the tail of the successor partition then advances the active
/// term count by exactly one.  Safe to race: both CASes tolerate a
/// concurrent rotation having won.
pub fn rotate_log(meta: &AtomicBuffer, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id + 1;
    let next_term_count = current_term_count + 1;
    let next_index = index_by_term_count(next_term_count);
    let expected_raw_tail = pack_tail(next_term_id - PARTITION_COUNT as i32, 0);
    let new_raw_tail = pack_tail(next_term_id, 0);

    meta.compare_and_set_i64(tail_counter_offset(next_index), expected_raw_tail, new_raw_tail);
    cas_active_term_count(meta, current_term_count, next_term_count)
}
