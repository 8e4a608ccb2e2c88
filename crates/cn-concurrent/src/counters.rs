//! Shared-memory counters.
//!
//! Counters live in two regions of the cnc file: a metadata region (one
//! record per counter: state, type id, key, label, ownership) and a values
//! region (one cache-line-padded i64 per counter).  The driver allocates
//! system and per-stream counters; clients may allocate user counters.
//! External tooling reads both regions with a [`CountersReader`].

use crate::buffer::AtomicBuffer;
use crate::CACHE_LINE_LENGTH;

/// Metadata record is unused and may be allocated.
pub const RECORD_UNUSED: i32 = 0;
/// Metadata record is in use.
pub const RECORD_ALLOCATED: i32 = 1;
/// Metadata record freed, pending reuse after a cool-down.
pub const RECORD_RECLAIMED: i32 = -1;

/// Bytes per counter metadata record.
pub const METADATA_LENGTH: usize = 192;
/// Bytes per counter value slot (padded to avoid false sharing).
pub const VALUE_LENGTH: usize = CACHE_LINE_LENGTH * 2;

// Metadata record field offsets.
const STATE_OFFSET: usize = 0;
const TYPE_ID_OFFSET: usize = 4;
const FREE_FOR_REUSE_DEADLINE_OFFSET: usize = 8;
const REGISTRATION_ID_OFFSET: usize = 16;
const OWNER_ID_OFFSET: usize = 24;
const KEY_OFFSET: usize = 32;
const LABEL_LENGTH_OFFSET: usize = 64;
const LABEL_OFFSET: usize = 68;

/// Bytes available for the opaque key.
pub const MAX_KEY_LENGTH: usize = LABEL_LENGTH_OFFSET - KEY_OFFSET;
/// Bytes available for the label.
pub const MAX_LABEL_LENGTH: usize = METADATA_LENGTH - LABEL_OFFSET;

/// Registration id value for counters not owned by any registration.
pub const DEFAULT_REGISTRATION_ID: i64 = 0;
/// Owner id value for driver-owned counters.
pub const DEFAULT_OWNER_ID: i64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum CountersError {
    #[error("counters space exhausted ({max} counters)")]
    Exhausted { max: usize },
    #[error("label of {0} bytes exceeds max of {MAX_LABEL_LENGTH}")]
    LabelTooLong(usize),
    #[error("key of {0} bytes exceeds max of {MAX_KEY_LENGTH}")]
    KeyTooLong(usize),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Allocator for counters.  Single-threaded: only the Conductor (or a
/// client conductor for its own counters) allocates and frees.
pub struct CountersManager {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
    max_counters: usize,
    free_list: Vec<i32>,
    free_to_reuse_timeout_ms: i64,
}

impl CountersManager {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer, free_to_reuse_timeout_ms: i64) -> Self {
        let max_counters = (values.capacity() / VALUE_LENGTH)
            .min(metadata.capacity() / METADATA_LENGTH);
        CountersManager {
            metadata,
            values,
            max_counters,
            free_list: Vec::new(),
            free_to_reuse_timeout_ms,
        }
    }

    pub fn max_counters(&self) -> usize {
        self.max_counters
    }

    /// Allocate a counter, returning its id.
    pub fn allocate(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
        now_ms: i64,
    ) -> Result<i32, CountersError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(CountersError::KeyTooLong(key.len()));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(CountersError::LabelTooLong(label.len()));
        }

        let id = self.next_counter_id(now_ms)?;
        let record = id as usize * METADATA_LENGTH;

        self.metadata.put_i32(record + TYPE_ID_OFFSET, type_id);
        self.metadata
            .put_i64(record + REGISTRATION_ID_OFFSET, DEFAULT_REGISTRATION_ID);
        self.metadata.put_i64(record + OWNER_ID_OFFSET, DEFAULT_OWNER_ID);
        self.metadata.set_memory(record + KEY_OFFSET, MAX_KEY_LENGTH, 0);
        self.metadata.put_bytes(record + KEY_OFFSET, key);
        self.metadata
            .set_memory(record + LABEL_OFFSET, MAX_LABEL_LENGTH, 0);
        self.metadata.put_bytes(record + LABEL_OFFSET, label.as_bytes());
        self.metadata
            .put_i32(record + LABEL_LENGTH_OFFSET, label.len() as i32);

        self.values.put_i64(id as usize * VALUE_LENGTH, 0);
        self.metadata
            .put_i32_ordered(record + STATE_OFFSET, RECORD_ALLOCATED);

        Ok(id)
    }

    /// Free a counter.  The slot is reclaimed after the reuse cool-down so
    /// late readers never observe an id reassigned under them.
    pub fn free(&mut self, id: i32, now_ms: i64) {
        let record = id as usize * METADATA_LENGTH;
        self.metadata.put_i64(
            record + FREE_FOR_REUSE_DEADLINE_OFFSET,
            now_ms + self.free_to_reuse_timeout_ms,
        );
        self.metadata
            .put_i32_ordered(record + STATE_OFFSET, RECORD_RECLAIMED);
        self.free_list.push(id);
    }

    pub fn set_registration_id(&self, id: i32, registration_id: i64) {
        let record = id as usize * METADATA_LENGTH;
        self.metadata
            .put_i64_ordered(record + REGISTRATION_ID_OFFSET, registration_id);
    }

    pub fn set_owner_id(&self, id: i32, owner_id: i64) {
        let record = id as usize * METADATA_LENGTH;
        self.metadata.put_i64(record + OWNER_ID_OFFSET, owner_id);
    }

    /// A live handle to the counter's value slot.
    pub fn counter(&self, id: i32) -> AtomicCounter {
        AtomicCounter::new(self.values, id)
    }

    fn next_counter_id(&mut self, now_ms: i64) -> Result<i32, CountersError> {
        if let Some(pos) = self.free_list.iter().position(|&id| {
            let record = id as usize * METADATA_LENGTH;
            self.metadata.get_i64(record + FREE_FOR_REUSE_DEADLINE_OFFSET) <= now_ms
        }) {
            return Ok(self.free_list.swap_remove(pos));
        }

        for id in 0..self.max_counters {
            let record = id * METADATA_LENGTH;
            if self.metadata.get_i32_volatile(record + STATE_OFFSET) == RECORD_UNUSED {
                return Ok(id as i32);
            }
        }

        Err(CountersError::Exhausted {
            max: self.max_counters,
        })
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read-only view over the counters regions, usable from any process.
#[derive(Clone, Copy)]
pub struct CountersReader {
    metadata: AtomicBuffer,
    values: AtomicBuffer,
}

impl CountersReader {
    pub fn new(metadata: AtomicBuffer, values: AtomicBuffer) -> Self {
        CountersReader { metadata, values }
    }

    pub fn counter_value(&self, id: i32) -> i64 {
        self.values.get_i64_volatile(id as usize * VALUE_LENGTH)
    }

    pub fn label(&self, id: i32) -> String {
        let record = id as usize * METADATA_LENGTH;
        let len = self.metadata.get_i32(record + LABEL_LENGTH_OFFSET) as usize;
        let len = len.min(MAX_LABEL_LENGTH);
        String::from_utf8_lossy(self.metadata.as_slice(record + LABEL_OFFSET, len)).into_owned()
    }

    pub fn type_id(&self, id: i32) -> i32 {
        self.metadata
            .get_i32(id as usize * METADATA_LENGTH + TYPE_ID_OFFSET)
    }

    pub fn registration_id(&self, id: i32) -> i64 {
        self.metadata
            .get_i64_volatile(id as usize * METADATA_LENGTH + REGISTRATION_ID_OFFSET)
    }

    /// Visit every allocated counter as `(id, type_id, label)`.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(i32, i32, &str),
    {
        let max = self.metadata.capacity() / METADATA_LENGTH;
        for id in 0..max {
            let record = id * METADATA_LENGTH;
            let state = self.metadata.get_i32_volatile(record + STATE_OFFSET);
            if state == RECORD_UNUSED {
                break;
            }
            if state == RECORD_ALLOCATED {
                let label = self.label(id as i32);
                visitor(id as i32, self.type_id(id as i32), &label);
            }
        }
    }

    /// Find the first allocated counter with the given type id and
    /// registration id.
    pub fn find_by_type_and_registration(&self, type_id: i32, registration_id: i64) -> Option<i32> {
        let mut found = None;
        self.for_each(|id, tid, _| {
            if found.is_none() && tid == type_id && self.registration_id(id) == registration_id {
                found = Some(id);
            }
        });
        found
    }
}

// ---------------------------------------------------------------------------
// Counter handle
// ---------------------------------------------------------------------------

/// Handle to a single counter value slot.
///
/// Writers use ordered stores or relaxed increments; observers read with
/// acquire.  One writer per counter by protocol.
#[derive(Clone, Copy)]
pub struct AtomicCounter {
    values: AtomicBuffer,
    id: i32,
    offset: usize,
}

impl AtomicCounter {
    pub fn new(values: AtomicBuffer, id: i32) -> Self {
        AtomicCounter {
            values,
            id,
            offset: id as usize * VALUE_LENGTH,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.values.get_i64(self.offset)
    }

    #[inline]
    pub fn get_volatile(&self) -> i64 {
        self.values.get_i64_volatile(self.offset)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.values.put_i64(self.offset, value);
    }

    #[inline]
    pub fn set_ordered(&self, value: i64) {
        self.values.put_i64_ordered(self.offset, value);
    }

    #[inline]
    pub fn increment(&self) {
        self.values.get_and_add_i64(self.offset, 1);
    }

    #[inline]
    pub fn add(&self, delta: i64) {
        self.values.get_and_add_i64(self.offset, delta);
    }

    /// Set to `value` only if it is greater than the current value.
    pub fn propose_max_ordered(&self, value: i64) -> bool {
        if self.get() < value {
            self.set_ordered(value);
            return true;
        }
        false
    }
}

/// A stream position backed by a counter slot: same mechanics, named for
/// intent where a value is a byte position rather than a tally.
pub type Position = AtomicCounter;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;

    fn manager_mem() -> (AlignedBuffer, AlignedBuffer) {
        (
            AlignedBuffer::with_capacity(METADATA_LENGTH * 8),
            AlignedBuffer::with_capacity(VALUE_LENGTH * 8),
        )
    }

    #[test]
    fn allocate_assigns_sequential_ids_and_labels() {
        let (meta, values) = manager_mem();
        let mut mgr = CountersManager::new(meta.buffer(), values.buffer(), 1000);

        let a = mgr.allocate(1, &[], "bytes-sent", 0).unwrap();
        let b = mgr.allocate(2, &[], "bytes-received", 0).unwrap();
        assert_eq!((a, b), (0, 1));

        let reader = CountersReader::new(meta.buffer(), values.buffer());
        assert_eq!(reader.label(a), "bytes-sent");
        assert_eq!(reader.type_id(b), 2);
    }

    #[test]
    fn counter_updates_visible_through_reader() {
        let (meta, values) = manager_mem();
        let mut mgr = CountersManager::new(meta.buffer(), values.buffer(), 1000);
        let id = mgr.allocate(1, &[], "naks-sent", 0).unwrap();

        let counter = mgr.counter(id);
        counter.increment();
        counter.add(4);

        let reader = CountersReader::new(meta.buffer(), values.buffer());
        assert_eq!(reader.counter_value(id), 5);
    }

    #[test]
    fn freed_id_not_reused_until_cooldown_expires() {
        let (meta, values) = manager_mem();
        let mut mgr = CountersManager::new(meta.buffer(), values.buffer(), 1000);

        let id = mgr.allocate(1, &[], "a", 0).unwrap();
        mgr.free(id, 0);

        let next = mgr.allocate(1, &[], "b", 500).unwrap();
        assert_ne!(next, id, "still cooling down");

        let reused = mgr.allocate(1, &[], "c", 1500).unwrap();
        assert_eq!(reused, id, "cooled down and reusable");
    }

    #[test]
    fn exhaustion_is_reported() {
        let (meta, values) = manager_mem();
        let mut mgr = CountersManager::new(meta.buffer(), values.buffer(), 1000);
        for _ in 0..8 {
            mgr.allocate(1, &[], "x", 0).unwrap();
        }
        assert!(matches!(
            mgr.allocate(1, &[], "overflow", 0),
            Err(CountersError::Exhausted { .. })
        ));
    }

    #[test]
    fn propose_max_only_advances() {
        let (_, values) = manager_mem();
        let counter = AtomicCounter::new(values.buffer(), 0);
        assert!(counter.propose_max_ordered(100));
        assert!(!counter.propose_max_ordered(50));
        assert_eq!(counter.get(), 100);
    }

    #[test]
    fn find_by_registration() {
        let (meta, values) = manager_mem();
        let mut mgr = CountersManager::new(meta.buffer(), values.buffer(), 1000);
        let a = mgr.allocate(4, &[], "sub-pos", 0).unwrap();
        mgr.set_registration_id(a, 777);

        let reader = CountersReader::new(meta.buffer(), values.buffer());
        assert_eq!(reader.find_by_type_and_registration(4, 777), Some(a));
        assert_eq!(reader.find_by_type_and_registration(4, 778), None);
    }
}
