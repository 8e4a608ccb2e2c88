//! Atomic view over a region of raw memory.
//!
//! An [`AtomicBuffer`] is a borrowed window into memory owned elsewhere (a
//! memory-mapped file or an [`AlignedBuffer`]).  It is `Copy` and carries no
//! lifetime; the owner must outlive every view, which the driver guarantees
//! by keeping mappings alive in `Arc`s for as long as any component holds a
//! view.
//!
//! # Memory ordering
//! - `*_volatile` reads are `Acquire`, `*_ordered` writes are `Release`.
//!   These form the happens-before edge for the frame-length publish
//!   protocol used throughout the log buffers and rings.
//! - Plain `get_*`/`put_*` are `Relaxed` atomics: still race-free, no
//!   ordering.  Used for fields with a single writer and tolerant readers.
//! - Byte-range copies are not atomic; the surrounding protocol must
//!   guarantee exclusive access to the copied range.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};

/// A fixed-capacity window over raw shared memory.
#[derive(Clone, Copy, Debug)]
pub struct AtomicBuffer {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// Wrap a raw pointer and length.
    ///
    /// # Safety
    /// The memory must remain valid and writable for the lifetime of every
    /// copy of the returned view, and must be at least 8-byte aligned.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        debug_assert_eq!(ptr as usize & 7, 0, "buffer must be 8-byte aligned");
        AtomicBuffer { ptr, len }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// A sub-view of this buffer.  Panics if out of range.
    pub fn view(&self, offset: usize, len: usize) -> AtomicBuffer {
        assert!(offset + len <= self.len, "view out of range");
        AtomicBuffer {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }

    #[inline]
    fn bounds_check(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len, "index out of bounds");
    }

    #[inline]
    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.bounds_check(offset, 4);
        debug_assert_eq!(offset & 3, 0, "i32 access must be 4-byte aligned");
        unsafe { &*(self.ptr.add(offset) as *const AtomicI32) }
    }

    #[inline]
    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.bounds_check(offset, 8);
        debug_assert_eq!(offset & 7, 0, "i64 access must be 8-byte aligned");
        unsafe { &*(self.ptr.add(offset) as *const AtomicI64) }
    }

    // -----------------------------------------------------------------------
    // i32
    // -----------------------------------------------------------------------

    #[inline]
    pub fn get_i32(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_i32(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set_i32(&self, offset: usize, expected: i32, update: i32) -> bool {
        self.atomic_i32(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn get_and_add_i32(&self, offset: usize, delta: i32) -> i32 {
        self.atomic_i32(offset).fetch_add(delta, Ordering::AcqRel)
    }

    // -----------------------------------------------------------------------
    // i64
    // -----------------------------------------------------------------------

    #[inline]
    pub fn get_i64(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_i64(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get_i64_volatile(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i64_ordered(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set_i64(&self, offset: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    // -----------------------------------------------------------------------
    // Small scalars
    // -----------------------------------------------------------------------

    #[inline]
    pub fn get_u8(&self, offset: usize) -> u8 {
        self.bounds_check(offset, 1);
        unsafe { (*(self.ptr.add(offset) as *const AtomicU8)).load(Ordering::Relaxed) }
    }

    #[inline]
    pub fn put_u8(&self, offset: usize, value: u8) {
        self.bounds_check(offset, 1);
        unsafe { (*(self.ptr.add(offset) as *const AtomicU8)).store(value, Ordering::Relaxed) };
    }

    #[inline]
    pub fn get_u16(&self, offset: usize) -> u16 {
        self.bounds_check(offset, 2);
        let mut bytes = [0u8; 2];
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.add(offset), bytes.as_mut_ptr(), 2) };
        u16::from_le_bytes(bytes)
    }

    #[inline]
    pub fn put_u16(&self, offset: usize, value: u16) {
        self.bounds_check(offset, 2);
        let bytes = value.to_le_bytes();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), 2) };
    }

    // -----------------------------------------------------------------------
    // Byte ranges
    // -----------------------------------------------------------------------

    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.bounds_check(offset, dst.len());
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len()) };
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.bounds_check(offset, src.len());
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len()) };
    }

    pub fn set_memory(&self, offset: usize, len: usize, value: u8) {
        self.bounds_check(offset, len);
        unsafe { std::ptr::write_bytes(self.ptr.add(offset), value, len) };
    }

    /// Copy a range out of another buffer into this one.
    pub fn put_bytes_from(&self, offset: usize, src: &AtomicBuffer, src_offset: usize, len: usize) {
        self.bounds_check(offset, len);
        src.bounds_check(src_offset, len);
        unsafe {
            std::ptr::copy_nonoverlapping(src.ptr.add(src_offset), self.ptr.add(offset), len);
        }
    }

    /// Borrow a byte range for reading.  The caller must hold the range
    /// stable per the surrounding protocol.
    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        self.bounds_check(offset, len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) }
    }
}

/// Heap memory aligned for atomic access, for agent-local scratch buffers
/// and unit tests.
pub struct AlignedBuffer {
    data: Vec<i64>,
    len: usize,
}

impl AlignedBuffer {
    pub fn with_capacity(len: usize) -> Self {
        AlignedBuffer {
            data: vec![0i64; (len + 7) / 8],
            len,
        }
    }

    pub fn buffer(&self) -> AtomicBuffer {
        unsafe { AtomicBuffer::new(self.data.as_ptr() as *mut u8, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        let mem = AlignedBuffer::with_capacity(64);
        let buf = mem.buffer();

        buf.put_i32(0, 42);
        assert_eq!(buf.get_i32(0), 42);

        buf.put_i64_ordered(8, -7);
        assert_eq!(buf.get_i64_volatile(8), -7);

        buf.put_u16(16, 0xFFAA);
        assert_eq!(buf.get_u16(16), 0xFFAA);
    }

    #[test]
    fn cas_only_succeeds_on_expected() {
        let mem = AlignedBuffer::with_capacity(16);
        let buf = mem.buffer();

        buf.put_i64(0, 5);
        assert!(!buf.compare_and_set_i64(0, 4, 9));
        assert!(buf.compare_and_set_i64(0, 5, 9));
        assert_eq!(buf.get_i64(0), 9);
    }

    #[test]
    fn byte_copies_and_fill() {
        let mem = AlignedBuffer::with_capacity(32);
        let buf = mem.buffer();

        buf.put_bytes(4, b"hello");
        let mut out = [0u8; 5];
        buf.get_bytes(4, &mut out);
        assert_eq!(&out, b"hello");

        buf.set_memory(0, 32, 0);
        buf.get_bytes(4, &mut out);
        assert_eq!(out, [0u8; 5]);
    }

    #[test]
    fn fetch_add_returns_previous() {
        let mem = AlignedBuffer::with_capacity(8);
        let buf = mem.buffer();
        assert_eq!(buf.get_and_add_i64(0, 64), 0);
        assert_eq!(buf.get_and_add_i64(0, 64), 64);
        assert_eq!(buf.get_i64(0), 128);
    }
}
