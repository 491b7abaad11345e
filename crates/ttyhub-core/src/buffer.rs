//! Growable staging buffer for outbound viewer frames and replay windows.
//!
//! Capacity grows geometrically (×1.5, or straight to the requested size when
//! that is larger) and never shrinks on the append path. Idle connections call
//! [`GrowBuf::reset`] after a flush to give memory back. Allocation failure
//! aborts the process through the global allocator; there is no recoverable
//! error path.

use std::fmt;
use std::ops::Range;

/// Capacity a buffer starts with and returns to after [`GrowBuf::reset`].
pub const BASELINE_CAPACITY: usize = 2048;

/// Capacity above which [`GrowBuf::reset`] reallocates at the baseline.
pub const SHRINK_THRESHOLD: usize = 4000;

/// An append-only byte buffer with explicit capacity management.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrowBuf {
    buf: Vec<u8>,
}

impl GrowBuf {
    /// Create a buffer with [`BASELINE_CAPACITY`] bytes reserved.
    pub fn new() -> Self {
        Self::with_capacity(BASELINE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Guarantee that `additional` more bytes can be appended without
    /// reallocating.
    pub fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        let capacity = self.buf.capacity();
        if needed <= capacity {
            return;
        }
        let grown = (capacity * 3 / 2).max(needed);
        self.buf.reserve_exact(grown - self.buf.len());
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_capacity(data.len());
        self.buf.extend_from_slice(data);
    }

    /// Append formatted text, e.g. `buf.append_fmt(format_args!("{n}"))`.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) {
        // Writing into a Vec cannot fail.
        let _ = fmt::Write::write_fmt(self, args);
    }

    /// Drop the contents and, when the buffer has grown past
    /// [`SHRINK_THRESHOLD`], reallocate it at [`BASELINE_CAPACITY`].
    pub fn reset(&mut self) {
        if self.buf.capacity() > SHRINK_THRESHOLD {
            self.buf = Vec::with_capacity(BASELINE_CAPACITY);
        } else {
            self.buf.clear();
        }
    }

    /// Release all storage.
    pub fn release(&mut self) {
        self.buf = Vec::new();
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Extend with zero bytes up to `len` (no-op if already that long).
    pub fn pad_to(&mut self, len: usize) {
        if len > self.buf.len() {
            self.ensure_capacity(len - self.buf.len());
            self.buf.resize(len, 0);
        }
    }

    /// Move the bytes in `src` so they start at `dest` (like `memmove`).
    pub fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        self.buf.copy_within(src, dest);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Bytes that can be appended before the next reallocation.
    pub fn spare_capacity(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Write for GrowBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes());
        Ok(())
    }
}
