//! Preservation buffer for replay on session reattach.
//!
//! Holds the output a session has produced since the last snapshot a viewer
//! reported, so a reattaching viewer can be given the snapshot followed by
//! exactly the bytes the snapshot does not cover. The window lives in
//! `buf[start..end]`; `anchor` is the 28-bit output count the snapshot was
//! taken at.

use ttyhub_core::counter;
use ttyhub_core::GrowBuf;

/// Offset the window is compacted to.
pub const PRESERVE_MIN: usize = 0;

/// A trim that leaves `start` below this just advances `start`.
const SMALL_TRIM_LIMIT: usize = 200;

const INITIAL_CAPACITY: usize = 1024;

/// Result of applying a viewer's window-contents report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentsOutcome {
    /// The report predates the anchor and was ignored.
    Stale,
    Applied,
}

#[derive(Debug, Default)]
pub struct ReplayBuffer {
    buf: Option<GrowBuf>,
    start: usize,
    end: usize,
    snapshot: Option<String>,
    anchor: u32,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.buf.is_some()
    }

    /// Start preserving output anchored at `anchor`. A buffer that is already
    /// active keeps its window and anchor.
    pub fn activate(&mut self, anchor: u32) {
        if self.buf.is_some() {
            return;
        }
        let mut buf = GrowBuf::with_capacity(INITIAL_CAPACITY);
        buf.pad_to(PRESERVE_MIN);
        self.buf = Some(buf);
        self.start = PRESERVE_MIN;
        self.end = PRESERVE_MIN;
        self.anchor = anchor;
    }

    /// Append freshly read output (no-op while inactive).
    pub fn append(&mut self, data: &[u8]) {
        if let Some(buf) = &mut self.buf {
            buf.append(data);
            self.end += data.len();
        }
    }

    /// The preserved bytes not yet covered by the snapshot.
    pub fn window(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf.as_slice()[self.start..self.end],
            None => &[],
        }
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }

    pub fn anchor(&self) -> u32 {
        self.anchor
    }

    /// Apply a `count,snapshot` report: replace the snapshot and drop the
    /// `count - anchor` bytes it now covers from the front of the window.
    pub fn apply_contents(&mut self, count: u32, snapshot: String) -> ContentsOutcome {
        if counter::is_behind(self.anchor, count) {
            return ContentsOutcome::Stale;
        }
        let covered = counter::diff(count, self.anchor) as usize;
        self.snapshot = Some(snapshot);

        if let Some(buf) = &mut self.buf {
            let len = self.end - self.start;
            if covered >= len {
                self.start = PRESERVE_MIN;
                self.end = PRESERVE_MIN;
            } else if self.start + covered < SMALL_TRIM_LIMIT {
                self.start += covered;
            } else {
                let remaining = len - covered;
                buf.copy_within(self.start + covered..self.end, PRESERVE_MIN);
                self.start = PRESERVE_MIN;
                self.end = PRESERVE_MIN + remaining;
            }
            buf.truncate(self.end);
        }
        self.anchor = count;
        ContentsOutcome::Applied
    }

    /// Drop the window and the snapshot.
    pub fn release(&mut self) {
        self.buf = None;
        self.start = 0;
        self.end = 0;
        self.snapshot = None;
    }
}
