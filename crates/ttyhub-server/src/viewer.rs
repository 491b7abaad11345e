//! Per-connection viewer state.

use ttyhub_core::{counter, EventDecoder, GrowBuf};

use crate::session::{ConnId, SessionNumber};

/// Progress of a window-contents request to this viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentsRequest {
    #[default]
    Idle,
    /// The request goes out with the next writable frame.
    Requested,
    /// Sent; waiting for `WINDOW-CONTENTS`.
    AwaitingReply,
}

#[derive(Debug)]
pub struct Viewer {
    pub id: ConnId,
    /// Linked session; absent when unlinked or after the session ended.
    pub session: Option<SessionNumber>,
    /// Staged outbound bytes: PTY output and control frames.
    pub outbound: GrowBuf,
    /// PTY payload bytes staged in `outbound` but not yet sent.
    pub pending_payload: usize,
    pub sent: u32,
    pub confirmed: u32,
    /// `None` while this is the only viewer of its session.
    pub window_number: Option<u32>,
    pub window_update_needed: bool,
    pub settings_needed: bool,
    pub detach_notice_needed: bool,
    pub contents: ContentsRequest,
    pub detach_on_close: bool,
    /// Session metadata has been delivered since the last `VERSION`.
    pub initialized: bool,
    pub version_info: Option<String>,
    pub decoder: EventDecoder,
    /// The session ended; send end-of-stream once.
    pub eof_pending: bool,
}

impl Viewer {
    pub fn new(id: ConnId) -> Self {
        Self {
            id,
            session: None,
            outbound: GrowBuf::new(),
            pending_payload: 0,
            sent: 0,
            confirmed: 0,
            window_number: None,
            window_update_needed: false,
            settings_needed: true,
            detach_notice_needed: false,
            contents: ContentsRequest::Idle,
            detach_on_close: false,
            initialized: false,
            version_info: None,
            decoder: EventDecoder::new(),
            eof_pending: false,
        }
    }

    /// Sent-but-unconfirmed bytes plus payload still staged locally.
    pub fn backlog(&self) -> usize {
        counter::diff(self.sent, self.confirmed) as usize + self.pending_payload
    }

    /// Room left in the outbound buffer under `limit`.
    pub fn headroom(&self, limit: usize) -> usize {
        limit.saturating_sub(self.outbound.len())
    }

    /// Slot announced in window updates: 0 for a sole viewer.
    pub fn window_slot(&self) -> u32 {
        self.window_number.map_or(0, |n| n + 1)
    }

    /// Apply an acknowledgement. Reports behind the current confirmation, or
    /// ahead of what was actually sent, are ignored.
    pub fn confirm(&mut self, count: u32) -> bool {
        if counter::is_behind(self.confirmed, count) {
            return false;
        }
        if counter::diff(count, self.confirmed) > counter::diff(self.sent, self.confirmed) {
            return false;
        }
        self.confirmed = count;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_counts_unconfirmed_and_staged() {
        let mut v = Viewer::new(1);
        v.sent = 5000;
        v.confirmed = 1000;
        v.pending_payload = 300;
        assert_eq!(v.backlog(), 4300);
    }

    #[test]
    fn backlog_across_wraparound() {
        let mut v = Viewer::new(1);
        v.sent = 10;
        v.confirmed = counter::MASK28 - 9;
        assert_eq!(v.backlog(), 20);
    }

    #[test]
    fn confirm_rejects_stale_and_future_counts() {
        let mut v = Viewer::new(1);
        v.sent = 3000;
        v.confirmed = 2000;
        assert!(!v.confirm(1500));
        assert!(!v.confirm(3500));
        assert_eq!(v.confirmed, 2000);
        assert!(v.confirm(2999));
        assert_eq!(v.confirmed, 2999);
    }

    #[test]
    fn slots() {
        let mut v = Viewer::new(1);
        assert_eq!(v.window_slot(), 0);
        v.window_number = Some(0);
        assert_eq!(v.window_slot(), 1);
    }
}
