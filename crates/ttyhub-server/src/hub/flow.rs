//! Backpressure and fan-out of PTY output.

use std::collections::HashMap;
use tracing::{debug, trace};
use ttyhub_core::{protocol, GrowBuf};

use super::{Effect, Hub};
use crate::session::pty::TIOCPKT_IOCTL;
use crate::session::{ConnId, SessionNumber};
use crate::viewer::{ContentsRequest, Viewer};

/// Whether output should keep going into the replay buffer: some viewer is
/// waiting to report its contents, or every attached viewer wants the
/// session preserved when it closes (true when none are attached).
pub(super) fn should_preserve(attached: &[ConnId], viewers: &HashMap<ConnId, Viewer>) -> bool {
    let mut all_preserve = true;
    for viewer in attached.iter().filter_map(|id| viewers.get(id)) {
        if viewer.contents == ContentsRequest::AwaitingReply {
            return true;
        }
        all_preserve &= viewer.detach_on_close;
    }
    all_preserve
}

impl Hub {
    /// Decide whether the session may read from its PTY now, and if so grant
    /// exactly one read.
    ///
    /// Reads stop while the slowest viewer has `high_water` or more bytes
    /// unconfirmed, while any viewer's buffer is full, and while nobody is
    /// attached.
    pub(super) fn poll(&mut self, number: SessionNumber) {
        let Some(session) = self.registry.get_mut(number) else {
            return;
        };

        let mut backlog: Option<usize> = None;
        let mut avail = usize::MAX;
        for viewer in session.viewers.iter().filter_map(|id| self.viewers.get(id)) {
            let b = viewer.backlog();
            backlog = Some(backlog.map_or(b, |max| max.max(b)));
            avail = avail.min(viewer.headroom(self.options.viewer_buffer_limit));
        }

        let gated = match backlog {
            None => true,
            Some(b) => b >= self.options.high_water || avail == 0,
        };
        if gated {
            if !session.paused {
                debug!(session = number, backlog = ?backlog, avail, "pausing PTY reads");
                session.paused = true;
            }
            return;
        }

        if session.paused {
            debug!(session = number, "resuming PTY reads");
            session.paused = false;
        }
        if session.read_in_flight {
            return;
        }
        let max = avail.min(self.options.read_chunk);
        for id in &session.viewers {
            if let Some(viewer) = self.viewers.get_mut(id) {
                viewer.outbound.ensure_capacity(max);
            }
        }
        session.read_in_flight = true;
        self.effects.push(Effect::ReadPty { session: number, max });
    }

    /// Bytes read under the session's outstanding grant. Every attached
    /// viewer gets the same bytes in the same order.
    pub fn pty_output(&mut self, number: SessionNumber, data: &[u8]) {
        let Some(session) = self.registry.get_mut(number) else {
            return;
        };
        session.read_in_flight = false;
        trace!(session = number, bytes = data.len(), "PTY output");

        let mut synthesized = GrowBuf::with_capacity(0);
        let (bytes, payload): (&[u8], bool) = if session.packet_mode() {
            match data {
                [] => (&[], false),
                [status] => {
                    if status & TIOCPKT_IOCTL != 0 {
                        match session.pty.local_modes() {
                            Ok(modes) => protocol::terminal_modes(&mut synthesized, modes),
                            Err(e) => debug!(session = number, error = %e, "cannot read terminal modes"),
                        }
                    }
                    (synthesized.as_slice(), false)
                }
                [_, rest @ ..] => (rest, true),
            }
        } else {
            (data, true)
        };

        if !bytes.is_empty() {
            for id in &session.viewers {
                if let Some(viewer) = self.viewers.get_mut(id) {
                    viewer.outbound.append(bytes);
                    if payload {
                        viewer.pending_payload += bytes.len();
                    }
                    self.effects.push(Effect::Writable(*id));
                }
            }
            if payload && session.replay.is_active() {
                if should_preserve(&session.viewers, &self.viewers) {
                    session.replay.append(bytes);
                } else {
                    debug!(session = number, "releasing replay buffer");
                    session.replay.release();
                }
            } else if payload && session.viewers.is_empty() {
                session.unclaimed.extend_from_slice(bytes);
            }
        }

        self.poll(number);
    }
}
