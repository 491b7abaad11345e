//! Assembly of a viewer's next outbound frame.

use ttyhub_core::{counter, protocol, DetachCode, GrowBuf};

use super::flow::should_preserve;
use super::Hub;
use crate::session::ConnId;
use crate::viewer::ContentsRequest;

impl Hub {
    /// Build everything the viewer is owed, in protocol order: session
    /// metadata (with snapshot replay), window update, settings, detach
    /// notice, staged output, contents request, end-of-stream.
    ///
    /// Returns `None` when there is nothing to send.
    pub fn viewer_writable(&mut self, id: ConnId) -> Option<Vec<u8>> {
        let number = self.viewers.get(&id)?.session;
        let preserve = number
            .and_then(|n| self.registry.get(n))
            .is_some_and(|s| should_preserve(&s.viewers, &self.viewers));

        let viewer = self.viewers.get_mut(&id)?;
        let mut session = number.and_then(|n| self.registry.get_mut(n));
        let mut frame = GrowBuf::new();
        // Output staged while waiting for a snapshot is part of the replay
        // window, so it is held back and discarded at initialization.
        let mut awaiting_snapshot = false;

        if let Some(session) = session.as_deref_mut() {
            let snapshot_pending = session.replay.is_active() && session.replay.snapshot().is_none();
            awaiting_snapshot = !viewer.initialized && snapshot_pending;
            if !viewer.initialized && !snapshot_pending {
                protocol::session_metadata(
                    &mut frame,
                    session.pid,
                    session.number,
                    session.name_unique,
                    session.name.as_deref(),
                );
                if let Some(snapshot) = session.replay.snapshot() {
                    let anchor = session.replay.anchor();
                    protocol::snapshot(&mut frame, anchor, snapshot);
                    let mut count = anchor;
                    if session.replay.is_active() {
                        let window = session.replay.window();
                        protocol::replay(&mut frame, window);
                        count = counter::add(count, window.len());
                        // Output staged since linking is already in the window.
                        viewer.outbound.clear();
                        viewer.pending_payload = 0;
                    }
                    viewer.sent = count;
                    viewer.confirmed = count;
                    protocol::ack_request(&mut frame, count);
                    if !preserve {
                        session.replay.clear_snapshot();
                    }
                }
                viewer.initialized = true;
            }

            if viewer.window_update_needed {
                viewer.window_update_needed = false;
                protocol::window_update(
                    &mut frame,
                    session.number,
                    session.name_unique,
                    viewer.window_slot(),
                );
            }
        }

        if viewer.settings_needed {
            viewer.settings_needed = false;
            if let Some(json) = &self.settings_json {
                protocol::settings(&mut frame, json);
            }
        }

        if viewer.detach_notice_needed {
            viewer.detach_notice_needed = false;
            if let Some(session) = session.as_deref() {
                let code = if session.viewers.len() >= 2 {
                    DetachCode::Shared
                } else if session.detach_on_close {
                    DetachCode::SolePreserved
                } else {
                    DetachCode::Sole
                };
                protocol::detach_notice(&mut frame, code);
            }
        }

        if !viewer.outbound.is_empty() && !awaiting_snapshot {
            viewer.sent = counter::add(viewer.sent, viewer.pending_payload);
            viewer.pending_payload = 0;
            frame.append(viewer.outbound.as_slice());
            viewer.outbound.reset();
        }

        if viewer.contents == ContentsRequest::Requested {
            if let Some(session) = session.as_deref_mut() {
                protocol::request_contents(&mut frame);
                viewer.contents = ContentsRequest::AwaitingReply;
                session.replay.activate(viewer.sent);
            }
        }

        if viewer.eof_pending {
            viewer.eof_pending = false;
            protocol::end_of_stream(&mut frame);
        }

        // Flushing frees buffer space, which may lift a pause.
        if let Some(n) = number {
            self.poll(n);
        }

        if frame.is_empty() {
            None
        } else {
            Some(frame.as_slice().to_vec())
        }
    }
}
