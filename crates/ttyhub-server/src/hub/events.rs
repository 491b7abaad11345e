//! Inbound viewer traffic: literal PTY input and in-band events.

use tracing::{debug, error, trace, warn};
use ttyhub_core::{protocol, Inbound, LocalModes, ViewerEvent};

use super::{Effect, Hub};
use crate::session::{ContentsOutcome, ConnId, SessionNumber};
use crate::viewer::ContentsRequest;

/// Keys that bypass local echo in canonical mode: ^C, ^D, ^Z.
const UNECHOED_KEYS: [u8; 3] = [3, 4, 26];

impl Hub {
    /// Bytes received from a viewer's transport.
    pub fn viewer_input(&mut self, id: ConnId, data: &[u8]) {
        let Some(viewer) = self.viewers.get_mut(&id) else {
            return;
        };
        let items = viewer.decoder.feed(data);
        if let Some(session) = viewer.session.and_then(|n| self.registry.get_mut(n)) {
            session.recent_viewer = Some(id);
        }

        for item in items {
            match item {
                Inbound::Input(bytes) => self.write_input(id, &bytes),
                Inbound::Event { name, data } => match ViewerEvent::parse(&name, &data) {
                    Ok(event) => self.handle_event(id, event),
                    Err(e) => debug!(conn = id, event = %name, error = %e, "dropping malformed event"),
                },
            }
        }
    }

    fn linked_session(&self, id: ConnId) -> Option<SessionNumber> {
        self.viewers.get(&id)?.session
    }

    fn write_input(&mut self, id: ConnId, bytes: &[u8]) {
        if self.options.readonly {
            return;
        }
        let Some(number) = self.linked_session(id) else {
            debug!(conn = id, bytes = bytes.len(), "input from unlinked viewer dropped");
            return;
        };
        if let Some(session) = self.registry.get_mut(number) {
            if let Err(e) = session.pty.write_input(bytes) {
                warn!(session = number, error = %e, "write to PTY failed");
            }
        }
    }

    fn handle_event(&mut self, id: ConnId, event: ViewerEvent) {
        trace!(conn = id, ?event, "viewer event");
        match event {
            ViewerEvent::WindowSize(geometry) => {
                let Some(session) = self.linked_session(id).and_then(|n| self.registry.get_mut(n)) else {
                    return;
                };
                session.geometry = geometry;
                if geometry.cells().is_some() {
                    if let Err(e) = session.pty.resize(&geometry) {
                        warn!(session = session.number, error = %e, "resize failed");
                    }
                }
            }

            ViewerEvent::Version(info) => {
                let linked = match self.viewers.get_mut(&id) {
                    Some(viewer) => {
                        viewer.version_info = Some(info);
                        viewer.initialized = false;
                        viewer.session.is_some()
                    }
                    None => return,
                };
                if !linked {
                    let argv = self.options.default_command.clone();
                    match self.spawn_session(argv, None, Vec::new()) {
                        Ok(number) => self.link(id, number),
                        Err(e) => {
                            error!(conn = id, error = %e, "failed to start default command");
                            return;
                        }
                    }
                }
                self.schedule_writable(id);
            }

            ViewerEvent::Received(count) => {
                let Some(viewer) = self.viewers.get_mut(&id) else {
                    return;
                };
                if !viewer.confirm(count) {
                    trace!(conn = id, count, confirmed = viewer.confirmed, "ignoring stale acknowledgement");
                    return;
                }
                if let Some(number) = viewer.session {
                    self.poll(number);
                }
            }

            ViewerEvent::Key { raw, key } => {
                if !self.options.readonly {
                    self.handle_key(id, &raw, key.as_bytes());
                }
            }

            ViewerEvent::SessionName(name) => {
                let Some(number) = self.linked_session(id) else {
                    return;
                };
                let changed = self.registry.set_name(number, name);
                self.flag_window_updates(&changed);
            }

            ViewerEvent::OpenWindow { request, geometry } => {
                self.effects.push(Effect::OpenWindow { request, geometry });
            }

            ViewerEvent::Detach(preserve) => {
                let Some(number) = self.linked_session(id) else {
                    return;
                };
                let Some(session) = self.registry.get_mut(number) else {
                    return;
                };
                session.detach_on_close = preserve;
                let replay_active = session.replay.is_active();
                if let Some(viewer) = self.viewers.get_mut(&id) {
                    viewer.detach_on_close = preserve;
                    if !replay_active && viewer.contents == ContentsRequest::Idle {
                        viewer.contents = ContentsRequest::Requested;
                    }
                }
                self.schedule_writable(id);
            }

            ViewerEvent::Focused => self.focused = Some(id),

            ViewerEvent::Link(value) => self.effects.push(Effect::OpenLink(value)),

            ViewerEvent::WindowContents { count, snapshot } => {
                let Some(number) = self.linked_session(id) else {
                    return;
                };
                let Some(session) = self.registry.get_mut(number) else {
                    return;
                };
                match session.replay.apply_contents(count, snapshot) {
                    ContentsOutcome::Stale => {
                        debug!(session = number, count, "ignoring stale window contents");
                    }
                    ContentsOutcome::Applied => {
                        if let Some(viewer) = self.viewers.get_mut(&id) {
                            viewer.contents = ContentsRequest::Idle;
                        }
                        // Viewers waiting for the snapshot can now be initialized.
                        for other in &session.viewers {
                            if self.viewers.get(other).is_some_and(|v| !v.initialized) {
                                self.effects.push(Effect::Writable(*other));
                            }
                        }
                    }
                }
            }

            ViewerEvent::EchoUrgent(text) => {
                let Some(session) = self.linked_session(id).and_then(|n| self.registry.get(n)) else {
                    return;
                };
                for other in &session.viewers {
                    if let Some(viewer) = self.viewers.get_mut(other) {
                        protocol::urgent_text(&mut viewer.outbound, &text);
                    }
                    self.effects.push(Effect::Writable(*other));
                }
            }

            ViewerEvent::Unknown(name) => debug!(conn = id, event = %name, "unknown event"),
        }
    }

    /// In canonical mode most keys are echoed back for the viewer to edit
    /// locally; everything else goes straight to the PTY. An INTR typed while
    /// reads are paused also discards the output already queued.
    fn handle_key(&mut self, id: ConnId, raw: &str, key: &[u8]) {
        let Some(number) = self.linked_session(id) else {
            return;
        };
        let Some(session) = self.registry.get_mut(number) else {
            return;
        };
        let modes = session.pty.local_modes().unwrap_or_else(|e| {
            debug!(session = number, error = %e, "cannot read terminal modes");
            LocalModes::default()
        });
        let single = match key {
            [b] => Some(*b),
            _ => None,
        };

        if modes.icanon && !single.is_some_and(|b| UNECHOED_KEYS.contains(&b)) {
            if let Some(viewer) = self.viewers.get_mut(&id) {
                protocol::key_echo(&mut viewer.outbound, modes.echo, raw);
            }
            self.effects.push(Effect::Writable(id));
            return;
        }

        let mut to_drain = 0;
        if session.paused && single.is_some() && session.pty.interrupt_char().ok() == single {
            to_drain = session.pty.queued_output().unwrap_or(0);
        }
        if let Err(e) = session.pty.write_input(key) {
            warn!(session = number, error = %e, "write key to PTY failed");
        }
        if to_drain > 0 {
            debug!(session = number, bytes = to_drain, "discarding queued output after interrupt");
            self.effects.push(Effect::DiscardPty { session: number, len: to_drain });
        }
    }
}
