//! The multiplexing engine.
//!
//! [`Hub`] owns the session registry and the viewer table and is driven
//! entirely by method calls from a single task. It never performs async I/O;
//! instead it queues [`Effect`]s (read grants for PTY pumps, "viewer has
//! output" notifications, timers) for the caller to carry out.

mod events;
mod flow;
mod frame;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use ttyhub_core::HubResult;

use crate::config::{self, ServerConfig};
use crate::session::{
    ConnId, PtySession, PtySpawner, SessionNumber, SessionRegistry, SpawnRequest,
};
use crate::viewer::{ContentsRequest, Viewer};

/// Unconfirmed bytes at which a viewer stops PTY reads for its session.
pub const HIGH_WATER: usize = 8000;

/// Largest single PTY read.
pub const READ_CHUNK: usize = 4096;

/// Outbound bytes a viewer may have staged before reads stop.
pub const VIEWER_BUFFER_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub high_water: usize,
    pub read_chunk: usize,
    pub viewer_buffer_limit: usize,
    /// Refuse a viewer while another is connected.
    pub once: bool,
    /// Drop literal input and key events.
    pub readonly: bool,
    /// Command run when an unlinked viewer announces itself.
    pub default_command: Vec<String>,
    /// Signal sent to a session's process on teardown.
    pub kill_signal: i32,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            high_water: HIGH_WATER,
            read_chunk: READ_CHUNK,
            viewer_buffer_limit: VIEWER_BUFFER_LIMIT,
            once: false,
            readonly: false,
            default_command: config::default_command(),
            kill_signal: libc::SIGHUP,
        }
    }
}

impl HubOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            once: config.once,
            readonly: config.readonly,
            default_command: config.command.clone(),
            kill_signal: config.signal,
            ..Self::default()
        }
    }
}

/// Work the engine asks its driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The viewer has a frame to send; call [`Hub::viewer_writable`].
    Writable(ConnId),
    /// Start the read pump of a new session (see [`Hub::take_reader`]).
    StartPump(SessionNumber),
    /// Allow one PTY read of at most `max` payload bytes.
    ReadPty { session: SessionNumber, max: usize },
    /// Read and throw away `len` bytes already queued on the PTY.
    DiscardPty { session: SessionNumber, len: usize },
    /// The session is gone; stop its pump.
    StopPump(SessionNumber),
    /// Call [`Hub::shutdown_timer_fired`] after the grace period.
    ScheduleShutdown { session: SessionNumber, token: u64 },
    /// A viewer asked to open a link.
    OpenLink(serde_json::Value),
    /// A viewer asked for a new window.
    OpenWindow {
        request: String,
        geometry: Option<String>,
    },
    /// No sessions and no viewers remain.
    Exit,
}

pub struct Hub {
    options: HubOptions,
    spawner: Box<dyn PtySpawner>,
    registry: SessionRegistry,
    viewers: HashMap<ConnId, Viewer>,
    next_conn: ConnId,
    next_token: u64,
    focused: Option<ConnId>,
    settings_json: Option<String>,
    effects: Vec<Effect>,
}

impl Hub {
    pub fn new(
        options: HubOptions,
        spawner: Box<dyn PtySpawner>,
        settings_json: Option<String>,
    ) -> Self {
        Self {
            options,
            spawner,
            registry: SessionRegistry::new(),
            viewers: HashMap::new(),
            next_conn: 0,
            next_token: 0,
            focused: None,
            settings_json,
            effects: Vec::new(),
        }
    }

    /// Take the effects queued since the last call.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn viewer(&self, id: ConnId) -> Option<&Viewer> {
        self.viewers.get(&id)
    }

    fn schedule_writable(&mut self, id: ConnId) {
        self.effects.push(Effect::Writable(id));
    }

    /// A transport connection opened. `connect_pid` links it straight to the
    /// session running that pid. Returns `None` when the connection must be
    /// refused.
    pub fn viewer_connected(&mut self, connect_pid: Option<u32>) -> Option<ConnId> {
        if self.options.once && !self.viewers.is_empty() {
            info!("refusing viewer: another viewer is connected");
            return None;
        }
        self.next_conn += 1;
        let id = self.next_conn;
        self.viewers.insert(id, Viewer::new(id));
        info!(conn = id, total = self.viewers.len(), "viewer connected");

        if let Some(pid) = connect_pid.filter(|&pid| pid != 0) {
            match self.registry.find_by_pid(pid).map(|s| s.number) {
                Some(number) => self.link(id, number),
                None => debug!(conn = id, pid, "connect-pid names no live session"),
            }
        }
        self.schedule_writable(id);
        Some(id)
    }

    /// A transport connection closed.
    pub fn viewer_closed(&mut self, id: ConnId) {
        let Some(viewer) = self.viewers.remove(&id) else {
            return;
        };
        if self.focused == Some(id) {
            self.focused = None;
        }
        info!(
            conn = id,
            client = viewer.version_info.as_deref().unwrap_or("unknown"),
            total = self.viewers.len(),
            "viewer disconnected"
        );
        if let Some(number) = viewer.session {
            self.unlink(&viewer, number);
        }
        self.maybe_exit();
    }

    /// Start `argv` on a new PTY and register the session.
    pub fn spawn_session(
        &mut self,
        argv: Vec<String>,
        cwd: Option<PathBuf>,
        env: Vec<(String, String)>,
    ) -> HubResult<SessionNumber> {
        let number = self.registry.issue_number();
        let pty = self.spawner.spawn(SpawnRequest {
            argv,
            cwd,
            env,
            session_number: number,
        })?;
        let session = PtySession::new(number, pty);
        info!(session = number, pid = session.pid, "session started");
        self.registry.insert(session);
        self.effects.push(Effect::StartPump(number));
        Ok(number)
    }

    /// The read side of a session's PTY, for its pump.
    pub fn take_reader(&mut self, number: SessionNumber) -> Option<(Box<dyn Read + Send>, bool)> {
        let session = self.registry.get_mut(number)?;
        let packet_mode = session.packet_mode();
        session.pty.take_reader().map(|reader| (reader, packet_mode))
    }

    /// The session's PTY reached end of file.
    pub fn pty_closed(&mut self, number: SessionNumber) {
        debug!(session = number, "PTY closed");
        self.destroy_session(number);
    }

    /// Destroy sessions with no viewers whose process has exited. Nothing
    /// reads from such a session, so its hangup is not otherwise noticed.
    pub fn reap_exited(&mut self) {
        let idle: Vec<SessionNumber> = self
            .registry
            .iter()
            .filter(|s| s.viewers.is_empty() && !s.read_in_flight)
            .map(|s| s.number)
            .collect();
        for number in idle {
            let Some(session) = self.registry.get_mut(number) else {
                continue;
            };
            match session.pty.try_wait() {
                Ok(Some(code)) => {
                    info!(session = number, code, "unattached session process exited");
                    self.destroy_session(number);
                }
                Ok(None) => {}
                Err(e) => debug!(session = number, error = %e, "cannot check session process"),
            }
        }
    }

    /// The deferred shutdown scheduled with `token` is due.
    pub fn shutdown_timer_fired(&mut self, number: SessionNumber, token: u64) {
        let due = self
            .registry
            .get(number)
            .is_some_and(|s| s.shutdown_token == Some(token));
        if due {
            info!(session = number, "no viewers returned, shutting session down");
            self.destroy_session(number);
        }
    }

    /// Resolve `specifier` for an attach and, unless a contents request is
    /// already under way, ask an attached viewer for its window contents so
    /// the new viewer can be given a snapshot.
    pub fn prepare_attach(&mut self, specifier: &str) -> HubResult<SessionNumber> {
        let number = self.registry.lookup(specifier)?;
        let Some(session) = self.registry.get(number) else {
            return Ok(number);
        };
        let pending = session.viewers.iter().any(|id| {
            self.viewers
                .get(id)
                .is_some_and(|v| v.contents != ContentsRequest::Idle)
        });
        if !pending {
            if let Some(&first) = session.viewers.first() {
                if let Some(viewer) = self.viewers.get_mut(&first) {
                    viewer.contents = ContentsRequest::Requested;
                }
                self.schedule_writable(first);
            }
        }
        Ok(number)
    }

    /// Link a viewer that asked to attach to `specifier`.
    pub fn attach_viewer(&mut self, id: ConnId, specifier: &str) -> HubResult<SessionNumber> {
        let number = self.prepare_attach(specifier)?;
        self.link(id, number);
        Ok(number)
    }

    /// Start the default command in a session nobody is attached to yet.
    pub fn spawn_detached(&mut self) -> HubResult<SessionNumber> {
        let argv = self.options.default_command.clone();
        let number = self.spawn_session(argv, None, Vec::new())?;
        self.mark_detached(number)?;
        info!(session = number, "session started detached");
        Ok(number)
    }

    /// Mark a session as explicitly detached by the command layer.
    pub fn mark_detached(&mut self, number: SessionNumber) -> HubResult<()> {
        let session = self
            .registry
            .get_mut(number)
            .ok_or_else(|| ttyhub_core::HubError::SessionNotFound(format!(":{number}")))?;
        session.detached = true;
        Ok(())
    }

    /// Replace the viewer settings and re-upload them to everyone.
    pub fn set_settings(&mut self, settings_json: Option<String>) {
        self.settings_json = settings_json;
        let ids: Vec<ConnId> = self.viewers.keys().copied().collect();
        for id in ids {
            if let Some(viewer) = self.viewers.get_mut(&id) {
                viewer.settings_needed = true;
            }
            self.schedule_writable(id);
        }
    }

    /// Tear down every session, as when the server stops.
    pub fn shutdown(&mut self) {
        let numbers: Vec<SessionNumber> = self.registry.iter().map(|s| s.number).collect();
        for number in numbers {
            self.destroy_session(number);
        }
    }

    fn link(&mut self, id: ConnId, number: SessionNumber) {
        let Some(session) = self.registry.get_mut(number) else {
            return;
        };

        if session.viewers.is_empty() {
            if let Some(viewer) = self.viewers.get_mut(&id) {
                viewer.window_number = None;
                if session.detach_on_close {
                    viewer.detach_notice_needed = true;
                }
            }
        } else {
            let was_sole = session.viewers.len() == 1;
            if was_sole {
                let first = session.viewers[0];
                if let Some(viewer) = self.viewers.get_mut(&first) {
                    viewer.window_number = Some(0);
                    viewer.window_update_needed = true;
                    viewer.detach_notice_needed = true;
                }
                self.effects.push(Effect::Writable(first));
            }
            let used: Vec<u32> = session
                .viewers
                .iter()
                .filter_map(|v| self.viewers.get(v)?.window_number)
                .collect();
            let mut slot = 0;
            while used.contains(&slot) {
                slot += 1;
            }
            if let Some(viewer) = self.viewers.get_mut(&id) {
                viewer.window_number = Some(slot);
                if was_sole {
                    viewer.detach_notice_needed = true;
                }
            }
        }

        if let Some(viewer) = self.viewers.get_mut(&id) {
            viewer.session = Some(number);
            viewer.window_update_needed = true;
            if !session.unclaimed.is_empty() {
                viewer.outbound.append(&session.unclaimed);
                viewer.pending_payload += session.unclaimed.len();
                session.unclaimed.clear();
            }
        }
        session.viewers.push(id);
        self.focused = Some(id);

        if session.detached {
            session.detach_on_close = false;
        }
        session.detached = false;
        session.detach_count = session.detach_count.saturating_sub(1);
        if session.shutdown_token.take().is_some() {
            debug!(session = number, "reattach cancelled pending shutdown");
        }
        session.paused = false;
        info!(conn = id, session = number, viewers = session.viewers.len(), "viewer linked");

        self.effects.push(Effect::Writable(id));
        self.poll(number);
    }

    fn unlink(&mut self, viewer: &Viewer, number: SessionNumber) {
        let Some(session) = self.registry.get_mut(number) else {
            return;
        };
        session.viewers.retain(|&v| v != viewer.id);
        if session.recent_viewer == Some(viewer.id) {
            session.recent_viewer = None;
        }

        if viewer.detach_on_close {
            session.detach_count += 1;
            debug!(session = number, detach_count = session.detach_count, "viewer detached, session preserved");
        } else if session.viewers.is_empty() && session.detach_count == 0 {
            self.next_token += 1;
            let token = self.next_token;
            session.shutdown_token = Some(token);
            self.effects.push(Effect::ScheduleShutdown { session: number, token });
        }

        let awaiting = session.viewers.iter().any(|v| {
            self.viewers
                .get(v)
                .is_some_and(|v| v.contents == ContentsRequest::AwaitingReply)
        });
        if !awaiting && session.replay.is_active() && session.replay.snapshot().is_none() {
            debug!(session = number, "contents request abandoned, releasing replay buffer");
            session.replay.release();
            for id in &session.viewers {
                self.effects.push(Effect::Writable(*id));
            }
        }

        if let [only] = session.viewers[..] {
            if let Some(remaining) = self.viewers.get_mut(&only) {
                remaining.window_number = None;
                remaining.window_update_needed = true;
                remaining.detach_notice_needed = true;
            }
            self.effects.push(Effect::Writable(only));
        }
        self.poll(number);
    }

    fn destroy_session(&mut self, number: SessionNumber) {
        let Some(mut session) = self.registry.remove(number) else {
            return;
        };
        info!(session = number, pid = session.pid, "destroying session");

        for id in &session.viewers {
            if let Some(viewer) = self.viewers.get_mut(id) {
                viewer.session = None;
                viewer.eof_pending = true;
            }
            self.effects.push(Effect::Writable(*id));
        }
        session.replay.release();
        self.effects.push(Effect::StopPump(number));

        if let Err(e) = session.pty.terminate(self.options.kill_signal) {
            warn!(session = number, pid = session.pid, error = %e, "failed to reap session process");
        }
        drop(session);

        let changed = self.registry.recompute_uniqueness();
        self.flag_window_updates(&changed);
        self.maybe_exit();
    }

    fn flag_window_updates(&mut self, sessions: &[SessionNumber]) {
        for &number in sessions {
            let Some(session) = self.registry.get(number) else {
                continue;
            };
            for id in &session.viewers {
                if let Some(viewer) = self.viewers.get_mut(id) {
                    viewer.window_update_needed = true;
                }
                self.effects.push(Effect::Writable(*id));
            }
        }
    }

    fn maybe_exit(&mut self) {
        if self.registry.is_empty() && self.viewers.is_empty() {
            info!("no sessions or viewers left");
            self.effects.push(Effect::Exit);
        }
    }
}
