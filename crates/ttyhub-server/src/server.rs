//! The server: accepts viewer connections and drives the [`Hub`].
//!
//! A single task owns the hub. Connection tasks and PTY pumps talk to it
//! through one mailbox of [`HubEvent`]s, and the hub's effects are carried
//! out here: frames go to connection tasks, read grants to pumps, shutdown
//! timers to `tokio::time`.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ttyhub_core::{HubError, HubResult};

use crate::config::ServerConfig;
use crate::hub::{Effect, Hub, HubOptions};
use crate::launch::{Launcher, LoggingLauncher};
use crate::session::{ConnId, NativeSpawner, SessionNumber};
use crate::transport::websocket::{self, ViewerConnection};

/// How often sessions nobody reads from are checked for an exited child.
const CHILD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Messages delivered to the task that owns the hub.
#[derive(Debug)]
enum HubEvent {
    ViewerInput { id: ConnId, data: Vec<u8> },
    /// The connection task finished sending the last frame it was given.
    ViewerFlushed(ConnId),
    ViewerClosed(ConnId),
    PtyOutput { session: SessionNumber, data: Vec<u8> },
    PtyClosed(SessionNumber),
    ShutdownTimer { session: SessionNumber, token: u64 },
}

/// Instructions for a session's blocking read pump.
#[derive(Debug)]
enum PumpCommand {
    /// Read once, at most this many payload bytes.
    Read(usize),
    /// Read and drop this many queued bytes.
    Discard(usize),
}

/// The hub's handle on a viewer's connection task.
struct ViewerLink {
    frames: mpsc::Sender<Vec<u8>>,
    /// No frame is in flight, so the next one may be assembled.
    idle: bool,
}

/// The ttyhub server instance.
pub struct TtyHubServer {
    config: ServerConfig,
}

impl TtyHubServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Serve until no sessions or viewers remain.
    pub async fn run(self) -> HubResult<()> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let mut listener = websocket::start_listener(addr).await?;
        let mut hangup = signal(SignalKind::hangup())?;

        let (events_tx, mut events_rx) = mpsc::channel::<HubEvent>(256);
        let hub = Hub::new(
            HubOptions::from_config(&self.config),
            Box::new(NativeSpawner::new(self.config.packet_mode)),
            self.config.settings_json.clone(),
        );
        let mut state = ServerState {
            hub,
            links: HashMap::new(),
            pumps: HashMap::new(),
            launcher: Box::new(LoggingLauncher),
            events: events_tx,
            shutdown_grace: self.config.shutdown_grace,
        };

        info!(
            addr = %addr,
            command = ?self.config.command,
            readonly = self.config.readonly,
            "ttyhub ready"
        );

        if self.config.detached {
            state.hub.spawn_detached()?;
            state.apply_effects();
        }

        let mut child_check = tokio::time::interval(CHILD_CHECK_INTERVAL);
        child_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(conn) = listener.recv() => state.accept(conn),
                Some(event) = events_rx.recv() => state.handle(event),
                _ = child_check.tick() => state.hub.reap_exited(),
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading settings");
                    match self.config.reload_settings() {
                        Ok(settings) => state.hub.set_settings(settings),
                        Err(e) => warn!(error = %e, "settings reload failed"),
                    }
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
            if state.apply_effects() {
                info!("nothing left to serve, exiting");
                break;
            }
        }

        Ok(())
    }
}

struct ServerState {
    hub: Hub,
    links: HashMap<ConnId, ViewerLink>,
    pumps: HashMap<SessionNumber, mpsc::UnboundedSender<PumpCommand>>,
    launcher: Box<dyn Launcher>,
    events: mpsc::Sender<HubEvent>,
    shutdown_grace: Duration,
}

impl ServerState {
    fn accept(&mut self, mut conn: ViewerConnection) {
        let remote = conn.remote_addr;
        let Some(id) = self.hub.viewer_connected(conn.connect_pid) else {
            tokio::spawn(async move {
                let _ = conn.ws_stream.close(None).await;
            });
            return;
        };
        info!(conn = id, remote = %remote, "viewer accepted");
        if let Some(specifier) = conn.attach.as_deref() {
            let linked = self.hub.viewer(id).is_some_and(|v| v.session.is_some());
            if !linked {
                if let Err(e) = self.hub.attach_viewer(id, specifier) {
                    warn!(conn = id, specifier, error = %e, "attach failed");
                }
            }
        }

        let (frames_tx, frames_rx) = mpsc::channel(1);
        self.links.insert(
            id,
            ViewerLink {
                frames: frames_tx,
                idle: true,
            },
        );
        tokio::spawn(serve_viewer(id, conn, frames_rx, self.events.clone()));
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::ViewerInput { id, data } => self.hub.viewer_input(id, &data),
            HubEvent::ViewerFlushed(id) => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.idle = true;
                }
                self.flush(id);
            }
            HubEvent::ViewerClosed(id) => {
                self.links.remove(&id);
                self.hub.viewer_closed(id);
            }
            HubEvent::PtyOutput { session, data } => self.hub.pty_output(session, &data),
            HubEvent::PtyClosed(session) => self.hub.pty_closed(session),
            HubEvent::ShutdownTimer { session, token } => {
                self.hub.shutdown_timer_fired(session, token)
            }
        }
    }

    /// Carry out queued effects until none remain. Returns true when the
    /// server should exit.
    fn apply_effects(&mut self) -> bool {
        let mut exit = false;
        loop {
            let effects = self.hub.drain_effects();
            if effects.is_empty() {
                return exit;
            }
            for effect in effects {
                match effect {
                    Effect::Writable(id) => self.flush(id),
                    Effect::StartPump(session) => self.start_pump(session),
                    Effect::ReadPty { session, max } => {
                        self.command_pump(session, PumpCommand::Read(max))
                    }
                    Effect::DiscardPty { session, len } => {
                        self.command_pump(session, PumpCommand::Discard(len))
                    }
                    Effect::StopPump(session) => {
                        // Dropping the sender ends the pump once its read returns.
                        self.pumps.remove(&session);
                    }
                    Effect::ScheduleShutdown { session, token } => {
                        let events = self.events.clone();
                        let grace = self.shutdown_grace;
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = events.send(HubEvent::ShutdownTimer { session, token }).await;
                        });
                    }
                    Effect::OpenLink(link) => self.launcher.open_link(&link),
                    Effect::OpenWindow { request, geometry } => {
                        self.launcher.open_window(&request, geometry.as_deref())
                    }
                    Effect::Exit => exit = true,
                }
            }
        }
    }

    /// Hand the viewer its next frame if its connection is idle.
    fn flush(&mut self, id: ConnId) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        if !link.idle {
            return;
        }
        let Some(frame) = self.hub.viewer_writable(id) else {
            return;
        };
        match link.frames.try_send(frame) {
            Ok(()) => link.idle = false,
            Err(e) => debug!(conn = id, error = %e, "viewer connection gone, dropping frame"),
        }
    }

    fn start_pump(&mut self, session: SessionNumber) {
        let Some((reader, packet_mode)) = self.hub.take_reader(session) else {
            warn!(session, "session has no PTY reader");
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.pumps.insert(session, tx);
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || run_pump(session, reader, packet_mode, rx, events));
    }

    fn command_pump(&mut self, session: SessionNumber, command: PumpCommand) {
        let Some(pump) = self.pumps.get(&session) else {
            debug!(session, ?command, "no pump for session");
            return;
        };
        if pump.send(command).is_err() {
            debug!(session, "pump already stopped");
        }
    }
}

impl Drop for ServerState {
    fn drop(&mut self) {
        self.hub.shutdown();
    }
}

/// Shuttle bytes between one viewer's WebSocket and the hub.
async fn serve_viewer(
    id: ConnId,
    mut conn: ViewerConnection,
    mut frames: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<HubEvent>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(e) = websocket::ws_send_binary(&mut conn.ws_stream, frame).await {
                    debug!(conn = id, error = %e, "viewer send failed");
                    break;
                }
                if events.send(HubEvent::ViewerFlushed(id)).await.is_err() {
                    break;
                }
            }

            received = websocket::ws_recv(&mut conn.ws_stream) => {
                match received {
                    Ok(Some(data)) => {
                        if events.send(HubEvent::ViewerInput { id, data }).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(conn = id, "viewer closed the connection");
                        break;
                    }
                    Err(e) => {
                        debug!(conn = id, error = %e, "viewer connection failed");
                        break;
                    }
                }
            }
        }
    }
    let _ = events.send(HubEvent::ViewerClosed(id)).await;
}

/// Blocking read loop for one PTY. Performs exactly one read per grant.
fn run_pump(
    session: SessionNumber,
    mut reader: Box<dyn Read + Send>,
    packet_mode: bool,
    mut commands: mpsc::UnboundedReceiver<PumpCommand>,
    events: mpsc::Sender<HubEvent>,
) {
    let mut buf = Vec::new();
    while let Some(command) = commands.blocking_recv() {
        match command {
            PumpCommand::Read(max) => {
                // In packet mode every read starts with a status byte.
                let want = if packet_mode { max + 1 } else { max };
                buf.resize(want, 0);
                let event = match read_once(&mut reader, &mut buf) {
                    Ok(0) => HubEvent::PtyClosed(session),
                    Ok(n) => HubEvent::PtyOutput {
                        session,
                        data: buf[..n].to_vec(),
                    },
                    Err(e) => {
                        debug!(session, error = %e, "PTY read ended");
                        HubEvent::PtyClosed(session)
                    }
                };
                let closed = matches!(event, HubEvent::PtyClosed(_));
                if events.blocking_send(event).is_err() || closed {
                    break;
                }
            }
            PumpCommand::Discard(len) => {
                if let Err(e) = discard(&mut reader, len) {
                    debug!(session, error = %e, "discarding queued output failed");
                }
            }
        }
    }
    debug!(session, "PTY pump stopped");
}

fn read_once(reader: &mut dyn Read, buf: &mut [u8]) -> HubResult<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other.map_err(HubError::from),
        }
    }
}

fn discard(reader: &mut dyn Read, mut len: usize) -> HubResult<()> {
    let mut scratch = [0u8; 4096];
    while len > 0 {
        let want = len.min(scratch.len());
        let n = read_once(reader, &mut scratch[..want])?;
        if n == 0 {
            break;
        }
        len -= n;
    }
    Ok(())
}
