//! PTY wrapper using portable-pty.
//!
//! The engine talks to PTYs through [`PtyIo`] and creates them through
//! [`PtySpawner`], so session logic can be driven by an in-memory fake in
//! tests. [`NativeSpawner`] is the real implementation: portable-pty for the
//! pair and the child, plus a few termios/ioctl calls portable-pty does not
//! expose (packet mode, local modes, queued byte count, signals).

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use ttyhub_core::protocol::identity_value;
use ttyhub_core::{Geometry, HubError, HubResult, LocalModes};

use crate::config::PacketMode;

/// Name of the identity variable exported to child processes.
pub const IDENTITY_VAR: &str = "TTYHUB";

/// Status-byte flag reporting a termios change in packet mode.
pub const TIOCPKT_IOCTL: u8 = 0x40;

#[cfg(target_os = "linux")]
const EXTPROC: libc::tcflag_t = 0o200000;
#[cfg(target_os = "macos")]
const EXTPROC: libc::tcflag_t = 0x800;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const EXTPROC: libc::tcflag_t = 0;

/// How long [`PtyIo::terminate`] waits for the signal to take effect before
/// falling back to `SIGKILL`.
const TERMINATE_POLLS: u32 = 20;
const TERMINATE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Runs the real command through `sh` so the identity variable can carry the
/// child's own pid: `$0` is the identity prefix, `"$@"` the command.
fn identity_script() -> String {
    format!("{IDENTITY_VAR}=\"$0;pid=$$\"; export {IDENTITY_VAR}; exec \"$@\"")
}

/// What to run in a new session.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub session_number: u32,
}

/// Operations the engine performs on a session's PTY master and child.
pub trait PtyIo: Send {
    fn pid(&self) -> u32;

    /// Whether reads carry a leading packet-mode status byte.
    fn packet_mode(&self) -> bool;

    /// Hand out the read side for the session's pump. Returns `None` after
    /// the first call.
    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>>;

    fn write_input(&mut self, data: &[u8]) -> HubResult<()>;

    fn resize(&mut self, geometry: &Geometry) -> HubResult<()>;

    fn local_modes(&self) -> HubResult<LocalModes>;

    /// The terminal's INTR character.
    fn interrupt_char(&self) -> HubResult<u8>;

    /// Bytes the kernel has queued for reading on the master.
    fn queued_output(&self) -> HubResult<usize>;

    /// Send `signal` to the child and reap it, escalating to `SIGKILL` if it
    /// does not exit promptly. Returns the exit code when one is available.
    fn terminate(&mut self, signal: i32) -> HubResult<Option<u32>>;

    /// Reap the child if it has already exited, without blocking.
    fn try_wait(&mut self) -> HubResult<Option<u32>>;
}

/// Creates PTY-backed children.
pub trait PtySpawner: Send {
    fn spawn(&mut self, request: SpawnRequest) -> HubResult<Box<dyn PtyIo>>;
}

/// Spawns children on a native PTY pair.
#[derive(Debug, Clone, Copy)]
pub struct NativeSpawner {
    packet_mode: PacketMode,
}

impl NativeSpawner {
    pub fn new(packet_mode: PacketMode) -> Self {
        Self { packet_mode }
    }
}

impl PtySpawner for NativeSpawner {
    fn spawn(&mut self, request: SpawnRequest) -> HubResult<Box<dyn PtyIo>> {
        Ok(Box::new(NativePty::spawn(request, self.packet_mode)?))
    }
}

/// A child process running on a native PTY.
pub struct NativePty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    reader: Option<Box<dyn Read + Send>>,
    child: Box<dyn Child + Send + Sync>,
    fd: RawFd,
    pid: u32,
    /// Exit code once the child has been reaped.
    exit_code: Option<u32>,
    packet_mode: bool,
}

impl NativePty {
    pub fn spawn(request: SpawnRequest, packet_mode: PacketMode) -> HubResult<Self> {
        if request.argv.is_empty() {
            return Err(HubError::Spawn("empty command".into()));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| HubError::Spawn(format!("failed to open PTY: {e}")))?;

        let fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| HubError::Spawn("PTY master has no file descriptor".into()))?;
        let tty_name = slave_name(fd);

        let packet = packet_mode.enabled() && enable_packet_mode(fd);
        if packet && packet_mode == PacketMode::Extproc {
            if let Err(e) = set_extproc(fd) {
                debug!(error = %e, "could not enable EXTPROC");
            }
        }

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg(identity_script());
        cmd.arg(identity_value(tty_name.as_deref(), request.session_number));
        for arg in &request.argv {
            cmd.arg(arg);
        }
        cmd.cwd(working_dir(request.cwd));
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HubError::Spawn(format!("failed to spawn command: {e}")))?;
        // The child holds the only slave descriptor we need; dropping ours
        // lets reads on the master fail once the child exits.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| HubError::Spawn("spawned child has no pid".into()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HubError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HubError::Pty(format!("failed to take PTY writer: {e}")))?;

        info!(pid, tty = ?tty_name, packet_mode = packet, "PTY spawned");

        Ok(Self {
            master: pair.master,
            writer,
            reader: Some(reader),
            child,
            fd,
            pid,
            exit_code: None,
            packet_mode: packet,
        })
    }

    fn termios(&self) -> HubResult<libc::termios> {
        // SAFETY: `termios` is plain data and `fd` stays open for the
        // lifetime of `self.master`.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(self.fd, &mut tio) != 0 {
                return Err(HubError::Pty(format!(
                    "tcgetattr: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok(tio)
        }
    }
}

impl PtyIo for NativePty {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn packet_mode(&self) -> bool {
        self.packet_mode
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    fn write_input(&mut self, data: &[u8]) -> HubResult<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, geometry: &Geometry) -> HubResult<()> {
        let Some((rows, cols)) = geometry.cells() else {
            return Ok(());
        };
        let size = PtySize {
            rows,
            cols,
            pixel_width: geometry.pixel_width.unwrap_or(0),
            pixel_height: geometry.pixel_height.unwrap_or(0),
        };
        self.master
            .resize(size)
            .map_err(|e| HubError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(pid = self.pid, rows, cols, "PTY resized");
        Ok(())
    }

    fn local_modes(&self) -> HubResult<LocalModes> {
        let tio = self.termios()?;
        let lflag = tio.c_lflag;
        Ok(LocalModes {
            icanon: lflag & libc::ICANON != 0,
            echo: lflag & libc::ECHO != 0,
            extproc: EXTPROC != 0 && lflag & EXTPROC != 0,
            lflag: lflag as u32,
        })
    }

    fn interrupt_char(&self) -> HubResult<u8> {
        Ok(self.termios()?.c_cc[libc::VINTR] as u8)
    }

    fn queued_output(&self) -> HubResult<usize> {
        let mut queued: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the pointer.
        let rc = unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut queued) };
        if rc != 0 {
            return Err(HubError::Pty(format!(
                "FIONREAD: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(queued.max(0) as usize)
    }

    fn terminate(&mut self, signal: i32) -> HubResult<Option<u32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        info!(pid = self.pid, signal, "sending signal to session process");
        self.signal(signal);
        for _ in 0..TERMINATE_POLLS {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            std::thread::sleep(TERMINATE_POLL_INTERVAL);
        }
        warn!(pid = self.pid, "session process ignored signal, killing it");
        self.signal(libc::SIGKILL);
        let status = self
            .child
            .wait()
            .map_err(|e| HubError::Pty(format!("wait error: {e}")))?;
        let code = status.exit_code();
        info!(pid = self.pid, code, "session process exited");
        self.exit_code = Some(code);
        Ok(Some(code))
    }

    fn try_wait(&mut self) -> HubResult<Option<u32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let status = self
            .child
            .try_wait()
            .map_err(|e| HubError::Pty(format!("wait error: {e}")))?;
        Ok(status.map(|status| {
            let code = status.exit_code();
            info!(pid = self.pid, code, "session process exited");
            self.exit_code = Some(code);
            code
        }))
    }
}

impl NativePty {
    fn signal(&self, signal: i32) {
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(self.pid as libc::pid_t, signal) } != 0 {
            debug!(
                pid = self.pid,
                signal,
                error = %std::io::Error::last_os_error(),
                "kill failed"
            );
        }
    }
}

/// Path of the slave side of the PTY whose master is `fd`.
#[cfg(target_os = "linux")]
fn slave_name(fd: RawFd) -> Option<String> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: ptsname_r writes a NUL-terminated name of at most `buf.len()`
    // bytes into `buf`.
    let rc = unsafe { libc::ptsname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: on success `buf` holds a NUL-terminated string.
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    name.to_str().ok().map(str::to_owned)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(fd: RawFd) -> Option<String> {
    // SAFETY: ptsname returns NULL or a pointer to a NUL-terminated static
    // buffer, copied out before any other PTY call on this thread.
    unsafe {
        let ptr = libc::ptsname(fd);
        if ptr.is_null() {
            return None;
        }
        std::ffi::CStr::from_ptr(ptr).to_str().ok().map(str::to_owned)
    }
}

fn enable_packet_mode(fd: RawFd) -> bool {
    let on: libc::c_int = 1;
    // SAFETY: TIOCPKT reads a single c_int through the pointer.
    unsafe { libc::ioctl(fd, libc::TIOCPKT, &on) == 0 }
}

fn set_extproc(fd: RawFd) -> std::io::Result<()> {
    if EXTPROC == 0 {
        return Ok(());
    }
    // SAFETY: `termios` is plain data; the fd is a valid open PTY master.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        tio.c_lflag |= EXTPROC;
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// `cwd` if it is a directory, else the home directory, else `/`.
pub fn working_dir(cwd: Option<PathBuf>) -> PathBuf {
    cwd.filter(|p| p.is_dir())
        .or_else(|| dirs::home_dir().filter(|p| p.is_dir()))
        .unwrap_or_else(|| PathBuf::from("/"))
}
