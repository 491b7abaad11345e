//! PTY sessions: the child process, its attached viewers and replay state.

#[cfg(test)]
pub mod fake;
pub mod pty;
pub mod registry;
pub mod replay;

pub use pty::{NativeSpawner, PtyIo, PtySpawner, SpawnRequest};
pub use registry::SessionRegistry;
pub use replay::{ContentsOutcome, ReplayBuffer};

use ttyhub_core::Geometry;

/// Session numbers start at 1 and are never reused.
pub type SessionNumber = u32;

/// Viewer connection ids are never reused.
pub type ConnId = u64;

/// One child process running on a PTY, shared by zero or more viewers.
pub struct PtySession {
    pub number: SessionNumber,
    pub pid: u32,
    pub name: Option<String>,
    /// Advisory: no other live session has the same name.
    pub name_unique: bool,
    pub geometry: Geometry,
    pub pty: Box<dyn PtyIo>,
    /// Attached viewers in attach order.
    pub viewers: Vec<ConnId>,
    /// Keep the session alive when its last viewer closes.
    pub detach_on_close: bool,
    /// Viewers that closed with preserve-on-close and have not come back.
    pub detach_count: u32,
    /// Explicitly detached by the command layer.
    pub detached: bool,
    /// Reads are gated by backpressure.
    pub paused: bool,
    /// A read grant is outstanding with the pump.
    pub read_in_flight: bool,
    /// Viewer that most recently sent input.
    pub recent_viewer: Option<ConnId>,
    pub replay: ReplayBuffer,
    /// Output read while nobody was attached and no replay was running;
    /// handed to the next viewer that links.
    pub unclaimed: Vec<u8>,
    /// Token of the pending deferred shutdown, if any.
    pub shutdown_token: Option<u64>,
}

impl PtySession {
    pub fn new(number: SessionNumber, pty: Box<dyn PtyIo>) -> Self {
        Self {
            number,
            pid: pty.pid(),
            name: None,
            name_unique: false,
            geometry: Geometry::default(),
            pty,
            viewers: Vec::new(),
            detach_on_close: false,
            detach_count: 0,
            detached: false,
            paused: false,
            read_in_flight: false,
            recent_viewer: None,
            replay: ReplayBuffer::new(),
            unclaimed: Vec::new(),
            shutdown_token: None,
        }
    }

    pub fn packet_mode(&self) -> bool {
        self.pty.packet_mode()
    }
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("number", &self.number)
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("viewers", &self.viewers)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}
