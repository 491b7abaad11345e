//! In-memory PTY used by engine tests.

use std::io::Read;
use std::sync::{Arc, Mutex};
use ttyhub_core::{Geometry, HubError, HubResult, LocalModes};

use super::pty::{PtyIo, PtySpawner, SpawnRequest};

/// Observable state of one fake PTY.
#[derive(Debug, Default)]
pub struct FakeState {
    pub request: SpawnRequest,
    pub input: Vec<u8>,
    pub resizes: Vec<Geometry>,
    pub modes: LocalModes,
    pub intr: u8,
    pub queued: usize,
    pub terminated_with: Option<i32>,
    /// Set to make the child look like it has exited.
    pub exited: Option<u32>,
}

pub struct FakePty {
    pid: u32,
    packet_mode: bool,
    state: Arc<Mutex<FakeState>>,
}

impl PtyIo for FakePty {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn packet_mode(&self) -> bool {
        self.packet_mode
    }

    fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }

    fn write_input(&mut self, data: &[u8]) -> HubResult<()> {
        self.state.lock().unwrap().input.extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, geometry: &Geometry) -> HubResult<()> {
        self.state.lock().unwrap().resizes.push(*geometry);
        Ok(())
    }

    fn local_modes(&self) -> HubResult<LocalModes> {
        Ok(self.state.lock().unwrap().modes)
    }

    fn interrupt_char(&self) -> HubResult<u8> {
        Ok(self.state.lock().unwrap().intr)
    }

    fn queued_output(&self) -> HubResult<usize> {
        Ok(self.state.lock().unwrap().queued)
    }

    fn terminate(&mut self, signal: i32) -> HubResult<Option<u32>> {
        let mut state = self.state.lock().unwrap();
        if state.exited.is_none() {
            state.terminated_with = Some(signal);
            state.exited = Some(0);
        }
        Ok(state.exited)
    }

    fn try_wait(&mut self) -> HubResult<Option<u32>> {
        Ok(self.state.lock().unwrap().exited)
    }
}

/// Hands out fake PTYs with pids 1000, 1001, ... and keeps their state.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    pub spawned: Arc<Mutex<Vec<Arc<Mutex<FakeState>>>>>,
    pub packet_mode: bool,
    pub fail: bool,
}

impl FakeSpawner {
    pub fn state(&self, index: usize) -> Arc<Mutex<FakeState>> {
        self.spawned.lock().unwrap()[index].clone()
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&mut self, request: SpawnRequest) -> HubResult<Box<dyn PtyIo>> {
        if self.fail {
            return Err(HubError::Spawn("no ptys left".into()));
        }
        let state = Arc::new(Mutex::new(FakeState {
            request,
            intr: 3,
            ..FakeState::default()
        }));
        let mut spawned = self.spawned.lock().unwrap();
        let pid = 1000 + spawned.len() as u32;
        spawned.push(state.clone());
        Ok(Box::new(FakePty {
            pid,
            packet_mode: self.packet_mode,
            state,
        }))
    }
}
