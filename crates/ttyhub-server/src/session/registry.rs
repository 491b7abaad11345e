//! Process-wide list of live sessions in creation order.

use std::collections::HashMap;
use tracing::debug;
use ttyhub_core::{HubError, HubResult};

use super::{PtySession, SessionNumber};

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Vec<PtySession>,
    last_number: SessionNumber,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next session number (highest issued + 1).
    pub fn issue_number(&mut self) -> SessionNumber {
        self.last_number += 1;
        self.last_number
    }

    pub fn insert(&mut self, session: PtySession) {
        debug!(session = session.number, pid = session.pid, "session registered");
        self.sessions.push(session);
    }

    pub fn remove(&mut self, number: SessionNumber) -> Option<PtySession> {
        let index = self.sessions.iter().position(|s| s.number == number)?;
        Some(self.sessions.remove(index))
    }

    pub fn get(&self, number: SessionNumber) -> Option<&PtySession> {
        self.sessions.iter().find(|s| s.number == number)
    }

    pub fn get_mut(&mut self, number: SessionNumber) -> Option<&mut PtySession> {
        self.sessions.iter_mut().find(|s| s.number == number)
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<&PtySession> {
        self.sessions.iter().find(|s| s.pid == pid)
    }

    /// Sessions whose name is exactly `name`.
    pub fn find_by_name(&self, name: &str) -> Vec<SessionNumber> {
        self.sessions
            .iter()
            .filter(|s| s.name.as_deref() == Some(name))
            .map(|s| s.number)
            .collect()
    }

    /// Resolve a session specifier.
    ///
    /// An all-digit specifier matching a live pid wins outright. Otherwise
    /// sessions match by exact name, or by number when written `:N`.
    /// Several matches are returned as `Err` (ambiguous).
    pub fn resolve(&self, specifier: &str) -> Result<Option<SessionNumber>, Vec<SessionNumber>> {
        if !specifier.is_empty() && specifier.bytes().all(|b| b.is_ascii_digit()) {
            if let Some(session) = specifier
                .parse::<u32>()
                .ok()
                .and_then(|pid| self.find_by_pid(pid))
            {
                return Ok(Some(session.number));
            }
        }

        let mut matches = self.find_by_name(specifier);
        let by_number = specifier
            .strip_prefix(':')
            .and_then(|n| n.parse::<SessionNumber>().ok())
            .filter(|&n| self.get(n).is_some() && !matches.contains(&n));
        matches.extend(by_number);

        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(matches),
        }
    }

    /// Like [`resolve`](Self::resolve), with user-facing errors.
    pub fn lookup(&self, specifier: &str) -> HubResult<SessionNumber> {
        match self.resolve(specifier) {
            Ok(Some(number)) => Ok(number),
            Ok(None) => Err(HubError::SessionNotFound(specifier.to_string())),
            Err(_) => Err(HubError::AmbiguousSession(specifier.to_string())),
        }
    }

    /// Rename a session and recompute every uniqueness flag.
    ///
    /// Returns the sessions whose viewers need a window update: the renamed
    /// one plus any whose flag changed.
    pub fn set_name(&mut self, number: SessionNumber, name: String) -> Vec<SessionNumber> {
        let Some(session) = self.get_mut(number) else {
            return Vec::new();
        };
        session.name = Some(name);
        let mut changed = self.recompute_uniqueness();
        if !changed.contains(&number) {
            changed.push(number);
        }
        changed
    }

    /// Recompute name uniqueness; returns the sessions whose flag flipped.
    pub fn recompute_uniqueness(&mut self) -> Vec<SessionNumber> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for name in self.sessions.iter().filter_map(|s| s.name.clone()) {
            *counts.entry(name).or_default() += 1;
        }
        let mut changed = Vec::new();
        for session in &mut self.sessions {
            let unique = session
                .name
                .as_ref()
                .is_some_and(|n| counts.get(n) == Some(&1));
            if unique != session.name_unique {
                session.name_unique = unique;
                changed.push(session.number);
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = &PtySession> {
        self.sessions.iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
