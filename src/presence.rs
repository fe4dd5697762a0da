//! Readiness protocol
//!
//! Readiness is never stored: it is read off the lobby channel's presence
//! snapshot. [`LobbyState`] folds roster loads, presence syncs and start
//! outcomes into effects for the lobby driver, and holds the one-shot latch
//! that keeps the auto-start from firing twice.

use crate::transport::PresenceSnapshot;
use crate::types::RosterEntry;
use std::collections::BTreeMap;
use tracing::debug;

/// `user_id -> ready`
pub type ReadyMap = BTreeMap<String, bool>;

/// Flatten a presence snapshot. A user with several sessions is ready if any
/// of them is.
pub fn ready_map(snapshot: &PresenceSnapshot) -> ReadyMap {
    let mut map = ReadyMap::new();
    for (_, states) in snapshot.iter() {
        for state in states {
            let ready = map.entry(state.user_id.clone()).or_insert(false);
            *ready |= state.ready;
        }
    }
    map
}

/// Whether the roster is exactly `required` strong and every member is ready.
pub fn all_ready(roster: &[RosterEntry], ready: &ReadyMap, required: usize) -> bool {
    roster.len() == required
        && roster
            .iter()
            .all(|entry| ready.get(&entry.user_id).copied().unwrap_or(false))
}

/// One-shot guard around the start transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartLatch {
    fired: bool,
}

impl StartLatch {
    /// Returns true exactly once until released.
    pub fn try_fire(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn release(&mut self) {
        self.fired = false;
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }
}

#[derive(Debug, Clone)]
pub enum LobbyInput {
    /// Current roster for the game
    Roster(Vec<RosterEntry>),
    /// Synchronized presence of the lobby channel
    Presence(PresenceSnapshot),
    /// Our start call went through
    StartSucceeded,
    /// Our start call failed
    StartFailed(String),
    /// The game row left the lobby state (someone else started it)
    GameActivated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEffect {
    RosterChanged(Vec<RosterEntry>),
    ReadinessChanged(ReadyMap),
    /// Invoke the lifecycle start operation
    StartGame,
    /// Move to the game view
    GameStarted,
    StartFailed(String),
}

/// Lobby reducer
#[derive(Debug, Clone)]
pub struct LobbyState {
    roster: Vec<RosterEntry>,
    ready: ReadyMap,
    latch: StartLatch,
    started: bool,
    required: usize,
}

impl LobbyState {
    pub fn new(required: usize) -> Self {
        Self {
            roster: Vec::new(),
            ready: ReadyMap::new(),
            latch: StartLatch::default(),
            started: false,
            required,
        }
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn ready(&self) -> &ReadyMap {
        &self.ready
    }

    pub fn is_ready(&self, user_id: &str) -> bool {
        self.ready.get(user_id).copied().unwrap_or(false)
    }

    pub fn latch(&self) -> StartLatch {
        self.latch
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn apply(&mut self, input: LobbyInput) -> Vec<LobbyEffect> {
        let mut effects = Vec::new();

        match input {
            LobbyInput::Roster(roster) => {
                if roster != self.roster {
                    self.roster = roster;
                    effects.push(LobbyEffect::RosterChanged(self.roster.clone()));
                }
            }
            LobbyInput::Presence(snapshot) => {
                let ready = ready_map(&snapshot);
                if ready != self.ready {
                    self.ready = ready;
                    effects.push(LobbyEffect::ReadinessChanged(self.ready.clone()));
                }
            }
            LobbyInput::StartSucceeded | LobbyInput::GameActivated => {
                self.latch.try_fire();
                if !self.started {
                    self.started = true;
                    effects.push(LobbyEffect::GameStarted);
                }
                return effects;
            }
            LobbyInput::StartFailed(reason) => {
                if !self.started {
                    debug!("Start failed, releasing latch: {}", reason);
                    self.latch.release();
                    effects.push(LobbyEffect::StartFailed(reason));
                }
                // wait for the next roster or presence input before retrying
                return effects;
            }
        }

        if !self.started
            && all_ready(&self.roster, &self.ready, self.required)
            && self.latch.try_fire()
        {
            effects.push(LobbyEffect::StartGame);
        }
        effects
    }
}
