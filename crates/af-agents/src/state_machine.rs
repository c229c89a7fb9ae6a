use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Transitions kept for diagnostics.
const HISTORY_LIMIT: usize = 64;

// ---------------------------------------------------------------------------
// RoleState
// ---------------------------------------------------------------------------

/// Lifecycle of the worker process owned for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleState {
    NotStarted,
    Starting,
    Running,
    Crashed,
    /// Waiting out the restart delay.
    Backoff,
    /// Restart budget exhausted; terminal until reset.
    GivenUp,
    Stopping,
    Stopped,
}

impl RoleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleState::NotStarted => "not_started",
            RoleState::Starting => "starting",
            RoleState::Running => "running",
            RoleState::Crashed => "crashed",
            RoleState::Backoff => "backoff",
            RoleState::GivenUp => "given_up",
            RoleState::Stopping => "stopping",
            RoleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RoleEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleEvent {
    Start,
    Started,
    Fail,
    Backoff,
    GiveUp,
    Stop,
    Stopped,
    Reset,
}

impl fmt::Display for RoleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoleEvent::Start => "start",
            RoleEvent::Started => "started",
            RoleEvent::Fail => "fail",
            RoleEvent::Backoff => "backoff",
            RoleEvent::GiveUp => "give_up",
            RoleEvent::Stop => "stop",
            RoleEvent::Stopped => "stopped",
            RoleEvent::Reset => "reset",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition { state: RoleState, event: RoleEvent },
}

// ---------------------------------------------------------------------------
// RoleStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RoleStateMachine {
    current: RoleState,
    history: VecDeque<(RoleState, RoleEvent, RoleState)>,
}

impl RoleStateMachine {
    pub fn new() -> Self {
        Self {
            current: RoleState::NotStarted,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> RoleState {
        self.current
    }

    /// Most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &(RoleState, RoleEvent, RoleState)> {
        self.history.iter()
    }

    fn next_state(state: RoleState, event: RoleEvent) -> Option<RoleState> {
        use RoleEvent as E;
        use RoleState as S;
        let next = match (state, event) {
            (S::NotStarted | S::Stopped | S::Backoff | S::Crashed, E::Start) => S::Starting,
            (S::Starting, E::Started) => S::Running,
            (S::Starting | S::Running, E::Fail) => S::Crashed,
            (S::Crashed, E::Backoff) => S::Backoff,
            (S::Crashed, E::GiveUp) => S::GivenUp,
            (S::Starting | S::Running, E::Stop) => S::Stopping,
            (S::Crashed | S::Backoff, E::Stop) => S::Stopped,
            // Exiting on its own while being stopped is still a stop.
            (S::Stopping, E::Stopped | E::Fail) => S::Stopped,
            (S::GivenUp | S::Stopped, E::Reset) => S::NotStarted,
            _ => return None,
        };
        Some(next)
    }

    /// Apply `event`.
    ///
    /// ```text
    /// NotStarted ─Start→ Starting ─Started→ Running ─Fail→ Crashed
    /// Crashed ─Backoff→ Backoff ─Start→ Starting
    /// Crashed ─GiveUp→ GivenUp ─Reset→ NotStarted
    /// Running ─Stop→ Stopping ─Stopped→ Stopped
    /// ```
    pub fn transition(&mut self, event: RoleEvent) -> Result<RoleState, StateMachineError> {
        let next = Self::next_state(self.current, event).ok_or(StateMachineError::InvalidTransition {
            state: self.current,
            event,
        })?;

        let from = self.current;
        self.current = next;
        self.history.push_back((from, event, next));
        if self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
        tracing::debug!(from = %from, event = %event, to = %next, "role state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: RoleEvent) -> bool {
        Self::next_state(self.current, event).is_some()
    }
}

impl Default for RoleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
