//! Session lifecycle state machine
//!
//! One enumerated state per session with a single transition function that
//! rejects anything not in the transition table, instead of letting event
//! handlers overwrite a status string at will.

use thiserror::Error;

/// Lifecycle of one capture-to-transport session.
///
/// `Playing` is only entered by the assistant pipeline, while synthesized
/// speech is being played back; the recording pipeline never uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Playing,
    Closing,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    /// Label used for UI/status reporting.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "connected",
            SessionState::Playing => "playing",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        }
    }

    fn can_move_to(self, to: SessionState) -> bool {
        use SessionState::*;
        // Error is reachable from any non-terminal state.
        if to == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Playing)
                | (Open, Closing)
                | (Open, Closed)
                | (Playing, Open)
                | (Playing, Closing)
                | (Playing, Closed)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Move `state` to `to` if the transition table allows it.
pub fn transition(state: &mut SessionState, to: SessionState) -> Result<(), InvalidTransition> {
    if state.can_move_to(to) {
        *state = to;
        Ok(())
    } else {
        Err(InvalidTransition { from: *state, to })
    }
}
