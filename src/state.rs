//! Server lifecycle states.
//!
//! ```text
//! Initializing -> Starting(address) -> Started -> Stopping -> Stopped
//! ```
//!
//! Every transition moves exactly one step forward. `Stopped` is terminal.

use crate::error::ServerError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, `start` not yet called.
    Initializing,
    /// `start` in progress (or bind failed) for this address.
    Starting(String),
    /// Listening and accepting connections.
    Started,
    /// `stop` in progress; the listener is closing.
    Stopping,
    /// Listener closed. Terminal.
    Stopped,
}

impl ServerState {
    fn ordinal(&self) -> u8 {
        match self {
            ServerState::Initializing => 0,
            ServerState::Starting(_) => 1,
            ServerState::Started => 2,
            ServerState::Stopping => 3,
            ServerState::Stopped => 4,
        }
    }

    pub fn can_transition_to(&self, next: &ServerState) -> bool {
        next.ordinal() == self.ordinal() + 1
    }

    /// Move to `next`, rejecting anything but the immediate successor.
    pub fn transition(&mut self, next: ServerState) -> Result<(), ServerError> {
        if !self.can_transition_to(&next) {
            return Err(ServerError::IllegalTransition {
                from: self.clone(),
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Stopped)
    }

    /// Whether the server owns a listener in this state.
    pub fn holds_listener(&self) -> bool {
        matches!(self, ServerState::Started | ServerState::Stopping)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Initializing => f.write_str("initializing"),
            ServerState::Starting(address) => write!(f, "starting({address})"),
            ServerState::Started => f.write_str("started"),
            ServerState::Stopping => f.write_str("stopping"),
            ServerState::Stopped => f.write_str("stopped"),
        }
    }
}
