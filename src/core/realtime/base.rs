//! Lifecycle and turn-taking states of a realtime session.

use std::fmt;

use serde::Serialize;

// =============================================================================
// Connection State
// =============================================================================

/// State of the persistent protocol connection.
///
/// A failed handshake returns to `Disconnected` so the caller can retry;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// Controller State
// =============================================================================

/// Lifecycle of a model session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ControllerState {
    #[default]
    Idle,
    Connecting,
    /// Handshake done, session configuration being sent
    AwaitingSessionAck,
    /// Pump and receive loops running
    Active,
    Closed,
    /// Transport failed; `connect` again to resume
    Failed,
}

impl ControllerState {
    /// Whether `connect` may be called from this state.
    pub fn can_connect(&self) -> bool {
        matches!(self, ControllerState::Idle | ControllerState::Failed)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Connecting => write!(f, "Connecting"),
            ControllerState::AwaitingSessionAck => write!(f, "AwaitingSessionAck"),
            ControllerState::Active => write!(f, "Active"),
            ControllerState::Closed => write!(f, "Closed"),
            ControllerState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Turn State
// =============================================================================

/// Who holds the conversational floor, as signalled by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TurnState {
    #[default]
    Idle,
    /// The human is speaking
    Listening,
    /// Model audio is streaming
    Speaking,
    /// The human stopped; waiting on the model
    Thinking,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Idle => write!(f, "Idle"),
            TurnState::Listening => write!(f, "Listening"),
            TurnState::Speaking => write!(f, "Speaking"),
            TurnState::Thinking => write!(f, "Thinking"),
        }
    }
}
