//! Error types shared by the bridge components.
//!
//! Protocol-level `error` events sent by the model are *not* represented here:
//! they are delivered to subscribers as data (see [`crate::core::realtime::ApiError`])
//! and never tear the session down.

use thiserror::Error;

/// Errors that can occur while bridging audio to a realtime model.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Operation attempted while the connection is not in the `Connected` state
    #[error("Not connected")]
    NotConnected,

    /// Handshake with the realtime endpoint failed; the caller may retry
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Transport-level failure of an established connection
    #[error("Socket error: {0}")]
    Socket(String),

    /// Track is not usable for audio ingest
    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    /// An ingest task is already running for this track id
    #[error("Track already started: {0}")]
    DuplicateTrack(String),

    /// Malformed audio frame or inbound payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Socket(_))
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
