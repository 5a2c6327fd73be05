//! Realtime speech-to-speech model integration.
//!
//! This module speaks the OpenAI Realtime WebSocket protocol:
//!
//! - [`messages`]: client and server event types
//! - [`config`]: model, voice, audio format and endpoint settings
//! - [`connection`]: the WebSocket transport ([`ProtocolConnection`])
//! - [`controller`]: the session state machine ([`ModelSessionController`])
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use realtime_bridge::config::BridgeConfig;
//! use realtime_bridge::core::audio::ChannelTrack;
//! use realtime_bridge::core::realtime::ModelSessionController;
//!
//! let controller = ModelSessionController::new(BridgeConfig::from_env());
//! let (track, frames) = ChannelTrack::new(64);
//! controller.conversation().add_track("mic", Arc::new(track))?;
//! controller.connect().await?;
//!
//! let mut playback = controller.playback_source();
//! while let Some(frame) = playback.recv().await {
//!     // hand the frame to the outbound transport
//! }
//! ```

mod base;
pub mod config;
pub mod connection;
pub mod controller;
pub mod messages;

pub use base::{ConnectionState, ControllerState, TurnState};
pub use config::{
    AudioEncoding, Modality, ModelSessionConfig, REALTIME_BASE_URL, REALTIME_BETA_HEADER,
    REALTIME_PCM16_SAMPLE_RATE, RealtimeModel, RealtimeSettings, ToolChoice, Voice,
};
pub use connection::{EventSender, ProtocolConnection, ServerEventHandler};
pub use controller::ModelSessionController;
pub use messages::{
    ApiError, ClientEvent, ContentPart, ConversationItem, MaxTokens, ParseError, RateLimit,
    ResponseInfo, ServerEvent, SessionInfo, TurnDetection,
};
