//! Inbound media track seam.
//!
//! The media transport (peer/room join, network negotiation) lives outside this
//! crate. It hands the bridge objects implementing [`AudioTrack`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::AudioFrame;
use crate::errors::BridgeResult;

/// Kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle of an inbound track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Live,
    Ended,
}

/// A pull-based inbound media track.
#[async_trait]
pub trait AudioTrack: Send + Sync {
    fn kind(&self) -> TrackKind;

    fn ready_state(&self) -> ReadyState;

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` once the track has ended. A `BridgeError::Decode`
    /// affects only the frame being read; the caller may keep reading.
    async fn recv(&self) -> BridgeResult<Option<AudioFrame>>;
}

/// Channel-backed track fed by an in-process producer.
pub struct ChannelTrack {
    rx: Mutex<mpsc::Receiver<BridgeResult<AudioFrame>>>,
    ended: AtomicBool,
}

impl ChannelTrack {
    /// Create a track and the sender used to feed it frames.
    ///
    /// Dropping every sender ends the track.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<BridgeResult<AudioFrame>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                rx: Mutex::new(rx),
                ended: AtomicBool::new(false),
            },
            tx,
        )
    }

    /// Mark the track ended; pending frames are discarded.
    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioTrack for ChannelTrack {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn ready_state(&self) -> ReadyState {
        if self.ended.load(Ordering::SeqCst) {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    async fn recv(&self) -> BridgeResult<Option<AudioFrame>> {
        if self.ended.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match self.rx.lock().await.recv().await {
            Some(frame) => frame.map(Some),
            None => {
                self.ended.store(true, Ordering::SeqCst);
                Ok(None)
            }
        }
    }
}
