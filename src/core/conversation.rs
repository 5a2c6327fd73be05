//! Conversation session: multiplexes inbound tracks into one resampled stream.
//!
//! Each added track gets an ingest task that pulls frames, strips their
//! timestamps and feeds the shared [`AudioResampler`]. Frames from several
//! tracks interleave in arrival order; no cross-track alignment is attempted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::core::audio::{AudioFormat, AudioResampler, AudioTrack, ReadyState, TrackKind};
use crate::errors::{BridgeError, BridgeResult};

/// One logical conversation feeding the model.
pub struct ConversationSession {
    id: String,
    resampler: Arc<AudioResampler>,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    span: Span,
}

impl ConversationSession {
    /// Session resampling into `target` with the built-in converter.
    pub fn new(id: impl Into<String>, target: AudioFormat) -> Self {
        Self::with_resampler(id, AudioResampler::new(target))
    }

    pub fn with_resampler(id: impl Into<String>, resampler: AudioResampler) -> Self {
        let id = id.into();
        let span = info_span!("conversation", id = %id);
        Self {
            id,
            resampler: Arc::new(resampler),
            active: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Format of the chunks returned by [`recv`](Self::recv).
    pub fn format(&self) -> AudioFormat {
        self.resampler.target()
    }

    /// Start ingesting `track` under `track_id`.
    ///
    /// Fails with `InvalidTrack` for non-audio tracks or a stopped session and
    /// with `DuplicateTrack` while an ingest task for `track_id` is running.
    pub fn add_track(
        &self,
        track_id: impl Into<String>,
        track: Arc<dyn AudioTrack>,
    ) -> BridgeResult<()> {
        let track_id = track_id.into();
        if track.kind() != TrackKind::Audio {
            return Err(BridgeError::InvalidTrack(format!(
                "track {track_id} is {}, expected audio",
                track.kind()
            )));
        }
        if !self.is_active() {
            return Err(BridgeError::InvalidTrack(format!(
                "conversation {} is stopped",
                self.id
            )));
        }

        let mut tasks = self.tasks.lock();
        if tasks.get(&track_id).is_some_and(|handle| !handle.is_finished()) {
            return Err(BridgeError::DuplicateTrack(track_id));
        }

        let span = info_span!(parent: &self.span, "ingest", track = %track_id);
        let handle = tokio::spawn(
            ingest_track(
                track,
                self.resampler.clone(),
                self.active.clone(),
                self.cancel.clone(),
            )
            .instrument(span),
        );
        tasks.insert(track_id.clone(), handle);
        info!(parent: &self.span, track = %track_id, "track added");
        Ok(())
    }

    /// Ids of every track added so far, sorted.
    pub fn track_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of ingest tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Next ready chunk of resampled PCM, or `None` if nothing is buffered.
    pub fn recv(&self) -> Option<Bytes> {
        if !self.is_active() {
            return None;
        }
        self.resampler.recv()
    }

    /// Wait for the next chunk. Returns `None` once the session is stopped.
    pub async fn next_chunk(&self) -> Option<Bytes> {
        if !self.is_active() {
            return None;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            chunk = self.resampler.next_chunk() => Some(chunk),
        }
    }

    /// Drop buffered audio without stopping ingest.
    pub fn clear(&self) {
        self.resampler.clear();
    }

    /// Stop ingest and discard buffered audio. Idempotent.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        for (_, handle) in self.tasks.lock().iter() {
            handle.abort();
        }
        self.resampler.clear();
        info!(parent: &self.span, "conversation stopped");
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn ingest_track(
    track: Arc<dyn AudioTrack>,
    resampler: Arc<AudioResampler>,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    while active.load(Ordering::SeqCst) && track.ready_state() != ReadyState::Ended {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = track.recv() => next,
        };

        match next {
            Ok(Some(frame)) => {
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = resampler.resample(&frame.with_pts(None)) {
                    warn!(error = %e, "dropping frame");
                }
            }
            Ok(None) => {
                debug!("track ended");
                break;
            }
            Err(BridgeError::Decode(reason)) => {
                warn!(%reason, "dropping undecodable frame");
            }
            Err(e) => {
                warn!(error = %e, "track failed, stopping ingest");
                break;
            }
        }
    }
}
