//! Model audio queued for playback and the paced source that drains it.
//!
//! The controller appends decoded `response.audio.delta` payloads to an
//! [`AudioOutputBuffer`]. The outbound transport pulls fixed-size frames from a
//! [`PacedAudioSource`], which sleeps until each frame is due and fills gaps
//! with silence so starvation is never observed as an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use super::{AudioFrame, PCM16_SAMPLE_WIDTH};
use crate::errors::{BridgeError, BridgeResult};

/// Default packetization time for outbound audio.
pub const DEFAULT_PTIME_MS: u32 = 20;

/// Layout and cadence of the outbound audio signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackOptions {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
    /// Bytes per sample
    pub sample_width: u16,
    /// Samples per channel in each emitted frame
    pub frame_samples: usize,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            sample_width: PCM16_SAMPLE_WIDTH,
            frame_samples: (24000 * DEFAULT_PTIME_MS / 1000) as usize,
        }
    }
}

impl PlaybackOptions {
    /// Size the frame for the given packetization time.
    pub fn with_ptime(mut self, ptime_ms: u32) -> Self {
        self.frame_samples = (self.sample_rate as u64 * ptime_ms as u64 / 1000) as usize;
        self
    }

    /// Bytes in one emitted frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * self.channels as usize * self.sample_width as usize
    }

    /// Wall-clock duration of `samples` samples.
    pub fn duration_of(&self, samples: u64) -> Duration {
        let nanos = samples as u128 * 1_000_000_000 / self.sample_rate.max(1) as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// Time source for playback pacing.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Clock backed by the tokio runtime, so paused test time applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Pending model audio awaiting playback.
///
/// Written by the controller's dispatch path and read by a single
/// [`PacedAudioSource`]. Locks are held only for the copy in or out.
#[derive(Debug)]
pub struct AudioOutputBuffer {
    options: PlaybackOptions,
    pending: Mutex<BytesMut>,
    closed: AtomicBool,
}

impl AudioOutputBuffer {
    pub fn new(options: PlaybackOptions) -> Self {
        Self {
            options,
            pending: Mutex::new(BytesMut::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &PlaybackOptions {
        &self.options
    }

    /// Append raw PCM. Ignored once the buffer is closed.
    pub fn enqueue(&self, data: &[u8]) {
        if data.is_empty() || self.is_closed() {
            return;
        }
        self.pending.lock().extend_from_slice(data);
    }

    /// Decode a base64 payload and append it. Returns the decoded length.
    pub fn enqueue_base64(&self, encoded: &str) -> BridgeResult<usize> {
        let decoded = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| BridgeError::Decode(format!("invalid base64 audio: {e}")))?;
        self.enqueue(&decoded);
        Ok(decoded.len())
    }

    /// Drop all pending audio. Returns the number of bytes discarded.
    pub fn flush(&self) -> usize {
        let mut pending = self.pending.lock();
        let discarded = pending.len();
        pending.clear();
        discarded
    }

    /// Close the buffer and discard pending audio.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.flush();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bytes waiting to be played.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Dequeue one frame of bytes, zero-padding a short tail.
    /// Returns `None` when nothing is queued.
    fn take_frame(&self) -> Option<Bytes> {
        let frame_bytes = self.options.frame_bytes();
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }
        if pending.len() >= frame_bytes {
            return Some(pending.split_to(frame_bytes).freeze());
        }
        let mut frame = BytesMut::with_capacity(frame_bytes);
        frame.extend_from_slice(&pending[..]);
        pending.clear();
        frame.resize(frame_bytes, 0);
        Some(frame.freeze())
    }
}

/// Pull-based outbound audio source paced against a clock.
///
/// The first call anchors the stream. Frame `n` is released no earlier than
/// `anchor + n * frame_duration`, and its timestamp is the number of samples
/// emitted before it.
pub struct PacedAudioSource {
    buffer: Arc<AudioOutputBuffer>,
    clock: Arc<dyn Clock>,
    anchor: Option<Instant>,
    samples_emitted: u64,
}

impl PacedAudioSource {
    pub fn new(buffer: Arc<AudioOutputBuffer>) -> Self {
        Self::with_clock(buffer, Arc::new(TokioClock))
    }

    pub fn with_clock(buffer: Arc<AudioOutputBuffer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            buffer,
            clock,
            anchor: None,
            samples_emitted: 0,
        }
    }

    pub fn options(&self) -> &PlaybackOptions {
        self.buffer.options()
    }

    /// Samples emitted so far.
    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted
    }

    /// Wait until the next frame is due and return it.
    ///
    /// Yields silence when too little audio is queued. Returns `None` once
    /// the source has been stopped.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_closed() {
            return None;
        }
        let options = *self.buffer.options();

        let anchor = *self.anchor.get_or_insert_with(|| self.clock.now());
        let target = anchor + options.duration_of(self.samples_emitted);
        let wait = target.saturating_duration_since(self.clock.now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        if self.buffer.is_closed() {
            return None;
        }

        let data = match self.buffer.take_frame() {
            Some(data) => data,
            None => {
                trace!(pts = self.samples_emitted, "output underrun, emitting silence");
                Bytes::from(vec![0u8; options.frame_bytes()])
            }
        };
        let pts = self.samples_emitted;
        self.samples_emitted += options.frame_samples as u64;

        Some(
            AudioFrame::from_raw(
                data,
                options.sample_rate,
                options.channels,
                options.sample_width,
            )
            .with_pts(Some(pts)),
        )
    }

    /// Stop playback; pending audio is dropped and `recv` returns `None` from now on.
    pub fn stop(&self) {
        self.buffer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_byte_frames() -> PlaybackOptions {
        PlaybackOptions {
            sample_rate: 24000,
            channels: 1,
            sample_width: 2,
            frame_samples: 1,
        }
    }

    #[test]
    fn test_default_options() {
        let options = PlaybackOptions::default();
        assert_eq!(options.frame_bytes(), 960);
        assert_eq!(options.duration_of(480), Duration::from_millis(20));
        assert_eq!(options.with_ptime(10).frame_samples, 240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_deltas_play_back_in_order() {
        let buffer = Arc::new(AudioOutputBuffer::new(two_byte_frames()));
        buffer.enqueue_base64(&BASE64_STANDARD.encode(b"ABCD")).unwrap();
        buffer.enqueue_base64(&BASE64_STANDARD.encode(b"ABCD")).unwrap();

        let mut source = PacedAudioSource::new(buffer.clone());
        let mut out = Vec::new();
        for _ in 0..4 {
            out.push(source.recv().await.unwrap().into_data().to_vec());
        }
        assert_eq!(out, vec![b"AB".to_vec(), b"CD".to_vec(), b"AB".to_vec(), b"CD".to_vec()]);

        let silence = source.recv().await.unwrap();
        assert_eq!(silence.data().as_ref(), &[0u8, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced_from_anchor() {
        let buffer = Arc::new(AudioOutputBuffer::new(PlaybackOptions::default()));
        let mut source = PacedAudioSource::new(buffer);
        let start = Instant::now();

        source.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..4 {
            source.recv().await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(90), "elapsed {elapsed:?}");
    }

    /// Clock running a fixed offset ahead of the runtime.
    struct OffsetClock(Duration);

    impl Clock for OffsetClock {
        fn now(&self) -> Instant {
            Instant::now() + self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_follows_injected_clock() {
        let buffer = Arc::new(AudioOutputBuffer::new(PlaybackOptions::default()));
        let clock = Arc::new(OffsetClock(Duration::from_secs(1)));
        let mut source = PacedAudioSource::with_clock(buffer, clock);
        let start = Instant::now();

        source.recv().await.unwrap();
        source.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(25), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_is_not_delayed() {
        let buffer = Arc::new(AudioOutputBuffer::new(PlaybackOptions::default()));
        let mut source = PacedAudioSource::new(buffer);
        source.recv().await.unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        let before = Instant::now();
        source.recv().await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_follow_sample_counter() {
        let buffer = Arc::new(AudioOutputBuffer::new(PlaybackOptions::default()));
        buffer.enqueue(&[1u8; 960]);
        let mut source = PacedAudioSource::new(buffer);

        let mut pts = Vec::new();
        for _ in 0..3 {
            let frame = source.recv().await.unwrap();
            assert_eq!(frame.sample_rate(), 24000);
            assert_eq!(frame.channels(), 1);
            assert_eq!(frame.samples(), 480);
            pts.push(frame.pts().unwrap());
        }
        assert_eq!(pts, vec![0, 480, 960]);
        assert_eq!(source.samples_emitted(), 1440);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_tail_is_padded_with_silence() {
        let options = PlaybackOptions {
            frame_samples: 2,
            ..two_byte_frames()
        };
        let buffer = Arc::new(AudioOutputBuffer::new(options));
        buffer.enqueue(&[1, 2, 3]);
        let mut source = PacedAudioSource::new(buffer.clone());

        let frame = source.recv().await.unwrap();
        assert_eq!(frame.data().as_ref(), &[1, 2, 3, 0]);
        assert!(buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_stream() {
        let buffer = Arc::new(AudioOutputBuffer::new(two_byte_frames()));
        buffer.enqueue(b"ABCD");
        let mut source = PacedAudioSource::new(buffer.clone());
        source.stop();

        assert!(source.recv().await.is_none());
        buffer.enqueue(b"EF");
        assert!(buffer.is_empty());
        assert!(source.recv().await.is_none());
    }

    #[test]
    fn test_flush_empties_buffer() {
        let buffer = AudioOutputBuffer::new(PlaybackOptions::default());
        buffer.enqueue(&[0u8; 100]);
        assert_eq!(buffer.flush(), 100);
        assert!(buffer.is_empty());
        assert_eq!(buffer.flush(), 0);
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        let buffer = AudioOutputBuffer::new(PlaybackOptions::default());
        let result = buffer.enqueue_base64("not base64!!");
        assert!(matches!(result, Err(BridgeError::Decode(_))));
        assert!(buffer.is_empty());
    }
}
