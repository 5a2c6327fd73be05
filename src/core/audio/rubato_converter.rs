//! FFT-based converter backed by `rubato`.
//!
//! The resampler is built lazily from the first frame's format. Input is mixed
//! down to mono and accumulated until a full input chunk is available; the
//! remainder waits for the next frame.

use rubato::{FftFixedIn, Resampler};
use tracing::debug;

use super::{AudioFormat, AudioFrame, SampleConverter, i16_to_bytes};
use crate::errors::{BridgeError, BridgeResult};

/// Input chunk size in frames handed to the FFT resampler.
const FFT_CHUNK_FRAMES: usize = 480;
const FFT_SUB_CHUNKS: usize = 2;

struct FftState {
    resampler: FftFixedIn<f32>,
    source: AudioFormat,
}

/// High quality converter for the `hq-resampling` feature.
pub struct FftConverter {
    target: AudioFormat,
    state: Option<FftState>,
    pending: Vec<f32>,
    produced: u64,
}

impl FftConverter {
    pub fn new(target: AudioFormat) -> Self {
        Self {
            target,
            state: None,
            pending: Vec::new(),
            produced: 0,
        }
    }

    fn ensure_state(&mut self, source: AudioFormat) -> BridgeResult<()> {
        if self.state.as_ref().is_some_and(|s| s.source == source) {
            return Ok(());
        }
        debug!(
            from = source.sample_rate,
            to = self.target.sample_rate,
            "initialising FFT resampler"
        );
        let resampler = FftFixedIn::<f32>::new(
            source.sample_rate as usize,
            self.target.sample_rate as usize,
            FFT_CHUNK_FRAMES,
            FFT_SUB_CHUNKS,
            1,
        )
        .map_err(|e| BridgeError::Decode(format!("resampler construction failed: {e}")))?;
        self.pending.clear();
        self.produced = 0;
        self.state = Some(FftState { resampler, source });
        Ok(())
    }
}

impl SampleConverter for FftConverter {
    fn target(&self) -> AudioFormat {
        self.target
    }

    fn convert(&mut self, frame: &AudioFrame) -> BridgeResult<Vec<AudioFrame>> {
        let samples = frame.to_i16()?;
        self.ensure_state(frame.format())?;

        let channels = frame.channels() as usize;
        self.pending.extend(samples.chunks_exact(channels).map(|block| {
            block.iter().map(|s| *s as f32 / 32768.0).sum::<f32>() / channels as f32
        }));

        let Some(state) = self.state.as_mut() else {
            return Ok(Vec::new());
        };

        let mut out: Vec<i16> = Vec::new();
        loop {
            let needed = state.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let processed = state
                .resampler
                .process(&[chunk], None)
                .map_err(|e| BridgeError::Decode(format!("resampling failed: {e}")))?;
            if let Some(mono) = processed.first() {
                for value in mono {
                    let sample = (value * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
                    for _ in 0..self.target.channels {
                        out.push(sample);
                    }
                }
            }
        }

        if out.is_empty() {
            return Ok(Vec::new());
        }
        let first = self.produced;
        self.produced += (out.len() / self.target.channels as usize) as u64;
        let frame = AudioFrame::new(
            i16_to_bytes(&out),
            self.target.sample_rate,
            self.target.channels,
        )?
        .with_pts(Some(first));
        Ok(vec![frame])
    }

    fn reset(&mut self) {
        self.state = None;
        self.pending.clear();
        self.produced = 0;
    }
}
