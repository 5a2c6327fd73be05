//! Conversion of inbound frames into the model's input format.
//!
//! [`AudioResampler`] owns a [`SampleConverter`] (the numerical transform) and the
//! FIFO its output lands in. The ingest tasks call [`AudioResampler::resample`];
//! the pump loop drains with [`AudioResampler::recv`] / [`AudioResampler::next_chunk`].

use bytes::Bytes;
use parking_lot::Mutex;

use super::{AudioFormat, AudioFrame, AudioFrameBuffer, i16_to_bytes};
use crate::errors::{BridgeError, BridgeResult};

/// Converts frames of arbitrary rate/layout into a fixed target format.
///
/// One input frame yields zero or more output frames; implementations may
/// hold samples back between calls.
pub trait SampleConverter: Send {
    /// Format every produced frame is in.
    fn target(&self) -> AudioFormat;

    fn convert(&mut self, frame: &AudioFrame) -> BridgeResult<Vec<AudioFrame>>;

    /// Drop any internal state carried between frames.
    fn reset(&mut self);
}

/// Linear-interpolation converter with downmixing.
///
/// Keeps exact running sample counters so the output duration tracks the
/// input duration across frame boundaries (to within one output sample).
/// A change of input format restarts the stream.
#[derive(Debug)]
pub struct LinearConverter {
    target: AudioFormat,
    source: Option<AudioFormat>,
    consumed: u64,
    produced: u64,
    history: Vec<f32>,
}

impl LinearConverter {
    pub fn new(target: AudioFormat) -> Self {
        Self {
            target,
            source: None,
            consumed: 0,
            produced: 0,
            history: Vec::new(),
        }
    }
}

impl SampleConverter for LinearConverter {
    fn target(&self) -> AudioFormat {
        self.target
    }

    fn convert(&mut self, frame: &AudioFrame) -> BridgeResult<Vec<AudioFrame>> {
        let samples = frame.to_i16()?;
        let source = frame.format();
        if self.source != Some(source) {
            self.reset();
            self.source = Some(source);
        }

        let channels = source.channels as usize;
        let mono: Vec<f32> = samples
            .chunks_exact(channels)
            .map(|block| block.iter().map(|s| *s as f32).sum::<f32>() / channels as f32)
            .collect();
        if mono.is_empty() {
            return Ok(Vec::new());
        }

        let in_rate = source.sample_rate as u128;
        let out_rate = self.target.sample_rate as u128;

        let base = self.consumed - self.history.len() as u64;
        let mut window = std::mem::take(&mut self.history);
        window.extend_from_slice(&mono);

        let total_in = self.consumed + mono.len() as u64;
        let total_out = (total_in as u128 * out_rate / in_rate) as u64;
        let first_out = self.produced;

        let last = window.len() - 1;
        let out_channels = self.target.channels as usize;
        let mut out = Vec::with_capacity((total_out - first_out) as usize * out_channels);
        for k in first_out..total_out {
            let position = k as u128 * in_rate;
            let index = (position / out_rate) as u64;
            let frac = (position % out_rate) as f32 / out_rate as f32;

            let i0 = (index.saturating_sub(base) as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let value = window[i0] + (window[i1] - window[i0]) * frac;
            let sample = value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            for _ in 0..out_channels {
                out.push(sample);
            }
        }

        self.consumed = total_in;
        self.produced = total_out;

        // Enough trailing input for the next frame's first interpolation points.
        let keep = (in_rate / out_rate) as usize + 2;
        let start = window.len().saturating_sub(keep);
        self.history = window.split_off(start);

        if out.is_empty() {
            return Ok(Vec::new());
        }
        let frame = AudioFrame::new(
            i16_to_bytes(&out),
            self.target.sample_rate,
            self.target.channels,
        )?
        .with_pts(Some(first_out));
        Ok(vec![frame])
    }

    fn reset(&mut self) {
        self.source = None;
        self.consumed = 0;
        self.produced = 0;
        self.history.clear();
    }
}

/// Resampler feeding a FIFO of converted PCM bytes.
pub struct AudioResampler {
    target: AudioFormat,
    converter: Mutex<Box<dyn SampleConverter>>,
    fifo: AudioFrameBuffer,
}

impl AudioResampler {
    /// Resampler using the built-in linear converter.
    pub fn new(target: AudioFormat) -> Self {
        Self::with_converter(Box::new(LinearConverter::new(target)))
    }

    pub fn with_converter(converter: Box<dyn SampleConverter>) -> Self {
        Self {
            target: converter.target(),
            converter: Mutex::new(converter),
            fifo: AudioFrameBuffer::new(),
        }
    }

    pub fn target(&self) -> AudioFormat {
        self.target
    }

    /// Convert a frame and enqueue the result.
    pub fn resample(&self, frame: &AudioFrame) -> BridgeResult<()> {
        let converted = self.converter.lock().convert(frame)?;
        for out in converted {
            if out.format() != self.target {
                return Err(BridgeError::Decode(format!(
                    "converter produced {:?}, expected {:?}",
                    out.format(),
                    self.target
                )));
            }
            self.fifo.push(out.into_data());
        }
        Ok(())
    }

    /// Next converted chunk, or `None` when nothing is buffered. Never blocks.
    pub fn recv(&self) -> Option<Bytes> {
        self.fifo.pop()
    }

    /// Wait for the next converted chunk.
    pub async fn next_chunk(&self) -> Bytes {
        self.fifo.recv().await
    }

    /// Discard buffered output and converter state.
    pub fn clear(&self) {
        self.fifo.clear();
        self.converter.lock().reset();
    }

    /// Bytes waiting to be drained.
    pub fn buffered_bytes(&self) -> usize {
        self.fifo.len()
    }
}
