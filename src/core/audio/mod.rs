//! Audio primitives shared by the ingest and playback paths.
//!
//! # Audio Format
//!
//! All audio crossing the bridge is interleaved signed 16-bit little-endian PCM.
//! Frames carry their own sample rate and channel layout so the resampler can
//! normalise whatever the media transport produces into the model's input format.

mod fifo;
mod output;
mod resampler;
#[cfg(feature = "hq-resampling")]
mod rubato_converter;
mod track;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};

pub use fifo::AudioFrameBuffer;
pub use output::{
    AudioOutputBuffer, Clock, DEFAULT_PTIME_MS, PacedAudioSource, PlaybackOptions, TokioClock,
};
pub use resampler::{AudioResampler, LinearConverter, SampleConverter};
#[cfg(feature = "hq-resampling")]
pub use rubato_converter::FftConverter;
pub use track::{AudioTrack, ChannelTrack, ReadyState, TrackKind};

/// Bytes per PCM16 sample.
pub const PCM16_SAMPLE_WIDTH: u16 = 2;

/// Target layout a resampler converts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
}

impl AudioFormat {
    /// Mono PCM16 at the given rate.
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Bytes occupied by one sample across all channels.
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * PCM16_SAMPLE_WIDTH as usize
    }
}

/// An immutable block of interleaved PCM16 audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
    sample_rate: u32,
    channels: u16,
    sample_width: u16,
    pts: Option<u64>,
}

impl AudioFrame {
    /// Create a PCM16 frame, validating that the payload holds whole samples.
    pub fn new(data: impl Into<Bytes>, sample_rate: u32, channels: u16) -> BridgeResult<Self> {
        Self::with_sample_width(data, sample_rate, channels, PCM16_SAMPLE_WIDTH)
    }

    /// Create a frame with an explicit sample width in bytes.
    pub fn with_sample_width(
        data: impl Into<Bytes>,
        sample_rate: u32,
        channels: u16,
        sample_width: u16,
    ) -> BridgeResult<Self> {
        let data = data.into();
        if sample_rate == 0 || channels == 0 || sample_width == 0 {
            return Err(BridgeError::Decode(format!(
                "invalid frame layout: rate={sample_rate} channels={channels} width={sample_width}"
            )));
        }
        let block = channels as usize * sample_width as usize;
        if data.len() % block != 0 {
            return Err(BridgeError::Decode(format!(
                "frame of {} bytes is not a multiple of {block}-byte sample blocks",
                data.len()
            )));
        }
        Ok(Self {
            data,
            sample_rate,
            channels,
            sample_width,
            pts: None,
        })
    }

    /// Frame from a payload the caller has already sized to whole sample blocks.
    pub(crate) fn from_raw(data: Bytes, sample_rate: u32, channels: u16, sample_width: u16) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            sample_width,
            pts: None,
        }
    }

    /// Build a frame of `samples` silent samples per channel.
    pub fn silence(samples: usize, sample_rate: u32, channels: u16) -> Self {
        let len = samples * channels as usize * PCM16_SAMPLE_WIDTH as usize;
        Self {
            data: Bytes::from(vec![0u8; len]),
            sample_rate,
            channels,
            sample_width: PCM16_SAMPLE_WIDTH,
            pts: None,
        }
    }

    /// Return a copy of this frame carrying the given presentation timestamp.
    pub fn with_pts(mut self, pts: Option<u64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_width(&self) -> u16 {
        self.sample_width
    }

    /// Presentation timestamp in samples (time base `1 / sample_rate`).
    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    /// Number of samples per channel.
    pub fn samples(&self) -> usize {
        self.data.len() / (self.channels as usize * self.sample_width as usize)
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples() as f64 / self.sample_rate as f64
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Decode the payload into signed 16-bit samples.
    pub fn to_i16(&self) -> BridgeResult<Vec<i16>> {
        if self.sample_width != PCM16_SAMPLE_WIDTH {
            return Err(BridgeError::Decode(format!(
                "unsupported sample width {} (expected s16)",
                self.sample_width
            )));
        }
        Ok(self
            .data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }
}

/// Encode samples as PCM16 little-endian bytes.
pub fn i16_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}
