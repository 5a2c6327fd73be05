//! Audio Test Fixtures
//!
//! Generated audio keeps the tests reproducible without external files.
//! Everything is 16-bit signed little-endian PCM.

use std::f32::consts::PI;

use realtime_bridge::core::audio::{AudioFrame, i16_to_bytes};

/// Wire sample rate of the model (24kHz)
pub const MODEL_SAMPLE_RATE: u32 = 24000;

/// Typical WebRTC capture rate (48kHz)
pub const CAPTURE_SAMPLE_RATE: u32 = 48000;

/// Samples in 20ms at the given rate
pub fn samples_per_20ms(sample_rate: u32) -> usize {
    (sample_rate / 50) as usize
}

/// Generate silence (zeros)
pub fn generate_silence(duration_samples: usize) -> Vec<i16> {
    vec![0i16; duration_samples]
}

/// Generate a sine wave tone
pub fn generate_sine_wave(
    duration_samples: usize,
    sample_rate: u32,
    frequency: f32,
    amplitude: f32,
) -> Vec<i16> {
    let max_amplitude = amplitude * i16::MAX as f32;
    let angular_freq = 2.0 * PI * frequency / sample_rate as f32;

    (0..duration_samples)
        .map(|i| ((angular_freq * i as f32).sin() * max_amplitude) as i16)
        .collect()
}

/// Mono frame holding `samples`
pub fn mono_frame(samples: &[i16], sample_rate: u32) -> AudioFrame {
    AudioFrame::new(i16_to_bytes(samples), sample_rate, 1).expect("valid mono frame")
}

/// Mono frame of `count` samples all equal to `value`
pub fn constant_frame(value: i16, count: usize, sample_rate: u32) -> AudioFrame {
    mono_frame(&vec![value; count], sample_rate)
}

/// Split a tone into consecutive 20ms frames
pub fn tone_frames(duration_ms: usize, sample_rate: u32, frequency: f32) -> Vec<AudioFrame> {
    let total = sample_rate as usize * duration_ms / 1000;
    generate_sine_wave(total, sample_rate, frequency, 0.5)
        .chunks(samples_per_20ms(sample_rate))
        .map(|chunk| mono_frame(chunk, sample_rate))
        .collect()
}

/// Convert i16 samples to bytes (little-endian)
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Convert bytes to i16 samples (little-endian)
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}
