use serde::Deserialize;
use std::path::Path;

use crate::core::audio::PlaybackOptions;
use crate::core::realtime::{
    AudioEncoding, MaxTokens, Modality, ToolChoice, TurnDetection, Voice,
};

use super::BargeInPolicy;

/// Complete YAML configuration structure
///
/// Every field is optional so a file only needs to name what it overrides.
/// Values present here take precedence over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   api_key: "sk-..."
///   model: "gpt-4o-realtime-preview"
///   base_url: "wss://api.openai.com/v1/realtime"
///   connect_timeout_ms: 10000
///
/// session:
///   instructions: "You are a helpful assistant."
///   voice: "shimmer"
///   temperature: 0.8
///   turn_detection:
///     type: server_vad
///     threshold: 0.5
///     prefix_padding_ms: 300
///     silence_duration_ms: 500
///
/// playback:
///   frame_samples: 480
///
/// barge_in:
///   cancel_response: true
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub session: Option<SessionYaml>,
    pub playback: Option<PlaybackOptions>,
    pub barge_in: Option<BargeInPolicy>,
}

/// Realtime endpoint settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub connect_timeout_ms: Option<u64>,
}

/// Model session settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub instructions: Option<String>,
    pub modalities: Option<Vec<Modality>>,
    pub voice: Option<Voice>,
    pub input_audio_format: Option<AudioEncoding>,
    pub output_audio_format: Option<AudioEncoding>,
    pub temperature: Option<f32>,
    pub turn_detection: Option<TurnDetection>,
    /// `false` disables server-side turn detection entirely
    pub turn_detection_enabled: Option<bool>,
    pub tool_choice: Option<ToolChoice>,
    pub max_response_output_tokens: Option<MaxTokens>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        Self::from_str(&contents)
    }

    /// Parse YAML configuration from a string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, String> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| format!("Failed to parse YAML config: {e}"))
    }
}
