//! Bridge configuration.
//!
//! Configuration is assembled from three layers, highest priority first:
//!
//! 1. A YAML file passed to [`BridgeConfig::from_file`]
//! 2. Environment variables (see [`BridgeConfig::from_env`])
//! 3. Built-in defaults
//!
//! # Environment variables
//!
//! | Variable                | Field                      |
//! |-------------------------|----------------------------|
//! | `OPENAI_API_KEY`        | `realtime.api_key`         |
//! | `REALTIME_MODEL`        | `realtime.model`           |
//! | `REALTIME_BASE_URL`     | `realtime.base_url`        |
//! | `REALTIME_INSTRUCTIONS` | `session.instructions`     |
//! | `REALTIME_VOICE`        | `session.voice`            |

mod yaml;

pub use yaml::{RealtimeYaml, SessionYaml, YamlConfig};

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::audio::{PCM16_SAMPLE_WIDTH, PlaybackOptions};
use crate::core::realtime::{
    AudioEncoding, ModelSessionConfig, RealtimeModel, RealtimeSettings, Voice,
};
use crate::errors::{BridgeError, BridgeResult};

/// Accepted range for the model sampling temperature.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.6..=1.2;

/// What to do with an in-flight response when the user starts speaking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInPolicy {
    /// Send `response.cancel` when speech starts while the model is speaking.
    /// Playback is flushed either way.
    pub cancel_response: bool,
}

/// Everything needed to run one bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub realtime: RealtimeSettings,
    pub session: ModelSessionConfig,
    pub playback: PlaybackOptions,
    pub barge_in: BargeInPolicy,
}

impl BridgeConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            config.realtime.api_key = key;
        }
        if let Ok(model) = env::var("REALTIME_MODEL") {
            config.realtime.model = model;
        }
        if let Ok(base_url) = env::var("REALTIME_BASE_URL") {
            config.realtime.base_url = base_url;
        }
        if let Ok(instructions) = env::var("REALTIME_INSTRUCTIONS") {
            config.session.instructions = instructions;
        }
        if let Ok(voice) = env::var("REALTIME_VOICE") {
            config.session.voice = Voice::from_str_or_default(&voice);
        }

        config
    }

    /// Load from a YAML file layered over the environment, then validate.
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let yaml = YamlConfig::from_file(path).map_err(BridgeError::Configuration)?;
        let mut config = Self::from_env();
        config.merge_yaml(yaml);
        config.validate()?;
        Ok(config)
    }

    /// Apply every value present in `yaml` on top of `self`.
    pub fn merge_yaml(&mut self, yaml: YamlConfig) {
        if let Some(realtime) = yaml.realtime {
            let settings = &mut self.realtime;
            if let Some(api_key) = realtime.api_key {
                settings.api_key = api_key;
            }
            if let Some(model) = realtime.model {
                settings.model = model;
            }
            if let Some(base_url) = realtime.base_url {
                settings.base_url = base_url;
            }
            if let Some(timeout) = realtime.connect_timeout_ms {
                settings.connect_timeout_ms = timeout;
            }
        }

        if let Some(session) = yaml.session {
            let target = &mut self.session;
            if let Some(instructions) = session.instructions {
                target.instructions = instructions;
            }
            if let Some(modalities) = session.modalities {
                target.modalities = modalities;
            }
            if let Some(voice) = session.voice {
                target.voice = voice;
            }
            if let Some(format) = session.input_audio_format {
                target.input_audio_format = format;
            }
            if let Some(format) = session.output_audio_format {
                target.output_audio_format = format;
            }
            if let Some(temperature) = session.temperature {
                target.temperature = temperature;
            }
            if let Some(turn_detection) = session.turn_detection {
                target.turn_detection = Some(turn_detection);
            }
            if session.turn_detection_enabled == Some(false) {
                target.turn_detection = None;
            }
            if let Some(tool_choice) = session.tool_choice {
                target.tool_choice = tool_choice;
            }
            if let Some(max_tokens) = session.max_response_output_tokens {
                target.max_response_output_tokens = max_tokens;
            }
        }

        if let Some(playback) = yaml.playback {
            self.playback = playback;
        }
        if let Some(barge_in) = yaml.barge_in {
            self.barge_in = barge_in;
        }
    }

    /// Check that the configuration can drive a session.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.realtime.api_key.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "realtime.api_key is required (set OPENAI_API_KEY)".to_string(),
            ));
        }
        self.realtime.endpoint_url()?;
        if self.realtime.connect_timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "realtime.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if RealtimeModel::from_name(&self.realtime.model).is_none() {
            warn!(model = %self.realtime.model, "unrecognized realtime model");
        }

        let session = &self.session;
        if !TEMPERATURE_RANGE.contains(&session.temperature) {
            return Err(BridgeError::Configuration(format!(
                "session.temperature must be within {}..={}, got {}",
                TEMPERATURE_RANGE.start(),
                TEMPERATURE_RANGE.end(),
                session.temperature
            )));
        }
        for (name, format) in [
            ("input_audio_format", session.input_audio_format),
            ("output_audio_format", session.output_audio_format),
        ] {
            if format != AudioEncoding::Pcm16 {
                return Err(BridgeError::Configuration(format!(
                    "session.{name} {format} is not supported, audio is bridged as pcm16"
                )));
            }
        }

        let playback = &self.playback;
        if playback.sample_rate == 0 || playback.frame_samples == 0 {
            return Err(BridgeError::Configuration(
                "playback.sample_rate and playback.frame_samples must be greater than zero"
                    .to_string(),
            ));
        }
        let output_rate = session.output_audio_format.sample_rate();
        if playback.sample_rate != output_rate
            || playback.channels != 1
            || playback.sample_width != PCM16_SAMPLE_WIDTH
        {
            return Err(BridgeError::Configuration(format!(
                "playback must be {output_rate} Hz mono 16-bit to match model output, got {} Hz, {} channel(s), {}-byte samples",
                playback.sample_rate, playback.channels, playback.sample_width
            )));
        }

        Ok(())
    }

    /// Effective configuration as YAML with the api key redacted.
    pub fn to_yaml(&self) -> BridgeResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| BridgeError::Configuration(format!("Failed to render config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::{MaxTokens, TurnDetection};
    use serial_test::serial;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 5] = [
        "OPENAI_API_KEY",
        "REALTIME_MODEL",
        "REALTIME_BASE_URL",
        "REALTIME_INSTRUCTIONS",
        "REALTIME_VOICE",
    ];

    fn cleanup_env_vars() {
        unsafe {
            for var in ENV_VARS {
                env::remove_var(var);
            }
        }
    }

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("bridge.yaml");
        fs::write(&path, contents).unwrap();
        path
    }

    fn valid_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.realtime.api_key = "sk-test".to_string();
        config
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = BridgeConfig::from_env();
        assert_eq!(config.realtime.api_key, "");
        assert_eq!(config.realtime.model, "gpt-4o-realtime-preview");
        assert_eq!(config.realtime.base_url, "wss://api.openai.com/v1/realtime");
        assert_eq!(config.session.voice, Voice::Alloy);
        assert!(!config.barge_in.cancel_response);
        assert_eq!(config.playback, PlaybackOptions::default());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_variables() {
        cleanup_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("REALTIME_MODEL", "gpt-4o-mini-realtime-preview");
            env::set_var("REALTIME_BASE_URL", "ws://localhost:9000/v1/realtime");
            env::set_var("REALTIME_INSTRUCTIONS", "Be brief.");
            env::set_var("REALTIME_VOICE", "coral");
        }

        let config = BridgeConfig::from_env();
        assert_eq!(config.realtime.api_key, "sk-env");
        assert_eq!(config.realtime.model, "gpt-4o-mini-realtime-preview");
        assert_eq!(config.realtime.base_url, "ws://localhost:9000/v1/realtime");
        assert_eq!(config.session.instructions, "Be brief.");
        assert_eq!(config.session.voice, Voice::Coral);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "sk-env");
            env::set_var("REALTIME_VOICE", "echo");
        }

        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
realtime:
  model: "gpt-4o-realtime-preview-2024-12-17"
session:
  voice: "verse"
  temperature: 1.0
barge_in:
  cancel_response: true
"#,
        );

        let config = BridgeConfig::from_file(&path).unwrap();
        // Env value survives where YAML is silent
        assert_eq!(config.realtime.api_key, "sk-env");
        assert_eq!(config.realtime.model, "gpt-4o-realtime-preview-2024-12-17");
        assert_eq!(config.session.voice, Voice::Verse);
        assert_eq!(config.session.temperature, 1.0);
        assert!(config.barge_in.cancel_response);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_disables_turn_detection() {
        cleanup_env_vars();

        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
realtime:
  api_key: "sk-yaml"
session:
  turn_detection_enabled: false
  max_response_output_tokens: 256
"#,
        );

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.session.turn_detection, None);
        assert_eq!(
            config.session.max_response_output_tokens,
            MaxTokens::Limited(256)
        );
    }

    #[test]
    #[serial]
    fn test_from_file_custom_turn_detection() {
        cleanup_env_vars();

        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
realtime:
  api_key: "sk-yaml"
session:
  turn_detection:
    type: server_vad
    silence_duration_ms: 800
"#,
        );

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(
            config.session.turn_detection,
            Some(TurnDetection::ServerVad {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 800,
            })
        );
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = BridgeConfig::from_file(Path::new("/nonexistent/bridge.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_requires_api_key() {
        cleanup_env_vars();

        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "session:\n  voice: ash\n");

        let result = BridgeConfig::from_file(&path);
        assert!(matches!(result, Err(BridgeError::Configuration(msg)) if msg.contains("api_key")));
    }

    #[test]
    fn test_validate_accepts_defaults_with_key() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_http_base_url() {
        let mut config = valid_config();
        config.realtime.base_url = "https://api.openai.com/v1/realtime".to_string();
        assert!(matches!(
            config.validate(),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_temperature_range() {
        let mut config = valid_config();
        config.session.temperature = 0.6;
        assert!(config.validate().is_ok());
        config.session.temperature = 1.2;
        assert!(config.validate().is_ok());
        config.session.temperature = 1.5;
        assert!(config.validate().is_err());
        config.session.temperature = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_g711() {
        let mut config = valid_config();
        config.session.input_audio_format = AudioEncoding::G711Ulaw;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("input_audio_format"));
    }

    #[test]
    fn test_validate_playback() {
        let mut config = valid_config();
        config.playback.frame_samples = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.playback.sample_rate = 48000;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.playback = config.playback.with_ptime(40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_model_is_allowed() {
        let mut config = valid_config();
        config.realtime.model = "gpt-realtime-next".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_yaml_redacts_key() {
        let yaml = valid_config().to_yaml().unwrap();
        assert!(!yaml.contains("sk-test"));
        assert!(yaml.contains("<redacted>"));
        assert!(yaml.contains("gpt-4o-realtime-preview"));
    }
}
