//! Realtime endpoint and session configuration types.
//!
//! This module contains:
//! - Model selection
//! - Voice selection
//! - Audio encodings accepted by the endpoint
//! - [`ModelSessionConfig`], the body of the `session.update` event
//! - [`RealtimeSettings`], how to reach and authenticate with the endpoint

use std::fmt;
use std::time::Duration;

use http::HeaderValue;
use serde::{Deserialize, Serialize, Serializer};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use url::Url;

use super::messages::{MaxTokens, TurnDetection};
use crate::errors::{BridgeError, BridgeResult};

/// Realtime API WebSocket endpoint.
pub const REALTIME_BASE_URL: &str = "wss://api.openai.com/v1/realtime";

/// Sample rate of PCM16 audio on the wire.
pub const REALTIME_PCM16_SAMPLE_RATE: u32 = 24000;

/// Value of the `OpenAI-Beta` header required by the realtime endpoint.
pub const REALTIME_BETA_HEADER: &str = "realtime=v1";

// =============================================================================
// Models
// =============================================================================

/// Known realtime models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RealtimeModel {
    #[default]
    #[serde(rename = "gpt-4o-realtime-preview")]
    Gpt4oRealtimePreview,
    #[serde(rename = "gpt-4o-realtime-preview-2024-10-01")]
    Gpt4oRealtimePreview20241001,
    #[serde(rename = "gpt-4o-realtime-preview-2024-12-17")]
    Gpt4oRealtimePreview20241217,
    #[serde(rename = "gpt-4o-mini-realtime-preview")]
    Gpt4oMiniRealtimePreview,
}

impl RealtimeModel {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpt4oRealtimePreview => "gpt-4o-realtime-preview",
            Self::Gpt4oRealtimePreview20241001 => "gpt-4o-realtime-preview-2024-10-01",
            Self::Gpt4oRealtimePreview20241217 => "gpt-4o-realtime-preview-2024-12-17",
            Self::Gpt4oMiniRealtimePreview => "gpt-4o-mini-realtime-preview",
        }
    }

    /// Look up a model by its API name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "gpt-4o-realtime-preview" => Some(Self::Gpt4oRealtimePreview),
            "gpt-4o-realtime-preview-2024-10-01" => Some(Self::Gpt4oRealtimePreview20241001),
            "gpt-4o-realtime-preview-2024-12-17" => Some(Self::Gpt4oRealtimePreview20241217),
            "gpt-4o-mini-realtime-preview" => Some(Self::Gpt4oMiniRealtimePreview),
            _ => None,
        }
    }
}

impl fmt::Display for RealtimeModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Voices
// =============================================================================

/// Voices the model can speak with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Ash => "ash",
            Self::Ballad => "ballad",
            Self::Coral => "coral",
            Self::Echo => "echo",
            Self::Sage => "sage",
            Self::Shimmer => "shimmer",
            Self::Verse => "verse",
        }
    }

    /// Parse a voice name, falling back to the default.
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ash" => Self::Ash,
            "ballad" => Self::Ballad,
            "coral" => Self::Coral,
            "echo" => Self::Echo,
            "sage" => Self::Sage,
            "shimmer" => Self::Shimmer,
            "verse" => Self::Verse,
            _ => Self::Alloy,
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Audio Encodings
// =============================================================================

/// Audio encodings accepted by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// PCM 16-bit signed little-endian, 24 kHz mono
    #[default]
    Pcm16,
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    #[serde(rename = "g711_alaw")]
    G711Alaw,
}

impl AudioEncoding {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "pcm16",
            Self::G711Ulaw => "g711_ulaw",
            Self::G711Alaw => "g711_alaw",
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Pcm16 => REALTIME_PCM16_SAMPLE_RATE,
            Self::G711Ulaw | Self::G711Alaw => 8000,
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "g711_ulaw" | "ulaw" | "mulaw" => Self::G711Ulaw,
            "g711_alaw" | "alaw" => Self::G711Alaw,
            _ => Self::Pcm16,
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Modalities and Tool Choice
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// How the model may use tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Model behaviour for one connection, sent as the `session` object of
/// `session.update` immediately after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSessionConfig {
    /// System prompt
    pub instructions: String,
    pub modalities: Vec<Modality>,
    pub voice: Voice,
    pub input_audio_format: AudioEncoding,
    pub output_audio_format: AudioEncoding,
    pub temperature: f32,
    /// `None` disables server-side turn detection
    pub turn_detection: Option<TurnDetection>,
    pub tool_choice: ToolChoice,
    pub max_response_output_tokens: MaxTokens,
}

impl Default for ModelSessionConfig {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            modalities: vec![Modality::Text, Modality::Audio],
            voice: Voice::default(),
            input_audio_format: AudioEncoding::Pcm16,
            output_audio_format: AudioEncoding::Pcm16,
            temperature: 0.8,
            turn_detection: Some(TurnDetection::default()),
            tool_choice: ToolChoice::Auto,
            max_response_output_tokens: MaxTokens::Infinite,
        }
    }
}

// =============================================================================
// Endpoint Settings
// =============================================================================

fn redact<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str("<redacted>")
    }
}

/// Where the realtime endpoint lives and how to authenticate with it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    #[serde(serialize_with = "redact")]
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl fmt::Debug for RealtimeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSettings")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: RealtimeModel::default().as_str().to_string(),
            base_url: REALTIME_BASE_URL.to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl RealtimeSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `{base_url}?model={model}`, validated as a `ws`/`wss` URL.
    pub fn endpoint_url(&self) -> BridgeResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| BridgeError::Configuration(format!("invalid base_url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(BridgeError::Configuration(format!(
                "base_url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }

    /// WebSocket handshake request with authentication headers.
    pub fn client_request(&self) -> BridgeResult<Request> {
        let url = self.endpoint_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::Connection(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| BridgeError::Configuration(format!("invalid api key: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static(REALTIME_BETA_HEADER));
        Ok(request)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names() {
        assert_eq!(
            RealtimeModel::default().as_str(),
            "gpt-4o-realtime-preview"
        );
        assert_eq!(
            RealtimeModel::from_name("GPT-4o-mini-realtime-preview"),
            Some(RealtimeModel::Gpt4oMiniRealtimePreview)
        );
        assert_eq!(RealtimeModel::from_name("gpt-5"), None);
    }

    #[test]
    fn test_voice_from_str() {
        assert_eq!(Voice::from_str_or_default("SHIMMER"), Voice::Shimmer);
        assert_eq!(Voice::from_str_or_default(" verse "), Voice::Verse);
        assert_eq!(Voice::from_str_or_default("unknown"), Voice::Alloy);
    }

    #[test]
    fn test_encoding_sample_rates() {
        assert_eq!(AudioEncoding::Pcm16.sample_rate(), 24000);
        assert_eq!(AudioEncoding::G711Ulaw.sample_rate(), 8000);
        assert_eq!(AudioEncoding::from_str_or_default("alaw"), AudioEncoding::G711Alaw);
        assert_eq!(AudioEncoding::from_str_or_default("opus"), AudioEncoding::Pcm16);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = ModelSessionConfig::default();
        assert_eq!(config.instructions, "");
        assert_eq!(config.modalities, vec![Modality::Text, Modality::Audio]);
        assert_eq!(config.voice, Voice::Alloy);
        assert_eq!(config.tool_choice, ToolChoice::Auto);
        assert_eq!(config.max_response_output_tokens, MaxTokens::Infinite);
        assert!(matches!(
            config.turn_detection,
            Some(TurnDetection::ServerVad { .. })
        ));
    }

    #[test]
    fn test_session_config_partial_yaml() {
        let config: ModelSessionConfig =
            serde_yaml::from_str("voice: echo\ntemperature: 1.0\nturn_detection: null\n").unwrap();
        assert_eq!(config.voice, Voice::Echo);
        assert_eq!(config.temperature, 1.0);
        assert_eq!(config.turn_detection, None);
        assert_eq!(config.input_audio_format, AudioEncoding::Pcm16);
    }

    #[test]
    fn test_endpoint_url_appends_model() {
        let settings = RealtimeSettings::new("sk-test");
        assert_eq!(
            settings.endpoint_url().unwrap().as_str(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
    }

    #[test]
    fn test_endpoint_url_rejects_http() {
        let settings = RealtimeSettings {
            base_url: "https://api.openai.com/v1/realtime".to_string(),
            ..RealtimeSettings::new("sk-test")
        };
        assert!(matches!(
            settings.endpoint_url(),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_client_request_headers() {
        let request = RealtimeSettings::new("sk-test").client_request().unwrap();
        assert_eq!(request.headers()["Authorization"], "Bearer sk-test");
        assert_eq!(request.headers()["OpenAI-Beta"], "realtime=v1");
    }

    #[test]
    fn test_api_key_is_redacted() {
        let settings = RealtimeSettings::new("sk-secret");
        assert!(!format!("{settings:?}").contains("sk-secret"));
        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(!yaml.contains("sk-secret"));
        assert!(yaml.contains("<redacted>"));
    }
}
