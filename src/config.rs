//! Engine configuration: audio encoding, buffering, endpoint and voice
//! settings for the streaming synthesis connection.

use serde::{Deserialize, Serialize};
use url::Url;

/// PCM output encodings supported by the streaming endpoint.
///
/// The wire name (`pcm_24000` etc.) doubles as the `output_format` query
/// parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    #[serde(rename = "pcm_16000")]
    Pcm16000,
    #[serde(rename = "pcm_22050")]
    Pcm22050,
    #[serde(rename = "pcm_24000")]
    Pcm24000,
    #[serde(rename = "pcm_44100")]
    Pcm44100,
}

impl AudioEncoding {
    /// Wire identifier used in the connection URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Pcm16000 => "pcm_16000",
            AudioEncoding::Pcm22050 => "pcm_22050",
            AudioEncoding::Pcm24000 => "pcm_24000",
            AudioEncoding::Pcm44100 => "pcm_44100",
        }
    }

    /// Sample rate in Hz for this encoding.
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioEncoding::Pcm16000 => 16000,
            AudioEncoding::Pcm22050 => 22050,
            AudioEncoding::Pcm24000 => 24000,
            AudioEncoding::Pcm44100 => 44100,
        }
    }

    /// Pick the encoding matching a sample rate, defaulting to 24kHz for
    /// unsupported rates.
    pub fn from_sample_rate(sample_rate: u32) -> Self {
        match sample_rate {
            16000 => AudioEncoding::Pcm16000,
            22050 => AudioEncoding::Pcm22050,
            24000 => AudioEncoding::Pcm24000,
            44100 => AudioEncoding::Pcm44100,
            _ => AudioEncoding::Pcm24000,
        }
    }
}

impl Default for AudioEncoding {
    fn default() -> Self {
        AudioEncoding::Pcm24000
    }
}

/// Voice settings sent with the stream handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Voice stability (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<f32>,
    /// Similarity boost (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_boost: Option<f32>,
    /// Style strength (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<f32>,
    /// Use speaker boost
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_speaker_boost: Option<bool>,
    /// Speaking rate (0.25 to 4.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: Some(0.5),
            similarity_boost: Some(0.8),
            style: Some(0.0),
            use_speaker_boost: Some(false),
            speed: Some(1.0),
        }
    }
}

/// Configuration errors raised by [`EngineConfig::validate`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("API key is required")]
    MissingApiKey,
    #[error("voice id is required")]
    MissingVoiceId,
    #[error("ring buffer length must be at least one second")]
    InvalidBufferLength,
    #[error("channel count must be at least one")]
    InvalidChannelCount,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Configuration for the streaming engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// API key for the synthesis service
    pub api_key: String,
    /// Voice identifier for synthesis
    pub voice_id: String,
    /// Model identifier for synthesis
    pub model_id: String,
    /// Output audio encoding (determines the sample rate)
    pub encoding: AudioEncoding,
    /// Channel count of the decoded stream
    pub channels: u16,
    /// Ring buffer length in seconds
    pub buffer_secs: u32,
    /// Idle time after the last text chunk before the utterance is
    /// auto-closed, in milliseconds
    pub idle_close_timeout_ms: u64,
    /// Latency optimization level requested from the service
    pub optimize_streaming_latency: u32,
    /// Request character-level alignment data with each audio fragment
    pub sync_alignment: bool,
    /// Endpoint host
    pub host: String,
    /// Endpoint port
    pub port: u16,
    /// Endpoint scheme (wss/ws)
    pub scheme: String,
    /// Voice settings sent with the stream handshake
    pub voice_settings: VoiceSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            model_id: "eleven_flash_v2_5".to_string(),
            encoding: AudioEncoding::default(),
            channels: 1,
            buffer_secs: 10,
            idle_close_timeout_ms: 300,
            optimize_streaming_latency: 4,
            sync_alignment: true,
            host: "api.elevenlabs.io".to_string(),
            port: 443,
            scheme: "wss".to_string(),
            voice_settings: VoiceSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Sample rate of the configured encoding in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.encoding.sample_rate()
    }

    /// Ring buffer capacity in samples (rate x channels x seconds).
    pub fn capacity_samples(&self) -> usize {
        self.sample_rate() as usize * self.channels as usize * self.buffer_secs as usize
    }

    /// Validate the configuration before opening a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.voice_id.is_empty() {
            return Err(ConfigError::MissingVoiceId);
        }
        if self.buffer_secs == 0 {
            return Err(ConfigError::InvalidBufferLength);
        }
        if self.channels == 0 {
            return Err(ConfigError::InvalidChannelCount);
        }
        Ok(())
    }

    /// Build the streaming endpoint URL from the configuration.
    pub fn url(&self) -> Result<Url, ConfigError> {
        let base = format!(
            "{}://{}:{}/v1/text-to-speech/{}/stream-input",
            self.scheme, self.host, self.port, self.voice_id
        );
        let mut url = Url::parse(&base).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("model_id", &self.model_id)
            .append_pair(
                "optimize_streaming_latency",
                &self.optimize_streaming_latency.to_string(),
            )
            .append_pair("output_format", self.encoding.as_str());
        if self.sync_alignment {
            url.query_pairs_mut().append_pair("sync_alignment", "true");
        }
        Ok(url)
    }
}
