//! Wire message types for the streaming synthesis connection.
//!
//! Field names are bit-exact with the service schema:
//!
//! - **Outgoing**: [`StreamHandshake`] opens an utterance, [`TextChunk`]
//!   carries text, [`CloseSentinel`] ends the utterance.
//! - **Incoming**: [`InboundMessage`] interleaves base64 audio fragments
//!   with character-level alignment metadata; a non-empty `error` field
//!   routes the message to the error path instead of audio processing.

use serde::{Deserialize, Serialize};

use crate::config::VoiceSettings;

// =============================================================================
// Outgoing Messages (Client to Server)
// =============================================================================

/// Handshake sent as the first message of every utterance.
#[derive(Debug, Serialize)]
pub struct StreamHandshake {
    /// Always a single space: primes the stream without synthesizing.
    pub text: &'static str,
    pub voice_settings: VoiceSettings,
    pub xi_api_key: String,
}

impl StreamHandshake {
    pub fn new(api_key: &str, voice_settings: VoiceSettings) -> Self {
        Self {
            text: " ",
            voice_settings,
            xi_api_key: api_key.to_string(),
        }
    }
}

/// One submitted text chunk.
#[derive(Debug, Serialize)]
pub struct TextChunk {
    pub text: String,
}

impl TextChunk {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

/// Close sentinel: an empty text field tells the server no more text is
/// coming for this utterance.
#[derive(Debug, Serialize)]
pub struct CloseSentinel {
    pub text: &'static str,
}

impl Default for CloseSentinel {
    fn default() -> Self {
        Self { text: "" }
    }
}

// =============================================================================
// Incoming Messages (Server to Client)
// =============================================================================

/// Character-level timing metadata correlating synthesized audio to source
/// text.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AlignmentData {
    /// Characters of the synthesized text, one string per character.
    #[serde(default)]
    pub chars: Vec<String>,
    /// Start time of each character in milliseconds, relative to the start
    /// of this fragment's audio.
    #[serde(default, rename = "charStartTimesMs")]
    pub char_start_times_ms: Vec<i64>,
    /// Duration of each character in milliseconds.
    #[serde(default, rename = "charDurationsMs")]
    pub char_durations_ms: Vec<i64>,
}

impl AlignmentData {
    /// True when the three arrays agree in length.
    pub fn is_well_formed(&self) -> bool {
        self.chars.len() == self.char_start_times_ms.len()
            && self.chars.len() == self.char_durations_ms.len()
    }
}

/// One inbound message from the synthesis stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    /// Base64-encoded PCM16LE audio fragment.
    #[serde(default)]
    pub audio: Option<String>,
    /// Set on the last message of an utterance.
    #[serde(default, rename = "isFinal")]
    pub is_final: Option<bool>,
    /// Alignment normalized to the synthesized text.
    #[serde(default, rename = "normalizedAlignment")]
    pub normalized_alignment: Option<AlignmentData>,
    /// Alignment against the raw submitted text.
    #[serde(default)]
    pub alignment: Option<AlignmentData>,
    /// Informational message from the server.
    #[serde(default)]
    pub message: Option<String>,
    /// Readiness marker sent once the server will accept text.
    #[serde(default)]
    pub ready: Option<bool>,
    /// Non-empty on server-side failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl InboundMessage {
    /// Parse a text frame into a message.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether this message marks the stream ready for text.
    pub fn is_ready(&self) -> bool {
        self.ready.is_some() || self.message.as_deref() == Some("ready")
    }

    /// The server error carried by this message, if any.
    pub fn error_text(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    /// The alignment block to reconcile, preferring the normalized form.
    pub fn alignment(&self) -> Option<&AlignmentData> {
        self.normalized_alignment
            .as_ref()
            .or(self.alignment.as_ref())
    }
}
