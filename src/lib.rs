pub mod config;
pub mod core;

// Re-export commonly used items for convenience
pub use crate::config::{AudioEncoding, ConfigError, EngineConfig, VoiceSettings};
pub use crate::core::audio::{AudioError, PlaybackEvent, SampleRingBuffer, StreamingPlayer};
pub use crate::core::ledger::{AudioRequest, CompletionHandle, RequestLedger, RequestListeners};
pub use crate::core::session::{
    SessionError, SessionResult, SessionState, StreamingSession, Transport, WebSocketTransport,
};
