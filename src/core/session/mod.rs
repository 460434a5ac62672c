//! Streaming session: connection lifecycle, outbound message sequencing,
//! and inbound dispatch to the aligner, ledger and player.

pub mod client;
pub mod messages;
pub mod transport;


pub use client::{PlaybackEventCallback, StreamingSession};
pub use messages::{AlignmentData, CloseSentinel, InboundMessage, StreamHandshake, TextChunk};
pub use transport::{
    Transport, TransportCommand, TransportConnection, TransportEvent, WebSocketTransport,
};

use crate::config::ConfigError;
use crate::core::audio::AudioError;

/// Session error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("session closed: {0}")]
    Closed(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("text must not be empty")]
    EmptyText,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("audio buffer error: {0}")]
    Audio(#[from] AudioError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Connection lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport connection.
    Disconnected,
    /// Transport connect in progress.
    Connecting,
    /// Transport open, waiting for the server's ready marker.
    Open,
    /// Ready: outbound chunks may be sent.
    Ready,
    /// Close requested, draining.
    Closing,
}
