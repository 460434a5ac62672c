//! Playback event variants fired as buffered audio is consumed.
//!
//! Events carry only data; invocation of user callbacks is centralized in
//! the session event loop, which drains the hand-off channel. This keeps
//! firing order and at-most-once guarantees auditable in one place.

use tokio::sync::mpsc;
use uuid::Uuid;

/// An event correlated to a position in the audio stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A matched word has started playing.
    WordStart { word: String },
    /// A matched word has finished playing.
    WordFinish { word: String },
    /// The first word of a submitted text chunk has started playing.
    ChunkStart { request_id: Uuid, text: String },
    /// The last word of a submitted text chunk has finished playing.
    ChunkComplete { request_id: Uuid, text: String },
    /// A character of the request text is now audible.
    CharacterPlayed { request_id: Uuid, index: usize },
    /// The first audio of a request has started playing.
    PlaybackStarted { request_id: Uuid },
    /// The audio of a request has been fully consumed. Scheduled at the end
    /// of every inbound segment; the session ignores firings for requests
    /// that still have characters outstanding.
    RequestComplete { request_id: Uuid },
}

/// Hand-off channel sender used by the audio thread.
///
/// `UnboundedSender::send` never blocks, so it is safe to call from the
/// real-time audio callback while the timeline lock is held.
pub type EventSink = mpsc::UnboundedSender<PlaybackEvent>;

/// Control-thread side of the hand-off channel.
pub type EventSource = mpsc::UnboundedReceiver<PlaybackEvent>;

/// Create the audio-to-control hand-off channel.
pub fn event_channel() -> (EventSink, EventSource) {
    mpsc::unbounded_channel()
}
