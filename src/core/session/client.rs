//! Streaming session: one long-lived connection to the synthesis service,
//! driven by a single event-loop task.
//!
//! The loop owns the aligner, the request ledger and the transport
//! connection, so all of their state is single-threaded from its
//! perspective. It multiplexes four sources:
//!
//! - commands from the session handle (speak, stop, close),
//! - inbound transport events (messages, errors, close),
//! - playback events fired by the audio callback via the hand-off channel,
//! - the idle timer that auto-closes an utterance left open.
//!
//! Outbound chunks sent before the server's ready marker are queued and
//! flushed on entering the ready state; sending while disconnected lazily
//! reconnects first.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::aligner::{AlignmentContext, ChunkAligner};
use crate::core::audio::{event_channel, EventSource, PlaybackEvent, StreamingPlayer};
use crate::core::ledger::{AudioRequest, CompletionHandle, RequestLedger, RequestListeners};

use super::messages::{CloseSentinel, InboundMessage, StreamHandshake, TextChunk};
use super::transport::{Transport, TransportCommand, TransportConnection, TransportEvent};
use super::{SessionError, SessionResult, SessionState};

/// Callback type for session-level playback event notifications.
pub type PlaybackEventCallback =
    Arc<dyn Fn(PlaybackEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum SessionCommand {
    Speak {
        text: String,
        request: AudioRequest,
        interrupt: bool,
    },
    BeginUtterance,
    EndUtterance,
    Stop,
    SetEventListener(PlaybackEventCallback),
    Close,
}

/// Handle to a streaming synthesis session.
///
/// Dropping the handle shuts the session down; pending requests fail with
/// a closed error.
pub struct StreamingSession {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    player: Arc<StreamingPlayer>,
    driver: JoinHandle<()>,
}

impl StreamingSession {
    /// Create a session over the given transport. Must be called from
    /// within a tokio runtime; the connection is opened lazily on the
    /// first send.
    pub fn new<T: Transport>(config: EngineConfig, transport: T) -> SessionResult<Self> {
        config.validate()?;
        let (event_tx, events_rx) = event_channel();
        let player = Arc::new(StreamingPlayer::new(&config, event_tx.clone()));
        let aligner = ChunkAligner::new(config.sample_rate(), config.channels, event_tx);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = SessionDriver {
            config,
            transport: Box::new(transport),
            conn: None,
            state: SessionState::Disconnected,
            aligner,
            ledger: RequestLedger::new(),
            player: player.clone(),
            events_rx,
            cmd_rx,
            pending_out: VecDeque::new(),
            utterance_open: false,
            idle_deadline: None,
            event_listener: None,
        };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            cmd_tx,
            player,
            driver,
        })
    }

    /// Create a session connected to the configured websocket endpoint.
    pub fn websocket(config: EngineConfig) -> SessionResult<Self> {
        let transport = super::transport::WebSocketTransport::new(&config)?;
        Self::new(config, transport)
    }

    /// The audio player backing this session. The host audio callback
    /// pulls sample blocks from it with [`StreamingPlayer::fill`].
    pub fn player(&self) -> Arc<StreamingPlayer> {
        self.player.clone()
    }

    /// Speak `text`, interrupting anything queued or currently playing.
    pub fn speak(&self, text: &str) -> SessionResult<CompletionHandle> {
        self.speak_with(text, RequestListeners::default(), false)
    }

    /// Speak `text` after everything already queued has played.
    pub fn speak_queued(&self, text: &str) -> SessionResult<CompletionHandle> {
        self.speak_with(text, RequestListeners::default(), true)
    }

    /// Speak `text` with per-request listeners. `queued` appends behind
    /// in-flight requests instead of interrupting them.
    pub fn speak_with(
        &self,
        text: &str,
        listeners: RequestListeners,
        queued: bool,
    ) -> SessionResult<CompletionHandle> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyText);
        }
        let (request, handle) = AudioRequest::new(text, listeners);
        self.send_command(SessionCommand::Speak {
            text: text.to_string(),
            request,
            interrupt: !queued,
        })?;
        Ok(handle)
    }

    /// Open the utterance stream eagerly so the first chunk does not pay
    /// the handshake latency. Optional: `speak` opens it on demand.
    pub fn begin_utterance(&self) -> SessionResult<()> {
        self.send_command(SessionCommand::BeginUtterance)
    }

    /// Close the current utterance now instead of waiting for the idle
    /// timer.
    pub fn end_utterance(&self) -> SessionResult<()> {
        self.send_command(SessionCommand::EndUtterance)
    }

    /// Stop playback: buffered audio and pending events are discarded
    /// without firing, and pending requests resolve as cancelled.
    pub fn stop(&self) -> SessionResult<()> {
        self.send_command(SessionCommand::Stop)
    }

    /// Register a listener for every playback event the session fires.
    pub fn on_playback_event(&self, callback: PlaybackEventCallback) -> SessionResult<()> {
        self.send_command(SessionCommand::SetEventListener(callback))
    }

    /// Close the session, failing anything still pending.
    pub async fn close(self) -> SessionResult<()> {
        let _ = self.cmd_tx.send(SessionCommand::Close);
        self.driver
            .await
            .map_err(|e| SessionError::Closed(format!("session task panicked: {e}")))
    }

    fn send_command(&self, command: SessionCommand) -> SessionResult<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| SessionError::Closed("session task ended".to_string()))
    }
}

enum LoopEvent {
    Command(Option<SessionCommand>),
    Transport(Option<TransportEvent>),
    Playback(Option<PlaybackEvent>),
    IdleExpired,
}

struct SessionDriver {
    config: EngineConfig,
    transport: Box<dyn Transport>,
    conn: Option<TransportConnection>,
    state: SessionState,
    aligner: ChunkAligner,
    ledger: RequestLedger,
    player: Arc<StreamingPlayer>,
    events_rx: EventSource,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    /// Serialized frames queued until the stream is ready.
    pending_out: VecDeque<String>,
    /// Whether the current utterance still accepts text (no close sentinel
    /// queued yet).
    utterance_open: bool,
    idle_deadline: Option<Instant>,
    event_listener: Option<PlaybackEventCallback>,
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            let idle_armed = self.idle_deadline.is_some();
            let idle_at = self
                .idle_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let event = {
                let conn = self.conn.as_mut();
                tokio::select! {
                    command = self.cmd_rx.recv() => LoopEvent::Command(command),
                    transport_event = async move {
                        match conn {
                            Some(c) => c.events.recv().await,
                            None => std::future::pending().await,
                        }
                    } => LoopEvent::Transport(transport_event),
                    playback = self.events_rx.recv() => LoopEvent::Playback(playback),
                    _ = tokio::time::sleep_until(idle_at), if idle_armed => LoopEvent::IdleExpired,
                }
            };

            match event {
                LoopEvent::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                LoopEvent::Command(None) => {
                    self.shutdown(SessionError::Closed("session handle dropped".to_string()))
                        .await;
                    break;
                }
                LoopEvent::Transport(Some(event)) => self.handle_transport_event(event).await,
                LoopEvent::Transport(None) => {
                    self.disconnect(SessionError::NetworkError(
                        "transport task ended".to_string(),
                    ))
                    .await;
                }
                LoopEvent::Playback(Some(event)) => self.handle_playback_event(event).await,
                // Both sink clones live in this struct, so the channel
                // cannot close while the loop runs.
                LoopEvent::Playback(None) => {}
                LoopEvent::IdleExpired => self.handle_idle().await,
            }
        }
        debug!("session loop ended");
    }

    /// Returns false when the loop should exit.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Speak {
                text,
                request,
                interrupt,
            } => {
                if interrupt {
                    self.interrupt();
                    // An interrupting speak retracts unsent chunks and
                    // starts a fresh utterance.
                    self.pending_out.clear();
                    self.utterance_open = false;
                }
                self.enqueue_chunk(&text, request).await;
                true
            }
            SessionCommand::BeginUtterance => {
                self.open_utterance();
                self.arm_idle_timer();
                match self.state {
                    SessionState::Disconnected => self.connect().await,
                    SessionState::Ready => self.flush_pending().await,
                    _ => {}
                }
                true
            }
            SessionCommand::EndUtterance => {
                self.idle_deadline = None;
                self.queue_close_sentinel();
                self.flush_pending().await;
                true
            }
            SessionCommand::Stop => {
                // Queued network sends are not retracted; the next ready
                // transition flushes them.
                self.interrupt();
                true
            }
            SessionCommand::SetEventListener(callback) => {
                self.event_listener = Some(callback);
                true
            }
            SessionCommand::Close => {
                self.shutdown(SessionError::Closed("closed by caller".to_string()))
                    .await;
                false
            }
        }
    }

    /// Discard buffered audio and pending state without firing callbacks.
    fn interrupt(&mut self) {
        self.player.stop();
        self.aligner.clear();
        self.ledger.cancel_all();
    }

    async fn enqueue_chunk(&mut self, text: &str, request: AudioRequest) {
        self.aligner.push_chunk(request.id, text);
        self.ledger.enqueue(request);

        self.open_utterance();
        if let Some(frame) = encode(&TextChunk::new(text)) {
            self.pending_out.push_back(frame);
        }
        self.arm_idle_timer();

        match self.state {
            SessionState::Disconnected => self.connect().await,
            SessionState::Ready => self.flush_pending().await,
            // Connecting/Open/Closing: chunks stay queued until ready.
            _ => {}
        }
    }

    async fn connect(&mut self) {
        self.state = SessionState::Connecting;
        info!("connecting to synthesis service");
        match self.transport.connect().await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = SessionState::Open;
            }
            Err(e) => {
                error!("connect failed: {e}");
                self.disconnect(e).await;
            }
        }
    }

    /// Queue the handshake for a new utterance if one is not already open.
    fn open_utterance(&mut self) {
        if self.utterance_open {
            return;
        }
        if let Some(frame) = encode(&StreamHandshake::new(
            &self.config.api_key,
            self.config.voice_settings.clone(),
        )) {
            self.pending_out.push_back(frame);
        }
        self.utterance_open = true;
    }

    fn arm_idle_timer(&mut self) {
        self.idle_deadline =
            Some(Instant::now() + Duration::from_millis(self.config.idle_close_timeout_ms));
    }

    fn queue_close_sentinel(&mut self) {
        if !self.utterance_open {
            return;
        }
        if let Some(frame) = encode(&CloseSentinel::default()) {
            self.pending_out.push_back(frame);
        }
        self.utterance_open = false;
    }

    async fn flush_pending(&mut self) {
        if self.state != SessionState::Ready {
            return;
        }
        while let Some(frame) = self.pending_out.front() {
            let Some(conn) = &self.conn else {
                return;
            };
            if let Err(e) = conn
                .outbound
                .send(TransportCommand::Send(frame.clone()))
                .await
            {
                self.disconnect(SessionError::NetworkError(format!(
                    "transport send failed: {e}"
                )))
                .await;
                return;
            }
            self.pending_out.pop_front();
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.handle_message(&text).await,
            TransportEvent::Error(e) => {
                self.disconnect(SessionError::NetworkError(e)).await;
            }
            TransportEvent::Closed(code) => {
                let reason = match code {
                    Some(code) => format!("connection closed with code {code}"),
                    None => "connection closed".to_string(),
                };
                self.disconnect(SessionError::Closed(reason)).await;
            }
        }
    }

    async fn handle_message(&mut self, text: &str) {
        // Malformed messages are skipped; they never tear down the session.
        let msg = match InboundMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("skipping malformed message: {e}");
                return;
            }
        };

        if let Some(server_error) = msg.error_text() {
            error!("server error: {server_error}");
            self.disconnect(SessionError::ServerError(server_error.to_string()))
                .await;
            return;
        }

        if self.state == SessionState::Open && msg.is_ready() {
            info!("stream ready");
            self.state = SessionState::Ready;
            self.flush_pending().await;
        }

        self.handle_audio(&msg).await;

        if msg.is_final == Some(true) {
            self.handle_final().await;
        }
    }

    async fn handle_audio(&mut self, msg: &InboundMessage) {
        let pcm = match &msg.audio {
            Some(encoded) if !encoded.is_empty() => match BASE64_STANDARD.decode(encoded) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("skipping message with undecodable audio: {e}");
                    return;
                }
            },
            _ => Vec::new(),
        };

        let mut events = Vec::new();
        let mut aligned_chars = 0;
        if let Some(alignment) = msg.alignment() {
            if !alignment.is_well_formed() {
                warn!("skipping malformed alignment block");
            } else if !alignment.chars.is_empty() {
                match self.ledger.alignment_target() {
                    Some((request_id, char_base, first_segment)) => {
                        let segment = self.aligner.process(
                            AlignmentContext {
                                request_id,
                                char_base,
                                first_segment,
                            },
                            alignment,
                        );
                        events = segment.events;
                        aligned_chars = segment.aligned_chars;
                    }
                    None => warn!("alignment received with no in-flight request"),
                }
            }
        }

        if pcm.is_empty() && events.is_empty() {
            // Heartbeat or informational message.
            return;
        }

        if let Err(e) = self.player.add_pcm(&pcm, events).await {
            // The fragment was rejected whole; character accounting stays
            // untouched so the final-message path can still complete the
            // request.
            error!("audio fragment dropped: {e}");
            return;
        }

        if aligned_chars > 0 {
            self.ledger.record_aligned(aligned_chars).await;
        }
    }

    /// The server marked the utterance finished: everything buffered will
    /// still play out, so completion events land at the current end of the
    /// written stream.
    async fn handle_final(&mut self) {
        debug!("utterance finished by server");
        let pending = self.ledger.pending_ids();
        let mut events = Vec::with_capacity(pending.len());
        for request_id in pending {
            self.ledger.force_data_complete(request_id).await;
            events.push(PlaybackEvent::RequestComplete { request_id });
        }
        self.player.schedule_at_end(events);
        self.utterance_open = false;
        self.idle_deadline = None;
    }

    async fn handle_idle(&mut self) {
        self.idle_deadline = None;
        if self.utterance_open {
            debug!("idle timeout: closing utterance");
            self.queue_close_sentinel();
            self.flush_pending().await;
        }
    }

    async fn handle_playback_event(&mut self, event: PlaybackEvent) {
        // Mid-request segment ends fire this too; only a request with no
        // characters outstanding actually completes, and only the
        // completing firing reaches the session listener.
        if let PlaybackEvent::RequestComplete { request_id } = event {
            if self.ledger.is_data_complete(request_id) {
                for flushed in self.aligner.flush_for_request(request_id) {
                    self.forward_event(flushed).await;
                }
                if self.ledger.complete(request_id).await {
                    self.forward_event(event).await;
                }
            }
            return;
        }

        match &event {
            PlaybackEvent::PlaybackStarted { request_id } => {
                self.ledger.playback_started(*request_id).await;
            }
            PlaybackEvent::CharacterPlayed { request_id, index } => {
                self.ledger.character_played(*request_id, *index).await;
            }
            _ => {}
        }
        self.forward_event(event).await;
    }

    async fn forward_event(&self, event: PlaybackEvent) {
        if let Some(callback) = &self.event_listener {
            callback(event).await;
        }
    }

    /// Transport-level failure or close: every pending request fails, the
    /// timeline is cleared (playback can no longer reach the scheduled
    /// offsets), and the session returns to the disconnected state. The
    /// next send reconnects lazily; unsent frames stay queued.
    async fn disconnect(&mut self, reason: SessionError) {
        self.ledger.fail_all(&reason).await;
        self.player.clear_timeline();
        self.aligner.clear();
        self.conn = None;
        self.state = SessionState::Disconnected;
        self.utterance_open = false;
        self.idle_deadline = None;
    }

    async fn shutdown(&mut self, reason: SessionError) {
        self.state = SessionState::Closing;
        if let Some(conn) = &self.conn {
            let _ = conn.outbound.send(TransportCommand::Close).await;
        }
        self.disconnect(reason).await;
        info!("session closed");
    }
}

fn encode<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("failed to encode outbound message: {e}");
            None
        }
    }
}
