//! Tracks one in-flight audio request per submitted utterance, draining in
//! FIFO order as alignment data confirms characters consumed.
//!
//! Each request carries a listener set and a completion handle. Listeners
//! fire on the session's control task; completion resolves exactly once.
//! A second resolution indicates a timeline/ledger invariant violation and
//! is reported loudly rather than swallowed.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::session::SessionError;

/// Callback type for per-character playback notifications.
pub type CharacterPlayedCallback =
    Arc<dyn Fn(Uuid, usize) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for request lifecycle notifications.
pub type RequestCallback =
    Arc<dyn Fn(Uuid) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for request errors.
pub type RequestErrorCallback =
    Arc<dyn Fn(Uuid, SessionError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Listener set attached to an [`AudioRequest`].
#[derive(Clone, Default)]
pub struct RequestListeners {
    /// Called when a character at the given index becomes audible.
    pub on_character_played: Option<CharacterPlayedCallback>,
    /// Called when an error ends the request before playback completes.
    pub on_error: Option<RequestErrorCallback>,
    /// Called when all audio data for the request has been received and
    /// only playback remains.
    pub on_data_processing_complete: Option<RequestCallback>,
    /// Called when the first audio of the request becomes audible.
    pub on_playback_started: Option<RequestCallback>,
    /// Called when the request's audio has been fully played.
    pub on_playback_complete: Option<RequestCallback>,
    /// Called last, after data completion, an error, or playback
    /// completion; no further events follow.
    pub on_complete: Option<RequestCallback>,
}

impl std::fmt::Debug for RequestListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestListeners")
            .field("on_character_played", &self.on_character_played.is_some())
            .field("on_error", &self.on_error.is_some())
            .field(
                "on_data_processing_complete",
                &self.on_data_processing_complete.is_some(),
            )
            .field("on_playback_started", &self.on_playback_started.is_some())
            .field("on_playback_complete", &self.on_playback_complete.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Awaitable side of a request's completion promise.
#[derive(Debug)]
pub struct CompletionHandle {
    request_id: Uuid,
    rx: oneshot::Receiver<Result<Uuid, SessionError>>,
}

impl CompletionHandle {
    /// Identifier of the request this handle tracks.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the request to finish playback (or fail).
    pub async fn wait(self) -> Result<Uuid, SessionError> {
        match self.rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: the session went away.
            Err(_) => Err(SessionError::Cancelled),
        }
    }
}

/// Lifecycle record for one submitted utterance.
#[derive(Debug)]
pub struct AudioRequest {
    pub id: Uuid,
    pub text: String,
    /// Characters not yet confirmed by alignment data. Signed so a
    /// server that over-reports cannot wrap the counter.
    pub chars_remaining: i64,
    pub listeners: RequestListeners,
    completion: Option<oneshot::Sender<Result<Uuid, SessionError>>>,
    /// Set once alignment has been seen for this request.
    pub alignment_seen: bool,
    data_complete_fired: bool,
    playback_started_fired: bool,
}

impl AudioRequest {
    /// Create a request for `text` along with its completion handle.
    pub fn new(text: &str, listeners: RequestListeners) -> (Self, CompletionHandle) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id,
            text: text.to_string(),
            chars_remaining: text.chars().count() as i64,
            listeners,
            completion: Some(tx),
            alignment_seen: false,
            data_complete_fired: false,
            playback_started_fired: false,
        };
        (request, CompletionHandle { request_id: id, rx })
    }

    /// Whether all characters have been confirmed consumed.
    pub fn data_complete(&self) -> bool {
        self.chars_remaining <= 0
    }

    /// Resolve the completion promise. Resolving twice is a programming
    /// error: the first result stands and the violation is reported.
    fn resolve(&mut self, result: Result<Uuid, SessionError>) {
        match self.completion.take() {
            Some(tx) => {
                // A dropped handle just means nobody is waiting.
                let _ = tx.send(result);
            }
            None => {
                error!(
                    "request {} completion resolved twice; timeline/ledger invariant violated",
                    self.id
                );
                debug_assert!(false, "request completion resolved twice");
            }
        }
    }
}

/// FIFO queue of in-flight audio requests.
#[derive(Debug, Default)]
pub struct RequestLedger {
    queue: VecDeque<AudioRequest>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a request behind any already in flight.
    pub fn enqueue(&mut self, request: AudioRequest) {
        debug!(
            "enqueued request {} ({} chars)",
            request.id, request.chars_remaining
        );
        self.queue.push_back(request);
    }

    /// The request that should consume the next alignment characters:
    /// the first with characters outstanding, falling back to the newest
    /// request so trailing alignment still has an owner.
    ///
    /// Returns (request id, index of its next character, whether this is
    /// its first aligned segment) and marks alignment as seen.
    pub fn alignment_target(&mut self) -> Option<(Uuid, usize, bool)> {
        let request = match self.queue.iter_mut().find(|r| !r.data_complete()) {
            Some(request) => request,
            None => self.queue.back_mut()?,
        };
        let char_base = request.text.chars().count() - request.chars_remaining.max(0) as usize;
        let first_segment = !request.alignment_seen;
        request.alignment_seen = true;
        Some((request.id, char_base, first_segment))
    }

    /// Reduce outstanding character counts by `count` aligned characters,
    /// draining requests front to back. Requests reaching zero fire
    /// `on_data_processing_complete`.
    pub async fn record_aligned(&mut self, count: usize) {
        let mut remaining = count as i64;
        for request in self.queue.iter_mut() {
            if remaining == 0 {
                break;
            }
            if request.data_complete() {
                continue;
            }
            let consumed = remaining.min(request.chars_remaining);
            request.chars_remaining -= consumed;
            remaining -= consumed;
            if request.data_complete() && !request.data_complete_fired {
                request.data_complete_fired = true;
                debug!("request {} data processing complete", request.id);
                if let Some(cb) = &request.listeners.on_data_processing_complete {
                    cb(request.id).await;
                }
            }
        }
        if remaining > 0 {
            warn!("{remaining} aligned characters had no owning request");
        }
    }

    /// Force a request's outstanding count to zero (server signalled the
    /// end of the stream without aligning every character).
    pub async fn force_data_complete(&mut self, request_id: Uuid) {
        if let Some(request) = self.queue.iter_mut().find(|r| r.id == request_id) {
            request.chars_remaining = 0;
            if !request.data_complete_fired {
                request.data_complete_fired = true;
                if let Some(cb) = &request.listeners.on_data_processing_complete {
                    cb(request.id).await;
                }
            }
        }
    }

    /// Ids of requests still in the queue, in queue order.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.queue.iter().map(|r| r.id).collect()
    }

    /// Whether the request has all its audio data accounted for.
    pub fn is_data_complete(&self, request_id: Uuid) -> bool {
        self.queue
            .iter()
            .find(|r| r.id == request_id)
            .is_some_and(AudioRequest::data_complete)
    }

    /// Fire `on_playback_started` for a request, at most once.
    pub async fn playback_started(&mut self, request_id: Uuid) {
        if let Some(request) = self.queue.iter_mut().find(|r| r.id == request_id) {
            if request.playback_started_fired {
                return;
            }
            request.playback_started_fired = true;
            if let Some(cb) = &request.listeners.on_playback_started {
                cb(request.id).await;
            }
        }
    }

    /// Fire `on_character_played` for a request.
    pub async fn character_played(&mut self, request_id: Uuid, index: usize) {
        if let Some(request) = self.queue.iter().find(|r| r.id == request_id) {
            if let Some(cb) = &request.listeners.on_character_played {
                cb(request.id, index).await;
            }
        }
    }

    /// Complete a request: fire `on_playback_complete` then `on_complete`,
    /// resolve its promise, and remove it from the queue.
    ///
    /// Returns false if the request is unknown (already completed firings
    /// are ignored, keeping completion at-most-once).
    pub async fn complete(&mut self, request_id: Uuid) -> bool {
        let Some(pos) = self.queue.iter().position(|r| r.id == request_id) else {
            return false;
        };
        let Some(mut request) = self.queue.remove(pos) else {
            return false;
        };
        debug!("request {} playback complete", request.id);
        if let Some(cb) = &request.listeners.on_playback_complete {
            cb(request.id).await;
        }
        if let Some(cb) = &request.listeners.on_complete {
            cb(request.id).await;
        }
        request.resolve(Ok(request_id));
        true
    }

    /// Fail every still-queued request: `on_error` then `on_complete` per
    /// request in queue order, promises resolved with the error, queue
    /// cleared. All callbacks run before this returns; playback can no
    /// longer be trusted to reach scheduled offsets, so the timeline is
    /// bypassed entirely.
    pub async fn fail_all(&mut self, reason: &SessionError) {
        let failed = self.queue.len();
        while let Some(mut request) = self.queue.pop_front() {
            if let Some(cb) = &request.listeners.on_error {
                cb(request.id, reason.clone()).await;
            }
            if let Some(cb) = &request.listeners.on_complete {
                cb(request.id).await;
            }
            request.resolve(Err(reason.clone()));
        }
        if failed > 0 {
            warn!("failed {failed} pending requests: {reason}");
        }
    }

    /// Drop every request without firing listeners, resolving promises as
    /// cancelled. Used on hard stop, where pending callbacks are
    /// intentionally not fired.
    pub fn cancel_all(&mut self) {
        while let Some(mut request) = self.queue.pop_front() {
            request.resolve(Err(SessionError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn recording_listeners(log: Arc<Mutex<Vec<String>>>) -> RequestListeners {
        let starts = log.clone();
        let completes = log.clone();
        let errors = log.clone();
        let data = log.clone();
        let played = log;
        RequestListeners {
            on_character_played: Some(Arc::new(move |_, index| {
                let log = played.clone();
                Box::pin(async move {
                    log.lock().await.push(format!("char:{index}"));
                })
            })),
            on_error: Some(Arc::new(move |_, err| {
                let log = errors.clone();
                Box::pin(async move {
                    log.lock().await.push(format!("error:{err}"));
                })
            })),
            on_data_processing_complete: Some(Arc::new(move |_| {
                let log = data.clone();
                Box::pin(async move {
                    log.lock().await.push("data_complete".to_string());
                })
            })),
            on_playback_started: Some(Arc::new(move |_| {
                let log = starts.clone();
                Box::pin(async move {
                    log.lock().await.push("playback_started".to_string());
                })
            })),
            on_playback_complete: None,
            on_complete: Some(Arc::new(move |_| {
                let log = completes.clone();
                Box::pin(async move {
                    log.lock().await.push("complete".to_string());
                })
            })),
        }
    }

    #[tokio::test]
    async fn test_record_aligned_drains_fifo() {
        let mut ledger = RequestLedger::new();
        let (first, _h1) = AudioRequest::new("abc", RequestListeners::default());
        let (second, _h2) = AudioRequest::new("de", RequestListeners::default());
        let first_id = first.id;
        let second_id = second.id;
        ledger.enqueue(first);
        ledger.enqueue(second);

        // 4 characters: finishes the first request, starts the second.
        ledger.record_aligned(4).await;
        assert!(ledger.is_data_complete(first_id));
        assert!(!ledger.is_data_complete(second_id));

        ledger.record_aligned(1).await;
        assert!(ledger.is_data_complete(second_id));
    }

    #[tokio::test]
    async fn test_alignment_target_tracks_char_base() {
        let mut ledger = RequestLedger::new();
        let (request, _h) = AudioRequest::new("hello", RequestListeners::default());
        let id = request.id;
        ledger.enqueue(request);

        let (target, base, first) = ledger.alignment_target().unwrap();
        assert_eq!(target, id);
        assert_eq!(base, 0);
        assert!(first);

        ledger.record_aligned(3).await;
        let (_, base, first) = ledger.alignment_target().unwrap();
        assert_eq!(base, 3);
        assert!(!first);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = RequestLedger::new();
        let (request, handle) = AudioRequest::new("hi", recording_listeners(log.clone()));
        let id = request.id;
        ledger.enqueue(request);
        ledger.record_aligned(2).await;

        assert!(ledger.complete(id).await);
        // Second firing of the same scheduled completion is ignored.
        assert!(!ledger.complete(id).await);

        assert_eq!(handle.wait().await.unwrap(), id);
        let log = log.lock().await;
        assert_eq!(log.iter().filter(|entry| *entry == "complete").count(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_notifies_every_request_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut ledger = RequestLedger::new();
        let mut handles = Vec::new();
        for text in ["one", "two", "three"] {
            let errors = counter.clone();
            let listeners = RequestListeners {
                on_error: Some(Arc::new(move |_, _| {
                    let errors = errors.clone();
                    Box::pin(async move {
                        errors.fetch_add(1, Ordering::SeqCst);
                    })
                })),
                ..Default::default()
            };
            let (request, handle) = AudioRequest::new(text, listeners);
            ledger.enqueue(request);
            handles.push(handle);
        }

        ledger
            .fail_all(&SessionError::NetworkError("gone".to_string()))
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(ledger.is_empty());
        for handle in handles {
            assert!(handle.wait().await.is_err());
        }
    }

    #[tokio::test]
    async fn test_cancel_all_skips_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = RequestLedger::new();
        let (request, handle) = AudioRequest::new("hi", recording_listeners(log.clone()));
        ledger.enqueue(request);

        ledger.cancel_all();
        assert!(ledger.is_empty());
        assert!(matches!(handle.wait().await, Err(SessionError::Cancelled)));
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_data_complete_fires_listener_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = RequestLedger::new();
        let (request, _h) = AudioRequest::new("abc", recording_listeners(log.clone()));
        let id = request.id;
        ledger.enqueue(request);

        ledger.record_aligned(2).await;
        assert!(log.lock().await.is_empty());

        ledger.record_aligned(1).await;
        assert_eq!(*log.lock().await, vec!["data_complete".to_string()]);

        // Further signals for a drained request never re-fire.
        ledger.force_data_complete(id).await;
        assert_eq!(log.lock().await.len(), 1);
    }
}
