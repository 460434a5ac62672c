//! Streaming PCM player: ring buffer and event timeline behind a single
//! short-lived lock, fed by the network task and drained by the host's
//! real-time audio callback.
//!
//! # Thread safety
//!
//! Two execution contexts touch the player:
//!
//! - the network/control task calls [`StreamingPlayer::add_pcm`] and
//!   [`StreamingPlayer::stop`];
//! - the host audio thread calls [`StreamingPlayer::fill`] at a fixed
//!   block size.
//!
//! The only shared state is guarded by one `parking_lot::Mutex` held for
//! index arithmetic and memory copies, never for callback invocation.
//! Fired events travel to the control task over the lock-free hand-off
//! channel, so `fill` never blocks on user code.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::EngineConfig;

use super::events::{EventSink, PlaybackEvent};
use super::ring_buffer::{AudioError, AudioResult, SampleRingBuffer};
use super::timeline::EventTimeline;

/// Decode 16-bit little-endian PCM into normalized f32 samples.
///
/// A trailing odd byte is ignored.
pub fn decode_pcm16(pcm: &[u8]) -> Vec<f32> {
    pcm.chunks_exact(2)
        .map(|pair| {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            f32::from(sample) / 32768.0
        })
        .collect()
}

struct PlayerInner {
    ring: SampleRingBuffer,
    timeline: EventTimeline,
}

/// Streaming audio player decoupling bursty network writes from the
/// fixed-rate audio callback.
pub struct StreamingPlayer {
    inner: Mutex<PlayerInner>,
    /// Signalled by `fill` after consuming samples so a blocked producer
    /// can retry its write.
    space_available: Notify,
    playing: AtomicBool,
    position: AtomicU64,
    sample_rate: u32,
    channels: u16,
    capacity: usize,
    /// Upper bound on how long a producer write may wait for free space.
    write_deadline: Duration,
}

impl StreamingPlayer {
    /// Create a player sized from the engine configuration, handing fired
    /// events to `sink`.
    pub fn new(config: &EngineConfig, sink: EventSink) -> Self {
        let capacity = config.capacity_samples();
        Self {
            inner: Mutex::new(PlayerInner {
                ring: SampleRingBuffer::new(capacity),
                timeline: EventTimeline::new(sink),
            }),
            space_available: Notify::new(),
            playing: AtomicBool::new(true),
            position: AtomicU64::new(0),
            sample_rate: config.sample_rate(),
            channels: config.channels,
            capacity,
            // Waiting longer than one full buffer of audio means playback
            // has stalled; surface backpressure instead of hanging.
            write_deadline: Duration::from_secs(u64::from(config.buffer_secs)),
        }
    }

    /// Sample rate of the decoded stream in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the decoded stream.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total samples handed to the audio device so far (lock-free read).
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Unread samples currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.lock().ring.available()
    }

    /// Decode a PCM16LE fragment and append it, scheduling `events` at
    /// their offsets relative to the start of the fragment.
    ///
    /// If the buffer lacks space the call waits for the audio callback to
    /// drain samples, bounded by one full buffer duration; a missed
    /// deadline surfaces [`AudioError::Backpressure`] without writing
    /// anything, so event-offset arithmetic stays consistent.
    pub async fn add_pcm(
        &self,
        pcm: &[u8],
        events: Vec<(u64, PlaybackEvent)>,
    ) -> AudioResult<()> {
        let samples = decode_pcm16(pcm);
        if samples.len() > self.capacity {
            warn!(
                "audio fragment of {} samples exceeds buffer capacity {}",
                samples.len(),
                self.capacity
            );
            return Err(AudioError::Backpressure {
                needed: samples.len(),
                available: self.capacity,
            });
        }

        let mut events = events;
        let deadline = tokio::time::Instant::now() + self.write_deadline;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.ring.free() >= samples.len() {
                    let base = inner.ring.total_written();
                    for (offset, event) in events.drain(..) {
                        inner.timeline.schedule_at(base + offset, event);
                    }
                    // Cannot fail: space was checked under this lock.
                    inner.ring.write(&samples)?;
                    return Ok(());
                }
                debug!(
                    "buffer backpressure: waiting for {} free samples ({} available)",
                    samples.len(),
                    inner.ring.free()
                );
            }

            let notified = self.space_available.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let available = self.inner.lock().ring.free();
                warn!(
                    "dropping audio fragment after backpressure deadline: \
                     needed {} samples, {} free",
                    samples.len(),
                    available
                );
                return Err(AudioError::Backpressure {
                    needed: samples.len(),
                    available,
                });
            }
        }
    }

    /// Schedule events at the current end of the written stream, i.e. they
    /// fire once everything already buffered has played out.
    pub fn schedule_at_end(&self, events: Vec<PlaybackEvent>) {
        let mut inner = self.inner.lock();
        let base = inner.ring.total_written();
        for event in events {
            inner.timeline.schedule_at(base, event);
        }
    }

    /// Host audio callback: pull a block of samples and advance the event
    /// timeline by the real sample count.
    ///
    /// Underrun zero-fills (silence while waiting for the network). While
    /// paused the output is silence and nothing is consumed. Never blocks
    /// and never invokes user callbacks.
    pub fn fill(&self, out: &mut [f32]) -> usize {
        if !self.playing.load(Ordering::Acquire) {
            out.fill(0.0);
            return 0;
        }

        let produced = {
            let mut inner = self.inner.lock();
            let produced = inner.ring.read(out);
            // Advance even on underrun so events already due (scheduled at
            // the current end of the stream) still fire.
            inner.timeline.advance(produced as u64);
            produced
        };

        if produced > 0 {
            self.position.fetch_add(produced as u64, Ordering::AcqRel);
            self.space_available.notify_one();
        }
        produced
    }

    /// Resume pulling buffered samples.
    pub fn play(&self) {
        self.playing.store(true, Ordering::Release);
    }

    /// Pause playback, retaining buffered data.
    pub fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    /// Whether the player is currently consuming samples.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Stop playback: discard buffered audio and drop pending events
    /// without firing them.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.ring.reset();
        inner.timeline.reset();
        drop(inner);
        // Unblock any producer waiting on space that will now exist.
        self.space_available.notify_one();
    }

    /// Drop pending events without firing them, leaving buffered audio in
    /// place. Used when a transport failure invalidates scheduled offsets.
    pub fn clear_timeline(&self) {
        self.inner.lock().timeline.clear();
    }
}
