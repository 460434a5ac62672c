//! Reconciles server-provided character alignment against the words of
//! submitted text chunks.
//!
//! Submitted text is tokenized into whitespace-delimited word runs and
//! queued as triggers in submission order. As alignment messages arrive,
//! consecutive word characters are accumulated into candidate words and
//! matched against the head of the queue, strictly FIFO. A head that does
//! not match the next aligned word is force-flushed (its start and finish
//! fired immediately, in that order) before the match is re-attempted, so
//! a server that skips or reorders a word can never stall the queue.
//! Flushed callbacks fire out of true audio time; that trade-off is
//! inherited from the service's best-effort alignment stream.

use std::collections::VecDeque;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::audio::{EventSink, PlaybackEvent};
use crate::core::session::messages::AlignmentData;

/// Word runs in submitted text, the same token shape the alignment walk
/// reconstructs.
static WORD_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

/// True for characters that extend the current candidate word.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A queued word awaiting alignment confirmation.
#[derive(Debug, Clone)]
pub struct WordTrigger {
    /// The word text as tokenized from the submitted chunk.
    pub word: String,
    /// The request that submitted the chunk this word belongs to.
    pub request_id: Uuid,
    /// Set on the first word of a chunk; carries the chunk text.
    pub starts_chunk: Option<String>,
    /// Set on the last word of a chunk; carries the chunk text.
    pub finishes_chunk: Option<String>,
}

/// Context for one inbound alignment segment.
#[derive(Debug, Clone, Copy)]
pub struct AlignmentContext {
    /// Request currently consuming alignment characters.
    pub request_id: Uuid,
    /// Index of the first character of this segment within the request
    /// text.
    pub char_base: usize,
    /// Whether this is the first aligned segment of the request.
    pub first_segment: bool,
}

/// Events produced for one alignment segment, with offsets relative to the
/// start of the segment's audio fragment.
#[derive(Debug, Default)]
pub struct AlignedSegment {
    pub events: Vec<(u64, PlaybackEvent)>,
    /// Number of characters this segment confirmed as consumed.
    pub aligned_chars: usize,
}

/// Word-by-word reconciliation of submitted chunks against alignment data.
///
/// The trigger queue is owned here and mutated only through `push_chunk`,
/// the match walk, and the flush paths.
pub struct ChunkAligner {
    triggers: VecDeque<WordTrigger>,
    sink: EventSink,
    sample_rate: u32,
    channels: u16,
}

impl ChunkAligner {
    pub fn new(sample_rate: u32, channels: u16, sink: EventSink) -> Self {
        Self {
            triggers: VecDeque::new(),
            sink,
            sample_rate,
            channels,
        }
    }

    /// Number of words still awaiting alignment.
    pub fn pending_words(&self) -> usize {
        self.triggers.len()
    }

    /// Convert an alignment timestamp in milliseconds to a sample offset.
    pub fn ms_to_samples(&self, ms: i64) -> u64 {
        let ms = ms.max(0) as f64;
        (ms / 1000.0 * f64::from(self.sample_rate) * f64::from(self.channels)).round() as u64
    }

    /// Tokenize a submitted chunk into word triggers and queue them.
    ///
    /// The first word carries the chunk-start notification and the last
    /// word the chunk-finish notification, so chunk boundaries ride on the
    /// same queue as words.
    pub fn push_chunk(&mut self, request_id: Uuid, text: &str) {
        let words: Vec<&str> = WORD_RUNS.find_iter(text).map(|m| m.as_str()).collect();
        let last = words.len().saturating_sub(1);
        for (i, word) in words.iter().enumerate() {
            self.triggers.push_back(WordTrigger {
                word: (*word).to_string(),
                request_id,
                starts_chunk: (i == 0).then(|| text.to_string()),
                finishes_chunk: (i == last).then(|| text.to_string()),
            });
        }
        debug!(
            "queued {} word triggers for request {}",
            words.len(),
            request_id
        );
    }

    /// Process one inbound alignment segment, producing timeline events
    /// offset from the start of the segment's audio.
    pub fn process(&mut self, ctx: AlignmentContext, alignment: &AlignmentData) -> AlignedSegment {
        let chars = &alignment.chars;
        let starts = &alignment.char_start_times_ms;
        let durations = &alignment.char_durations_ms;
        if chars.is_empty() {
            return AlignedSegment::default();
        }
        if chars.len() != starts.len() || chars.len() != durations.len() {
            warn!(
                "mismatched alignment arrays ({} chars, {} starts, {} durations); skipping",
                chars.len(),
                starts.len(),
                durations.len()
            );
            return AlignedSegment::default();
        }

        let mut segment = AlignedSegment {
            events: Vec::with_capacity(chars.len() + 4),
            aligned_chars: chars.len(),
        };

        if ctx.first_segment {
            segment.events.push((
                self.ms_to_samples(starts[0]),
                PlaybackEvent::PlaybackStarted {
                    request_id: ctx.request_id,
                },
            ));
        }

        let mut candidate = String::new();
        for (i, ch) in chars.iter().enumerate() {
            segment.events.push((
                self.ms_to_samples(starts[i]),
                PlaybackEvent::CharacterPlayed {
                    request_id: ctx.request_id,
                    index: ctx.char_base + i,
                },
            ));

            let is_word = ch.chars().next().is_some_and(is_word_char);
            if is_word {
                candidate.push_str(ch);
            } else if !candidate.is_empty() {
                self.match_word(&candidate, &mut segment.events);
                candidate.clear();
            }
        }
        if !candidate.is_empty() {
            self.match_word(&candidate, &mut segment.events);
        }

        // One event at the segment's end; if the owning request has no
        // characters left by the time it fires, the session flushes any
        // unmatched words and completes the request.
        let last = chars.len() - 1;
        let end_offset = self.ms_to_samples(starts[last].saturating_add(durations[last]));
        segment.events.push((
            end_offset,
            PlaybackEvent::RequestComplete {
                request_id: ctx.request_id,
            },
        ));

        segment
    }

    /// Match a reconstructed word against the head of the trigger queue.
    ///
    /// Heads that differ are force-flushed (fired immediately through the
    /// hand-off channel) until the head matches or the queue empties. The
    /// matched word's events are scheduled at offset zero, as soon as the
    /// segment's audio begins playing, with start before finish.
    fn match_word(&mut self, candidate: &str, events: &mut Vec<(u64, PlaybackEvent)>) {
        while let Some(head) = self.triggers.pop_front() {
            if head.word == candidate {
                self.push_trigger_events(&head, events);
                return;
            }
            debug!(
                "aligned word {:?} does not match queued {:?}; flushing",
                candidate, head.word
            );
            self.fire_now(&head);
        }
        debug!("aligned word {:?} had no queued trigger", candidate);
    }

    /// The start/finish (and chunk boundary) events for one trigger, in
    /// firing order.
    fn trigger_events(trigger: &WordTrigger) -> Vec<PlaybackEvent> {
        let mut events = Vec::with_capacity(4);
        if let Some(text) = &trigger.starts_chunk {
            events.push(PlaybackEvent::ChunkStart {
                request_id: trigger.request_id,
                text: text.clone(),
            });
        }
        events.push(PlaybackEvent::WordStart {
            word: trigger.word.clone(),
        });
        events.push(PlaybackEvent::WordFinish {
            word: trigger.word.clone(),
        });
        if let Some(text) = &trigger.finishes_chunk {
            events.push(PlaybackEvent::ChunkComplete {
                request_id: trigger.request_id,
                text: text.clone(),
            });
        }
        events
    }

    fn push_trigger_events(&self, trigger: &WordTrigger, events: &mut Vec<(u64, PlaybackEvent)>) {
        events.extend(Self::trigger_events(trigger).into_iter().map(|ev| (0, ev)));
    }

    /// Fire a trigger's start and finish immediately, bypassing the
    /// timeline.
    fn fire_now(&self, trigger: &WordTrigger) {
        for event in Self::trigger_events(trigger) {
            let _ = self.sink.send(event);
        }
    }

    /// Flush still-queued triggers belonging to `request_id` from the head
    /// of the queue, returning their start/finish events in queue order so
    /// the caller can dispatch them ahead of the request's completion.
    pub fn flush_for_request(&mut self, request_id: Uuid) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        while self
            .triggers
            .front()
            .is_some_and(|t| t.request_id == request_id)
        {
            if let Some(trigger) = self.triggers.pop_front() {
                events.extend(Self::trigger_events(&trigger));
            }
        }
        events
    }

    /// Drop all queued triggers without firing them (hard stop).
    pub fn clear(&mut self) {
        self.triggers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::event_channel;

    fn alignment(chars: &[&str], starts: &[i64], durations: &[i64]) -> AlignmentData {
        AlignmentData {
            chars: chars.iter().map(|c| (*c).to_string()).collect(),
            char_start_times_ms: starts.to_vec(),
            char_durations_ms: durations.to_vec(),
        }
    }

    fn ctx(request_id: Uuid) -> AlignmentContext {
        AlignmentContext {
            request_id,
            char_base: 0,
            first_segment: true,
        }
    }

    fn scheduled_words(events: &[(u64, PlaybackEvent)]) -> Vec<(u64, String, bool)> {
        events
            .iter()
            .filter_map(|(off, ev)| match ev {
                PlaybackEvent::WordStart { word } => Some((*off, word.clone(), true)),
                PlaybackEvent::WordFinish { word } => Some((*off, word.clone(), false)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ms_to_samples_uses_rate_and_channels() {
        let (tx, _rx) = event_channel();
        let aligner = ChunkAligner::new(16000, 2, tx);
        assert_eq!(aligner.ms_to_samples(0), 0);
        assert_eq!(aligner.ms_to_samples(100), 3200);
        assert_eq!(aligner.ms_to_samples(-5), 0);
    }

    #[test]
    fn test_push_chunk_tokenizes_word_runs() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        aligner.push_chunk(Uuid::new_v4(), "  hello,  world! ");
        assert_eq!(aligner.pending_words(), 2);
    }

    #[test]
    fn test_word_match_start_before_finish() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let id = Uuid::new_v4();
        aligner.push_chunk(id, "hello world");

        let segment = aligner.process(
            ctx(id),
            &alignment(
                &["h", "e", "l", "l", "o", " ", "w", "o", "r", "l", "d"],
                &[0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100],
                &[10; 11],
            ),
        );

        let words = scheduled_words(&segment.events);
        assert_eq!(
            words,
            vec![
                (0, "hello".to_string(), true),
                (0, "hello".to_string(), false),
                (0, "world".to_string(), true),
                (0, "world".to_string(), false),
            ]
        );
        assert_eq!(segment.aligned_chars, 11);
        assert_eq!(aligner.pending_words(), 0);
    }

    #[test]
    fn test_flush_on_mismatch_fires_skipped_word_first() {
        let (tx, mut rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let id = Uuid::new_v4();
        aligner.push_chunk(id, "hello world");

        // Server skipped "hello" and only aligned "world".
        let segment = aligner.process(
            ctx(id),
            &alignment(
                &["w", "o", "r", "l", "d", " "],
                &[0, 10, 20, 30, 40, 50],
                &[10; 6],
            ),
        );

        // The stale head fired immediately, before the matched word's
        // scheduled events exist.
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackEvent::ChunkStart {
                request_id: id,
                text: "hello world".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackEvent::WordStart {
                word: "hello".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PlaybackEvent::WordFinish {
                word: "hello".to_string()
            }
        );
        assert!(rx.try_recv().is_err());

        let words = scheduled_words(&segment.events);
        assert_eq!(
            words,
            vec![
                (0, "world".to_string(), true),
                (0, "world".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_segment_schedules_completion_at_end_offset() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let id = Uuid::new_v4();
        aligner.push_chunk(id, "hi");

        let segment = aligner.process(ctx(id), &alignment(&["h", "i"], &[0, 100], &[100, 100]));

        let complete: Vec<_> = segment
            .events
            .iter()
            .filter(|(_, ev)| matches!(ev, PlaybackEvent::RequestComplete { .. }))
            .collect();
        assert_eq!(complete.len(), 1);
        // 200ms at 16kHz mono.
        assert_eq!(complete[0].0, 3200);
    }

    #[test]
    fn test_playback_started_only_on_first_segment() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let id = Uuid::new_v4();
        aligner.push_chunk(id, "hi there");

        let first = aligner.process(ctx(id), &alignment(&["h", "i"], &[0, 10], &[10, 10]));
        assert!(first
            .events
            .iter()
            .any(|(_, ev)| matches!(ev, PlaybackEvent::PlaybackStarted { .. })));

        let later = aligner.process(
            AlignmentContext {
                request_id: id,
                char_base: 2,
                first_segment: false,
            },
            &alignment(&["t", "h"], &[0, 10], &[10, 10]),
        );
        assert!(!later
            .events
            .iter()
            .any(|(_, ev)| matches!(ev, PlaybackEvent::PlaybackStarted { .. })));
    }

    #[test]
    fn test_empty_alignment_advances_nothing() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let id = Uuid::new_v4();
        aligner.push_chunk(id, "hello");

        let segment = aligner.process(ctx(id), &alignment(&[], &[], &[]));
        assert!(segment.events.is_empty());
        assert_eq!(segment.aligned_chars, 0);
        assert_eq!(aligner.pending_words(), 1);
    }

    #[test]
    fn test_mismatched_arrays_skipped() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let id = Uuid::new_v4();
        aligner.push_chunk(id, "hello");

        let segment = aligner.process(ctx(id), &alignment(&["h", "e"], &[0], &[10, 10]));
        assert!(segment.events.is_empty());
        assert_eq!(segment.aligned_chars, 0);
    }

    #[test]
    fn test_flush_for_request_stops_at_other_request() {
        let (tx, _rx) = event_channel();
        let mut aligner = ChunkAligner::new(16000, 1, tx);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        aligner.push_chunk(first, "one two");
        aligner.push_chunk(second, "three");

        let events = aligner.flush_for_request(first);
        assert_eq!(aligner.pending_words(), 1);

        // Start before finish for each flushed word, in queue order.
        let seen: Vec<String> = events
            .iter()
            .filter_map(|ev| match ev {
                PlaybackEvent::WordStart { word } => Some(format!("start:{word}")),
                PlaybackEvent::WordFinish { word } => Some(format!("finish:{word}")),
                _ => None,
            })
            .collect();
        assert_eq!(
            seen,
            vec!["start:one", "finish:one", "start:two", "finish:two"]
        );
    }
}
