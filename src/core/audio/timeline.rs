//! Offset-indexed event scheduling keyed to buffer consumption.
//!
//! Events are stored against absolute sample offsets in the same monotonic
//! coordinate space as the ring buffer's written counter. `advance` is
//! driven by the audio callback with the real sample count each read
//! produced, so events fire when their audio is actually audible, not when
//! it arrived from the network.

use std::collections::BTreeMap;

use super::events::{EventSink, PlaybackEvent};

/// Pending set of (offset, event) pairs, fired in ascending offset order
/// with FIFO ordering for ties.
#[derive(Debug)]
pub struct EventTimeline {
    /// Keyed by (absolute offset, schedule sequence) so equal offsets fire
    /// in schedule order.
    pending: BTreeMap<(u64, u64), PlaybackEvent>,
    seq: u64,
    consumed: u64,
    sink: EventSink,
}

impl EventTimeline {
    /// Create a timeline that hands fired events to `sink`.
    pub fn new(sink: EventSink) -> Self {
        Self {
            pending: BTreeMap::new(),
            seq: 0,
            consumed: 0,
            sink,
        }
    }

    /// Schedule an event at an absolute sample offset.
    ///
    /// The caller computes the offset against the ring buffer's written
    /// counter at schedule time, since alignment timestamps are relative to
    /// the start of each inbound chunk rather than the absolute stream.
    pub fn schedule_at(&mut self, offset: u64, event: PlaybackEvent) {
        self.pending.insert((offset, self.seq), event);
        self.seq += 1;
    }

    /// Advance the consumed counter and fire every due event, in ascending
    /// offset order, removing them from the pending set.
    ///
    /// Fired events are pushed onto the hand-off channel; user callbacks
    /// are never invoked here, so this is safe to call from the audio
    /// thread under a short lock.
    ///
    /// Returns the number of events fired.
    pub fn advance(&mut self, samples_consumed: u64) -> usize {
        self.consumed += samples_consumed;
        let mut fired = 0;
        while let Some((&key, _)) = self.pending.first_key_value() {
            if key.0 > self.consumed {
                break;
            }
            if let Some(event) = self.pending.remove(&key) {
                // A closed receiver means the session is shutting down;
                // dropping the event is the correct behavior then.
                let _ = self.sink.send(event);
                fired += 1;
            }
        }
        fired
    }

    /// Drop all pending events without firing them. Used on hard stop,
    /// distinct from the completion path which fires flushes deliberately.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Clear pending events and rewind the consumed counter, re-aligning
    /// with a reset ring buffer.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.consumed = 0;
    }

    /// Samples consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Number of events still pending.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::events::event_channel;
    use uuid::Uuid;

    fn word(label: &str) -> PlaybackEvent {
        PlaybackEvent::WordStart {
            word: label.to_string(),
        }
    }

    #[test]
    fn test_fires_in_offset_order_despite_insertion_order() {
        let (tx, mut rx) = event_channel();
        let mut timeline = EventTimeline::new(tx);

        timeline.schedule_at(50, word("c"));
        timeline.schedule_at(10, word("a"));
        timeline.schedule_at(30, word("b"));

        assert_eq!(timeline.advance(60), 3);

        assert_eq!(rx.try_recv().unwrap(), word("a"));
        assert_eq!(rx.try_recv().unwrap(), word("b"));
        assert_eq!(rx.try_recv().unwrap(), word("c"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_equal_offsets_fire_in_schedule_order() {
        let (tx, mut rx) = event_channel();
        let mut timeline = EventTimeline::new(tx);

        timeline.schedule_at(5, word("first"));
        timeline.schedule_at(5, word("second"));
        timeline.schedule_at(5, word("third"));

        timeline.advance(5);
        assert_eq!(rx.try_recv().unwrap(), word("first"));
        assert_eq!(rx.try_recv().unwrap(), word("second"));
        assert_eq!(rx.try_recv().unwrap(), word("third"));
    }

    #[test]
    fn test_events_fire_at_most_once() {
        let (tx, mut rx) = event_channel();
        let mut timeline = EventTimeline::new(tx);

        timeline.schedule_at(10, word("once"));
        assert_eq!(timeline.advance(10), 1);
        assert_eq!(timeline.advance(100), 0);

        assert_eq!(rx.try_recv().unwrap(), word("once"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_advance_accumulates() {
        let (tx, mut rx) = event_channel();
        let mut timeline = EventTimeline::new(tx);

        timeline.schedule_at(100, word("late"));
        assert_eq!(timeline.advance(60), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(timeline.advance(40), 1);
        assert_eq!(rx.try_recv().unwrap(), word("late"));
    }

    #[test]
    fn test_clear_drops_without_firing() {
        let (tx, mut rx) = event_channel();
        let mut timeline = EventTimeline::new(tx);

        timeline.schedule_at(
            1,
            PlaybackEvent::RequestComplete {
                request_id: Uuid::new_v4(),
            },
        );
        timeline.clear();
        assert_eq!(timeline.pending_len(), 0);
        assert_eq!(timeline.advance(10), 0);
        assert!(rx.try_recv().is_err());
    }
}
