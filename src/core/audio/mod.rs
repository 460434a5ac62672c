//! Streaming audio playback: ring buffer, consumption-keyed event
//! timeline, and the player tying both behind one lock.

pub mod events;
pub mod player;
pub mod ring_buffer;
pub mod timeline;

pub use events::{event_channel, EventSink, EventSource, PlaybackEvent};
pub use player::{decode_pcm16, StreamingPlayer};
pub use ring_buffer::{AudioError, AudioResult, SampleRingBuffer};
pub use timeline::EventTimeline;
