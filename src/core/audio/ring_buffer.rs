//! Fixed-capacity circular buffer of decoded audio samples.
//!
//! The ring decouples bursty network delivery from the fixed-rate pull of
//! the audio callback. Monotonic written/read counters (which never wrap)
//! are the coordinate space for all event-offset arithmetic, so a write
//! that would overrun unread data is rejected rather than silently
//! corrupting the stream.

/// Error raised by buffer writes.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AudioError {
    /// The producer outran the consumer: the write was rejected to keep
    /// unread samples and event offsets intact.
    #[error("buffer backpressure: needed {needed} samples but only {available} free")]
    Backpressure { needed: usize, available: usize },
}

/// Result type for audio buffer operations.
pub type AudioResult<T> = Result<T, AudioError>;

/// Fixed-capacity circular sample store.
///
/// Invariant: `total_written - total_read <= capacity`.
#[derive(Debug)]
pub struct SampleRingBuffer {
    buf: Vec<f32>,
    write_index: usize,
    read_index: usize,
    total_written: u64,
    total_read: u64,
}

impl SampleRingBuffer {
    /// Create a buffer holding `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity],
            write_index: 0,
            read_index: 0,
            total_written: 0,
            total_read: 0,
        }
    }

    /// Total samples written since the last reset.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Total samples read since the last reset.
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    /// Buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unread samples currently buffered.
    pub fn available(&self) -> usize {
        (self.total_written - self.total_read) as usize
    }

    /// Free space in samples.
    pub fn free(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Append samples at the write index, wrapping.
    ///
    /// All-or-nothing: if the write would overwrite unread data it is
    /// rejected with [`AudioError::Backpressure`] and the buffer is left
    /// untouched.
    pub fn write(&mut self, samples: &[f32]) -> AudioResult<()> {
        if samples.len() > self.free() {
            return Err(AudioError::Backpressure {
                needed: samples.len(),
                available: self.free(),
            });
        }
        for &sample in samples {
            if self.write_index >= self.buf.len() {
                self.write_index = 0;
            }
            self.buf[self.write_index] = sample;
            self.write_index += 1;
            self.total_written += 1;
        }
        Ok(())
    }

    /// Pull up to `out.len()` unread samples into `out`, zero-filling the
    /// remainder on underrun. Underrun is the normal "waiting for network"
    /// state, not an error: the caller hears silence, never garbage.
    ///
    /// Returns how many real samples were produced.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let mut produced = 0;
        for slot in out.iter_mut() {
            if self.total_read < self.total_written {
                if self.read_index >= self.buf.len() {
                    self.read_index = 0;
                }
                *slot = self.buf[self.read_index];
                self.read_index += 1;
                self.total_read += 1;
                produced += 1;
            } else {
                *slot = 0.0;
            }
        }
        produced
    }

    /// Zero indices and counters. Must only be called while no audio
    /// callback is concurrently reading.
    pub fn reset(&mut self) {
        self.write_index = 0;
        self.read_index = 0;
        self.total_written = 0;
        self.total_read = 0;
    }
}
