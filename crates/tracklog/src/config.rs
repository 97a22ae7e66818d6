use serde::{Deserialize, Serialize};

use crate::error::{TrackError, TrackResult};

/// Default number of messages per chunk, tuned for small payloads.
pub const DEFAULT_CHUNK_CAPACITY: u64 = 500_000;

/// The inbound queue buffers this fraction of a chunk by default.
const QUEUE_DEPTH_DIVISOR: u64 = 100;

/// Construction-time parameters for a [`Track`](crate::Track).
///
/// The chunk capacity is fixed for the lifetime of a track: every chunk
/// file records it in its header, and reopening a track with a different
/// capacity is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Messages stored per chunk file.
    pub chunk_capacity: u64,
    /// Capacity of the bounded producer queue feeding the writer thread.
    pub queue_depth: usize,
    /// Flush the active chunk every N committed messages. `None` leaves
    /// durability to explicit [`Track::flush`](crate::Track::flush) calls.
    pub flush_every: Option<u64>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self::with_chunk_capacity(DEFAULT_CHUNK_CAPACITY)
    }
}

impl TrackConfig {
    /// Build a config around the given chunk capacity, deriving the queue
    /// depth as one percent of a chunk (at least one slot).
    pub fn with_chunk_capacity(chunk_capacity: u64) -> Self {
        Self {
            chunk_capacity,
            queue_depth: default_queue_depth(chunk_capacity),
            flush_every: None,
        }
    }

    /// Override the producer queue depth.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Flush the active chunk after every `n` committed messages.
    pub fn with_flush_every(mut self, n: u64) -> Self {
        self.flush_every = Some(n);
        self
    }

    pub(crate) fn validate(&self) -> TrackResult<()> {
        if self.chunk_capacity == 0 {
            return Err(TrackError::invalid_config("chunk_capacity must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(TrackError::invalid_config("queue_depth must be at least 1"));
        }
        if self.flush_every == Some(0) {
            return Err(TrackError::invalid_config("flush_every must be at least 1"));
        }
        Ok(())
    }

    /// Split a track-wide ordinal into `(chunk index, slot within chunk)`.
    #[inline]
    pub(crate) fn locate(&self, ordinal: u64) -> (u64, u64) {
        (ordinal / self.chunk_capacity, ordinal % self.chunk_capacity)
    }
}

fn default_queue_depth(chunk_capacity: u64) -> usize {
    (chunk_capacity / QUEUE_DEPTH_DIVISOR).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_depth_is_one_percent_of_a_chunk() {
        let config = TrackConfig::default();
        assert_eq!(config.chunk_capacity, DEFAULT_CHUNK_CAPACITY);
        assert_eq!(config.queue_depth, 5_000);
    }

    #[test]
    fn tiny_capacity_still_gets_a_queue_slot() {
        let config = TrackConfig::with_chunk_capacity(10);
        assert_eq!(config.queue_depth, 1);
        config.validate().expect("valid config");
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = TrackConfig::with_chunk_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(TrackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn locate_splits_ordinals_at_chunk_boundaries() {
        let config = TrackConfig::with_chunk_capacity(1_000);
        assert_eq!(config.locate(0), (0, 0));
        assert_eq!(config.locate(999), (0, 999));
        assert_eq!(config.locate(1_000), (1, 0));
        assert_eq!(config.locate(2_500), (2, 500));
    }
}
