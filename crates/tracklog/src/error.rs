use std::fmt::Display;

/// A specialized error type for track operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A slot or ordinal falls outside the chunk's fixed capacity.
    #[error("slot {index} out of bounds for capacity {capacity}")]
    OutOfBounds { index: u64, capacity: u64 },
    /// An append arrived for a slot other than the next free one.
    #[error("out of order append: expected slot {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
    /// A non-blocking read addressed a slot that has not been written yet.
    #[error("slot {index} not yet written (chunk holds {size} messages)")]
    NotWritten { index: u64, size: u64 },
    /// The caller's buffer cannot hold the next message in full.
    #[error("buffer of {provided} bytes cannot hold next message of {needed} bytes")]
    BufferTooSmall { needed: u64, provided: u64 },
    /// Write on a track whose inbound queue has been closed.
    #[error("track is closed")]
    Closed,
    /// The writer thread hit a fatal error and shut the track down.
    #[error("writer failed: {0}")]
    WriterFailed(String),
    /// Read on a track that is no longer alive.
    #[error("end of track")]
    Eof,
    /// Data corruption detected while reopening on-disk state.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl TrackError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }
}

/// A Result type alias for track operations.
pub type TrackResult<T> = Result<T, TrackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = TrackError::invalid_config("bad capacity");
        assert!(matches!(err, TrackError::InvalidConfig(msg) if msg == "bad capacity"));
    }

    #[test]
    fn out_of_order_display_names_both_slots() {
        let err = TrackError::OutOfOrder {
            expected: 3,
            actual: 7,
        };
        assert_eq!(err.to_string(), "out of order append: expected slot 3, got 7");
    }
}
