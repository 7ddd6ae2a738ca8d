use thiserror::Error;

/// Errors produced by queue operations.
///
/// Timeouts are deliberately absent: a blocking operation that runs out of
/// time reports it through its return value, not through this enum.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The framed message can never fit in the buffer, regardless of how long
    /// the caller waits.
    #[error("framed message of {size} bytes can never fit in a {capacity}-byte queue")]
    MessageTooLarge { size: usize, capacity: usize },

    /// An `attach` was attempted with a capacity that does not match the
    /// shared region it points at.
    #[error("shared region capacity mismatch: expected {expected} bytes, got {actual}")]
    RegionMismatch { expected: usize, actual: usize },

    /// A dequeued frame could not be decoded into the adapter's value type.
    #[error("codec error: {0}")]
    Codec(String),
}

pub type QueueResult<T> = Result<T, QueueError>;
