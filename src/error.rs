//! Error types
//!
//! Capacity overruns are never errors: writes and reads are clipped to the
//! space available. What remains are access violations on buffers, queue
//! saturation or interruption, and lifecycle misuse.

use std::io;

use thiserror::Error;

use crate::buffer::{Access, BufferKind};

/// Failures raised by buffers and the pools that hand them out.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Content or cursor mutation attempted on a buffer that forbids it.
    #[error("buffer is {0}")]
    NotWritable(Access),

    /// An index fell outside `[0, capacity]` or broke `mark <= get <= put`.
    #[error("index {index} out of bounds (mark={mark:?}, get={get}, put={put}, capacity={capacity})")]
    OutOfBounds {
        index: usize,
        mark: Option<usize>,
        get: usize,
        put: usize,
        capacity: usize,
    },

    /// Immutable content is by definition stable and cannot be volatile.
    #[error("immutable buffers cannot be volatile")]
    ImmutableVolatile,

    /// The requested backing cannot be allocated by a pool.
    #[error("{0:?} buffers cannot be allocated by a pool")]
    UnsupportedKind(BufferKind),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures from [`BlockingArrayQueue`](crate::thread::BlockingArrayQueue).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at its limit and growth is disabled.
    #[error("queue is full")]
    Full,

    /// A blocked take was interrupted.
    #[error("interrupted while waiting")]
    Interrupted,
}

/// Failures from [`LifeCycle`](crate::lifecycle::LifeCycle) transitions.
#[derive(Debug, Error)]
pub enum LifeCycleError {
    #[error("component is already {0}")]
    IllegalState(crate::lifecycle::State),

    #[error("failed to spawn thread: {0}")]
    Spawn(io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Umbrella error for callers that mix subsystems.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    LifeCycle(#[from] LifeCycleError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<BufferError> for io::Error {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidInput, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_problem() {
        let err = BufferError::NotWritable(Access::ReadOnly);
        assert_eq!(err.to_string(), "buffer is READONLY");

        let err = BufferError::OutOfBounds {
            index: 9,
            mark: None,
            get: 0,
            put: 4,
            capacity: 8,
        };
        assert!(err.to_string().contains("index 9"));

        let err: Error = QueueError::Interrupted.into();
        assert_eq!(err.to_string(), "interrupted while waiting");
    }
}
