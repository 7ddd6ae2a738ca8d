use graphload_types::ObjectId;
use thiserror::Error;

use crate::store::StoreError;

/// Errors produced by the cache layer.
///
/// `Clone` because a settled lookup outcome is broadcast to every waiter
/// holding a handle to the same deferment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The id was looked up everywhere it could be and does not exist.
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// A deferment outlived its TTL without any source answering it.
    #[error("request for object {0} timed out")]
    TimedOut(ObjectId),

    /// The component was disposed while the operation was pending.
    #[error("cache disposed")]
    Disposed,

    /// The store worker thread never reached its ready state.
    #[error("cache worker failed to initialize: {0}")]
    WorkerInit(String),

    /// An earlier sink failure poisoned the batching accumulator; no further
    /// adds or flushes are accepted.
    #[error("batching accumulator poisoned by an earlier sink failure")]
    BatchPoisoned,

    #[error(transparent)]
    Queue(#[from] graphload_queue::QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CacheResult<T> = Result<T, CacheError>;
