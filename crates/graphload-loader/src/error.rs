use graphload_types::ObjectId;
use thiserror::Error;

use graphload_cache::{CacheError, StoreError};

/// Errors produced by the loader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// The id does not exist in any source the loader can reach.
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// The id is not in the closure of any object fetched so far; the loader
    /// refuses to issue speculative lookups.
    #[error("object {0} is not reachable from the root")]
    Unreachable(ObjectId),

    #[error("download failed: {0}")]
    Download(String),

    #[error("loader disposed")]
    Disposed,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type LoaderResult<T> = Result<T, LoaderError>;
