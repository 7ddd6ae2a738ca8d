//! Cache layer: deferred lookups, write batching, and the off-thread reader.
//!
//! The components here sit between the loader's orchestration code (tokio)
//! and the persistent object store (synchronous, owned by a dedicated worker
//! thread):
//!
//! - [`DefermentManager`] — de-duplicates in-flight lookups per object id and
//!   hands out awaitable [`DeferredObject`] handles, settled exactly once.
//! - [`BatchingAccumulator`] — coalesces keyed writes into size- or
//!   time-triggered batches for a [`BatchSink`].
//! - [`CacheReader`] — owns the request/response message queues, the store
//!   worker thread, and the response drain thread.
//! - [`PersistentStore`] — the synchronous storage seam, with [`MemoryStore`]
//!   as the in-memory reference implementation.

pub mod batch;
pub mod deferment;
pub mod error;
pub mod reader;
pub mod store;
pub mod worker;

pub use batch::{BatchSink, BatchingAccumulator, BatchingOptions};
pub use deferment::{DeferredObject, DefermentManager, DefermentOptions};
pub use error::{CacheError, CacheResult};
pub use reader::{CacheOptions, CacheReader, FoundSink, NotFoundSink};
pub use store::{MemoryStore, PersistentStore, StoreError, StoreResult};
pub use worker::{WorkerControl, WorkerEvent};
