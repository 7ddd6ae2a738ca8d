//! Bounded shared-memory message queues.
//!
//! This crate implements the cross-thread transport used between the loader's
//! orchestration thread and the cache worker thread:
//!
//! - [`BoundedMessageQueue`] — a fixed-capacity byte ring buffer carrying
//!   discrete length-prefixed messages, with blocking (timeout-bounded)
//!   enqueue/dequeue/peek. Single producer, single consumer; each end only
//!   ever advances its own offset, so no lock guards the data path.
//! - [`TypedQueue`] — a thin typed wrapper serializing domain values onto a
//!   `BoundedMessageQueue` through a [`WireFormat`] codec. [`IdQueue`]
//!   carries object ids (the request direction); [`ItemQueue`] carries
//!   found-or-not-found [`Item`](graphload_types::Item)s (the response
//!   direction).
//!
//! Timeouts are reported as values (`Ok(false)` / `None` / a short `Vec`),
//! never as errors: the bounded queue exists to provide backpressure, and
//! hitting it is an expected outcome.

pub mod adapter;
pub mod error;
pub mod ring;

pub use adapter::{IdFormat, IdQueue, ItemFormat, ItemQueue, TypedQueue, WireFormat};
pub use error::{QueueError, QueueResult};
pub use ring::{BoundedMessageQueue, SharedRegion};
