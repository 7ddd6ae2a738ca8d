//! Object-graph loading: download orchestration over the cache layer.
//!
//! Key types:
//!
//! - [`ObjectGraphLoader`] — wires the cache reader, deferment manager,
//!   write-back accumulator, and a [`Downloader`] into one pipeline, and
//!   exposes the public loading operations (`get_root_object`, `get_object`,
//!   `get_object_iterator`, `get_total_object_count`).
//! - [`ObjectIterator`] — lazy breadth-first traversal, each object exactly
//!   once, heavily shared children first.
//! - [`Downloader`] — the seam to whatever produces objects the cache does
//!   not have; [`MemoryDownloader`] is the in-memory reference.

pub mod download;
pub mod error;
pub mod iter;
pub mod loader;

pub use download::{DownloadPoolOptions, Downloader, MemoryDownloader};
pub use error::{LoaderError, LoaderResult};
pub use iter::ObjectIterator;
pub use loader::{LoaderOptions, ObjectGraphLoader};
