//! Foundation types for graphload.
//!
//! This crate provides the data model shared by every other graphload crate:
//! the scene-graph node record and its wire/storage envelope.
//!
//! # Key Types
//!
//! - [`ObjectId`] — Opaque string identifier for a graph node
//! - [`BaseObject`] — A graph node: id, type tag, optional closure, and any
//!   application-defined fields
//! - [`Item`] — The found-or-not-found envelope moved between the cache
//!   worker, the downloader, and the loader
//! - [`Closure`] — Per-object adjacency map from descendant id to reference
//!   count

pub mod base;
pub mod error;
pub mod id;
pub mod item;

pub use base::{BaseObject, Closure};
pub use error::TypeError;
pub use id::ObjectId;
pub use item::Item;
