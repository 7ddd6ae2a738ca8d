//! The persistent storage seam.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use graphload_types::{Item, ObjectId};

/// Errors surfaced by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Synchronous object storage.
///
/// Called only from the cache worker thread on the read side and from the
/// batching accumulator's sink on the write side, so implementations can be
/// plain blocking code.
pub trait PersistentStore: Send + Sync {
    /// Look up every id, answering each one: a found [`Item`] carries the
    /// object, a missing one carries `object: None`. The result has the same
    /// length and order as `ids`.
    fn get_all(&self, ids: &[ObjectId]) -> StoreResult<Vec<Item>>;

    /// Persist found items. Items without an object are skipped.
    fn add_all(&self, items: &[Item]) -> StoreResult<()>;
}

/// In-memory reference store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, Item>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(id)
    }
}

impl PersistentStore for MemoryStore {
    fn get_all(&self, ids: &[ObjectId]) -> StoreResult<Vec<Item>> {
        let objects = self.objects.read().expect("lock poisoned");
        Ok(ids
            .iter()
            .map(|id| match objects.get(id) {
                Some(item) => item.clone(),
                None => Item::missing(id.clone()),
            })
            .collect())
    }

    fn add_all(&self, items: &[Item]) -> StoreResult<()> {
        let mut objects = self.objects.write().expect("lock poisoned");
        let mut stored = 0usize;
        for item in items {
            if item.is_found() {
                objects.insert(item.id.clone(), item.clone());
                stored += 1;
            }
        }
        debug!(stored, offered = items.len(), "persisted batch");
        Ok(())
    }
}
