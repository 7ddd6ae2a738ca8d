//! Lazy breadth-first graph traversal.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use graphload_types::{BaseObject, ObjectId};

use crate::error::LoaderResult;
use crate::loader::ObjectGraphLoader;

/// Breadth-first iterator over every object reachable from the root.
///
/// Each id is yielded exactly once; within one object, children are visited
/// in descending closure-count order. A per-id failure (typically not-found)
/// is yielded in place and the traversal continues with the remaining queue.
/// A fresh iterator starts over from the root with its own visited set.
pub struct ObjectIterator {
    loader: Arc<ObjectGraphLoader>,
    queue: VecDeque<ObjectId>,
    visited: HashSet<ObjectId>,
}

impl ObjectIterator {
    pub(crate) fn new(loader: Arc<ObjectGraphLoader>) -> Self {
        let root = loader.root_id().clone();
        let mut visited = HashSet::new();
        visited.insert(root.clone());
        Self {
            loader,
            queue: VecDeque::from([root]),
            visited,
        }
    }

    /// Yield the next object, or `None` when the traversal is exhausted.
    pub async fn next(&mut self) -> Option<LoaderResult<BaseObject>> {
        let id = self.queue.pop_front()?;
        match self.loader.get_object(&id).await {
            Ok(object) => {
                let mut fresh = Vec::new();
                for child in object.children_by_count() {
                    if self.visited.insert(child.clone()) {
                        fresh.push(child);
                    }
                }
                if !fresh.is_empty() {
                    self.loader.prefetch(&fresh).await;
                    self.queue.extend(fresh);
                }
                Some(Ok(object))
            }
            Err(error) => Some(Err(error)),
        }
    }
}
