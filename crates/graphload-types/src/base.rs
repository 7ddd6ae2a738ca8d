use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TypeError;
use crate::id::ObjectId;

/// Per-object adjacency map: descendant id to reference count.
///
/// The count is historically a depth/weight; reachability treats it as
/// "reachable at least once" (a set, not a multiset).
pub type Closure = HashMap<ObjectId, u32>;

/// A scene-graph node.
///
/// Every object carries a unique id and a type tag; objects that reference
/// other objects carry a closure enumerating the ids reachable through them.
/// Any further fields the producing application attached are preserved
/// verbatim in [`extra`] so the record round-trips losslessly.
///
/// `BaseObject`s are immutable once constructed and cheap to clone relative
/// to refetching them.
///
/// [`extra`]: BaseObject::extra
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaseObject {
    pub id: ObjectId,

    #[serde(rename = "speckle_type", default)]
    pub speckle_type: String,

    #[serde(rename = "__closure", default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<Closure>,

    /// Application-defined fields, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BaseObject {
    /// Create a leaf object (no closure).
    pub fn new(id: impl Into<ObjectId>, speckle_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            speckle_type: speckle_type.into(),
            closure: None,
            extra: Map::new(),
        }
    }

    /// Create an object carrying a closure over its descendants.
    pub fn with_closure(
        id: impl Into<ObjectId>,
        speckle_type: impl Into<String>,
        closure: Closure,
    ) -> Self {
        Self {
            id: id.into(),
            speckle_type: speckle_type.into(),
            closure: Some(closure),
            extra: Map::new(),
        }
    }

    /// Ids of direct descendants, sorted by reference count descending.
    ///
    /// Higher-count ids come first so that heavily shared objects are
    /// requested before the long tail. Objects without a closure yield an
    /// empty vec.
    pub fn children_by_count(&self) -> Vec<ObjectId> {
        let Some(closure) = &self.closure else {
            return Vec::new();
        };
        let mut children: Vec<(&ObjectId, &u32)> = closure.iter().collect();
        children.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        children.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Number of entries in this object's closure (0 if none).
    pub fn closure_len(&self) -> usize {
        self.closure.as_ref().map_or(0, HashMap::len)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String, TypeError> {
        serde_json::to_string(self).map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Parse from the JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, TypeError> {
        serde_json::from_str(json).map_err(|e| TypeError::Serialization(e.to_string()))
    }
}
