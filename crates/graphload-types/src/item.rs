use bytes::Bytes;

use crate::base::BaseObject;
use crate::id::ObjectId;

/// The wire/storage envelope around a graph node.
///
/// An `Item` answers "what do you have for this id?": `object` present means
/// found, absent means the answering source does not have it. Items are value
/// types; they are copied across the queue boundary rather than shared.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: ObjectId,
    pub object: Option<BaseObject>,
    /// Raw serialized form, when the source already had one on hand.
    pub serialized: Option<Bytes>,
    pub byte_size: Option<usize>,
}

impl Item {
    /// An item answering "found" for the object's own id.
    pub fn found(object: BaseObject) -> Self {
        Self {
            id: object.id.clone(),
            object: Some(object),
            serialized: None,
            byte_size: None,
        }
    }

    /// An item answering "not found" for `id`.
    pub fn missing(id: impl Into<ObjectId>) -> Self {
        Self {
            id: id.into(),
            object: None,
            serialized: None,
            byte_size: None,
        }
    }

    /// Attach the serialized bytes this item was materialized from.
    pub fn with_serialized(mut self, bytes: Bytes) -> Self {
        self.byte_size = Some(bytes.len());
        self.serialized = Some(bytes);
        self
    }

    /// Returns `true` if the answering source had the object.
    pub fn is_found(&self) -> bool {
        self.object.is_some()
    }
}
