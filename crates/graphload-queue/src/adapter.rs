//! Typed adapters over the byte queue.
//!
//! A [`WireFormat`] turns a domain value into one framed message and back;
//! [`TypedQueue`] pairs a format with a [`BoundedMessageQueue`] so callers
//! deal in values rather than byte slices. The two formats used by the cache
//! worker are [`IdFormat`] (requests) and [`ItemFormat`] (responses).

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{trace, warn};

use graphload_types::{BaseObject, Item, ObjectId};

use crate::error::{QueueError, QueueResult};
use crate::ring::{BoundedMessageQueue, SharedRegion};

/// A codec between one domain value and one framed message payload.
pub trait WireFormat {
    type Value;

    fn encode(&self, value: &Self::Value) -> QueueResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> QueueResult<Self::Value>;
}

/// Object ids on the wire: the id's UTF-8 bytes, nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdFormat;

impl WireFormat for IdFormat {
    type Value = ObjectId;

    fn encode(&self, value: &ObjectId) -> QueueResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> QueueResult<ObjectId> {
        let text = std::str::from_utf8(bytes).map_err(|e| QueueError::Codec(e.to_string()))?;
        ObjectId::new(text).map_err(|e| QueueError::Codec(e.to_string()))
    }
}

/// Items on the wire: `id TAB json-object` when found, the bare id when not.
///
/// The tab never appears inside an id, so the first tab (or its absence)
/// carries the found/not-found bit without a separate flag byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct ItemFormat;

impl WireFormat for ItemFormat {
    type Value = Item;

    fn encode(&self, value: &Item) -> QueueResult<Vec<u8>> {
        let mut out = value.id.as_bytes().to_vec();
        if let Some(object) = &value.object {
            out.push(b'\t');
            match &value.serialized {
                Some(raw) => out.extend_from_slice(raw),
                None => {
                    let json = object
                        .to_json()
                        .map_err(|e| QueueError::Codec(e.to_string()))?;
                    out.extend_from_slice(json.as_bytes());
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> QueueResult<Item> {
        let tab = bytes.iter().position(|&b| b == b'\t');
        let id_bytes = &bytes[..tab.unwrap_or(bytes.len())];
        let id_text =
            std::str::from_utf8(id_bytes).map_err(|e| QueueError::Codec(e.to_string()))?;
        let id = ObjectId::new(id_text).map_err(|e| QueueError::Codec(e.to_string()))?;

        match tab {
            None => Ok(Item::missing(id)),
            Some(pos) => {
                let json = std::str::from_utf8(&bytes[pos + 1..])
                    .map_err(|e| QueueError::Codec(e.to_string()))?;
                let object =
                    BaseObject::from_json(json).map_err(|e| QueueError::Codec(e.to_string()))?;
                Ok(Item {
                    id,
                    object: Some(object),
                    serialized: None,
                    byte_size: None,
                }
                .with_serialized(Bytes::copy_from_slice(json.as_bytes())))
            }
        }
    }
}

/// A value-typed view of a [`BoundedMessageQueue`].
///
/// Carries the same single-producer/single-consumer contract as the
/// underlying queue; the format only governs how values map to frames.
#[derive(Clone, Debug)]
pub struct TypedQueue<F: WireFormat> {
    queue: BoundedMessageQueue,
    format: F,
}

/// Request-direction queue carrying object ids.
pub type IdQueue = TypedQueue<IdFormat>;
/// Response-direction queue carrying found-or-not-found items.
pub type ItemQueue = TypedQueue<ItemFormat>;

impl<F: WireFormat + Default> TypedQueue<F> {
    /// Allocate a fresh typed queue with `capacity_bytes` of data area.
    pub fn create(capacity_bytes: usize) -> Self {
        Self {
            queue: BoundedMessageQueue::create(capacity_bytes),
            format: F::default(),
        }
    }

    /// View an existing shared region from another thread.
    pub fn attach(region: std::sync::Arc<SharedRegion>, capacity_bytes: usize) -> QueueResult<Self> {
        Ok(Self {
            queue: BoundedMessageQueue::attach(region, capacity_bytes)?,
            format: F::default(),
        })
    }
}

impl<F: WireFormat> TypedQueue<F> {
    /// The underlying shared region, for transfer to the opposite end.
    pub fn shared_region(&self) -> std::sync::Arc<SharedRegion> {
        self.queue.shared_region()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue values in order, blocking up to `timeout` per value for space.
    ///
    /// Returns how many values were enqueued. A timeout stops the batch early
    /// without losing the remainder; the caller re-offers the rest later.
    /// Encoding failures and oversized values are hard errors.
    pub fn enqueue(&self, values: &[F::Value], timeout: Duration) -> QueueResult<usize> {
        for (sent, value) in values.iter().enumerate() {
            let frame = self.format.encode(value)?;
            if !self.queue.push(&frame, timeout)? {
                trace!(sent, total = values.len(), "enqueue stopped on backpressure");
                return Ok(sent);
            }
        }
        Ok(values.len())
    }

    /// Dequeue up to `max` values, waiting at most `timeout` in total.
    ///
    /// Returns as soon as `max` values are in hand or the deadline passes;
    /// an empty vec means nothing arrived in time. An undecodable frame is
    /// logged and skipped so its batch-mates still come through.
    pub fn dequeue(&self, max: usize, timeout: Duration) -> Vec<F::Value> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while out.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.queue.shift(remaining) else {
                break;
            };
            match self.format.decode(&frame) {
                Ok(value) => out.push(value),
                Err(error) => {
                    warn!(error = %error, len = frame.len(), "dropping undecodable frame");
                }
            }
        }
        out
    }
}
