//! The download seam.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use graphload_types::{BaseObject, Item, ObjectId};

use crate::error::{LoaderError, LoaderResult};

#[derive(Clone, Debug)]
pub struct DownloadPoolOptions {
    /// How many fetches the implementation may run concurrently.
    pub concurrency: usize,
}

impl Default for DownloadPoolOptions {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Source of objects the cache does not have.
///
/// Ids are fed in through [`add`](Self::add); the resulting items come back
/// as a lazy sequence through [`next_item`](Self::next_item), in whatever
/// order the implementation completes them. [`download_single`](Self::
/// download_single) is the dedicated root fetch.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn initialize_pool(&self, options: DownloadPoolOptions) -> LoaderResult<()>;

    /// Queue one id for download. An id the source does not have still
    /// produces an item (with `object: None`).
    async fn add(&self, id: ObjectId) -> LoaderResult<()>;

    /// Fetch the root object directly, bypassing the id queue.
    async fn download_single(&self) -> LoaderResult<Item>;

    /// Next completed download; `None` once disposed and drained.
    async fn next_item(&self) -> Option<Item>;

    async fn dispose(&self);
}

/// Downloader backed by a prepared in-memory object map.
pub struct MemoryDownloader {
    root_id: ObjectId,
    objects: HashMap<ObjectId, BaseObject>,
    tx: Mutex<Option<UnboundedSender<Item>>>,
    rx: AsyncMutex<UnboundedReceiver<Item>>,
}

impl MemoryDownloader {
    pub fn new(root_id: ObjectId, objects: HashMap<ObjectId, BaseObject>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            root_id,
            objects,
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        }
    }
}

#[async_trait]
impl Downloader for MemoryDownloader {
    async fn initialize_pool(&self, options: DownloadPoolOptions) -> LoaderResult<()> {
        debug!(concurrency = options.concurrency, "memory downloader ready");
        Ok(())
    }

    async fn add(&self, id: ObjectId) -> LoaderResult<()> {
        let item = match self.objects.get(&id) {
            Some(object) => Item::found(object.clone()),
            None => Item::missing(id),
        };
        let tx = self.tx.lock().expect("lock poisoned").clone();
        match tx {
            Some(tx) => tx.send(item).map_err(|_| LoaderError::Disposed),
            None => Err(LoaderError::Disposed),
        }
    }

    async fn download_single(&self) -> LoaderResult<Item> {
        match self.objects.get(&self.root_id) {
            Some(object) => Ok(Item::found(object.clone())),
            None => Err(LoaderError::NotFound(self.root_id.clone())),
        }
    }

    async fn next_item(&self) -> Option<Item> {
        self.rx.lock().await.recv().await
    }

    async fn dispose(&self) {
        self.tx.lock().expect("lock poisoned").take();
    }
}
