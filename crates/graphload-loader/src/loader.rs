//! The loader orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use graphload_cache::{
    BatchSink, BatchingAccumulator, BatchingOptions, CacheError, CacheOptions, CacheReader,
    CacheResult, DefermentManager, DefermentOptions, FoundSink, MemoryStore, NotFoundSink,
    PersistentStore,
};
use graphload_types::{BaseObject, Item, ObjectId};

use crate::download::{DownloadPoolOptions, Downloader, MemoryDownloader};
use crate::error::{LoaderError, LoaderResult};
use crate::iter::ObjectIterator;

#[derive(Clone, Debug, Default)]
pub struct LoaderOptions {
    pub cache: CacheOptions,
    pub batching: BatchingOptions,
    pub deferments: DefermentOptions,
    pub download_pool: DownloadPoolOptions,
}

/// Write-back sink: downloaded objects become store entries so repeat loads
/// hit the cache.
struct StoreSink {
    store: Arc<dyn PersistentStore>,
}

#[async_trait]
impl BatchSink<ObjectId, BaseObject> for StoreSink {
    async fn process(&self, batch: Vec<(ObjectId, BaseObject)>) -> CacheResult<()> {
        let items: Vec<Item> = batch
            .into_iter()
            .map(|(_, object)| Item::found(object))
            .collect();
        self.store.add_all(&items).map_err(CacheError::from)
    }
}

/// Streams an object graph from cache-plus-downloader into memory.
///
/// Wiring: lookups go through the [`CacheReader`]; cache misses flow out of
/// its not-found sink into the [`Downloader`]; a pump task consumes the
/// downloader's item sequence, settles the waiting deferments, and feeds the
/// write-back accumulator.
pub struct ObjectGraphLoader {
    root_id: ObjectId,
    store: Arc<dyn PersistentStore>,
    downloader: Arc<dyn Downloader>,
    deferments: Arc<DefermentManager>,
    cache: CacheReader,
    accumulator: Arc<BatchingAccumulator<ObjectId, BaseObject>>,
    /// Union of closure keys across every object fetched so far.
    reachable: Mutex<HashSet<ObjectId>>,
    root: Mutex<Option<BaseObject>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    forward: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ObjectGraphLoader {
    pub async fn new(
        root_id: ObjectId,
        store: Arc<dyn PersistentStore>,
        downloader: Arc<dyn Downloader>,
        options: LoaderOptions,
    ) -> LoaderResult<Arc<Self>> {
        let deferments = DefermentManager::new(options.deferments.clone());
        deferments.start_sweep();

        let cache = CacheReader::new(
            Arc::clone(&store),
            Arc::clone(&deferments),
            options.cache.clone(),
        );
        let accumulator = BatchingAccumulator::new(
            Arc::new(StoreSink {
                store: Arc::clone(&store),
            }),
            options.batching.clone(),
        );
        downloader
            .initialize_pool(options.download_pool.clone())
            .await?;

        let (miss_tx, mut miss_rx) = tokio::sync::mpsc::unbounded_channel::<ObjectId>();
        let not_found_sink: NotFoundSink = Box::new(move |id| {
            let _ = miss_tx.send(id);
        });
        let found_sink: FoundSink = Box::new(|item| {
            trace!(id = %item.id, "cache hit drained");
        });
        cache.initialize(found_sink, not_found_sink).await?;

        let loader = Arc::new(Self {
            root_id,
            store,
            downloader: Arc::clone(&downloader),
            deferments,
            cache,
            accumulator,
            reachable: Mutex::new(HashSet::new()),
            root: Mutex::new(None),
            pump: Mutex::new(None),
            forward: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });

        let forward = tokio::spawn({
            let downloader = Arc::clone(&downloader);
            async move {
                while let Some(id) = miss_rx.recv().await {
                    if let Err(error) = downloader.add(id.clone()).await {
                        warn!(%id, error = %error, "failed to hand miss to downloader");
                    }
                }
            }
        });
        let pump = tokio::spawn({
            let loader = Arc::clone(&loader);
            async move { loader.pump_downloads().await }
        });
        *loader.pump.lock().expect("lock poisoned") = Some(pump);
        *loader.forward.lock().expect("lock poisoned") = Some(forward);
        Ok(loader)
    }

    /// Build a loader over an in-memory downloader and a fresh memory store.
    pub async fn from_objects(
        root: BaseObject,
        others: Vec<BaseObject>,
    ) -> LoaderResult<Arc<Self>> {
        let root_id = root.id.clone();
        let mut objects: HashMap<ObjectId, BaseObject> = HashMap::new();
        objects.insert(root_id.clone(), root);
        for object in others {
            objects.insert(object.id.clone(), object);
        }
        let downloader = Arc::new(MemoryDownloader::new(root_id.clone(), objects));
        Self::new(
            root_id,
            Arc::new(MemoryStore::new()),
            downloader,
            LoaderOptions::default(),
        )
        .await
    }

    pub fn root_id(&self) -> &ObjectId {
        &self.root_id
    }

    /// Fetch the root: one direct store read, falling back to the
    /// downloader's dedicated root fetch. Cached after the first call.
    pub async fn get_root_object(&self) -> LoaderResult<BaseObject> {
        if self.disposed.load(Ordering::Relaxed) {
            return Err(LoaderError::Disposed);
        }
        if let Some(root) = self.root.lock().expect("lock poisoned").clone() {
            return Ok(root);
        }

        let cached = self.store.get_all(std::slice::from_ref(&self.root_id))?;
        let object = match cached.into_iter().next().and_then(|item| item.object) {
            Some(object) => object,
            None => {
                debug!(root = %self.root_id, "root not cached; downloading");
                let item = self.downloader.download_single().await?;
                match item.object {
                    Some(object) => {
                        if let Err(error) = self
                            .accumulator
                            .add(object.id.clone(), object.clone())
                            .await
                        {
                            warn!(error = %error, "failed to queue root write-back");
                        }
                        object
                    }
                    None => return Err(LoaderError::NotFound(self.root_id.clone())),
                }
            }
        };
        if object.id != self.root_id {
            return Err(LoaderError::Download(format!(
                "root fetch answered {} instead of {}",
                object.id, self.root_id
            )));
        }

        self.record_object(&object);
        *self.root.lock().expect("lock poisoned") = Some(object.clone());
        Ok(object)
    }

    /// Fetch one object by id. Only ids reachable from the root (through
    /// closures seen so far) are accepted.
    pub async fn get_object(&self, id: &ObjectId) -> LoaderResult<BaseObject> {
        if self.disposed.load(Ordering::Relaxed) {
            return Err(LoaderError::Disposed);
        }
        if *id == self.root_id {
            return self.get_root_object().await;
        }
        if self.root.lock().expect("lock poisoned").is_none() {
            self.get_root_object().await?;
        }
        if !self.is_reachable(id) {
            return Err(LoaderError::Unreachable(id.clone()));
        }
        let object = self.cache.get_object(id).await?;
        self.record_object(&object);
        Ok(object)
    }

    /// Lazy breadth-first traversal over the whole graph.
    pub fn get_object_iterator(self: &Arc<Self>) -> ObjectIterator {
        ObjectIterator::new(Arc::clone(self))
    }

    /// Total number of reachable objects: the root plus the union of closure
    /// keys collected so far. Fetches the root first if needed.
    pub async fn get_total_object_count(&self) -> LoaderResult<usize> {
        self.get_root_object().await?;
        Ok(1 + self.reachable.lock().expect("lock poisoned").len())
    }

    /// Tear down the pipeline back to front: downloader, pump, write-back
    /// accumulator, cache threads, then the remaining deferments.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.downloader.dispose().await;
        let pump = self.pump.lock().expect("lock poisoned").take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        if let Err(error) = self.accumulator.dispose().await {
            warn!(error = %error, "final write-back flush failed");
        }
        self.cache.dispose();
        let forward = self.forward.lock().expect("lock poisoned").take();
        if let Some(forward) = forward {
            let _ = forward.await;
        }
        self.deferments.dispose();
        debug!("loader disposed");
    }

    /// Ask the cache to start resolving `ids` ahead of their traversal.
    pub(crate) async fn prefetch(&self, ids: &[ObjectId]) {
        if let Err(error) = self.cache.request_all(ids).await {
            warn!(error = %error, count = ids.len(), "prefetch request failed");
        }
    }

    fn is_reachable(&self, id: &ObjectId) -> bool {
        self.reachable.lock().expect("lock poisoned").contains(id)
    }

    fn record_object(&self, object: &BaseObject) {
        if let Some(closure) = &object.closure {
            let mut reachable = self.reachable.lock().expect("lock poisoned");
            reachable.extend(closure.keys().cloned());
        }
    }

    async fn pump_downloads(&self) {
        while let Some(item) = self.downloader.next_item().await {
            match item.object.clone() {
                Some(object) => {
                    // Reachability must be recorded before waiters resume,
                    // so a resumed caller can immediately fetch children.
                    self.record_object(&object);
                    self.deferments.undefer(&item);
                    if let Err(error) = self.accumulator.add(object.id.clone(), object).await {
                        warn!(error = %error, "write-back accumulator rejected a download");
                    }
                }
                None => self.deferments.undefer(&item),
            }
        }
        debug!("download pump finished");
    }
}
