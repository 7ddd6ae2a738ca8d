//! Per-id deferred lookups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use graphload_types::{BaseObject, Item, ObjectId};

use crate::error::{CacheError, CacheResult};

/// Lifetime policy for unanswered deferments.
#[derive(Clone, Debug)]
pub struct DefermentOptions {
    /// How long a deferment may stay pending before the sweep rejects it
    /// with [`CacheError::TimedOut`].
    pub ttl: Duration,
    /// How often the background sweep looks for expired deferments.
    pub sweep_interval: Duration,
}

impl Default for DefermentOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

type Outcome = Option<Result<BaseObject, CacheError>>;

struct Pending {
    tx: watch::Sender<Outcome>,
    created_at: Instant,
}

/// An awaitable handle to an in-flight lookup.
///
/// Every handle for the same id resolves to the same outcome; clones are
/// cheap and may be awaited independently.
#[derive(Clone, Debug)]
pub struct DeferredObject {
    rx: watch::Receiver<Outcome>,
}

impl DeferredObject {
    /// Wait for the lookup to settle.
    pub async fn wait(mut self) -> CacheResult<BaseObject> {
        match self.rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(CacheError::Disposed)),
            // Sender dropped without settling; the manager is gone.
            Err(_) => Err(CacheError::Disposed),
        }
    }
}

/// De-duplicates concurrent lookups of the same object id.
///
/// At most one live entry exists per id; a second `defer` joins the existing
/// entry. Settling removes the entry, so an id may be deferred fresh after an
/// earlier lookup concluded.
pub struct DefermentManager {
    pending: Mutex<HashMap<ObjectId, Pending>>,
    total_requests: AtomicU64,
    options: DefermentOptions,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DefermentManager {
    pub fn new(options: DefermentOptions) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            options,
            sweeper: Mutex::new(None),
        })
    }

    /// Start the background TTL sweep. Must be called from within a tokio
    /// runtime; the task holds only a weak reference and stops by itself once
    /// the manager is dropped.
    pub fn start_sweep(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.options.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_expired();
            }
        });
        *self.sweeper.lock().expect("lock poisoned") = Some(handle);
    }

    /// Register interest in `id`. Returns the awaitable handle and whether
    /// this call created the entry (`true` means the caller owns issuing the
    /// actual lookup).
    pub fn defer(&self, id: &ObjectId) -> (DeferredObject, bool) {
        let mut pending = self.pending.lock().expect("lock poisoned");
        if let Some(entry) = pending.get(id) {
            return (
                DeferredObject {
                    rx: entry.tx.subscribe(),
                },
                false,
            );
        }
        let (tx, rx) = watch::channel(None);
        pending.insert(
            id.clone(),
            Pending {
                tx,
                created_at: Instant::now(),
            },
        );
        (DeferredObject { rx }, true)
    }

    /// Settle the deferment for `item.id`: with the object when found, with
    /// [`CacheError::NotFound`] otherwise. Unknown or already settled ids are
    /// a no-op.
    pub fn undefer(&self, item: &Item) {
        let entry = self.pending.lock().expect("lock poisoned").remove(&item.id);
        if let Some(entry) = entry {
            let outcome = match &item.object {
                Some(object) => Ok(object.clone()),
                None => Err(CacheError::NotFound(item.id.clone())),
            };
            let _ = entry.tx.send(Some(outcome));
        }
    }

    /// Settle the deferment for `id` with an error, freeing the id for a
    /// fresh defer. Used when the request behind a deferment could never be
    /// issued; unknown or already settled ids are a no-op.
    pub fn reject(&self, id: &ObjectId, error: CacheError) {
        let entry = self.pending.lock().expect("lock poisoned").remove(id);
        if let Some(entry) = entry {
            let _ = entry.tx.send(Some(Err(error)));
        }
    }

    /// Record `n` issued lookups for auditing batched fan-outs.
    pub fn track_requests(&self, n: u64) {
        self.total_requests.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Number of currently unsettled deferments.
    pub fn pending(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }

    /// Settle everything still pending with [`CacheError::Disposed`] and
    /// stop the sweep.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().expect("lock poisoned").take() {
            handle.abort();
        }
        let drained: Vec<(ObjectId, Pending)> = self
            .pending
            .lock()
            .expect("lock poisoned")
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "disposing unsettled deferments");
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(Some(Err(CacheError::Disposed)));
        }
    }

    fn sweep_expired(&self) {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let expired: Vec<ObjectId> = pending
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() > self.options.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = pending.remove(&id) {
                warn!(%id, "deferment expired before any source answered");
                let _ = entry.tx.send(Some(Err(CacheError::TimedOut(id))));
            }
        }
    }
}

impl std::fmt::Debug for DefermentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefermentManager")
            .field("pending", &self.pending())
            .field("total_requests", &self.total_requests())
            .finish()
    }
}
