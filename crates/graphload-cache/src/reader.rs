//! The cache reader: request/response queues plus the two threads that
//! service them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use graphload_queue::{IdQueue, ItemQueue};
use graphload_types::{BaseObject, Item, ObjectId};

use crate::deferment::DefermentManager;
use crate::error::{CacheError, CacheResult};
use crate::store::PersistentStore;
use crate::worker::{self, WorkerControl, WorkerEvent};

/// Receives every found item the drain loop pulls off the response queue.
pub type FoundSink = Box<dyn Fn(Item) + Send + Sync>;
/// Receives the id of every cache miss; the deferment for that id stays
/// pending so a slower source can still answer it.
pub type NotFoundSink = Box<dyn Fn(ObjectId) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Request ring capacity in bytes.
    pub request_capacity: usize,
    /// Response ring capacity in bytes.
    pub response_capacity: usize,
    /// Maximum ids per worker read and items per drain iteration.
    pub read_batch_size: usize,
    /// How long one enqueue attempt may block on a full ring.
    pub enqueue_timeout: Duration,
    /// Total budget for retrying a partially enqueued request batch.
    pub request_timeout: Duration,
    /// Thread name prefix.
    pub name: String,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            request_capacity: 16 * 1024,
            response_capacity: 16 * 1024,
            read_batch_size: 10,
            enqueue_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_secs(2),
            name: "cache".into(),
        }
    }
}

struct Running {
    requests: IdQueue,
    control: mpsc::Sender<WorkerControl>,
    worker: thread::JoinHandle<()>,
    drain: thread::JoinHandle<()>,
    events: thread::JoinHandle<()>,
}

/// Front end of the off-thread store read path.
///
/// `initialize` builds the queues and spawns the worker and drain threads;
/// after that, lookups are cheap: a deferment plus (for the first requester
/// of an id) one frame on the request ring.
pub struct CacheReader {
    options: CacheOptions,
    store: Arc<dyn PersistentStore>,
    deferments: Arc<DefermentManager>,
    running: Mutex<Option<Running>>,
    stopping: Arc<AtomicBool>,
}

impl CacheReader {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        deferments: Arc<DefermentManager>,
        options: CacheOptions,
    ) -> Self {
        Self {
            options,
            store,
            deferments,
            running: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the worker and drain threads and wait for the worker to attach
    /// the queues. Idempotent; a second call is a no-op.
    pub async fn initialize(
        &self,
        found_sink: FoundSink,
        not_found_sink: NotFoundSink,
    ) -> CacheResult<()> {
        let mut running = self.running.lock().expect("lock poisoned");
        if running.is_some() {
            return Ok(());
        }

        let requests = IdQueue::create(self.options.request_capacity);
        let responses = ItemQueue::create(self.options.response_capacity);
        let (control_tx, control_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let store = Arc::clone(&self.store);
        let batch = self.options.read_batch_size;
        let worker = thread::Builder::new()
            .name(format!("{}-worker", self.options.name))
            .spawn(move || worker::run(store, control_rx, event_tx, batch))
            .map_err(|e| CacheError::WorkerInit(e.to_string()))?;

        control_tx
            .send(WorkerControl::InitQueues {
                request_region: requests.shared_region(),
                request_capacity: self.options.request_capacity,
                response_region: responses.shared_region(),
                response_capacity: self.options.response_capacity,
                name: self.options.name.clone(),
            })
            .map_err(|_| CacheError::WorkerInit("worker exited before init".into()))?;

        match event_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(WorkerEvent::Ready) => {}
            Ok(WorkerEvent::InitFailed(reason)) => return Err(CacheError::WorkerInit(reason)),
            Ok(WorkerEvent::ProcessingError(reason)) => {
                return Err(CacheError::WorkerInit(reason))
            }
            Err(_) => return Err(CacheError::WorkerInit("worker never became ready".into())),
        }

        let deferments = Arc::clone(&self.deferments);
        let stopping = Arc::clone(&self.stopping);
        let drain = thread::Builder::new()
            .name(format!("{}-drain", self.options.name))
            .spawn(move || {
                drain_loop(responses, deferments, found_sink, not_found_sink, batch, stopping)
            })
            .map_err(|e| CacheError::WorkerInit(e.to_string()))?;

        let name = self.options.name.clone();
        let events = thread::Builder::new()
            .name(format!("{}-events", self.options.name))
            .spawn(move || {
                for event in event_rx {
                    if let WorkerEvent::ProcessingError(reason) = event {
                        error!(worker = %name, %reason, "cache worker processing error");
                    }
                }
            })
            .map_err(|e| CacheError::WorkerInit(e.to_string()))?;

        *running = Some(Running {
            requests,
            control: control_tx,
            worker,
            drain,
            events,
        });
        debug!(name = %self.options.name, "cache reader initialized");
        Ok(())
    }

    /// Look up one object, deferring until the worker (or, on a miss,
    /// whatever consumes the not-found sink) answers.
    pub async fn get_object(&self, id: &ObjectId) -> CacheResult<BaseObject> {
        let (deferred, created) = self.deferments.defer(id);
        if created {
            self.deferments.track_requests(1);
            if let Err(error) = self.issue_request(id) {
                // A request that never reached the ring can never be
                // answered; settle the deferment so a retry starts fresh
                // instead of joining an orphan.
                self.deferments.reject(id, error.clone());
                return Err(error);
            }
        }
        deferred.wait().await
    }

    /// Defer every id and enqueue the ones not already in flight, retrying
    /// partial enqueues until the request timeout budget runs out. Ids that
    /// never reach the ring have their deferments rejected. Returns how many
    /// ids were actually enqueued.
    pub async fn request_all(&self, ids: &[ObjectId]) -> CacheResult<usize> {
        self.deferments.track_requests(ids.len() as u64);
        let fresh: Vec<ObjectId> = ids
            .iter()
            .filter(|id| self.deferments.defer(id).1)
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        let outcome = self
            .request_queue()
            .and_then(|requests| self.enqueue_with_retry(&requests, &fresh));
        match outcome {
            Ok(sent) => {
                if sent < fresh.len() {
                    warn!(
                        sent,
                        total = fresh.len(),
                        "request batch only partially enqueued"
                    );
                    for id in &fresh[sent..] {
                        self.deferments.reject(id, CacheError::TimedOut(id.clone()));
                    }
                }
                Ok(sent)
            }
            Err(error) => {
                for id in &fresh {
                    self.deferments.reject(id, error.clone());
                }
                Err(error)
            }
        }
    }

    /// Stop both threads and join them. Pending deferments are left to the
    /// manager's TTL sweep or `dispose`.
    pub fn dispose(&self) {
        let running = self.running.lock().expect("lock poisoned").take();
        if let Some(running) = running {
            self.stopping.store(true, Ordering::Relaxed);
            let _ = running.control.send(WorkerControl::Dispose);
            let _ = running.worker.join();
            let _ = running.drain.join();
            let _ = running.events.join();
            debug!(name = %self.options.name, "cache reader disposed");
        }
    }

    fn issue_request(&self, id: &ObjectId) -> CacheResult<()> {
        let requests = self.request_queue()?;
        let sent = self.enqueue_with_retry(&requests, std::slice::from_ref(id))?;
        if sent == 0 {
            warn!(%id, "request queue full for the whole retry budget");
            return Err(CacheError::TimedOut(id.clone()));
        }
        Ok(())
    }

    fn request_queue(&self) -> CacheResult<IdQueue> {
        self.running
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|r| r.requests.clone())
            .ok_or(CacheError::Disposed)
    }

    fn enqueue_with_retry(&self, requests: &IdQueue, ids: &[ObjectId]) -> CacheResult<usize> {
        let deadline = Instant::now() + self.options.request_timeout;
        let mut sent = 0;
        while sent < ids.len() {
            let n = requests.enqueue(&ids[sent..], self.options.enqueue_timeout)?;
            sent += n;
            if n == 0 && Instant::now() >= deadline {
                break;
            }
        }
        Ok(sent)
    }
}

fn drain_loop(
    responses: ItemQueue,
    deferments: Arc<DefermentManager>,
    found_sink: FoundSink,
    not_found_sink: NotFoundSink,
    batch: usize,
    stopping: Arc<AtomicBool>,
) {
    const POLL: Duration = Duration::from_millis(50);

    while !stopping.load(Ordering::Relaxed) {
        for item in responses.dequeue(batch, POLL) {
            if item.is_found() {
                found_sink(item.clone());
                deferments.undefer(&item);
            } else {
                // The miss is handed onward; the deferment stays pending so
                // the slower source can settle it.
                not_found_sink(item.id.clone());
            }
        }
    }
    debug!("drain loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferment::DefermentOptions;
    use crate::store::{MemoryStore, StoreResult};
    use graphload_types::BaseObject;
    use std::sync::Condvar;

    fn sinks() -> (
        FoundSink,
        NotFoundSink,
        Arc<Mutex<Vec<ObjectId>>>,
        Arc<Mutex<Vec<ObjectId>>>,
    ) {
        let found = Arc::new(Mutex::new(Vec::new()));
        let missed = Arc::new(Mutex::new(Vec::new()));
        let found_in = Arc::clone(&found);
        let missed_in = Arc::clone(&missed);
        let found_sink: FoundSink = Box::new(move |item: Item| {
            found_in.lock().expect("lock poisoned").push(item.id);
        });
        let not_found_sink: NotFoundSink = Box::new(move |id| {
            missed_in.lock().expect("lock poisoned").push(id);
        });
        (found_sink, not_found_sink, found, missed)
    }

    fn reader_over(store: Arc<MemoryStore>) -> (CacheReader, Arc<DefermentManager>) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let deferments = DefermentManager::new(DefermentOptions::default());
        let reader = CacheReader::new(store, Arc::clone(&deferments), CacheOptions::default());
        (reader, deferments)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hit_resolves_through_the_worker() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_all(&[Item::found(BaseObject::new("hit", "Base"))])
            .unwrap();
        let (reader, _deferments) = reader_over(store);
        let (found_sink, not_found_sink, found, _) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();

        let object = reader.get_object(&ObjectId::from("hit")).await.unwrap();
        assert_eq!(object.id.as_str(), "hit");
        assert_eq!(found.lock().unwrap().as_slice(), &[ObjectId::from("hit")]);

        reader.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn miss_goes_to_the_not_found_sink_and_stays_pending() {
        let store = Arc::new(MemoryStore::new());
        let (reader, deferments) = reader_over(store);
        let (found_sink, not_found_sink, _, missed) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();

        let reader = Arc::new(reader);
        let lookup = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::from("slow")).await })
        };

        // Wait for the miss to surface.
        let deadline = Instant::now() + Duration::from_secs(2);
        while missed.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "miss never surfaced");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(deferments.pending(), 1);

        // A slower source answers; the original lookup resolves.
        deferments.undefer(&Item::found(BaseObject::new("slow", "Base")));
        let object = lookup.await.unwrap().unwrap();
        assert_eq!(object.id.as_str(), "slow");

        reader.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_all_skips_ids_already_in_flight() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_all(&[
                Item::found(BaseObject::new("a", "Base")),
                Item::found(BaseObject::new("b", "Base")),
            ])
            .unwrap();
        let (reader, deferments) = reader_over(store);
        let (found_sink, not_found_sink, _, _) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();

        let (_handle, created) = deferments.defer(&ObjectId::from("a"));
        assert!(created);
        let sent = reader
            .request_all(&[ObjectId::from("a"), ObjectId::from("b")])
            .await
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(deferments.total_requests(), 2);

        reader.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_all_retries_past_a_full_ring() {
        let store = Arc::new(MemoryStore::new());
        let ids: Vec<ObjectId> = (0..40)
            .map(|i| ObjectId::from(format!("obj-{i:03}")))
            .collect();
        let items: Vec<Item> = ids
            .iter()
            .map(|id| Item::found(BaseObject::new(id.as_str(), "Base")))
            .collect();
        store.add_all(&items).unwrap();

        let deferments = DefermentManager::new(DefermentOptions::default());
        // A request ring too small for the whole batch at once.
        let reader = CacheReader::new(
            store,
            Arc::clone(&deferments),
            CacheOptions {
                request_capacity: 64,
                ..CacheOptions::default()
            },
        );
        let (found_sink, not_found_sink, found, _) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();

        let sent = reader.request_all(&ids).await.unwrap();
        assert_eq!(sent, ids.len());

        let deadline = Instant::now() + Duration::from_secs(5);
        while found.lock().unwrap().len() < ids.len() {
            assert!(Instant::now() < deadline, "answers never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(deferments.pending(), 0);

        reader.dispose();
    }

    /// Store whose reads block until the gate opens, pinning the worker
    /// mid-batch so the request ring can be held full.
    struct GatedStore {
        inner: MemoryStore,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl GatedStore {
        fn new(inner: MemoryStore) -> (Arc<Self>, Arc<(Mutex<bool>, Condvar)>) {
            let gate = Arc::new((Mutex::new(false), Condvar::new()));
            (
                Arc::new(Self {
                    inner,
                    gate: Arc::clone(&gate),
                }),
                gate,
            )
        }
    }

    fn open_gate(gate: &(Mutex<bool>, Condvar)) {
        *gate.0.lock().expect("lock poisoned") = true;
        gate.1.notify_all();
    }

    impl PersistentStore for GatedStore {
        fn get_all(&self, ids: &[ObjectId]) -> StoreResult<Vec<Item>> {
            let (flag, cv) = &*self.gate;
            let mut open = flag.lock().expect("lock poisoned");
            while !*open {
                open = cv.wait(open).expect("lock poisoned");
            }
            drop(open);
            self.inner.get_all(ids)
        }

        fn add_all(&self, items: &[Item]) -> StoreResult<()> {
            self.inner.add_all(items)
        }
    }

    /// Options sized so a single 8-byte id fills the request ring and the
    /// retry budget expires quickly.
    fn tight_ring_options() -> CacheOptions {
        CacheOptions {
            request_capacity: 16,
            enqueue_timeout: Duration::from_millis(50),
            request_timeout: Duration::from_millis(100),
            ..CacheOptions::default()
        }
    }

    fn gated_reader() -> (Arc<CacheReader>, Arc<DefermentManager>, Arc<(Mutex<bool>, Condvar)>) {
        let inner = MemoryStore::new();
        for id in ["aaaaaaaa", "bbbbbbbb", "cccccccc"] {
            inner
                .add_all(&[Item::found(BaseObject::new(id, "Base"))])
                .unwrap();
        }
        let (store, gate) = GatedStore::new(inner);
        let deferments = DefermentManager::new(DefermentOptions::default());
        let reader = Arc::new(CacheReader::new(
            store,
            Arc::clone(&deferments),
            tight_ring_options(),
        ));
        (reader, deferments, gate)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_enqueue_does_not_orphan_the_deferment() {
        let (reader, deferments, gate) = gated_reader();
        let (found_sink, not_found_sink, _, _) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();

        // First lookup: the worker takes the id off the ring, then blocks in
        // the store until the gate opens.
        let first = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::from("aaaaaaaa")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Second lookup fills the ring while the worker is stuck.
        let second = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::from("bbbbbbbb")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Third lookup cannot enqueue within its budget; its deferment must
        // not linger as an orphan.
        assert_eq!(
            reader.get_object(&ObjectId::from("cccccccc")).await,
            Err(CacheError::TimedOut(ObjectId::from("cccccccc")))
        );
        assert_eq!(deferments.pending(), 2);

        open_gate(&gate);
        assert_eq!(first.await.unwrap().unwrap().id.as_str(), "aaaaaaaa");
        assert_eq!(second.await.unwrap().unwrap().id.as_str(), "bbbbbbbb");

        // The retried id defers fresh and resolves now that the ring has
        // space again.
        assert_eq!(
            reader
                .get_object(&ObjectId::from("cccccccc"))
                .await
                .unwrap()
                .id
                .as_str(),
            "cccccccc"
        );
        reader.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_all_rejects_the_unenqueued_remainder() {
        let (reader, deferments, gate) = gated_reader();
        let (found_sink, not_found_sink, _, _) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();

        let first = {
            let reader = Arc::clone(&reader);
            tokio::spawn(async move { reader.get_object(&ObjectId::from("aaaaaaaa")).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = reader
            .request_all(&[ObjectId::from("bbbbbbbb"), ObjectId::from("cccccccc")])
            .await
            .unwrap();
        assert_eq!(sent, 1);
        // Only the blocked first lookup and the enqueued id stay pending;
        // the remainder was rejected, so it can be deferred fresh.
        assert_eq!(deferments.pending(), 2);
        assert!(deferments.defer(&ObjectId::from("cccccccc")).1);
        deferments.undefer(&Item::missing("cccccccc"));

        open_gate(&gate);
        assert_eq!(first.await.unwrap().unwrap().id.as_str(), "aaaaaaaa");
        reader.dispose();
    }

    #[test]
    fn drain_survives_an_undecodable_frame() {
        let raw = graphload_queue::BoundedMessageQueue::create(1024);
        let responses = ItemQueue::attach(raw.shared_region(), 1024).unwrap();
        let deferments = DefermentManager::new(DefermentOptions::default());
        let (found_sink, not_found_sink, found, _) = sinks();
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let deferments = Arc::clone(&deferments);
            let stopping = Arc::clone(&stopping);
            thread::spawn(move || {
                drain_loop(responses, deferments, found_sink, not_found_sink, 10, stopping)
            })
        };

        // A frame that is not valid UTF-8 cannot decode to any item.
        raw.push(&[0xff, 0xfe], Duration::from_secs(1)).unwrap();
        raw.push(b"ok\t{\"id\":\"ok\"}", Duration::from_secs(1))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while found.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "drain never recovered");
            thread::sleep(Duration::from_millis(10));
        }
        stopping.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn get_object_after_dispose_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let (reader, _deferments) = reader_over(store);
        let (found_sink, not_found_sink, _, _) = sinks();
        reader.initialize(found_sink, not_found_sink).await.unwrap();
        reader.dispose();

        assert!(matches!(
            reader.get_object(&ObjectId::from("x")).await,
            Err(CacheError::Disposed)
        ));
    }
}
