//! The store worker thread.
//!
//! The worker models a message-passing boundary: it starts knowing nothing,
//! and its first control message must carry the shared queue regions. State
//! machine: `Uninitialized -> Ready -> Disposed`, with a terminal error state
//! when the first message is malformed or the queues cannot be attached (the
//! spawner learns of it through [`WorkerEvent::InitFailed`] and no messages
//! are processed afterward).

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use graphload_queue::{IdQueue, ItemQueue, SharedRegion};

use crate::store::PersistentStore;

/// How long one request-drain poll waits before re-checking control.
const POLL: Duration = Duration::from_millis(50);
/// How long one response push may block before the partial enqueue is
/// retried (with a dispose check in between).
const PUSH_TIMEOUT: Duration = Duration::from_millis(100);

/// Control messages into the worker.
pub enum WorkerControl {
    /// Must be the first message: the queue regions this worker serves.
    InitQueues {
        request_region: Arc<SharedRegion>,
        request_capacity: usize,
        response_region: Arc<SharedRegion>,
        response_capacity: usize,
        name: String,
    },
    Dispose,
}

/// Lifecycle and fault events out of the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Ready,
    InitFailed(String),
    /// A store or queue failure inside the ready loop; the worker keeps
    /// running.
    ProcessingError(String),
}

/// Worker thread body: attach queues, then loop draining request ids,
/// reading the store, and enqueueing the answers.
pub(crate) fn run(
    store: Arc<dyn PersistentStore>,
    control: Receiver<WorkerControl>,
    events: Sender<WorkerEvent>,
    batch_size: usize,
) {
    let (requests, responses, name) = match control.recv() {
        Ok(WorkerControl::InitQueues {
            request_region,
            request_capacity,
            response_region,
            response_capacity,
            name,
        }) => {
            let attached = IdQueue::attach(request_region, request_capacity).and_then(|req| {
                ItemQueue::attach(response_region, response_capacity).map(|resp| (req, resp))
            });
            match attached {
                Ok((requests, responses)) => (requests, responses, name),
                Err(error) => {
                    let _ = events.send(WorkerEvent::InitFailed(error.to_string()));
                    return;
                }
            }
        }
        Ok(WorkerControl::Dispose) => {
            let _ = events.send(WorkerEvent::InitFailed(
                "disposed before initialization".into(),
            ));
            return;
        }
        Err(_) => {
            let _ = events.send(WorkerEvent::InitFailed(
                "control channel closed before initialization".into(),
            ));
            return;
        }
    };

    let _ = events.send(WorkerEvent::Ready);
    info!(worker = %name, "cache worker ready");

    'serve: loop {
        if saw_dispose(&control, &name) {
            break;
        }

        let ids = requests.dequeue(batch_size, POLL);
        if ids.is_empty() {
            continue;
        }

        let items = match store.get_all(&ids) {
            Ok(items) => items,
            Err(error) => {
                let _ = events.send(WorkerEvent::ProcessingError(error.to_string()));
                continue;
            }
        };

        let mut rest = items.as_slice();
        while !rest.is_empty() {
            match responses.enqueue(rest, PUSH_TIMEOUT) {
                Ok(sent) => rest = &rest[sent..],
                Err(error) => {
                    // An unencodable or oversized item; drop the remainder of
                    // this batch rather than stall forever.
                    let _ = events.send(WorkerEvent::ProcessingError(error.to_string()));
                    break;
                }
            }
            if !rest.is_empty() && saw_dispose(&control, &name) {
                break 'serve;
            }
        }
    }

    debug!(worker = %name, "cache worker stopped");
}

fn saw_dispose(control: &Receiver<WorkerControl>, name: &str) -> bool {
    loop {
        match control.try_recv() {
            Ok(WorkerControl::Dispose) => return true,
            Ok(WorkerControl::InitQueues { .. }) => {
                warn!(worker = %name, "ignoring re-initialization of a ready worker");
            }
            Err(TryRecvError::Disconnected) => return true,
            Err(TryRecvError::Empty) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use graphload_types::{BaseObject, Item, ObjectId};
    use std::sync::mpsc;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        control: mpsc::Sender<WorkerControl>,
        events: mpsc::Receiver<WorkerEvent>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_worker(store: Arc<MemoryStore>) -> Harness {
        let (control_tx, control_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let handle = thread::spawn(move || run(store, control_rx, event_tx, 10));
        Harness {
            control: control_tx,
            events: event_rx,
            handle,
        }
    }

    fn init_message(requests: &IdQueue, responses: &ItemQueue) -> WorkerControl {
        WorkerControl::InitQueues {
            request_region: requests.shared_region(),
            request_capacity: requests.capacity(),
            response_region: responses.shared_region(),
            response_capacity: responses.capacity(),
            name: "test".into(),
        }
    }

    #[test]
    fn worker_answers_found_and_missing_ids() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_all(&[Item::found(BaseObject::new("hit", "Base"))])
            .unwrap();

        let requests = IdQueue::create(1024);
        let responses = ItemQueue::create(4096);
        let harness = spawn_worker(store);
        harness
            .control
            .send(init_message(&requests, &responses))
            .unwrap();
        assert_eq!(harness.events.recv_timeout(WAIT).unwrap(), WorkerEvent::Ready);

        requests
            .enqueue(&[ObjectId::from("hit"), ObjectId::from("miss")], WAIT)
            .unwrap();
        let items = responses.dequeue(2, WAIT);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_found());
        assert_eq!(items[0].id.as_str(), "hit");
        assert!(!items[1].is_found());
        assert_eq!(items[1].id.as_str(), "miss");

        harness.control.send(WorkerControl::Dispose).unwrap();
        harness.handle.join().unwrap();
    }

    #[test]
    fn dispose_as_first_message_is_an_init_failure() {
        let harness = spawn_worker(Arc::new(MemoryStore::new()));
        harness.control.send(WorkerControl::Dispose).unwrap();
        assert!(matches!(
            harness.events.recv_timeout(WAIT).unwrap(),
            WorkerEvent::InitFailed(_)
        ));
        harness.handle.join().unwrap();
    }

    #[test]
    fn capacity_mismatch_is_an_init_failure() {
        let requests = IdQueue::create(1024);
        let responses = ItemQueue::create(4096);
        let harness = spawn_worker(Arc::new(MemoryStore::new()));
        harness
            .control
            .send(WorkerControl::InitQueues {
                request_region: requests.shared_region(),
                request_capacity: 2048, // wrong on purpose
                response_region: responses.shared_region(),
                response_capacity: responses.capacity(),
                name: "test".into(),
            })
            .unwrap();
        assert!(matches!(
            harness.events.recv_timeout(WAIT).unwrap(),
            WorkerEvent::InitFailed(_)
        ));
        harness.handle.join().unwrap();
    }

    #[test]
    fn worker_retries_partial_response_enqueues() {
        let store = Arc::new(MemoryStore::new());
        let items: Vec<Item> = (0..8)
            .map(|i| Item::found(BaseObject::new(format!("obj-{i}"), "Base")))
            .collect();
        store.add_all(&items).unwrap();

        let requests = IdQueue::create(1024);
        // Small response ring: all eight answers cannot be in flight at once.
        let responses = ItemQueue::create(128);
        let harness = spawn_worker(store);
        harness
            .control
            .send(init_message(&requests, &responses))
            .unwrap();
        assert_eq!(harness.events.recv_timeout(WAIT).unwrap(), WorkerEvent::Ready);

        let ids: Vec<ObjectId> = (0..8).map(|i| ObjectId::from(format!("obj-{i}"))).collect();
        requests.enqueue(&ids, WAIT).unwrap();

        let mut received = Vec::new();
        while received.len() < 8 {
            let mut chunk = responses.dequeue(8 - received.len(), WAIT);
            assert!(!chunk.is_empty(), "worker stopped answering");
            received.append(&mut chunk);
        }
        let got: Vec<&str> = received.iter().map(|i| i.id.as_str()).collect();
        let want: Vec<String> = (0..8).map(|i| format!("obj-{i}")).collect();
        assert_eq!(got, want.iter().map(String::as_str).collect::<Vec<_>>());

        harness.control.send(WorkerControl::Dispose).unwrap();
        harness.handle.join().unwrap();
    }
}
