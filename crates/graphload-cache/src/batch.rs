//! Keyed write batching.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

use crate::error::{CacheError, CacheResult};

/// Consumer of flushed batches.
#[async_trait]
pub trait BatchSink<K, V>: Send + Sync {
    async fn process(&self, batch: Vec<(K, V)>) -> CacheResult<()>;
}

#[derive(Clone, Debug)]
pub struct BatchingOptions {
    /// Flush as soon as this many entries are pending; each flush takes at
    /// most this many entries.
    pub max_batch_size: usize,
    /// Flush whatever is pending once this long passes without a new add.
    pub max_wait: Duration,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait: Duration::from_millis(200),
        }
    }
}

struct State<K, V> {
    values: HashMap<K, V>,
    order: VecDeque<K>,
    poisoned: bool,
    disposed: bool,
    /// Bumped on every add; a timer task only fires if its epoch is still
    /// current, which is what makes each add reset the clock.
    timer_epoch: u64,
}

/// Accumulates keyed values and hands them to a [`BatchSink`] in
/// insertion-ordered batches.
///
/// Re-adding a pending key is a no-op (first write wins). Flushes are
/// serialized; a sink failure poisons the accumulator permanently.
pub struct BatchingAccumulator<K, V> {
    state: Mutex<State<K, V>>,
    sink: Arc<dyn BatchSink<K, V>>,
    options: BatchingOptions,
    flush_gate: AsyncMutex<()>,
}

impl<K, V> BatchingAccumulator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(sink: Arc<dyn BatchSink<K, V>>, options: BatchingOptions) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                values: HashMap::new(),
                order: VecDeque::new(),
                poisoned: false,
                disposed: false,
                timer_epoch: 0,
            }),
            sink,
            options,
            flush_gate: AsyncMutex::new(()),
        })
    }

    /// Number of entries waiting to be flushed.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add one entry, flushing when the size threshold is reached and
    /// (re)starting the idle timer otherwise.
    pub async fn add(self: &Arc<Self>, key: K, value: V) -> CacheResult<()> {
        let pending = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.poisoned {
                return Err(CacheError::BatchPoisoned);
            }
            if state.disposed {
                return Err(CacheError::Disposed);
            }
            state.timer_epoch += 1;
            if !state.values.contains_key(&key) {
                state.order.push_back(key.clone());
                state.values.insert(key, value);
            }
            state.values.len()
        };

        if pending >= self.options.max_batch_size {
            self.run_flushes(false).await
        } else {
            self.arm_timer();
            Ok(())
        }
    }

    /// Add several entries; equivalent to calling [`add`](Self::add) in
    /// order.
    pub async fn add_all(self: &Arc<Self>, entries: Vec<(K, V)>) -> CacheResult<()> {
        for (key, value) in entries {
            self.add(key, value).await?;
        }
        Ok(())
    }

    /// Stop accepting entries, wait out any in-flight flush, and flush the
    /// remainder.
    pub async fn dispose(self: &Arc<Self>) -> CacheResult<()> {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.disposed {
                return Ok(());
            }
            state.disposed = true;
            state.timer_epoch += 1;
        }
        debug!("draining accumulator on dispose");
        self.run_flushes(true).await
    }

    fn arm_timer(self: &Arc<Self>) {
        let epoch = self.state.lock().expect("lock poisoned").timer_epoch;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.options.max_wait).await;
            let stale = {
                let state = this.state.lock().expect("lock poisoned");
                state.timer_epoch != epoch || state.disposed || state.poisoned
            };
            if !stale {
                if let Err(error) = this.run_flushes(true).await {
                    error!(error = %error, "timed flush failed");
                }
            }
        });
    }

    /// Run flushes behind the gate. With `drain_all` the pending set is
    /// emptied in batch-sized chunks; otherwise flushing continues only while
    /// the size threshold is still met (the re-check after each flush).
    async fn run_flushes(self: &Arc<Self>, drain_all: bool) -> CacheResult<()> {
        let _gate = self.flush_gate.lock().await;
        loop {
            let batch = {
                let mut state = self.state.lock().expect("lock poisoned");
                if state.poisoned {
                    return Err(CacheError::BatchPoisoned);
                }
                if !drain_all && state.values.len() < self.options.max_batch_size {
                    return Ok(());
                }
                take_front(&mut state, self.options.max_batch_size)
            };
            if batch.is_empty() {
                return Ok(());
            }
            let size = batch.len();
            if let Err(error) = self.sink.process(batch).await {
                self.state.lock().expect("lock poisoned").poisoned = true;
                error!(error = %error, size, "batch sink failed; accumulator poisoned");
                return Err(error);
            }
            debug!(size, "flushed batch");
        }
    }
}

fn take_front<K: Eq + Hash, V>(state: &mut State<K, V>, max: usize) -> Vec<(K, V)> {
    let mut batch = Vec::with_capacity(max.min(state.order.len()));
    while batch.len() < max {
        let Some(key) = state.order.pop_front() else {
            break;
        };
        if let Some(value) = state.values.remove(&key) {
            batch.push((key, value));
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        batches: Mutex<Vec<Vec<(String, u32)>>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn batches(&self) -> Vec<Vec<(String, u32)>> {
            self.batches.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl BatchSink<String, u32> for RecordingSink {
        async fn process(&self, batch: Vec<(String, u32)>) -> CacheResult<()> {
            if self.fail {
                return Err(CacheError::Store(crate::store::StoreError::Backend(
                    "sink down".into(),
                )));
            }
            self.batches.lock().expect("lock poisoned").push(batch);
            Ok(())
        }
    }

    fn options(max_batch_size: usize, max_wait_ms: u64) -> BatchingOptions {
        BatchingOptions {
            max_batch_size,
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    #[tokio::test]
    async fn size_threshold_triggers_flush_in_insertion_order() {
        let sink = RecordingSink::new();
        let acc = BatchingAccumulator::new(sink.clone(), options(3, 10_000));

        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            acc.add(key.to_string(), i as u32).await.unwrap();
        }

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![("a".into(), 0), ("b".into(), 1), ("c".into(), 2)]
        );
        assert!(acc.is_empty());
    }

    #[tokio::test]
    async fn first_write_wins_for_duplicate_keys() {
        let sink = RecordingSink::new();
        let acc = BatchingAccumulator::new(sink.clone(), options(2, 10_000));

        acc.add("a".to_string(), 1).await.unwrap();
        acc.add("a".to_string(), 99).await.unwrap();
        acc.add("b".to_string(), 2).await.unwrap();

        assert_eq!(sink.batches(), vec![vec![("a".into(), 1), ("b".into(), 2)]]);
    }

    #[tokio::test]
    async fn idle_timer_flushes_a_small_batch() {
        let sink = RecordingSink::new();
        let acc = BatchingAccumulator::new(sink.clone(), options(100, 30));

        acc.add("a".to_string(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(sink.batches(), vec![vec![("a".into(), 1)]]);
        assert!(acc.is_empty());
    }

    #[tokio::test]
    async fn dispose_drains_the_remainder() {
        let sink = RecordingSink::new();
        let acc = BatchingAccumulator::new(sink.clone(), options(100, 10_000));

        acc.add("a".to_string(), 1).await.unwrap();
        acc.add("b".to_string(), 2).await.unwrap();
        acc.dispose().await.unwrap();

        assert_eq!(sink.batches(), vec![vec![("a".into(), 1), ("b".into(), 2)]]);
        assert_eq!(
            acc.add("c".to_string(), 3).await,
            Err(CacheError::Disposed)
        );
    }

    #[tokio::test]
    async fn oversized_drain_is_chunked_by_batch_size() {
        let sink = RecordingSink::new();
        let acc = BatchingAccumulator::new(sink.clone(), options(2, 10_000));

        // Three adds: the first two flush on the threshold, the third waits.
        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            acc.add(key.to_string(), i as u32).await.unwrap();
        }
        acc.dispose().await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1], vec![("c".into(), 2)]);
    }

    #[tokio::test]
    async fn sink_failure_poisons_permanently() {
        let sink = RecordingSink::failing();
        let acc = BatchingAccumulator::new(sink, options(1, 10_000));

        assert!(matches!(
            acc.add("a".to_string(), 1).await,
            Err(CacheError::Store(_))
        ));
        assert_eq!(
            acc.add("b".to_string(), 2).await,
            Err(CacheError::BatchPoisoned)
        );
        assert_eq!(acc.dispose().await, Err(CacheError::BatchPoisoned));
    }
}
