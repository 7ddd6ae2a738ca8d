//! The byte ring buffer and its shared region.
//!
//! # Layout and ordering
//!
//! A [`SharedRegion`] holds the data bytes plus two offsets. The producer is
//! the only writer of `write`; the consumer is the only writer of `read`.
//! Data bytes are `AtomicU8` cells accessed with relaxed ordering; the
//! release store of an offset after a copy, paired with the acquire load on
//! the opposite side, is what orders the byte traffic. No lock guards the
//! data path.
//!
//! One slot is always kept free so that `write == read` unambiguously means
//! empty; usable space is therefore `capacity - 1` bytes.
//!
//! Blocking is a wait-until-offsets-change affair: a producer that finds too
//! little free space parks on the space condvar until the consumer advances
//! `read` (and vice versa), with an absolute deadline bounding the wait.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{QueueError, QueueResult};

/// Length-prefix size: a 4-byte little-endian payload length precedes every
/// message.
pub const HEADER_BYTES: usize = 4;

/// The memory shared between the two ends of a [`BoundedMessageQueue`].
///
/// Handed to a worker thread as an `Arc` so both sides view the same offsets
/// and data cells.
pub struct SharedRegion {
    write: AtomicUsize,
    read: AtomicUsize,
    data: Box<[AtomicU8]>,
    wait_lock: Mutex<()>,
    space_waiters: Condvar,
    data_waiters: Condvar,
}

impl SharedRegion {
    fn new(capacity_bytes: usize) -> Self {
        let data = (0..capacity_bytes).map(|_| AtomicU8::new(0)).collect();
        Self {
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            data,
            wait_lock: Mutex::new(()),
            space_waiters: Condvar::new(),
            data_waiters: Condvar::new(),
        }
    }

    /// Total size of the data area in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently occupied by framed messages.
    fn occupied(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write + self.capacity() - read) % self.capacity()
    }

    /// Bytes available for new frames (one slot stays free).
    fn free(&self) -> usize {
        (self.capacity() - 1).saturating_sub(self.occupied())
    }

    /// Copy `bytes` into the data area starting at `pos`, wrapping at the
    /// end. Returns the position one past the last byte written.
    fn write_at(&self, mut pos: usize, bytes: &[u8]) -> usize {
        for &byte in bytes {
            self.data[pos].store(byte, Ordering::Relaxed);
            pos = (pos + 1) % self.capacity();
        }
        pos
    }

    /// Copy `len` bytes out of the data area starting at `pos`, wrapping at
    /// the end.
    fn read_at(&self, mut pos: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.data[pos].load(Ordering::Relaxed));
            pos = (pos + 1) % self.capacity();
        }
        out
    }

    fn read_u32_at(&self, pos: usize) -> u32 {
        let mut raw = [0u8; HEADER_BYTES];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = self.data[(pos + i) % self.capacity()].load(Ordering::Relaxed);
        }
        u32::from_le_bytes(raw)
    }

    fn notify_data(&self) {
        let _guard = self.wait_lock.lock().expect("lock poisoned");
        self.data_waiters.notify_all();
    }

    fn notify_space(&self) {
        let _guard = self.wait_lock.lock().expect("lock poisoned");
        self.space_waiters.notify_all();
    }

    /// Park until at least `needed` bytes are free or `deadline` passes.
    /// Returns `false` on deadline.
    fn wait_for_space(&self, needed: usize, deadline: Instant) -> bool {
        let mut guard = self.wait_lock.lock().expect("lock poisoned");
        loop {
            if self.free() >= needed {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _timed_out) = self
                .space_waiters
                .wait_timeout(guard, deadline - now)
                .expect("lock poisoned");
            guard = next;
        }
    }

    /// Park until at least `needed` bytes are occupied or `deadline` passes.
    /// Returns `false` on deadline.
    fn wait_for_data(&self, needed: usize, deadline: Instant) -> bool {
        let mut guard = self.wait_lock.lock().expect("lock poisoned");
        loop {
            if self.occupied() >= needed {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _timed_out) = self
                .data_waiters
                .wait_timeout(guard, deadline - now)
                .expect("lock poisoned");
            guard = next;
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied())
            .finish()
    }
}

/// A fixed-capacity, cross-thread byte queue carrying discrete
/// length-prefixed messages.
///
/// Single producer, single consumer. Clone one handle per end (clones share
/// the region); hand the region itself to the other thread with
/// [`shared_region`](Self::shared_region) + [`attach`](Self::attach).
#[derive(Clone)]
pub struct BoundedMessageQueue {
    region: Arc<SharedRegion>,
}

impl BoundedMessageQueue {
    /// Allocate a fresh queue with `capacity_bytes` of data area.
    pub fn create(capacity_bytes: usize) -> Self {
        Self {
            region: Arc::new(SharedRegion::new(capacity_bytes)),
        }
    }

    /// View an existing shared region from another thread.
    ///
    /// `capacity_bytes` must match the region's actual capacity; a mismatch
    /// means the two ends would disagree on offset arithmetic.
    pub fn attach(region: Arc<SharedRegion>, capacity_bytes: usize) -> QueueResult<Self> {
        if region.capacity() != capacity_bytes {
            return Err(QueueError::RegionMismatch {
                expected: capacity_bytes,
                actual: region.capacity(),
            });
        }
        Ok(Self { region })
    }

    /// The underlying shared region, for transfer to the opposite end.
    pub fn shared_region(&self) -> Arc<SharedRegion> {
        Arc::clone(&self.region)
    }

    /// Total size of the data area in bytes.
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Largest payload that can ever be pushed.
    pub fn max_payload(&self) -> usize {
        (self.capacity() - 1).saturating_sub(HEADER_BYTES)
    }

    /// Bytes currently occupied by framed messages.
    pub fn len(&self) -> usize {
        self.region.occupied()
    }

    pub fn is_empty(&self) -> bool {
        self.region.occupied() == 0
    }

    pub fn is_full(&self) -> bool {
        self.region.free() == 0
    }

    /// Bytes available for new frames.
    pub fn available_space(&self) -> usize {
        self.region.free()
    }

    /// Push one framed message, blocking up to `timeout` for space.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` on timeout. A message
    /// whose framed size exceeds what the buffer could ever hold fails
    /// immediately with [`QueueError::MessageTooLarge`] rather than looping
    /// until the deadline. A message is written whole or not at all.
    pub fn push(&self, payload: &[u8], timeout: Duration) -> QueueResult<bool> {
        let framed = HEADER_BYTES + payload.len();
        if framed > self.capacity().saturating_sub(1) {
            warn!(
                size = framed,
                capacity = self.capacity(),
                "message can never fit in queue"
            );
            return Err(QueueError::MessageTooLarge {
                size: framed,
                capacity: self.capacity(),
            });
        }

        let deadline = deadline_after(timeout);
        loop {
            if self.region.free() >= framed {
                let write = self.region.write.load(Ordering::Relaxed);
                let pos = self
                    .region
                    .write_at(write, &(payload.len() as u32).to_le_bytes());
                let pos = self.region.write_at(pos, payload);
                self.region.write.store(pos, Ordering::Release);
                self.region.notify_data();
                return Ok(true);
            }
            if !self.region.wait_for_space(framed, deadline) {
                return Ok(false);
            }
        }
    }

    /// Pop the next framed message, blocking up to `timeout` for one to
    /// arrive. Returns `None` on timeout.
    pub fn shift(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = deadline_after(timeout);
        loop {
            // The producer only publishes whole frames, so any occupancy at
            // all implies a complete header and payload.
            if self.region.occupied() >= HEADER_BYTES {
                let read = self.region.read.load(Ordering::Relaxed);
                let len = self.region.read_u32_at(read) as usize;
                let payload = self
                    .region
                    .read_at((read + HEADER_BYTES) % self.capacity(), len);
                self.region
                    .read
                    .store((read + HEADER_BYTES + len) % self.capacity(), Ordering::Release);
                self.region.notify_space();
                return Some(payload);
            }
            if !self.region.wait_for_data(HEADER_BYTES, deadline) {
                return None;
            }
        }
    }

    /// Non-destructively read the first `len` occupied bytes, blocking up to
    /// `timeout` for them to exist. Returns `None` on timeout, or
    /// immediately when `len` exceeds what the buffer could ever hold.
    pub fn peek(&self, len: usize, timeout: Duration) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        if len > self.capacity().saturating_sub(1) {
            return None;
        }
        let deadline = deadline_after(timeout);
        loop {
            if self.region.occupied() >= len {
                let read = self.region.read.load(Ordering::Relaxed);
                return Some(self.region.read_at(read, len));
            }
            if !self.region.wait_for_data(len, deadline) {
                return None;
            }
        }
    }
}

impl std::fmt::Debug for BoundedMessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedMessageQueue")
            .field("capacity", &self.capacity())
            .field("occupied", &self.len())
            .finish()
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now()
        .checked_add(timeout)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}
