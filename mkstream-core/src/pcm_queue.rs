//! # PCM Queue - Bounded Packet Buffer Between Producer and Feeder
//!
//! - Size-classed buffer pool, buffers return themselves on drop
//! - Bounded FIFO with blocking push (backpressure) and timed pop
//! - Seek generation: a flush bumps it, stale packets are discarded at push time
//! - End-of-stream marker so the feeder can tell "starved" from "done"
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────┐
//! │ Producer │───►│ PcmQueue │───►│ Feeder │
//! │ Thread   │    │          │    │ Thread │
//! └──────────┘    └──────────┘    └────────┘
//!       │                              │
//!       └──────── BufferPool ◄─────────┘
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Smallest buffer handed out, in bytes
const MIN_SIZE_CLASS: usize = 1024;
/// Free buffers kept per size class
const MAX_FREE_PER_CLASS: usize = 256;
/// How often a blocked push re-checks its cancellation token
const PUSH_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Buffer Pool
// ============================================================================

struct PoolInner {
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    outstanding: AtomicUsize,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, buffer: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        let mut free = self.free.lock();
        let class = free.entry(buffer.len()).or_default();
        if class.len() < MAX_FREE_PER_CLASS {
            class.push(buffer);
        }
    }
}

/// Pool of byte buffers bucketed by power-of-two size
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(HashMap::new()),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                recycled: AtomicU64::new(0),
            }),
        }
    }

    pub fn size_class(len: usize) -> usize {
        len.max(MIN_SIZE_CLASS).next_power_of_two()
    }

    /// Check out a buffer holding at least `len` bytes; its visible length is `len`.
    pub fn checkout(&self, len: usize) -> PooledBuffer {
        let class = Self::size_class(len);
        let reused = self.inner.free.lock().get_mut(&class).and_then(Vec::pop);
        let data = match reused {
            Some(data) => {
                self.inner.recycled.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; class]
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            data,
            len,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Buffers checked out and not yet dropped
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.inner.free.lock().values().map(Vec::len).sum(),
            outstanding: self.outstanding(),
            total_allocated: self.inner.allocated.load(Ordering::Relaxed),
            total_recycled: self.inner.recycled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub available: usize,
    pub outstanding: usize,
    pub total_allocated: u64,
    pub total_recycled: u64,
}

/// A pooled byte buffer. Move-only; goes back to its pool when dropped.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Shrink or grow the visible length within the buffer's capacity
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.give_back(data);
    }
}

// ============================================================================
// PCM Packet
// ============================================================================

/// Interleaved 16-bit little-endian PCM for one compressed frame
#[derive(Debug)]
pub struct PcmPacket {
    pub buffer: PooledBuffer,
    /// Queue generation current when the producer run started
    pub generation: u64,
    pub timestamp_ms: u64,
}

impl PcmPacket {
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}

// ============================================================================
// PCM Queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Packet predates the last flush and was dropped
    Stale,
    /// Token fired while waiting for space; packet dropped
    Cancelled,
}

pub struct PcmQueue {
    capacity: usize,
    packets: Mutex<VecDeque<PcmPacket>>,
    ready_cond: Condvar,
    space_cond: Condvar,
    generation: AtomicU64,
    end_of_stream: AtomicBool,
    pushed: AtomicU64,
    popped: AtomicU64,
    discarded: AtomicU64,
}

impl PcmQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            ready_cond: Condvar::new(),
            space_cond: Condvar::new(),
            generation: AtomicU64::new(0),
            end_of_stream: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Push, blocking while the queue is full
    pub fn push_blocking(&self, packet: PcmPacket, cancel: &CancellationToken) -> PushOutcome {
        let mut queue = self.packets.lock();
        loop {
            // Generation is bumped under this lock, so the check cannot race a flush.
            if packet.generation != self.generation.load(Ordering::SeqCst) {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Stale;
            }
            if cancel.is_cancelled() {
                return PushOutcome::Cancelled;
            }
            if queue.len() < self.capacity {
                queue.push_back(packet);
                self.pushed.fetch_add(1, Ordering::Relaxed);
                self.ready_cond.notify_one();
                return PushOutcome::Queued;
            }
            self.space_cond.wait_for(&mut queue, PUSH_POLL);
        }
    }

    /// Mark the end of production; poppers drain what is left and then see `None`
    pub fn close(&self) {
        let _queue = self.packets.lock();
        self.end_of_stream.store(true, Ordering::SeqCst);
        self.ready_cond.notify_all();
    }

    /// Close only if no flush happened since `generation` started
    pub fn close_generation(&self, generation: u64) -> bool {
        let _queue = self.packets.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.end_of_stream.store(true, Ordering::SeqCst);
        self.ready_cond.notify_all();
        true
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    pub fn pop(&self) -> Option<PcmPacket> {
        let mut queue = self.packets.lock();
        let packet = queue.pop_front();
        if packet.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
            self.space_cond.notify_one();
        }
        packet
    }

    /// Pop, waiting up to `timeout` for a packet
    pub fn pop_blocking(&self, timeout: Duration) -> Option<PcmPacket> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.packets.lock();

        while queue.is_empty() {
            if self.end_of_stream.load(Ordering::SeqCst) {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.ready_cond.wait_for(&mut queue, remaining);
        }

        let packet = queue.pop_front();
        if packet.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
            self.space_cond.notify_one();
        }
        packet
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drop every buffered packet and start a new generation. Returns the drained count.
    pub fn flush(&self) -> usize {
        let mut queue = self.packets.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let drained = queue.len();
        queue.clear();
        self.end_of_stream.store(false, Ordering::SeqCst);
        self.discarded.fetch_add(drained as u64, Ordering::Relaxed);
        drop(queue);

        self.ready_cond.notify_all();
        self.space_cond.notify_all();
        tracing::debug!("PCM queue flushed ({} packets), generation {}", drained, generation);
        drained
    }

    /// Wake every waiter so it can re-check cancellation
    pub fn wake_all(&self) {
        let _queue = self.packets.lock();
        self.ready_cond.notify_all();
        self.space_cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst)
    }

    /// End of stream reached and nothing left to pop
    pub fn is_drained(&self) -> bool {
        let queue = self.packets.lock();
        queue.is_empty() && self.end_of_stream.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let queue = self.packets.lock();
        QueueStats {
            buffered: queue.len(),
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::SeqCst),
            end_of_stream: self.end_of_stream.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub buffered: usize,
    pub pushed: u64,
    pub popped: u64,
    pub discarded: u64,
    pub generation: u64,
    pub end_of_stream: bool,
}

// ============================================================================
// Tests
// ============================================================================
