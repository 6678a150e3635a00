//! Process-wide event pool
//!
//! Events are recycled once every delivery has released them. Instead of
//! dropping the allocation, the recycled cell goes back onto a bounded free
//! list and the next [`Event::acquire`](crate::Event::acquire) reuses it.
//!
//! ## Rules
//!
//! - **Bounded**: at most [`MAX_POOL_SIZE`] cells are kept, the rest are dropped
//! - **Exclusive reuse**: a pooled cell is only handed out again if no stale
//!   `Event` handle still points at it; otherwise it is discarded
//! - **Single lock**: all pool mutation happens under one `parking_lot::Mutex`
//!
//! Pooling is a reuse optimization only. Correctness never depends on a hit.

use crate::event::EventCell;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of recycled events kept for reuse
pub const MAX_POOL_SIZE: usize = 50;

static GLOBAL_POOL: Lazy<EventPool> = Lazy::new(|| EventPool::new(MAX_POOL_SIZE));

// ============================================================================
// Pool Statistics
// ============================================================================

/// Statistics for pool operations
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Events served from the free list
    hits: AtomicU64,
    /// Events allocated fresh (pool miss)
    misses: AtomicU64,
    /// Events returned to the free list
    returns: AtomicU64,
    /// Events dropped (pool full or still referenced)
    discards: AtomicU64,
}

impl PoolStats {
    #[inline]
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_return(&self) {
        self.returns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Get hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            (hits / total) * 100.0
        } else {
            0.0
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.returns.store(0, Ordering::Relaxed);
        self.discards.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Event Pool
// ============================================================================

/// Bounded free list of recycled event cells
pub struct EventPool {
    free: Mutex<Vec<Arc<EventCell>>>,
    capacity: usize,
    stats: PoolStats,
}

impl EventPool {
    /// Create a pool keeping at most `capacity` cells
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            stats: PoolStats::default(),
        }
    }

    /// The process-wide pool used by [`Event::acquire`](crate::Event::acquire)
    pub fn global() -> &'static EventPool {
        &GLOBAL_POOL
    }

    /// Take a reset cell from the free list, or allocate one.
    pub(crate) fn take(&self) -> Arc<EventCell> {
        let mut free = self.free.lock();
        while let Some(cell) = free.pop() {
            if Arc::strong_count(&cell) == 1 {
                self.stats.record_hit();
                cell.reset();
                return cell;
            }
            self.stats.record_discard();
        }
        drop(free);

        self.stats.record_miss();
        Arc::new(EventCell::new())
    }

    /// Return a recycled cell. Dropped if the pool is already full.
    pub(crate) fn give(&self, cell: Arc<EventCell>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(cell);
            self.stats.record_return();
        } else {
            self.stats.record_discard();
        }
    }

    /// Number of cells currently pooled
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Drop every pooled cell and zero the statistics (test isolation hook)
    pub fn clear(&self) {
        self.free.lock().clear();
        self.stats.reset();
    }
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("pooled", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
