//! Buffer ownership and logical memory accounting.
//!
//! Off-heap ("direct") buffers are modeled as pool-accounted allocations:
//! every direct buffer belongs to exactly one [`BufferPool`] (its owner
//! tag) at a time, and releasing the last reference returns the accounted
//! bytes to that pool exactly once. Heap buffers carry no pool accounting
//! and are reclaimed by the runtime's normal means.
//!
//! The [`MemoryBroker`] is the separate, logical accounting service for
//! storage memory. It may deny a grant, which aborts the replace path of
//! the operation that asked.

pub mod buffer;

pub use buffer::{BufCursor, BufferRef};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Synthetic per-allocation overhead of a direct buffer: the allocation
/// bookkeeping plus the cleaner that returns it to its pool.
pub const DIRECT_OBJECT_OVERHEAD: usize = 64;

/// Synthetic overhead of the buffer wrapper itself (handle + counters).
pub const BUFFER_WRAPPER_OVERHEAD: usize = 40;

/// An accounting pool that direct allocations belong to. The pool name is
/// the owner tag; [`BufferRef::transfer_to`] moves an allocation's
/// accounted bytes between pools atomically.
pub struct BufferPool {
    name: &'static str,
    used: AtomicUsize,
}

impl BufferPool {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            used: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes currently accounted to this pool.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub(crate) fn grant(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn surrender(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(prev >= bytes, "pool {} accounting underflow", self.name);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.name)
            .field("used", &self.used())
            .finish()
    }
}

/// Grants and releases logical storage memory. Acquisitions may block for
/// eviction elsewhere and may deny with [`Error::LowMemory`]; every grant
/// taken on a replace path must be released on every exit path.
pub trait MemoryBroker: Send + Sync {
    fn acquire(&self, bytes: usize) -> Result<()>;
    fn release(&self, bytes: usize);
    fn used(&self) -> usize;
}

/// A broker that never denies. Still counts, so tests and stats can
/// observe balanced acquire/release pairs.
#[derive(Default)]
pub struct UnboundedBroker {
    used: AtomicUsize,
}

impl UnboundedBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MemoryBroker for UnboundedBroker {
    fn acquire(&self, bytes: usize) -> Result<()> {
        self.used.fetch_add(bytes, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// A broker with a fixed byte budget. Denies once the budget is exhausted.
pub struct BoundedBroker {
    limit: usize,
    used: AtomicUsize,
}

impl BoundedBroker {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
        })
    }
}

impl MemoryBroker for BoundedBroker {
    fn acquire(&self, bytes: usize) -> Result<()> {
        let mut used = self.used.load(Ordering::SeqCst);
        loop {
            let next = used.saturating_add(bytes);
            if next > self.limit {
                return Err(Error::LowMemory(format!(
                    "requested {bytes} bytes, {} of {} in use",
                    used, self.limit
                )));
            }
            match self
                .used
                .compare_exchange(used, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::SeqCst);
        debug_assert!(prev >= bytes, "broker accounting underflow");
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_broker_denies_past_limit() {
        let broker = BoundedBroker::new(100);

        broker.acquire(60).expect("first grant should fit");
        broker.acquire(40).expect("exact fit should succeed");

        let denied = broker.acquire(1);
        assert!(matches!(denied, Err(Error::LowMemory(_))));

        // Releasing makes room again.
        broker.release(40);
        broker.acquire(30).expect("grant after release should fit");
        assert_eq!(broker.used(), 90);
    }

    #[test]
    fn test_unbounded_broker_balances() {
        let broker = UnboundedBroker::new();
        broker.acquire(1 << 20).unwrap();
        broker.acquire(1 << 20).unwrap();
        broker.release(1 << 20);
        broker.release(1 << 20);
        assert_eq!(broker.used(), 0);
    }

    #[test]
    fn test_pool_accounting() {
        let pool = BufferPool::new("storage");
        pool.grant(4096);
        assert_eq!(pool.used(), 4096);
        pool.surrender(4096);
        assert_eq!(pool.used(), 0);
    }
}
