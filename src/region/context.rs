//! Per-region context shared by every value of a region.
//!
//! Values hold this context weakly: the region's entry owns the value and
//! the value only points back for stats, codec selection, and memory
//! accounting. Eviction drops the strong side; every use on the value
//! side tolerates a dead `Weak`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::codec::CodecId;
use crate::config::RegionConfig;
use crate::error::Result;
use crate::memory::{BufferPool, MemoryBroker, UnboundedBroker};
use crate::region::disk::DiskStore;

pub struct RegionContext {
    name: String,
    codec: CodecId,
    stats: PerfStats,
    broker: Arc<dyn MemoryBroker>,
    storage_pool: Arc<BufferPool>,
    decompression_pool: Arc<BufferPool>,
    /// The disk region. Recall takes the read lock first in the
    /// disk-region -> disk-id -> instance lock order; destroy takes the
    /// write lock and empties it.
    overflow: RwLock<Option<DiskStore>>,
    /// Net buffer bytes held by this region's values.
    memory_used: AtomicI64,
    destroyed: AtomicBool,
}

impl RegionContext {
    pub fn new(config: RegionConfig, broker: Arc<dyn MemoryBroker>) -> Result<Arc<Self>> {
        let overflow = match config.overflow_path() {
            Some(dir) => Some(DiskStore::create(dir, config.name())?),
            None => None,
        };
        Ok(Arc::new(Self {
            name: config.name().to_string(),
            codec: config.codec_id(),
            stats: PerfStats::default(),
            broker,
            storage_pool: BufferPool::new("storage"),
            decompression_pool: BufferPool::new("decompression"),
            overflow: RwLock::new(overflow),
            memory_used: AtomicI64::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// A context with no overflow store and no memory budget, for callers
    /// that only need stats and pools.
    pub fn in_memory(config: RegionConfig) -> Arc<Self> {
        Self::new(config.overflow_dir_cleared(), UnboundedBroker::new())
            .expect("in-memory context has no disk to fail on")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compression codec this region declares for its values.
    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn stats(&self) -> &PerfStats {
        &self.stats
    }

    pub fn broker(&self) -> &Arc<dyn MemoryBroker> {
        &self.broker
    }

    pub fn storage_pool(&self) -> &Arc<BufferPool> {
        &self.storage_pool
    }

    pub fn decompression_pool(&self) -> &Arc<BufferPool> {
        &self.decompression_pool
    }

    pub(crate) fn overflow(&self) -> &RwLock<Option<DiskStore>> {
        &self.overflow
    }

    /// Adjusts the region's buffer-byte statistic by `delta`.
    pub fn update_memory_stats(&self, delta: i64) {
        self.memory_used.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn memory_used(&self) -> i64 {
        self.memory_used.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Marks the region destroyed and drops the overflow store. In-flight
    /// recalls finish against their read guard; later recalls observe the
    /// destroyed region and treat their entries as absent.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let mut overflow = self.overflow.write().unwrap();
        if let Some(store) = overflow.take() {
            store.close();
        }
        tracing::info!(region = %self.name, "region destroyed");
    }
}

impl std::fmt::Debug for RegionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionContext")
            .field("name", &self.name)
            .field("codec", &self.codec)
            .field("memory_used", &self.memory_used())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Cache performance counters for one region. All counters are atomic;
/// snapshots are taken field by field and are not mutually consistent.
#[derive(Default)]
pub struct PerfStats {
    compressions: AtomicU64,
    compression_skips: AtomicU64,
    compression_nanos: AtomicU64,
    compression_bytes_in: AtomicU64,
    compression_bytes_out: AtomicU64,
    decompressions: AtomicU64,
    decompression_nanos: AtomicU64,
    corrupt_state_clamps: AtomicU64,
    disk_recalls: AtomicU64,
    evictions: AtomicU64,
}

impl PerfStats {
    pub fn start_compression(&self) -> Instant {
        Instant::now()
    }

    /// Ends a compression timing window. `out_len` of `None` records the
    /// codec declining to shrink the payload.
    pub fn end_compression(&self, start: Instant, in_len: usize, out_len: Option<usize>) {
        self.compression_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::SeqCst);
        match out_len {
            Some(out_len) => {
                self.compressions.fetch_add(1, Ordering::SeqCst);
                self.compression_bytes_in
                    .fetch_add(in_len as u64, Ordering::SeqCst);
                self.compression_bytes_out
                    .fetch_add(out_len as u64, Ordering::SeqCst);
            }
            None => {
                self.compression_skips.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    pub fn start_decompression(&self) -> Instant {
        Instant::now()
    }

    pub fn end_decompression(&self, start: Instant, out_len: usize) {
        self.decompressions.fetch_add(1, Ordering::SeqCst);
        self.decompression_nanos
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::SeqCst);
        let _ = out_len;
    }

    /// Records a payload whose leading int contradicted the tracked state
    /// and was clamped to decompressed.
    pub fn record_corrupt_state_clamp(&self) {
        self.corrupt_state_clamps.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_disk_recall(&self) {
        self.disk_recalls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            compressions: self.compressions.load(Ordering::SeqCst),
            compression_skips: self.compression_skips.load(Ordering::SeqCst),
            compression_nanos: self.compression_nanos.load(Ordering::SeqCst),
            compression_bytes_in: self.compression_bytes_in.load(Ordering::SeqCst),
            compression_bytes_out: self.compression_bytes_out.load(Ordering::SeqCst),
            decompressions: self.decompressions.load(Ordering::SeqCst),
            decompression_nanos: self.decompression_nanos.load(Ordering::SeqCst),
            corrupt_state_clamps: self.corrupt_state_clamps.load(Ordering::SeqCst),
            disk_recalls: self.disk_recalls.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub compressions: u64,
    pub compression_skips: u64,
    pub compression_nanos: u64,
    pub compression_bytes_in: u64,
    pub compression_bytes_out: u64,
    pub decompressions: u64,
    pub decompression_nanos: u64,
    pub corrupt_state_clamps: u64,
    pub disk_recalls: u64,
    pub evictions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_counters() {
        let stats = PerfStats::default();

        let start = stats.start_compression();
        stats.end_compression(start, 1000, Some(300));
        let start = stats.start_compression();
        stats.end_compression(start, 1000, None);

        let snap = stats.snapshot();
        assert_eq!(snap.compressions, 1);
        assert_eq!(snap.compression_skips, 1);
        assert_eq!(snap.compression_bytes_in, 1000);
        assert_eq!(snap.compression_bytes_out, 300);
    }

    #[test]
    fn test_context_destroy_drops_overflow() {
        let ctx = RegionContext::in_memory(RegionConfig::new("orders"));
        assert!(!ctx.is_destroyed());
        ctx.destroy();
        assert!(ctx.is_destroyed());
        assert!(ctx.overflow().read().unwrap().is_none());
    }

    #[test]
    fn test_memory_stats_are_signed() {
        let ctx = RegionContext::in_memory(RegionConfig::new("orders"));
        ctx.update_memory_stats(4096);
        ctx.update_memory_stats(-1024);
        assert_eq!(ctx.memory_used(), 3072);
    }
}
