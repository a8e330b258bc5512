//! A minimal bucket engine holding column entries.
//!
//! Entries live in a concurrent skip map keyed by [`ColumnKey`]; the
//! ordered keyspace puts every cell of one row batch next to its
//! siblings, with the delete mask first, so batch enumeration is one
//! range scan. Eviction spills a value's payload to the region's
//! overflow store, records the disk location on the value, and gives up
//! the region's reference; the buffer disappears once the last reader
//! releases and comes back through recall on the next retained read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::column::key::ColumnKey;
use crate::column::value::ColumnValue;
use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::format::ValueKind;
use crate::memory::MemoryBroker;
use crate::region::context::RegionContext;

struct RegionEntry {
    value: Arc<ColumnValue>,
    /// True once the region has given up its reference; guards the
    /// release so eviction and entry destruction stay exactly-once.
    evicted: AtomicBool,
}

impl RegionEntry {
    /// Drops the region's reference if this entry still holds it.
    fn surrender_region_ref(&self) {
        if !self.evicted.swap(true, Ordering::SeqCst) {
            self.value.release();
        }
    }
}

/// One partition bucket's column entries.
pub struct ColumnRegion {
    ctx: Arc<RegionContext>,
    entries: SkipMap<ColumnKey, Arc<RegionEntry>>,
}

impl ColumnRegion {
    pub fn open(config: RegionConfig, broker: Arc<dyn MemoryBroker>) -> Result<Self> {
        let ctx = RegionContext::new(config, broker)?;
        Ok(Self {
            ctx,
            entries: SkipMap::new(),
        })
    }

    pub fn context(&self) -> &Arc<RegionContext> {
        &self.ctx
    }

    /// Admits a value under `key`. The producer's reference becomes the
    /// region's, the value is wired to this region for stats and codec
    /// selection, and its bytes are granted from the memory broker; a
    /// denied grant refuses the put. Puts to one key are linearized by
    /// the caller.
    pub fn put(&self, key: ColumnKey, value: ColumnValue) -> Result<Arc<ColumnValue>> {
        if self.ctx.is_destroyed() {
            return Err(Error::RegionDestroyed);
        }
        let value = Arc::new(value);
        value.set_region(&self.ctx);
        value.acquire_storage()?;

        if let Some(old) = self.entries.get(&key) {
            old.value().surrender_region_ref();
        }
        self.entries.insert(
            key,
            Arc::new(RegionEntry {
                value: Arc::clone(&value),
                evicted: AtomicBool::new(false),
            }),
        );
        tracing::debug!(
            region = %self.ctx.name(),
            uuid = key.uuid(),
            partition = key.partition_id(),
            column = key.column_index(),
            "column entry admitted"
        );
        Ok(value)
    }

    /// The raw container, with no reference taken.
    pub fn get(&self, key: &ColumnKey) -> Option<Arc<ColumnValue>> {
        self.entries.get(key).map(|e| Arc::clone(&e.value().value))
    }

    /// Retrieves a value with a reference held for the caller, recalling
    /// spilled bytes from disk as needed. `None` means no entry; an
    /// absent buffer on the returned value means the entry is gone.
    pub fn get_retained(
        &self,
        key: &ColumnKey,
        decompress: bool,
    ) -> Result<Option<Arc<ColumnValue>>> {
        match self.entries.get(key) {
            Some(entry) => entry.value().value.get_value_retain(decompress, false).map(Some),
            None => Ok(None),
        }
    }

    /// Spills the value's payload to the overflow store and gives up the
    /// region's reference. The buffer survives until outstanding readers
    /// release; the entry stays mapped and recallable. Returns false for
    /// a missing, already evicted, or already absent entry.
    pub fn evict(&self, key: &ColumnKey) -> Result<bool> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(false);
        };
        let entry = Arc::clone(entry.value());
        if entry.evicted.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let value = &entry.value;
        if !value.retain() {
            return Ok(false);
        }

        let result = (|| -> Result<bool> {
            let Some(buf) = value.get_buffer() else {
                return Ok(false);
            };
            if value.disk_id().is_none() {
                let payload = buf.as_slice().to_vec();
                let overflow = self.ctx.overflow().read()?;
                let Some(store) = overflow.as_ref() else {
                    return Err(Error::RegionDestroyed);
                };
                let disk_id = store.append(key, value.kind(), &payload)?;
                value.set_disk_location(&disk_id, Some(&self.ctx));
            }
            Ok(true)
        })();
        value.release();

        match result {
            Ok(true) => {
                entry.surrender_region_ref();
                self.ctx.stats().record_eviction();
                tracing::debug!(
                    region = %self.ctx.name(),
                    uuid = key.uuid(),
                    column = key.column_index(),
                    "column entry evicted"
                );
                Ok(true)
            }
            other => other,
        }
    }

    /// Removes the entry and invalidates its spilled copy. Readers that
    /// lost the race observe the entry as absent, never an error.
    pub fn destroy_entry(&self, key: &ColumnKey) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        let entry = entry.value();
        if let Some(disk_id) = entry.value.disk_id() {
            disk_id.destroy();
        }
        entry.surrender_region_ref();
        true
    }

    /// Every cell of one row batch, in column order with the delete mask
    /// first.
    pub fn scan_batch(&self, uuid: u64, partition_id: i32) -> Vec<(ColumnKey, Arc<ColumnValue>)> {
        let low = ColumnKey::new(uuid, partition_id, i32::MIN);
        let high = ColumnKey::new(uuid, partition_id, i32::MAX);
        self.entries
            .range(low..=high)
            .map(|e| (*e.key(), Arc::clone(&e.value().value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroys the region: drops every entry and the overflow store.
    /// In-flight recalls finish or observe absence.
    pub fn destroy(&self) {
        while let Some(entry) = self.entries.pop_front() {
            if let Some(disk_id) = entry.value().value.disk_id() {
                disk_id.destroy();
            }
            entry.value().surrender_region_ref();
        }
        self.ctx.destroy();
    }

    /// Builds a value of the kind its column index calls for and admits
    /// it in one step.
    pub fn put_payload(&self, key: ColumnKey, payload: Vec<u8>) -> Result<Arc<ColumnValue>> {
        let kind = ValueKind::for_column_index(key.column_index());
        let value = ColumnValue::from_payload(payload, kind)?;
        self.put(key, value)
    }
}

impl std::fmt::Debug for ColumnRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnRegion")
            .field("region", &self.ctx.name())
            .field("entries", &self.entries.len())
            .finish()
    }
}
