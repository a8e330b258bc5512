//! The column value container and its compression state machine.
//!
//! A value owns at most one buffer and moves through three states:
//!
//! ```text
//! Compressed(0) -> Decompressed(1) -> ... -> Decompressed(k) -> Compressed(0)
//!        \------------------- NotCompressible(-1) <- non-shrinking compress
//! ```
//!
//! The decompressed counter is the hysteresis that keeps a hot value from
//! thrashing: each declined compression advances it, and only once it has
//! passed [`MAX_CONSECUTIVE_COMPRESSIONS`] may a later compression swap
//! the stored buffer back to compressed form. `NotCompressible` is sticky
//! until the next `set_buffer`.
//!
//! The reference count lives on the container: the producer's
//! `set_buffer` leaves it at one (the region's reference), readers
//! `retain` before touching bytes and `release` on every exit, and the
//! release that reaches zero drops the buffer. A value whose buffer was
//! dropped but which carries a disk location is recalled transparently by
//! [`ColumnValue::get_value_retain`].

use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use byteorder::{BigEndian, WriteBytesExt};

use crate::codec::{self, CodecId};
use crate::error::{Error, Result};
use crate::format::{
    write_serialization_header, OutputChannel, ValueInput, ValueKind, WireOrder, WIRE_HEADER_SIZE,
};
use crate::memory::{BufferRef, BUFFER_WRAPPER_OVERHEAD, DIRECT_OBJECT_OVERHEAD};
use crate::region::{DiskId, RegionContext};

/// Declined compressions a decompressed value tolerates before a later
/// compression may replace its stored buffer.
pub const MAX_CONSECUTIVE_COMPRESSIONS: u8 = 2;

/// Unused capacity that triggers an exact-size copy when a compressed
/// buffer replaces the stored one.
const TRIM_SLACK_THRESHOLD: usize = 32;

/// Synthetic overhead of the container itself for size accounting.
pub const CONTAINER_OVERHEAD: usize = 48;

/// Compression state of the stored buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionState {
    /// A compression declined to shrink the payload; sticky until the
    /// next `set_buffer`.
    NotCompressible,
    Compressed,
    /// Decompressed, with the count of compressions declined since the
    /// last decompression (at least one).
    Decompressed(u8),
}

struct Guarded {
    buffer: Option<BufferRef>,
    codec: CodecId,
    state: CompressionState,
    from_disk: bool,
    disk_id: Option<Arc<DiskId>>,
    region: Option<Weak<RegionContext>>,
    /// Bytes currently granted by the region's memory broker for this
    /// value; shrinks and drops release exactly this much.
    broker_granted: usize,
}

impl Guarded {
    fn region_ctx(&self) -> Option<Arc<RegionContext>> {
        self.region.as_ref().and_then(Weak::upgrade)
    }
}

/// One column-batch cell's bytes, with on-demand compression and
/// transparent disk recall.
pub struct ColumnValue {
    kind: ValueKind,
    refs: AtomicI32,
    guarded: Mutex<Guarded>,
}

impl ColumnValue {
    /// An empty container. Holds one reference for its producer.
    pub fn new(kind: ValueKind) -> Self {
        Self {
            kind,
            refs: AtomicI32::new(1),
            guarded: Mutex::new(Guarded {
                buffer: None,
                codec: CodecId::DEFAULT,
                state: CompressionState::NotCompressible,
                from_disk: false,
                disk_id: None,
                region: None,
                broker_granted: 0,
            }),
        }
    }

    /// Builds a container from payload bytes, deriving the compression
    /// state from the leading little-endian i32: negative means
    /// compressed with codec `-leading`.
    pub fn from_payload(payload: Vec<u8>, kind: ValueKind) -> Result<Self> {
        let value = Self::new(kind);
        if payload.is_empty() {
            return Ok(value);
        }
        let buf = BufferRef::heap(payload);
        let (codec, compressed) = classify_payload(&buf)?;
        value.set_buffer(buf, codec, compressed, false)?;
        Ok(value)
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Atomically takes a reference if the container is still live.
    /// Returns false once the count hit zero: the entry was evicted and
    /// must be treated as absent.
    pub fn retain(&self) -> bool {
        let mut count = self.refs.load(Ordering::SeqCst);
        loop {
            if count <= 0 {
                return false;
            }
            match self
                .refs
                .compare_exchange(count, count + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Drops one reference. The release that reaches zero drops the
    /// stored buffer: direct memory returns to its pool, the state goes
    /// `NotCompressible`, and only a disk location can bring the bytes
    /// back. Unbalanced releases are a logged no-op, never negative.
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.refs.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(count = prev, "value release without matching retain");
            return;
        }
        if prev == 1 {
            let mut g = self.guarded.lock().unwrap();
            release_buffer(&mut g);
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Stores the initial buffer. Only legal while the producer holds the
    /// sole reference; with `transfer_ownership` a direct buffer moves
    /// into the region's storage pool.
    pub fn set_buffer(
        &self,
        buf: BufferRef,
        codec: CodecId,
        is_compressed: bool,
        transfer_ownership: bool,
    ) -> Result<()> {
        let refs = self.ref_count();
        if refs != 1 {
            return Err(crate::errstate!(
                "buffer store needs a sole reference, count is {refs}"
            ));
        }
        let mut g = self.guarded.lock()?;
        let ctx = g.region_ctx();
        if let Some(old) = g.buffer.take() {
            if let Some(ctx) = &ctx {
                ctx.update_memory_stats(-(old.capacity() as i64));
                if g.broker_granted > 0 {
                    ctx.broker().release(g.broker_granted);
                }
            }
            g.broker_granted = 0;
            old.release();
        }
        if transfer_ownership {
            if let Some(ctx) = &ctx {
                buf.transfer_to(ctx.storage_pool());
            }
        }
        if let Some(ctx) = &ctx {
            ctx.update_memory_stats(buf.capacity() as i64);
        }
        g.codec = codec;
        g.state = if is_compressed {
            CompressionState::Compressed
        } else {
            CompressionState::Decompressed(1)
        };
        g.from_disk = false;
        g.buffer = Some(buf);
        Ok(())
    }

    /// The stored buffer handle. Only defined while the caller holds a
    /// retain; without one the buffer may be dropped concurrently.
    pub fn get_buffer(&self) -> Option<BufferRef> {
        self.guarded.lock().unwrap().buffer.clone()
    }

    pub fn state(&self) -> CompressionState {
        self.guarded.lock().unwrap().state
    }

    pub fn codec(&self) -> CodecId {
        self.guarded.lock().unwrap().codec
    }

    pub fn is_from_disk(&self) -> bool {
        self.guarded.lock().unwrap().from_disk
    }

    pub fn disk_id(&self) -> Option<Arc<DiskId>> {
        self.guarded.lock().unwrap().disk_id.clone()
    }

    /// Attaches the owning region for stats, codec selection and memory
    /// accounting. The pointer is weak: the region's entry owns the
    /// value, never the other way around.
    pub fn set_region(&self, ctx: &Arc<RegionContext>) {
        let mut g = self.guarded.lock().unwrap();
        if g.region.is_none() {
            g.region = Some(Arc::downgrade(ctx));
            if let Some(buf) = &g.buffer {
                ctx.update_memory_stats(buf.capacity() as i64);
            }
        }
    }

    /// Records where the value was spilled. Idempotent; an attached
    /// region that declares a codec also updates the value's codec.
    pub fn set_disk_location(&self, disk_id: &Arc<DiskId>, ctx: Option<&Arc<RegionContext>>) {
        let mut g = self.guarded.lock().unwrap();
        if g.disk_id.is_none() {
            g.disk_id = Some(Arc::clone(disk_id));
        }
        if let Some(ctx) = ctx {
            if g.region.is_none() {
                g.region = Some(Arc::downgrade(ctx));
            }
            if ctx.codec() != CodecId::None {
                g.codec = ctx.codec();
            }
        }
    }

    /// Retrieves the value with a reference held for the caller,
    /// restoring the buffer from disk when it was evicted. The caller
    /// owns one release on the returned value; an absent buffer on the
    /// result means the entry is gone and is never an error.
    pub fn get_value_retain(
        self: &Arc<Self>,
        decompress: bool,
        compress: bool,
    ) -> Result<Arc<ColumnValue>> {
        if decompress && compress {
            return Err(Error::BadArgument(
                "a view cannot be both compressed and decompressed".to_string(),
            ));
        }

        let (disk_id, region) = {
            let g = self.guarded.lock()?;
            if g.buffer.is_some() && self.retain() {
                drop(g);
                return self.transform(decompress, compress);
            }
            (g.disk_id.clone(), g.region.clone())
        };

        let (Some(disk_id), Some(ctx)) = (disk_id, region.and_then(|w| w.upgrade())) else {
            return Ok(self.absent());
        };

        // Lock order: disk region read lock, then the disk-id monitor,
        // then the instance lock. Nothing else is permitted.
        let overflow = ctx.overflow().read()?;
        let _id_guard = disk_id.lock();

        // Another thread may have recalled the entry while this one
        // waited on the monitor.
        {
            let g = self.guarded.lock()?;
            if g.buffer.is_some() && self.retain() {
                drop(g);
                drop(overflow);
                return self.transform(decompress, compress);
            }
        }

        let Some(store) = overflow.as_ref() else {
            return Ok(self.absent());
        };
        match store.read(&disk_id) {
            Ok(payload) => {
                let buf = BufferRef::heap(payload);
                let (codec, compressed) = classify_payload(&buf)?;
                {
                    let mut g = self.guarded.lock()?;
                    ctx.update_memory_stats(buf.capacity() as i64);
                    g.buffer = Some(buf);
                    g.codec = codec;
                    g.state = if compressed {
                        CompressionState::Compressed
                    } else {
                        CompressionState::Decompressed(1)
                    };
                    g.from_disk = true;
                }
                // The restored reference belongs to the caller.
                self.refs.store(1, Ordering::SeqCst);
                ctx.stats().record_disk_recall();
                drop(overflow);
                self.transform(decompress, compress)
            }
            Err(e) if e.is_entry_absent() => {
                tracing::debug!(error = %e, "disk recall found no entry");
                Ok(self.absent())
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort retain for absent returns, so the caller's
    /// unconditional release stays balanced whether or not the entry was
    /// already dead.
    fn absent(self: &Arc<Self>) -> Arc<ColumnValue> {
        let _ = self.retain();
        Arc::clone(self)
    }

    fn transform(
        self: &Arc<Self>,
        decompress: bool,
        compress: bool,
    ) -> Result<Arc<ColumnValue>> {
        if decompress {
            self.decompress_value()
        } else if compress {
            self.compress_value()
        } else {
            Ok(Arc::clone(self))
        }
    }

    /// Produces a decompressed view. The caller must hold a retain. The
    /// stored buffer is replaced in place unless other readers still use
    /// the compressed direct bytes, in which case a fresh value is
    /// returned and the caller's reference on `self` moves to it.
    pub fn decompress_value(self: &Arc<Self>) -> Result<Arc<ColumnValue>> {
        let mut g = self.guarded.lock()?;
        let Some(buf) = g.buffer.clone() else {
            return Ok(Arc::clone(self));
        };
        match g.state {
            CompressionState::NotCompressible => return Ok(Arc::clone(self)),
            CompressionState::Decompressed(n) => {
                if n > 1 {
                    g.state = CompressionState::Decompressed(1);
                }
                return Ok(Arc::clone(self));
            }
            CompressionState::Compressed => {}
        }

        let leading = buf.duplicate().peek_i32()?;
        if leading >= 0 {
            // The payload disagrees with the tracked state. Clamp to the
            // payload's word, but never silently.
            let ctx = g.region_ctx();
            tracing::warn!(leading, "compressed state over a decompressed payload, clamping");
            if let Some(ctx) = &ctx {
                ctx.stats().record_corrupt_state_clamp();
            }
            g.state = CompressionState::Decompressed(1);
            return Ok(Arc::clone(self));
        }

        let ctx = g.region_ctx();
        let payload = codec::decompress(buf.as_slice(), ctx.as_deref().map(RegionContext::stats))?;
        let new_cap = payload.len();
        let old_cap = buf.capacity();

        // Scratch lives under the decompression owner until it is either
        // transferred to storage or released.
        let scratch = match &ctx {
            Some(ctx) => BufferRef::direct(payload, ctx.decompression_pool()),
            None => BufferRef::heap(payload),
        };

        let replace = !buf.is_direct() || self.ref_count() <= 2;
        if replace {
            if let Some(ctx) = &ctx {
                if !g.from_disk && new_cap > old_cap {
                    if let Err(e) = ctx.broker().acquire(new_cap - old_cap) {
                        scratch.release();
                        return Err(e);
                    }
                    g.broker_granted += new_cap - old_cap;
                }
                scratch.transfer_to(ctx.storage_pool());
                ctx.update_memory_stats(new_cap as i64 - old_cap as i64);
            }
            g.buffer = Some(scratch);
            g.state = CompressionState::Decompressed(1);
            buf.release();
            Ok(Arc::clone(self))
        } else {
            if let Some(ctx) = &ctx {
                scratch.transfer_to(ctx.storage_pool());
            }
            let view = Arc::new(self.sibling(scratch, g.codec, CompressionState::Decompressed(1)));
            drop(g);
            self.release();
            Ok(view)
        }
    }

    /// Compresses the value with its codec. The caller must hold a
    /// retain. Until the hysteresis counter passes
    /// [`MAX_CONSECUTIVE_COMPRESSIONS`] the stored buffer is kept
    /// decompressed and a fresh value carries the compressed bytes; past
    /// it, a compression with no other readers swaps the stored buffer.
    pub fn compress_value(self: &Arc<Self>) -> Result<Arc<ColumnValue>> {
        let mut g = self.guarded.lock()?;
        let counter = match g.state {
            CompressionState::NotCompressible | CompressionState::Compressed => {
                return Ok(Arc::clone(self))
            }
            CompressionState::Decompressed(n) => n,
        };
        if g.codec == CodecId::None {
            return Ok(Arc::clone(self));
        }
        let Some(buf) = g.buffer.clone() else {
            return Ok(Arc::clone(self));
        };

        let ctx = g.region_ctx();
        let Some(compressed) =
            codec::compress(g.codec, buf.as_slice(), ctx.as_deref().map(RegionContext::stats))?
        else {
            // The codec declined to shrink the payload. Sticky until the
            // next set_buffer.
            g.state = CompressionState::NotCompressible;
            return Ok(Arc::clone(self));
        };

        let old_cap = buf.capacity();
        let replace = counter > MAX_CONSECUTIVE_COMPRESSIONS
            && (!buf.is_direct() || self.ref_count() <= 2);
        if replace {
            let mut compressed = compressed;
            if compressed.capacity() - compressed.len() >= TRIM_SLACK_THRESHOLD {
                compressed.shrink_to_fit();
            }
            let new_cap = compressed.len();
            let stored = match &ctx {
                Some(ctx) => BufferRef::direct(compressed, ctx.storage_pool()),
                None => BufferRef::heap(compressed),
            };
            if let Some(ctx) = &ctx {
                ctx.update_memory_stats(new_cap as i64 - old_cap as i64);
                if !g.from_disk && old_cap > new_cap {
                    let freed = (old_cap - new_cap).min(g.broker_granted);
                    if freed > 0 {
                        ctx.broker().release(freed);
                        g.broker_granted -= freed;
                    }
                }
            }
            g.buffer = Some(stored);
            g.state = CompressionState::Compressed;
            buf.release();
            Ok(Arc::clone(self))
        } else {
            g.state = CompressionState::Decompressed(
                counter.saturating_add(1).min(MAX_CONSECUTIVE_COMPRESSIONS + 1),
            );
            let stored = BufferRef::heap(compressed);
            let view = Arc::new(self.sibling(stored, g.codec, CompressionState::Compressed));
            drop(g);
            self.release();
            Ok(view)
        }
    }

    /// A transient value over different bytes of the same cell. Carries
    /// no region pointer: its buffer was never added to region stats and
    /// its release must not subtract from them.
    fn sibling(&self, buf: BufferRef, codec: CodecId, state: CompressionState) -> ColumnValue {
        ColumnValue {
            kind: self.kind,
            refs: AtomicI32::new(1),
            guarded: Mutex::new(Guarded {
                buffer: Some(buf),
                codec,
                state,
                from_disk: false,
                disk_id: None,
                region: None,
                broker_granted: 0,
            }),
        }
    }

    /// Grants the stored buffer's bytes from the region's broker and
    /// remembers the grant so later shrinks and drops release it. The
    /// region calls this when it admits a value; recalled buffers are
    /// never granted.
    pub(crate) fn acquire_storage(&self) -> Result<()> {
        let mut g = self.guarded.lock()?;
        let Some(ctx) = g.region_ctx() else {
            return Ok(());
        };
        let Some(buf) = &g.buffer else {
            return Ok(());
        };
        if g.broker_granted == 0 && !g.from_disk {
            ctx.broker().acquire(buf.capacity())?;
            g.broker_granted = buf.capacity();
        }
        Ok(())
    }

    /// Streams the value to a channel behind the 8-byte inline header.
    /// Values crossing hosts are compressed first; loopback peers get
    /// the current form to save CPU.
    pub fn write_to<C: OutputChannel>(self: &Arc<Self>, channel: &mut C) -> Result<()> {
        let view = self.get_value_retain(false, !channel.is_same_host())?;
        let result = view.write_channel_body(channel);
        view.release();
        result
    }

    fn write_channel_body<C: OutputChannel>(&self, channel: &mut C) -> Result<()> {
        let buf = self.get_buffer();
        let payload = buf.as_ref().map(BufferRef::as_slice).unwrap_or(&[]);
        let mut header = [0u8; WIRE_HEADER_SIZE];
        if !write_serialization_header(self.kind, payload.len(), channel.byte_order(), &mut header)
        {
            return Err(Error::IO("channel rejected an 8-byte header".to_string()));
        }
        channel.write_all(&header)?;
        channel.write_all(payload)?;
        Ok(())
    }

    /// Serializes into an outer writer that supplies its own type prefix:
    /// one pad byte, a big-endian length, then the payload. Non-channel
    /// destinations always receive the compressed form.
    pub fn write_embedded<W: Write>(self: &Arc<Self>, out: &mut W) -> Result<()> {
        let view = self.get_value_retain(false, true)?;
        let result = (|| {
            let buf = view.get_buffer();
            let payload = buf.as_ref().map(BufferRef::as_slice).unwrap_or(&[]);
            out.write_u8(0)?;
            out.write_i32::<BigEndian>(payload.len() as i32)?;
            out.write_all(payload)?;
            Ok(())
        })();
        view.release();
        result
    }

    /// Reads the embedded form produced by [`ColumnValue::write_embedded`]
    /// (or the tail of the channel form, once the outer dispatcher has
    /// consumed the three type bytes) into this fresh container.
    pub fn read_from<I: ValueInput>(&self, input: &mut I, order: WireOrder) -> Result<()> {
        input.skip(1)?;
        let len = input.read_i32(order)?;
        if len == 0 {
            let mut g = self.guarded.lock()?;
            release_buffer(&mut g);
            return Ok(());
        }
        if len < 0 {
            return Err(Error::CorruptValue(format!("negative payload length {len}")));
        }
        let pool = {
            let g = self.guarded.lock()?;
            g.region_ctx().map(|ctx| Arc::clone(ctx.storage_pool()))
        };
        let buf = input.read_buffer(len as usize, pool.as_ref())?;
        let (codec, compressed) = classify_payload(&buf)?;
        self.set_buffer(buf, codec, compressed, false)
    }

    /// Synthetic heap footprint of the container and its buffer. Stable
    /// for a given logical state, independent of the reference count, and
    /// valid after the buffer was dropped.
    pub fn size_in_bytes(&self) -> usize {
        let g = self.guarded.lock().unwrap();
        match &g.buffer {
            Some(buf) => {
                let cleaner = if buf.is_direct() { DIRECT_OBJECT_OVERHEAD } else { 0 };
                CONTAINER_OVERHEAD + BUFFER_WRAPPER_OVERHEAD + cleaner + buf.capacity()
            }
            None => CONTAINER_OVERHEAD,
        }
    }

    /// Off-heap bytes held, including the per-allocation overhead; zero
    /// for heap buffers and absent values.
    pub fn off_heap_size_in_bytes(&self) -> usize {
        let g = self.guarded.lock().unwrap();
        match &g.buffer {
            Some(buf) if buf.is_direct() => buf.capacity() + DIRECT_OBJECT_OVERHEAD,
            _ => 0,
        }
    }
}

/// Containers abandoned without their final release (a failed region
/// admit, an error path) still balance region stats and broker grants.
impl Drop for ColumnValue {
    fn drop(&mut self) {
        if let Ok(g) = self.guarded.get_mut() {
            if g.buffer.is_some() {
                release_buffer(g);
            }
        }
    }
}

impl std::fmt::Debug for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.guarded.lock().unwrap();
        f.debug_struct("ColumnValue")
            .field("kind", &self.kind)
            .field("refs", &self.ref_count())
            .field("state", &g.state)
            .field("codec", &g.codec)
            .field("len", &g.buffer.as_ref().map(BufferRef::capacity))
            .field("from_disk", &g.from_disk)
            .field("spilled", &g.disk_id.is_some())
            .finish()
    }
}

/// Drops the stored buffer: direct memory returns to its pool via the
/// buffer's own release, the region statistic shrinks, and the state
/// parks at `NotCompressible` until a `set_buffer` or a disk recall.
fn release_buffer(g: &mut Guarded) {
    if let Some(buf) = g.buffer.take() {
        if let Some(ctx) = g.region_ctx() {
            ctx.update_memory_stats(-(buf.capacity() as i64));
            if g.broker_granted > 0 {
                ctx.broker().release(g.broker_granted);
            }
        }
        g.broker_granted = 0;
        buf.release();
    }
    g.state = CompressionState::NotCompressible;
    g.from_disk = false;
}

/// Derives `(codec, is_compressed)` from a payload's leading
/// little-endian i32.
fn classify_payload(buf: &BufferRef) -> Result<(CodecId, bool)> {
    let leading = buf.duplicate().peek_i32()?;
    if leading < 0 {
        Ok((CodecId::from_id(-leading)?, true))
    } else {
        Ok((CodecId::DEFAULT, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionConfig;
    use crate::format::{ByteChannel, MemoryInput};
    use crate::memory::{BoundedBroker, BufferPool, UnboundedBroker};
    use crate::tmpfs::TempDir;

    /// A payload that compresses well under any codec.
    fn compressible_payload() -> Vec<u8> {
        let mut payload = vec![0x0A, 0, 0, 0];
        payload.extend(std::iter::repeat(0x42).take(4096));
        payload
    }

    /// Short payloads never beat the codec frame.
    fn incompressible_payload() -> Vec<u8> {
        vec![0x0A, 0, 0, 0]
    }

    fn decompressed_value(payload: Vec<u8>) -> Arc<ColumnValue> {
        Arc::new(ColumnValue::from_payload(payload, ValueKind::Value).unwrap())
    }

    #[test]
    fn test_from_payload_classifies_leading_int() {
        // Leading -2 marks zstd-compressed bytes.
        let compressed =
            codec::compress(CodecId::Zstd, &compressible_payload(), None).unwrap().unwrap();
        let value = ColumnValue::from_payload(compressed, ValueKind::Value).unwrap();
        assert_eq!(value.state(), CompressionState::Compressed);
        assert_eq!(value.codec(), CodecId::Zstd);

        // A non-negative leading int is a decompressed table encoding.
        let value = decompressed_value(incompressible_payload());
        assert_eq!(value.state(), CompressionState::Decompressed(1));
        assert_eq!(value.codec(), CodecId::DEFAULT);
    }

    #[test]
    fn test_set_buffer_requires_sole_reference() {
        let value = decompressed_value(incompressible_payload());
        assert!(value.retain());

        let err = value
            .set_buffer(BufferRef::heap(vec![1, 0, 0, 0]), CodecId::Lz4, false, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        value.release();
        value
            .set_buffer(BufferRef::heap(vec![1, 0, 0, 0]), CodecId::Lz4, false, false)
            .expect("sole reference may replace the buffer");
        assert_eq!(value.ref_count(), 1);
    }

    #[test]
    fn test_compress_then_decompress_restores_payload() {
        let payload = compressible_payload();
        let value = decompressed_value(payload.clone());

        // Push the hysteresis counter past the threshold so compression
        // replaces in place.
        for _ in 0..3 {
            assert!(value.retain());
            let view = value.compress_value().unwrap();
            view.release();
        }
        assert_eq!(value.state(), CompressionState::Compressed);
        assert!(value.get_buffer().unwrap().capacity() < payload.len());

        assert!(value.retain());
        let view = value.decompress_value().unwrap();
        assert_eq!(view.state(), CompressionState::Decompressed(1));
        assert_eq!(view.get_buffer().unwrap().as_slice(), &payload[..]);
        view.release();
    }

    #[test]
    fn test_compression_hysteresis() {
        let value = decompressed_value(compressible_payload());

        // Two external retainers besides the producer.
        assert!(value.retain());
        assert!(value.retain());
        assert_eq!(value.ref_count(), 3);

        // First declined compression: stored buffer untouched, counter
        // advances, the compressed bytes ride out on a fresh value.
        let view = value.compress_value().unwrap();
        assert!(!Arc::ptr_eq(&view, &value));
        assert_eq!(view.state(), CompressionState::Compressed);
        assert_eq!(value.state(), CompressionState::Decompressed(2));
        assert!(value.get_buffer().unwrap().duplicate().peek_i32().unwrap() >= 0);
        view.release();
        assert_eq!(value.ref_count(), 2);

        // Second declined compression pushes the counter past the limit.
        assert!(value.retain());
        let view = value.compress_value().unwrap();
        assert_eq!(value.state(), CompressionState::Decompressed(3));
        view.release();

        // Past the limit and with no other readers, the swap happens.
        assert!(value.retain());
        let view = value.compress_value().unwrap();
        assert!(Arc::ptr_eq(&view, &value));
        assert_eq!(value.state(), CompressionState::Compressed);
        view.release();
        value.release();
        assert_eq!(value.ref_count(), 1);
    }

    #[test]
    fn test_not_compressible_is_sticky() {
        let value = decompressed_value(incompressible_payload());

        assert!(value.retain());
        let view = value.compress_value().unwrap();
        assert!(Arc::ptr_eq(&view, &value));
        assert_eq!(value.state(), CompressionState::NotCompressible);
        view.release();

        // Further compressions are no-ops.
        assert!(value.retain());
        let view = value.compress_value().unwrap();
        assert_eq!(view.state(), CompressionState::NotCompressible);
        view.release();

        // Only a fresh buffer resets the state.
        value
            .set_buffer(
                BufferRef::heap(incompressible_payload()),
                CodecId::Lz4,
                false,
                false,
            )
            .unwrap();
        assert_eq!(value.state(), CompressionState::Decompressed(1));
    }

    #[test]
    fn test_decompress_is_idempotent() {
        let value = decompressed_value(compressible_payload());
        assert!(value.retain());
        let first = value.decompress_value().unwrap();
        first.release();
        assert!(value.retain());
        let second = value.decompress_value().unwrap();
        assert_eq!(second.state(), CompressionState::Decompressed(1));
        second.release();
    }

    #[test]
    fn test_contradictory_flags_rejected() {
        let value = decompressed_value(incompressible_payload());
        let err = value.get_value_retain(true, true).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[test]
    fn test_corrupt_state_clamped_with_counter() {
        let ctx = RegionContext::in_memory(RegionConfig::new("orders"));
        let value = Arc::new(ColumnValue::new(ValueKind::Value));
        value.set_region(&ctx);

        // State says compressed, payload says otherwise.
        value
            .set_buffer(BufferRef::heap(vec![0x0A, 0, 0, 0]), CodecId::Lz4, true, false)
            .unwrap();
        assert_eq!(value.state(), CompressionState::Compressed);

        assert!(value.retain());
        let view = value.decompress_value().unwrap();
        assert_eq!(view.state(), CompressionState::Decompressed(1));
        view.release();
        assert_eq!(ctx.stats().snapshot().corrupt_state_clamps, 1);
    }

    #[test]
    fn test_release_drops_direct_buffer() {
        let pool = BufferPool::new("storage");
        let value = Arc::new(ColumnValue::new(ValueKind::Value));
        value
            .set_buffer(
                BufferRef::direct(vec![0x0A, 0, 0, 0], &pool),
                CodecId::Lz4,
                false,
                false,
            )
            .unwrap();
        assert_eq!(pool.used(), 4);
        assert!(value.off_heap_size_in_bytes() > 0);

        value.release();
        assert_eq!(pool.used(), 0);
        assert!(value.get_buffer().is_none());
        assert_eq!(value.state(), CompressionState::NotCompressible);
        assert_eq!(value.off_heap_size_in_bytes(), 0);
        assert!(!value.retain(), "evicted value must refuse retains");
    }

    #[test]
    fn test_size_estimate_stable_across_release() {
        let value = decompressed_value(incompressible_payload());
        let with_buffer = value.size_in_bytes();
        assert_eq!(
            with_buffer,
            CONTAINER_OVERHEAD + crate::memory::BUFFER_WRAPPER_OVERHEAD + 4
        );
        assert_eq!(value.size_in_bytes(), with_buffer);

        value.release();
        assert_eq!(value.size_in_bytes(), CONTAINER_OVERHEAD);
    }

    fn spilled_value(
        dir: &TempDir,
    ) -> (Arc<RegionContext>, Arc<ColumnValue>, Vec<u8>) {
        let config = RegionConfig::new("orders").overflow_dir(dir.path());
        let ctx = RegionContext::new(config, UnboundedBroker::new()).unwrap();
        let payload = compressible_payload();
        let value = decompressed_value(payload.clone());
        value.set_region(&ctx);

        let key = crate::column::key::ColumnKey::new(42, 7, 0);
        let disk_id = {
            let overflow = ctx.overflow().read().unwrap();
            overflow
                .as_ref()
                .unwrap()
                .append(&key, ValueKind::Value, &payload)
                .unwrap()
        };
        value.set_disk_location(&disk_id, Some(&ctx));
        (ctx, value, payload)
    }

    #[test]
    fn test_spill_and_recall() {
        let dir = TempDir::new().unwrap();
        let (ctx, value, payload) = spilled_value(&dir);

        // Eviction drops the producer reference and with it the buffer.
        value.release();
        assert!(value.get_buffer().is_none());

        let view = value.get_value_retain(false, false).unwrap();
        assert!(Arc::ptr_eq(&view, &value));
        assert_eq!(view.ref_count(), 1);
        assert!(view.is_from_disk());
        assert_eq!(view.get_buffer().unwrap().as_slice(), &payload[..]);
        assert_eq!(ctx.stats().snapshot().disk_recalls, 1);
        view.release();
    }

    #[test]
    fn test_recall_after_region_destroy_is_absent() {
        let dir = TempDir::new().unwrap();
        let (ctx, value, _payload) = spilled_value(&dir);

        value.release();
        ctx.destroy();

        // Engine-internal lifecycle failures surface as absence.
        let view = value.get_value_retain(false, false).unwrap();
        assert!(view.get_buffer().is_none());
        view.release();
    }

    #[test]
    fn test_recall_of_destroyed_entry_is_absent() {
        let dir = TempDir::new().unwrap();
        let (_ctx, value, _payload) = spilled_value(&dir);

        let disk_id = value.disk_id().unwrap();
        value.release();
        disk_id.destroy();

        let view = value.get_value_retain(false, false).unwrap();
        assert!(view.get_buffer().is_none());
        view.release();
    }

    #[test]
    fn test_low_memory_denial_leaves_value_intact() {
        let config = RegionConfig::new("orders");
        let ctx = RegionContext::new(config, BoundedBroker::new(16)).unwrap();

        let compressed =
            codec::compress(CodecId::Lz4, &compressible_payload(), None).unwrap().unwrap();
        let compressed_len = compressed.len();
        let value = Arc::new(ColumnValue::from_payload(compressed, ValueKind::Value).unwrap());
        value.set_region(&ctx);

        assert!(value.retain());
        let err = value.decompress_value().unwrap_err();
        assert!(matches!(err, Error::LowMemory(_)));

        // Prior state intact, and no accounting leaked anywhere.
        assert_eq!(value.state(), CompressionState::Compressed);
        assert_eq!(value.get_buffer().unwrap().capacity(), compressed_len);
        assert_eq!(ctx.broker().used(), 0);
        assert_eq!(ctx.decompression_pool().used(), 0);
        assert_eq!(ctx.storage_pool().used(), 0);
        value.release();
    }

    #[test]
    fn test_write_to_remote_channel_compresses() {
        let value = decompressed_value(compressible_payload());

        let mut channel = ByteChannel::new(WireOrder::Big);
        value.write_to(&mut channel).unwrap();
        let bytes = channel.into_bytes();

        assert_eq!(bytes[0], crate::format::WIRE_SENTINEL);
        assert_eq!(bytes[1], crate::format::COLUMN_TYPE_FAMILY);
        assert_eq!(bytes[2], ValueKind::Value.wire_id());
        assert_eq!(bytes[3], 0);
        let len = i32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 8);
        // The wire payload is compressed even though the stored buffer
        // stays decompressed under the hysteresis.
        let leading = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert!(leading < 0);
        assert_eq!(value.state(), CompressionState::Decompressed(2));
        assert_eq!(value.ref_count(), 1);
    }

    #[test]
    fn test_write_to_loopback_skips_compression() {
        let value = decompressed_value(compressible_payload());

        let mut channel = ByteChannel::same_host(WireOrder::Big);
        value.write_to(&mut channel).unwrap();
        let bytes = channel.into_bytes();

        let leading = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert!(leading >= 0, "loopback peers receive the current form");
        assert_eq!(value.state(), CompressionState::Decompressed(1));
    }

    #[test]
    fn test_channel_round_trip() {
        // The documented four-byte decompressed payload.
        let payload = vec![0x0A, 0, 0, 0];
        let value = decompressed_value(payload.clone());

        let mut channel = ByteChannel::new(WireOrder::Big);
        value.write_to(&mut channel).unwrap();
        let bytes = channel.into_bytes();
        assert_eq!(
            bytes,
            vec![
                crate::format::WIRE_SENTINEL,
                crate::format::COLUMN_TYPE_FAMILY,
                ValueKind::Value.wire_id(),
                0,
                0,
                0,
                0,
                4,
                0x0A,
                0,
                0,
                0
            ]
        );

        // The outer dispatcher consumes the three type bytes; read_from
        // takes over at the pad.
        let data: Arc<[u8]> = bytes.into();
        let mut input = MemoryInput::new(data);
        input.skip(3).unwrap();
        let restored = ColumnValue::new(ValueKind::Value);
        restored.read_from(&mut input, WireOrder::Big).unwrap();
        assert_eq!(restored.state(), CompressionState::Decompressed(1));
        assert_eq!(restored.codec(), CodecId::DEFAULT);
        assert_eq!(restored.get_buffer().unwrap().as_slice(), &payload[..]);
    }

    #[test]
    fn test_read_from_compressed_payload() {
        let framed = codec::compress(CodecId::Zstd, &compressible_payload(), None)
            .unwrap()
            .unwrap();
        let mut bytes = vec![0u8];
        bytes.extend((framed.len() as i32).to_be_bytes());
        bytes.extend_from_slice(&framed);

        let restored = ColumnValue::new(ValueKind::Value);
        let mut input = MemoryInput::new(bytes.into());
        restored.read_from(&mut input, WireOrder::Big).unwrap();
        assert_eq!(restored.state(), CompressionState::Compressed);
        assert_eq!(restored.codec(), CodecId::Zstd);
    }

    #[test]
    fn test_read_from_zero_length_is_absent() {
        let bytes: Arc<[u8]> = vec![0u8, 0, 0, 0, 0].into();
        let restored = ColumnValue::new(ValueKind::Value);
        restored
            .read_from(&mut MemoryInput::new(bytes), WireOrder::Big)
            .unwrap();
        assert!(restored.get_buffer().is_none());
        assert_eq!(restored.state(), CompressionState::NotCompressible);
    }

    #[test]
    fn test_write_embedded_always_compresses() {
        let value = decompressed_value(compressible_payload());
        let mut out = Vec::new();
        value.write_embedded(&mut out).unwrap();

        assert_eq!(out[0], 0);
        let len = i32::from_be_bytes(out[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, out.len() - 5);
        let leading = i32::from_le_bytes(out[5..9].try_into().unwrap());
        assert!(leading < 0, "non-channel outputs receive compressed form");
    }

    #[test]
    fn test_decompress_keeps_shared_direct_bytes() {
        let pool = BufferPool::new("storage");
        let ctx = RegionContext::in_memory(RegionConfig::new("orders"));

        let compressed =
            codec::compress(CodecId::Lz4, &compressible_payload(), None).unwrap().unwrap();
        let value = Arc::new(ColumnValue::new(ValueKind::Value));
        value
            .set_buffer(BufferRef::direct(compressed, &pool), CodecId::Lz4, true, false)
            .unwrap();
        value.set_region(&ctx);

        // Three holders: producer plus two readers of the compressed bytes.
        assert!(value.retain());
        assert!(value.retain());

        let view = value.decompress_value().unwrap();
        assert!(!Arc::ptr_eq(&view, &value), "busy direct bytes are not replaced");
        assert_eq!(view.state(), CompressionState::Decompressed(1));
        assert_eq!(value.state(), CompressionState::Compressed);
        view.release();

        // The remaining reader still sees the compressed bytes.
        assert!(value.get_buffer().unwrap().duplicate().peek_i32().unwrap() < 0);
        value.release();
    }
}
