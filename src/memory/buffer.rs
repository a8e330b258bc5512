//! Reference-counted byte buffers.
//!
//! A [`BufferRef`] is a handle to one contiguous byte region, heap or
//! direct, with an explicit retain/release protocol. The count tracks
//! logical readers, not handle copies: cloning the handle does not retain.
//! Reading the bytes is only defined inside a retain window, and the last
//! release returns a direct buffer's accounting to its owner pool exactly
//! once.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::memory::BufferPool;

enum Backing {
    /// Bytes owned by this buffer.
    Owned(Box<[u8]>),
    /// Bytes shared with a memory-backed input; no copy was made.
    Input(Arc<[u8]>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Owned(b) => b,
            Backing::Input(b) => b,
        }
    }
}

struct Shared {
    backing: Backing,
    /// Offset of the payload within the backing region.
    start: usize,
    /// Payload length.
    len: usize,
    direct: bool,
    /// Owner tag. None for heap and shared-input buffers.
    pool: Mutex<Option<Arc<BufferPool>>>,
    refs: AtomicI32,
    /// Accounting returned to the pool exactly once.
    surrendered: AtomicBool,
}

/// A reference-counted view over one contiguous byte region.
#[derive(Clone)]
pub struct BufferRef {
    shared: Arc<Shared>,
}

impl BufferRef {
    /// Wraps heap bytes. The new buffer starts with one reference, owned
    /// by the caller.
    pub fn heap(data: Vec<u8>) -> Self {
        Self::build(Backing::Owned(data.into_boxed_slice()), false, None)
    }

    /// Allocates a direct buffer from `pool`, accounting its capacity to
    /// the pool until the last release.
    pub fn direct(data: Vec<u8>, pool: &Arc<BufferPool>) -> Self {
        pool.grant(data.len());
        Self::build(
            Backing::Owned(data.into_boxed_slice()),
            true,
            Some(Arc::clone(pool)),
        )
    }

    /// Wraps a window of a memory-backed input without copying. Carries no
    /// pool accounting.
    pub fn from_input(data: Arc<[u8]>, start: usize, len: usize) -> Result<Self> {
        if start + len > data.len() {
            return Err(Error::BadArgument(format!(
                "window {start}+{len} exceeds input of {} bytes",
                data.len()
            )));
        }
        let shared = Arc::new(Shared {
            backing: Backing::Input(data),
            start,
            len,
            direct: false,
            pool: Mutex::new(None),
            refs: AtomicI32::new(1),
            surrendered: AtomicBool::new(false),
        });
        Ok(Self { shared })
    }

    fn build(backing: Backing, direct: bool, pool: Option<Arc<BufferPool>>) -> Self {
        let len = backing.bytes().len();
        Self {
            shared: Arc::new(Shared {
                backing,
                start: 0,
                len,
                direct,
                pool: Mutex::new(pool),
                refs: AtomicI32::new(1),
                surrendered: AtomicBool::new(false),
            }),
        }
    }

    /// Atomically takes another reference. Returns false if the count
    /// already hit zero: the buffer lost a race with eviction and must be
    /// treated as absent. Never panics.
    pub fn retain(&self) -> bool {
        let mut count = self.shared.refs.load(Ordering::SeqCst);
        loop {
            if count <= 0 {
                return false;
            }
            match self.shared.refs.compare_exchange(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Drops one reference and returns the remaining count. The release
    /// that reaches zero surrenders a direct buffer's accounting to its
    /// owner pool; exactly one release does so.
    pub fn release(&self) -> i32 {
        let prev = self.shared.refs.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            // Unbalanced release; restore and report rather than go negative.
            self.shared.refs.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(count = prev, "buffer release without matching retain");
            return 0;
        }
        let remaining = prev - 1;
        if remaining == 0 {
            self.surrender_accounting();
        }
        remaining
    }

    fn surrender_accounting(&self) {
        if self.shared.surrendered.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.shared.direct {
            if let Some(pool) = self.shared.pool.lock().unwrap().as_ref() {
                pool.surrender(self.shared.len);
            }
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.shared.refs.load(Ordering::SeqCst)
    }

    pub fn is_direct(&self) -> bool {
        self.shared.direct
    }

    /// Payload capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.len
    }

    /// Backing capacity, including any bytes before the payload window.
    pub fn backing_capacity(&self) -> usize {
        self.shared.backing.bytes().len()
    }

    /// The payload bytes. Only defined while the caller holds a retain.
    pub fn as_slice(&self) -> &[u8] {
        let s = &self.shared;
        &s.backing.bytes()[s.start..s.start + s.len]
    }

    /// Returns an independent read cursor over the payload, positioned at
    /// zero regardless of where the payload sits in the backing region.
    pub fn duplicate(&self) -> BufCursor<'_> {
        BufCursor {
            data: self.as_slice(),
            pos: 0,
        }
    }

    /// Moves the accounting ownership of a direct buffer to `target`.
    /// Heap and shared-input buffers are untagged; this is a no-op for
    /// them.
    pub fn transfer_to(&self, target: &Arc<BufferPool>) {
        if !self.shared.direct {
            return;
        }
        let mut pool = self.shared.pool.lock().unwrap();
        match pool.as_ref() {
            Some(current) if Arc::ptr_eq(current, target) => {}
            Some(current) => {
                target.grant(self.shared.len);
                current.surrender(self.shared.len);
                *pool = Some(Arc::clone(target));
            }
            None => {
                target.grant(self.shared.len);
                *pool = Some(Arc::clone(target));
            }
        }
    }

    /// Name of the owning pool, if the buffer is pool-accounted.
    pub fn pool_name(&self) -> Option<&'static str> {
        self.shared.pool.lock().unwrap().as_ref().map(|p| p.name())
    }
}

/// Safety net for handles abandoned without a final release, e.g. a value
/// dropped on a failed region admit. The surrendered flag keeps the pool
/// accounting exactly-once whichever path runs first.
impl Drop for Shared {
    fn drop(&mut self) {
        if self.direct && !self.surrendered.swap(true, Ordering::SeqCst) {
            if let Some(pool) = self.pool.lock().unwrap().as_ref() {
                pool.surrender(self.len);
            }
        }
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRef")
            .field("len", &self.shared.len)
            .field("direct", &self.shared.direct)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// An independent little-endian read cursor over a buffer's payload.
pub struct BufCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufCursor<'a> {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reads the i32 at the cursor without advancing.
    pub fn peek_i32(&self) -> Result<i32> {
        (&self.data[self.pos..])
            .read_i32::<LittleEndian>()
            .map_err(|_| Error::CorruptValue("payload shorter than its leading int".to_string()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let v = self.peek_i32()?;
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let v = (&self.data[self.pos..])
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::CorruptValue("payload truncated reading u64".to_string()))?;
        self.pos += 8;
        Ok(v)
    }

    /// The bytes from the cursor to the limit.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn advance(&mut self, by: usize) -> Result<()> {
        if by > self.remaining() {
            return Err(Error::CorruptValue(format!(
                "cursor advance of {by} past limit, {} remaining",
                self.remaining()
            )));
        }
        self.pos += by;
        Ok(())
    }
}
