//! Wire and disk layout for column values.
//!
//! A value streamed to a channel carries an 8-byte inline header so the
//! bytes can go straight from the store to a socket or the oplog without
//! an intermediate copy:
//!
//! ```text
//! offset  size  field
//!   0      1   sentinel marking a fixed-id serialized value
//!   1      1   column type family
//!   2      1   value kind (full value, delta, delete delta)
//!   3      1   padding (= 0)
//!   4      4   payload length, in the channel's byte order
//!   8      N   payload bytes
//! ```
//!
//! Embedded in an outer serializer that supplies its own type prefix, the
//! header shrinks to one pad byte plus a big-endian length. The payload
//! itself is always little-endian and starts with an i32 whose sign
//! encodes the compression state.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder as _, LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};
use crate::memory::{BufferPool, BufferRef};

/// First header byte: a fixed-id serialized value follows.
pub const WIRE_SENTINEL: u8 = 0x45;

/// Second header byte: the column-format type family.
pub const COLUMN_TYPE_FAMILY: u8 = 0x43;

/// Total size of the inline channel header.
pub const WIRE_HEADER_SIZE: usize = 8;

/// The kind byte of the inline header distinguishes full column values
/// from delta and delete-delta cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Value,
    Delta,
    DeleteDelta,
}

impl ValueKind {
    pub fn wire_id(&self) -> u8 {
        match self {
            ValueKind::Value => 0x10,
            ValueKind::Delta => 0x11,
            ValueKind::DeleteDelta => 0x12,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self> {
        match id {
            0x10 => Ok(ValueKind::Value),
            0x11 => Ok(ValueKind::Delta),
            0x12 => Ok(ValueKind::DeleteDelta),
            other => Err(Error::CorruptValue(format!("unknown value kind {other:#04x}"))),
        }
    }

    /// The kind a cell at `column_index` serializes as.
    pub fn for_column_index(column_index: i32) -> Self {
        use crate::column::key::{DELETE_MASK_COL_INDEX, DELTA_STATS_ROW_COL_INDEX};
        match column_index {
            DELETE_MASK_COL_INDEX => ValueKind::DeleteDelta,
            DELTA_STATS_ROW_COL_INDEX => ValueKind::Delta,
            _ => ValueKind::Value,
        }
    }
}

/// Byte order a channel's peer expects for the length field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireOrder {
    Big,
    Little,
}

impl WireOrder {
    fn write_i32(&self, dst: &mut [u8], v: i32) {
        match self {
            WireOrder::Big => BigEndian::write_i32(dst, v),
            WireOrder::Little => LittleEndian::write_i32(dst, v),
        }
    }
}

/// Writes the 8-byte inline header into the front of `dst`. Returns false
/// without writing when fewer than 8 bytes are free, so callers can flush
/// and retry.
pub fn write_serialization_header(
    kind: ValueKind,
    payload_len: usize,
    order: WireOrder,
    dst: &mut [u8],
) -> bool {
    if dst.len() < WIRE_HEADER_SIZE {
        return false;
    }
    dst[0] = WIRE_SENTINEL;
    dst[1] = COLUMN_TYPE_FAMILY;
    dst[2] = kind.wire_id();
    dst[3] = 0;
    order.write_i32(&mut dst[4..8], payload_len as i32);
    true
}

/// Destination of the channel write path.
pub trait OutputChannel: Write {
    /// Byte order of the length field on this channel.
    fn byte_order(&self) -> WireOrder {
        WireOrder::Big
    }

    /// Capability probe: true when the peer shares this host. Same-host
    /// writers skip compression to save CPU on loopback.
    fn is_same_host(&self) -> bool {
        false
    }
}

/// An in-memory channel, used wherever a value is staged before hitting
/// a socket or the oplog.
pub struct ByteChannel {
    buf: Vec<u8>,
    order: WireOrder,
    same_host: bool,
}

impl ByteChannel {
    pub fn new(order: WireOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
            same_host: false,
        }
    }

    pub fn same_host(order: WireOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
            same_host: true,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for ByteChannel {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl OutputChannel for ByteChannel {
    fn byte_order(&self) -> WireOrder {
        self.order
    }

    fn is_same_host(&self) -> bool {
        self.same_host
    }
}

/// Source of the read path. Implementations pick the cheapest
/// materialization they can offer for the payload bytes.
pub trait ValueInput {
    fn skip(&mut self, n: usize) -> Result<()>;

    fn read_i32(&mut self, order: WireOrder) -> Result<i32>;

    /// Materializes exactly `len` payload bytes. `pool` tags the buffer
    /// when the implementation allocates direct memory for it.
    fn read_buffer(&mut self, len: usize, pool: Option<&Arc<BufferPool>>) -> Result<BufferRef>;
}

/// A memory-backed input. `read_buffer` hands out a window of the backing
/// bytes without copying.
pub struct MemoryInput {
    data: Arc<[u8]>,
    pos: usize,
}

impl MemoryInput {
    pub fn new(data: Arc<[u8]>) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::IO(format!(
                "input exhausted: wanted {n} bytes at {}, have {}",
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

impl ValueInput for MemoryInput {
    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn read_i32(&mut self, order: WireOrder) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(match order {
            WireOrder::Big => BigEndian::read_i32(bytes),
            WireOrder::Little => LittleEndian::read_i32(bytes),
        })
    }

    fn read_buffer(&mut self, len: usize, _pool: Option<&Arc<BufferPool>>) -> Result<BufferRef> {
        let start = self.pos;
        self.take(len)?;
        BufferRef::from_input(Arc::clone(&self.data), start, len)
    }
}

/// A blocking stream input; payload bytes are bulk-read into a fresh heap
/// buffer.
pub struct StreamInput<R: Read> {
    reader: R,
}

impl<R: Read> StreamInput<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> ValueInput for StreamInput<R> {
    fn skip(&mut self, n: usize) -> Result<()> {
        let mut sink = [0u8; 8];
        let mut left = n;
        while left > 0 {
            let chunk = left.min(sink.len());
            self.reader
                .read_exact(&mut sink[..chunk])
                .map_err(|e| Error::IO(format!("skip: {e}")))?;
            left -= chunk;
        }
        Ok(())
    }

    fn read_i32(&mut self, order: WireOrder) -> Result<i32> {
        let v = match order {
            WireOrder::Big => self.reader.read_i32::<BigEndian>(),
            WireOrder::Little => self.reader.read_i32::<LittleEndian>(),
        };
        v.map_err(|e| Error::IO(format!("read length: {e}")))
    }

    fn read_buffer(&mut self, len: usize, _pool: Option<&Arc<BufferPool>>) -> Result<BufferRef> {
        let mut data = vec![0u8; len];
        self.reader
            .read_exact(&mut data)
            .map_err(|e| Error::IO(format!("read payload: {e}")))?;
        Ok(BufferRef::heap(data))
    }
}

/// A readiness-style channel: `try_read` moves what is available now,
/// `None` when the read would block, `Some(0)` at end of stream.
pub trait NonBlockingRead {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// Input over a non-blocking channel. Payload bytes stream into a fresh
/// direct buffer; a would-block result parks the reader with escalating
/// backoff rather than spinning hot.
pub struct NonBlockingInput<C: NonBlockingRead> {
    channel: C,
}

impl<C: NonBlockingRead> NonBlockingInput<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        let mut parker = Backoff::new();
        while filled < buf.len() {
            match self.channel.try_read(&mut buf[filled..])? {
                Some(0) => {
                    return Err(Error::IO(format!(
                        "end of stream with {} of {} bytes read",
                        filled,
                        buf.len()
                    )))
                }
                Some(n) => {
                    filled += n;
                    parker.reset();
                }
                None => parker.park(),
            }
        }
        Ok(())
    }
}

impl<C: NonBlockingRead> ValueInput for NonBlockingInput<C> {
    fn skip(&mut self, n: usize) -> Result<()> {
        let mut sink = vec![0u8; n];
        self.read_full(&mut sink)
    }

    fn read_i32(&mut self, order: WireOrder) -> Result<i32> {
        let mut bytes = [0u8; 4];
        self.read_full(&mut bytes)?;
        Ok(match order {
            WireOrder::Big => BigEndian::read_i32(&bytes),
            WireOrder::Little => LittleEndian::read_i32(&bytes),
        })
    }

    fn read_buffer(&mut self, len: usize, pool: Option<&Arc<BufferPool>>) -> Result<BufferRef> {
        let mut data = vec![0u8; len];
        self.read_full(&mut data)?;
        Ok(match pool {
            Some(pool) => BufferRef::direct(data, pool),
            None => BufferRef::heap(data),
        })
    }
}

/// Busy-wait with backoff: spin briefly, then yield, then sleep.
struct Backoff {
    rounds: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { rounds: 0 }
    }

    fn reset(&mut self) {
        self.rounds = 0;
    }

    fn park(&mut self) {
        self.rounds += 1;
        if self.rounds <= 16 {
            std::hint::spin_loop();
        } else if self.rounds <= 64 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut dst = [0u8; 12];
        assert!(write_serialization_header(
            ValueKind::Value,
            4,
            WireOrder::Big,
            &mut dst
        ));
        assert_eq!(
            &dst[..8],
            &[WIRE_SENTINEL, COLUMN_TYPE_FAMILY, 0x10, 0, 0, 0, 0, 4]
        );
    }

    #[test]
    fn test_header_length_respects_channel_order() {
        let mut dst = [0u8; 8];
        assert!(write_serialization_header(
            ValueKind::Delta,
            4,
            WireOrder::Little,
            &mut dst
        ));
        assert_eq!(&dst[4..8], &[4, 0, 0, 0]);
    }

    #[test]
    fn test_header_needs_eight_bytes() {
        let mut dst = [0u8; 7];
        assert!(!write_serialization_header(
            ValueKind::Value,
            4,
            WireOrder::Big,
            &mut dst
        ));
        assert_eq!(dst, [0u8; 7], "short destination left untouched");
    }

    #[test]
    fn test_value_kind_round_trip() {
        for kind in [ValueKind::Value, ValueKind::Delta, ValueKind::DeleteDelta] {
            assert_eq!(ValueKind::from_wire_id(kind.wire_id()).unwrap(), kind);
        }
        assert!(ValueKind::from_wire_id(0x7F).is_err());
    }

    #[test]
    fn test_kind_for_reserved_indexes() {
        use crate::column::key::{
            DELETE_MASK_COL_INDEX, DELTA_STATS_ROW_COL_INDEX, STATS_ROW_COL_INDEX,
        };
        assert_eq!(
            ValueKind::for_column_index(DELETE_MASK_COL_INDEX),
            ValueKind::DeleteDelta
        );
        assert_eq!(
            ValueKind::for_column_index(DELTA_STATS_ROW_COL_INDEX),
            ValueKind::Delta
        );
        assert_eq!(
            ValueKind::for_column_index(STATS_ROW_COL_INDEX),
            ValueKind::Value
        );
        assert_eq!(ValueKind::for_column_index(3), ValueKind::Value);
    }

    #[test]
    fn test_memory_input_is_zero_copy() {
        let data: Arc<[u8]> = vec![0u8, 9, 9, 9, 1, 2, 3].into();
        let mut input = MemoryInput::new(Arc::clone(&data));
        input.skip(4).unwrap();
        let buf = input.read_buffer(3, None).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_stream_input_reads_exact() {
        let bytes = vec![0u8, 0, 0, 0, 5, 0xAA, 0xBB];
        let mut input = StreamInput::new(&bytes[..]);
        input.skip(0).unwrap();
        assert_eq!(input.read_i32(WireOrder::Big).unwrap(), 5);
        let buf = input.read_buffer(2, None).unwrap();
        assert_eq!(buf.as_slice(), &[0xAA, 0xBB]);

        // Exhausted input is an IO error, not a panic.
        assert!(input.read_buffer(1, None).is_err());
    }

    /// A channel that reports would-block between every chunk.
    struct Choppy {
        data: Vec<u8>,
        pos: usize,
        ready: bool,
    }

    impl NonBlockingRead for Choppy {
        fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
            if self.pos >= self.data.len() {
                return Ok(Some(0));
            }
            if !self.ready {
                self.ready = true;
                return Ok(None);
            }
            self.ready = false;
            let n = buf.len().min(2).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(Some(n))
        }
    }

    #[test]
    fn test_non_blocking_input_retries_until_filled() {
        let mut input = NonBlockingInput::new(Choppy {
            data: vec![0, 0, 0, 6, 1, 2, 3, 4, 5, 6],
            pos: 0,
            ready: false,
        });
        assert_eq!(input.read_i32(WireOrder::Big).unwrap(), 6);
        let buf = input.read_buffer(6, None).unwrap();
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_non_blocking_eof_propagates() {
        let mut input = NonBlockingInput::new(Choppy {
            data: vec![1, 2],
            pos: 0,
            ready: true,
        });
        let err = input.read_buffer(4, None).unwrap_err();
        assert!(matches!(err, Error::IO(_)));
    }
}
