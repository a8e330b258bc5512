//! Composite keys for column-batch cells.
//!
//! A key names one column of one row batch in one partition. All columns
//! of a batch share the same `(uuid, partition_id)`, and the hash is
//! computed from those two components only, so every cell of a batch
//! lands in the same hash bucket and an iterator seeking all columns of
//! one batch gets hash colocation for free.

use std::hash::{Hash, Hasher};
use std::io::Write;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Reserved index of the per-batch statistics row.
pub const STATS_ROW_COL_INDEX: i32 = -1;

/// Reserved index of the delta statistics row.
pub const DELTA_STATS_ROW_COL_INDEX: i32 = -2;

/// Reserved index of the delete bitmap cell. Must remain the numerically
/// smallest reserved index; index arithmetic in batch scans depends on it
/// sorting before every other cell of the batch.
pub const DELETE_MASK_COL_INDEX: i32 = -3;

/// Encoded size of a key on wire and disk.
pub const ENCODED_KEY_SIZE: usize = 16;

/// Immutable identifier of a column-batch cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ColumnKey {
    uuid: u64,
    partition_id: i32,
    column_index: i32,
}

impl ColumnKey {
    pub fn new(uuid: u64, partition_id: i32, column_index: i32) -> Self {
        Self {
            uuid,
            partition_id,
            column_index,
        }
    }

    /// The row batch this cell belongs to.
    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    pub fn partition_id(&self) -> i32 {
        self.partition_id
    }

    /// Data column selector; negative values are reserved cells.
    pub fn column_index(&self) -> i32 {
        self.column_index
    }

    /// A key for a sibling cell of the same batch and partition.
    pub fn with_column_index(&self, column_index: i32) -> Self {
        Self {
            column_index,
            ..*self
        }
    }

    /// The routing object the partition engine hashes: the partition id.
    pub fn routing_object(&self) -> i32 {
        self.partition_id
    }

    /// True for the reserved negative indexes (stats rows, delete mask).
    pub fn is_reserved(&self) -> bool {
        self.column_index < 0
    }

    /// Writes the 16-byte big-endian wire form.
    pub fn encode<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_u64::<BigEndian>(self.uuid)?;
        out.write_i32::<BigEndian>(self.partition_id)?;
        out.write_i32::<BigEndian>(self.column_index)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; ENCODED_KEY_SIZE] {
        let mut buf = [0u8; ENCODED_KEY_SIZE];
        let mut cursor = &mut buf[..];
        // Writing into a fixed array cannot fail.
        self.encode(&mut cursor).expect("fixed-size key encode");
        buf
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENCODED_KEY_SIZE {
            return Err(Error::CorruptValue(format!(
                "column key needs {ENCODED_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let uuid = bytes.read_u64::<BigEndian>()?;
        let partition_id = bytes.read_i32::<BigEndian>()?;
        let column_index = bytes.read_i32::<BigEndian>()?;
        Ok(Self {
            uuid,
            partition_id,
            column_index,
        })
    }
}

impl Hash for ColumnKey {
    /// Hashes `(uuid, partition_id)` only, never the column index.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
        self.partition_id.hash(state);
    }
}
