//! Column-batch cells: the composite key, the value container, partition
//! routing, and the reserved-cell payload readers.

pub mod key;
pub mod resolver;
pub mod stats;
pub mod value;

pub use key::{
    ColumnKey, DELETE_MASK_COL_INDEX, DELTA_STATS_ROW_COL_INDEX, STATS_ROW_COL_INDEX,
};
pub use resolver::PartitionResolver;
pub use stats::{DeleteMaskReader, StatsReader};
pub use value::{ColumnValue, CompressionState, MAX_CONSECUTIVE_COMPRESSIONS};
