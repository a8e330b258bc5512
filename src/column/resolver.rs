//! Partition routing for column-batch cells.

use crate::column::key::ColumnKey;

/// The partitioning column every column table declares.
pub const PARTITIONING_COLUMN: &str = "PARTITIONID";

/// Maps a column key to its routing object so that every cell of a row
/// batch routes to the node owning the batch's partition.
#[derive(Clone, Debug, Default)]
pub struct PartitionResolver {
    colocated_region: Option<String>,
}

impl PartitionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver colocated with a master region, e.g. the row table a
    /// column table shadows.
    pub fn colocated_with(region_path: impl Into<String>) -> Self {
        Self {
            colocated_region: Some(region_path.into()),
        }
    }

    /// The routing object for `key`: its partition id.
    pub fn routing_object(&self, key: &ColumnKey) -> i32 {
        key.routing_object()
    }

    pub fn partitioning_columns(&self) -> &'static [&'static str] {
        &[PARTITIONING_COLUMN]
    }

    pub fn colocated_region(&self) -> Option<&str> {
        self.colocated_region.as_deref()
    }

    /// Resolvers hold no resources.
    pub fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_cells_share_a_route() {
        let resolver = PartitionResolver::new();
        let key = ColumnKey::new(42, 7, 0);
        assert_eq!(resolver.routing_object(&key), 7);
        assert_eq!(resolver.routing_object(&key.with_column_index(-1)), 7);
        assert_eq!(resolver.routing_object(&ColumnKey::new(42, 8, 0)), 8);
    }

    #[test]
    fn test_declares_partitioning_column() {
        let resolver = PartitionResolver::new();
        assert_eq!(resolver.partitioning_columns(), ["PARTITIONID"]);
        assert!(resolver.colocated_region().is_none());

        let colocated = PartitionResolver::colocated_with("/app/orders");
        assert_eq!(colocated.colocated_region(), Some("/app/orders"));
        colocated.close();
    }
}
