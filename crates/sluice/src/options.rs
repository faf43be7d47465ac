//! Stream options
//!
//! Consuming builder passed to `Destination::create_stream`. Options tune
//! how the desired table is shaped (primary key, overrides, partitioning)
//! and how rows land (merge vs append).

use crate::object::TypePolicy;
use crate::schema::SqlTypes;
use tokio_util::sync::CancellationToken;

/// Options recognized at stream creation.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Primary key columns of the desired table. Required when merge is on.
    pub primary_key: Vec<String>,
    /// Upsert on the primary key instead of appending.
    pub merge_rows: bool,
    /// Identifier of the partition to replace (ReplacePartition mode only).
    pub partition_id: Option<String>,
    /// Per-column dialect type overrides.
    pub column_types: SqlTypes,
    /// Column to use for time-partitioned tables.
    pub timestamp_column: Option<String>,
    /// Mark the destination table temporary.
    pub temporary_table: bool,
    /// Advisory target rows per commit; the engine never auto-flushes.
    pub batch_size: Option<usize>,
    /// Value typing policy for inference.
    pub type_policy: TypePolicy,
    /// Cooperative cancellation for commit suspension points.
    pub cancellation: CancellationToken,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_merge_rows(mut self) -> Self {
        self.merge_rows = true;
        self
    }

    pub fn with_partition(mut self, partition_id: impl Into<String>) -> Self {
        self.partition_id = Some(partition_id.into());
        self
    }

    pub fn with_column_types(mut self, types: SqlTypes) -> Self {
        self.column_types = types;
        self
    }

    pub fn with_timestamp(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = Some(column.into());
        self
    }

    pub fn with_temporary_table(mut self) -> Self {
        self.temporary_table = true;
        self
    }

    pub fn with_batch_size(mut self, rows: usize) -> Self {
        self.batch_size = Some(rows);
        self
    }

    pub fn with_round_floats(mut self) -> Self {
        self.type_policy.round_floats_to_int = true;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let options = StreamOptions::new()
            .with_primary_key(["id"])
            .with_merge_rows()
            .with_partition("20240115")
            .with_column_types(SqlTypes::new().with("d", "date"))
            .with_timestamp("ts")
            .with_temporary_table()
            .with_batch_size(500)
            .with_round_floats();

        assert_eq!(options.primary_key, vec!["id"]);
        assert!(options.merge_rows);
        assert_eq!(options.partition_id.as_deref(), Some("20240115"));
        assert_eq!(options.column_types.get("d"), Some("date"));
        assert_eq!(options.timestamp_column.as_deref(), Some("ts"));
        assert!(options.temporary_table);
        assert_eq!(options.batch_size, Some(500));
        assert!(options.type_policy.round_floats_to_int);
    }

    #[test]
    fn test_defaults() {
        let options = StreamOptions::new();
        assert!(options.primary_key.is_empty());
        assert!(!options.merge_rows);
        assert!(options.partition_id.is_none());
        assert!(!options.cancellation.is_cancelled());
    }
}
