//! Stream engine: the four commit-mode state machines
//!
//! A stream turns an unbounded sequence of dynamically-typed records into a
//! warehouse table under one of four consistency modes:
//!
//! - [`BulkMode::AutoCommit`]: row-at-a-time inserts, at most one in flight
//! - [`BulkMode::Transactional`]: staged locally, committed atomically
//! - [`BulkMode::ReplaceTable`]: staged into a shadow table, swapped in
//! - [`BulkMode::ReplacePartition`]: staged, then delete-partition + append
//!
//! All modes share the per-record preamble in [`StreamCore`]: status check,
//! normalize, infer and join into the header, derive the desired table,
//! count the row.

mod auto_commit;
mod replace_partition;
mod replace_table;
mod transactional;

pub use auto_commit::AutoCommitStream;
pub use replace_partition::ReplacePartitionStream;
pub use replace_table::ReplaceTableStream;
pub use transactional::TransactionalStream;

use crate::adapter::{WarehouseAdapter, WarehouseOps};
use crate::error::{IngestError, Result};
use crate::object::{normalize_object, Object};
use crate::options::StreamOptions;
use crate::schema::BatchHeader;
use crate::state::{StreamState, StreamStatus};
use crate::table::Table;
use crate::table_helper::TableHelper;
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Reserved column stamped onto every row of a ReplacePartition stream.
pub const PARTITION_ID_COLUMN: &str = "__partition_id";

/// Commit mode of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    /// Row-at-a-time inserts as records arrive.
    AutoCommit,
    /// Atomic batch: stage locally, land everything or nothing.
    Transactional,
    /// Full-table snapshot replacement via an atomic swap.
    ReplaceTable,
    /// Replace one named partition of the destination.
    ReplacePartition,
}

impl fmt::Display for BulkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BulkMode::AutoCommit => "auto_commit",
            BulkMode::Transactional => "transactional",
            BulkMode::ReplaceTable => "replace_table",
            BulkMode::ReplacePartition => "replace_partition",
        };
        f.write_str(s)
    }
}

/// An open ingestion stream.
///
/// Single-writer: the caller drives `consume` sequentially. Terminal
/// statuses are sticky; once the stream completed, failed or aborted,
/// further calls return [`IngestError::StreamInactive`].
#[async_trait]
pub trait IngestStream: Send {
    /// Feed one record. Returns the cumulative state on success; on error
    /// the caller decides whether to keep feeding or abort.
    async fn consume(&mut self, object: Object) -> Result<StreamState>;

    /// Feed one record as raw JSON bytes.
    async fn consume_json(&mut self, payload: &[u8]) -> Result<StreamState> {
        let value: Value = serde_json::from_slice(payload)?;
        match value {
            Value::Object(map) => self.consume(map).await,
            other => Err(IngestError::config(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Drive the mode-specific commit and return the terminal state.
    async fn complete(&mut self) -> Result<StreamState>;

    /// Discard progress. Cleanup of temp tables and staging files is best
    /// effort; failures are logged, not returned.
    async fn abort(&mut self) -> StreamState;

    /// Cumulative state after the most recent call.
    fn state(&self) -> &StreamState;
}

/// Shared per-stream plumbing used by all four modes.
pub(crate) struct StreamCore {
    pub id: String,
    pub adapter: Arc<dyn WarehouseAdapter>,
    pub helper: Arc<TableHelper>,
    pub table_name: String,
    pub mode: BulkMode,
    pub options: StreamOptions,
    pub merge: bool,
    pub state: StreamState,
    pub header: BatchHeader,
    inited: bool,
}

impl StreamCore {
    pub fn new(
        id: impl Into<String>,
        adapter: Arc<dyn WarehouseAdapter>,
        helper: Arc<TableHelper>,
        table_name: impl Into<String>,
        mode: BulkMode,
        options: StreamOptions,
    ) -> Result<Self> {
        let merge = options.merge_rows;
        if merge && options.primary_key.is_empty() {
            return Err(IngestError::config(
                "merge requires a primary key in the destination table; \
                 set the primary key option",
            ));
        }
        let table_name = table_name.into();
        Ok(Self {
            id: id.into(),
            adapter,
            helper,
            header: BatchHeader::new(table_name.clone()),
            table_name,
            mode,
            options,
            merge,
            state: StreamState::new(),
            inited: false,
        })
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(IngestError::StreamInactive(self.state.status))
        }
    }

    pub fn check_cancel(&self) -> Result<()> {
        if self.options.cancellation.is_cancelled() {
            Err(IngestError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Ensure the destination namespace exists, once per stream.
    pub async fn init(&mut self) -> Result<()> {
        if !self.inited {
            self.adapter.init_database().await?;
            self.inited = true;
        }
        Ok(())
    }

    /// Per-record preamble: normalize the record, fold it into the header,
    /// derive the desired table, count the row.
    pub fn preprocess(&mut self, mut object: Object) -> Result<(Table, Object)> {
        self.ensure_active()?;
        normalize_object(&mut object);
        self.header.merge_object(&object, self.options.type_policy);
        self.header.apply_overrides(&self.options.column_types);
        let table = self.desired_table();
        self.state.processed_rows += 1;
        counter!("sluice.rows.consumed").increment(1);
        Ok((table, object))
    }

    /// Desired destination shape for the current header.
    pub fn desired_table(&self) -> Table {
        TableHelper::map_table_schema(
            self.adapter.as_ref(),
            &self.header,
            &self.options,
            &self.table_name,
        )
    }

    /// Account for the outcome of consuming one record. Row-level failures
    /// stay local: the error is recorded and returned, the stream remains
    /// active so the caller may keep feeding.
    pub fn post_consume(&mut self, result: Result<()>) -> Result<StreamState> {
        match result {
            Ok(()) => {
                self.state.successful_rows += 1;
                Ok(self.state.clone())
            }
            Err(err) => {
                self.state.record_row_error(&err);
                counter!("sluice.rows.failed").increment(1);
                Err(err)
            }
        }
    }

    /// Settle the stream after a commit attempt.
    pub fn post_complete(&mut self, result: Result<()>) -> Result<StreamState> {
        match result {
            Ok(()) => {
                self.state.transition(StreamStatus::Completed);
                counter!("sluice.commits.success").increment(1);
                Ok(self.state.clone())
            }
            Err(err) => {
                self.state.last_error = Some(err.to_string());
                self.state.transition(StreamStatus::Failed);
                counter!("sluice.commits.failed").increment(1);
                Err(err)
            }
        }
    }
}

/// Whether `actual` can already hold everything `desired` asks for, i.e.
/// no reconcile is needed before inserting.
pub(crate) fn table_covers(actual: &Table, desired: &Table) -> bool {
    desired.columns.iter().all(|(name, column)| {
        actual
            .columns
            .get(name)
            .map(|existing| column.data_type.fits_into(existing.data_type))
            .unwrap_or(false)
    })
}

/// Staging table descriptor for merge and partition commits: same columns,
/// shadow name, no constraints.
pub(crate) fn staging_table_for(table: &Table, suffix: &str) -> Table {
    let mut tmp = table.renamed(format!("{}_tmp_{}", table.name, suffix));
    tmp.pk_fields.clear();
    tmp.primary_key_name = None;
    tmp.partition = None;
    tmp.temporary = true;
    tmp
}

/// Best-effort drop of a staging table outside the commit path.
pub(crate) async fn drop_staging_table(ops: &dyn WarehouseOps, table_name: &str) {
    if let Err(err) = ops.drop_table(table_name, true).await {
        warn!(table = table_name, %err, "failed to drop staging table");
    }
}

/// Short per-stream suffix for staging table names.
pub(crate) fn stream_suffix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_display() {
        assert_eq!(BulkMode::AutoCommit.to_string(), "auto_commit");
        assert_eq!(BulkMode::Transactional.to_string(), "transactional");
        assert_eq!(BulkMode::ReplaceTable.to_string(), "replace_table");
        assert_eq!(BulkMode::ReplacePartition.to_string(), "replace_partition");
    }

    #[test]
    fn test_stream_suffix_is_short_and_unique() {
        let a = stream_suffix();
        let b = stream_suffix();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_table_covers() {
        use crate::datatype::DataType;
        use crate::table::SqlColumn;

        let mut actual = Table::named("t");
        actual
            .columns
            .insert("a".into(), SqlColumn::new("double precision", DataType::Float64));

        let mut narrower = Table::named("t");
        narrower
            .columns
            .insert("a".into(), SqlColumn::new("bigint", DataType::Int64));
        assert!(table_covers(&actual, &narrower));

        let mut wider = Table::named("t");
        wider
            .columns
            .insert("a".into(), SqlColumn::new("text", DataType::String));
        assert!(!table_covers(&actual, &wider));

        let mut extra = Table::named("t");
        extra
            .columns
            .insert("b".into(), SqlColumn::new("bigint", DataType::Int64));
        assert!(!table_covers(&actual, &extra));
    }
}
