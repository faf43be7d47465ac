//! Warehouse adapter contract
//!
//! The narrow interface the engine consumes; one implementation per
//! warehouse. The operation set is split in two: [`WarehouseOps`] holds
//! everything that can run either directly or inside a transaction, and
//! [`WarehouseAdapter`] adds the connection-scoped pieces (init, ping,
//! transactions, identifier/type/batch-file policies).
//!
//! Warehouses without SQL transactions return a [`PassthroughTx`] from
//! `open_tx`: commit and rollback are no-ops and atomicity comes from
//! staging tables plus `replace_table`-style swaps.

use crate::batch_file::{BatchFileFormat, FileCompression, LoadSource};
use crate::datatype::DataType;
use crate::error::Result;
use crate::identifier::IdentifierPolicy;
use crate::object::Object;
use crate::stream::BulkMode;
use crate::table::Table;
use async_trait::async_trait;
use std::sync::Arc;

/// Operations available both directly and within a transaction.
#[async_trait]
pub trait WarehouseOps: Send + Sync {
    /// Fetch the current shape of a table. Returns an empty [`Table`] when
    /// the table does not exist; absence is not an error.
    async fn get_table_schema(&self, table_name: &str) -> Result<Table>;

    async fn create_table(&self, table: &Table) -> Result<()>;

    /// Apply a widening-only patch produced by [`Table::diff`]: new columns,
    /// widened column types, and primary key replacement (`delete_pk` plus
    /// the new `pk_fields`/`primary_key_name`).
    async fn patch_table_schema(&self, patch: &Table) -> Result<()>;

    async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<()>;

    async fn truncate_table(&self, table_name: &str) -> Result<()>;

    /// Append or merge all rows of `source` into `target`. With `merge`,
    /// rows are upserted on `target.pk_fields`. Returns the row count moved.
    async fn copy_tables(&self, target: &Table, source: &Table, merge: bool) -> Result<u64>;

    /// Atomically swap `target_name` with `replacement`; when the target
    /// does not exist the replacement is renamed over it. Readers observe a
    /// single cutover. With `drop_old` the displaced table is dropped.
    async fn replace_table(
        &self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()>;

    /// Bulk-load a local staging file into `target`. Returns the row count.
    async fn load_table(&self, target: &Table, source: &LoadSource) -> Result<u64>;

    /// Row-wise insert path used by the row-at-a-time mode. With `merge`,
    /// each row is upserted on the primary key.
    async fn insert(&self, table: &Table, merge: bool, objects: &[Object]) -> Result<()>;

    /// Delete all rows of the named partition. Returns the row count removed.
    async fn delete_partition(&self, table_name: &str, partition_id: &str) -> Result<u64>;
}

/// A logical transaction over the operation set.
#[async_trait]
pub trait WarehouseTx: WarehouseOps {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A warehouse implementation.
#[async_trait]
pub trait WarehouseAdapter: WarehouseOps {
    /// Registry type id, e.g. `"postgres"`.
    fn type_id(&self) -> &'static str;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<()>;

    /// Ensure the configured namespace (schema, dataset, database) exists.
    async fn init_database(&self) -> Result<()>;

    /// Begin a logical transaction. Warehouses without transactions return
    /// a pass-through wrapper whose commit/rollback do nothing.
    async fn open_tx(&self) -> Result<Box<dyn WarehouseTx>>;

    /// Release underlying connections.
    async fn close(&self) -> Result<()>;

    /// Identifier rules of this dialect.
    fn identifier_policy(&self) -> &IdentifierPolicy;

    /// Normalized table name for this dialect.
    fn table_name(&self, name: &str) -> String {
        self.identifier_policy().normalize(name)
    }

    /// Normalized column name for this dialect.
    fn column_name(&self, name: &str) -> String {
        self.identifier_policy().normalize(name)
    }

    /// Column name quoted for use in a statement.
    fn quoted_column_name(&self, name: &str) -> String {
        self.identifier_policy().quote(name)
    }

    /// Namespace-qualified, quoted table reference.
    fn full_table_name(&self, name: &str) -> String;

    /// Dialect SQL type for a logical type.
    fn sql_type(&self, data_type: DataType) -> &str;

    /// Logical type for a dialect SQL type string.
    fn data_type(&self, sql_type: &str) -> DataType;

    /// Format of the staging file this adapter bulk-loads.
    fn batch_file_format(&self) -> BatchFileFormat;

    /// Compression of the staging file this adapter bulk-loads.
    fn batch_file_compression(&self) -> FileCompression {
        FileCompression::None
    }

    /// Whether this adapter supports the given commit mode. Rejection
    /// happens at stream creation.
    fn supports_mode(&self, _mode: BulkMode) -> bool {
        true
    }
}

/// No-op transaction wrapper for warehouses without SQL transactions:
/// operations pass straight through to the shared handle, commit and
/// rollback do nothing.
pub struct PassthroughTx<T: WarehouseOps + ?Sized>(pub Arc<T>);

#[async_trait]
impl<T: WarehouseOps + ?Sized> WarehouseOps for PassthroughTx<T> {
    async fn get_table_schema(&self, table_name: &str) -> Result<Table> {
        self.0.get_table_schema(table_name).await
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        self.0.create_table(table).await
    }

    async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
        self.0.patch_table_schema(patch).await
    }

    async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<()> {
        self.0.drop_table(table_name, if_exists).await
    }

    async fn truncate_table(&self, table_name: &str) -> Result<()> {
        self.0.truncate_table(table_name).await
    }

    async fn copy_tables(&self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        self.0.copy_tables(target, source, merge).await
    }

    async fn replace_table(
        &self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        self.0.replace_table(target_name, replacement, drop_old).await
    }

    async fn load_table(&self, target: &Table, source: &LoadSource) -> Result<u64> {
        self.0.load_table(target, source).await
    }

    async fn insert(&self, table: &Table, merge: bool, objects: &[Object]) -> Result<()> {
        self.0.insert(table, merge, objects).await
    }

    async fn delete_partition(&self, table_name: &str, partition_id: &str) -> Result<u64> {
        self.0.delete_partition(table_name, partition_id).await
    }
}

#[async_trait]
impl<T: WarehouseOps + ?Sized> WarehouseTx for PassthroughTx<T> {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
