//! Schema reconciliation against the warehouse
//!
//! The [`TableHelper`] owns a per-destination cache of observed table
//! shapes. Given a desired [`Table`] derived from the stream header, it
//! closes the gap with create/patch DDL (widening only, never dropping a
//! column or narrowing a type) and retries once from a fresh fetch when the
//! warehouse reports that the actual shape drifted under the cache.

use crate::adapter::{WarehouseAdapter, WarehouseOps};
use crate::error::Result;
use crate::options::StreamOptions;
use crate::schema::BatchHeader;
use crate::table::{Granularity, SqlColumn, Table, TablePartition};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Cache of observed table schemas plus the reconcile algorithm.
///
/// Readers take the cache lock briefly; DDL runs under a separate async
/// mutex so concurrent streams of one destination serialize their schema
/// changes without holding the cache lock across I/O.
pub struct TableHelper {
    cache: RwLock<HashMap<String, Table>>,
    ddl_lock: tokio::sync::Mutex<()>,
}

impl Default for TableHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl TableHelper {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ddl_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Build the desired table shape from the stream header and options,
    /// normalizing every identifier through the adapter's policy.
    pub fn map_table_schema(
        adapter: &dyn WarehouseAdapter,
        header: &BatchHeader,
        options: &StreamOptions,
        table_name: &str,
    ) -> Table {
        let mut table = Table::named(adapter.table_name(table_name));
        table.temporary = options.temporary_table;

        for field in header.fields() {
            let column_name = adapter.column_name(&field.name);
            let materialized = field.data_type.materialized();
            let column = match &field.override_type {
                Some(sql_type) => SqlColumn::with_override(sql_type.clone(), materialized),
                None => SqlColumn::new(adapter.sql_type(materialized), materialized),
            };
            match table.columns.entry(column_name) {
                // Distinct source fields can collapse onto one normalized
                // name; their types join.
                indexmap::map::Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    let joined = existing.data_type.join(column.data_type);
                    if joined != existing.data_type && !existing.is_override {
                        *existing = SqlColumn::new(adapter.sql_type(joined), joined);
                    }
                }
                indexmap::map::Entry::Vacant(slot) => {
                    slot.insert(column);
                }
            }
        }

        for pk in &options.primary_key {
            table.pk_fields.insert(adapter.column_name(pk));
        }
        if !table.pk_fields.is_empty() {
            table.primary_key_name = Some(Table::constraint_name(&table.name));
        }

        if let Some(ts) = &options.timestamp_column {
            let field = adapter.column_name(ts);
            table.timestamp_column = Some(field.clone());
            table.partition = Some(TablePartition {
                field,
                granularity: Granularity::Day,
            });
        }

        table
    }

    pub fn cached(&self, table_name: &str) -> Option<Table> {
        self.cache.read().get(table_name).cloned()
    }

    /// Drop the cached shape for a table, forcing the next reconcile to
    /// re-fetch it.
    pub fn invalidate(&self, table_name: &str) {
        self.cache.write().remove(table_name);
    }

    fn store(&self, table: Table) {
        self.cache.write().insert(table.name.clone(), table);
    }

    /// Reconcile `desired` against the warehouse and return the table that
    /// actually exists afterwards. Schema drift triggers exactly one retry
    /// from a fresh fetch; a second drift is fatal for the current commit.
    pub async fn ensure_table(&self, ops: &dyn WarehouseOps, desired: &Table) -> Result<Table> {
        let _ddl = self.ddl_lock.lock().await;

        let mut last_err = None;
        for attempt in 0..2 {
            match self.reconcile(ops, desired).await {
                Ok(table) => return Ok(table),
                Err(err) if err.is_schema_drift() && attempt == 0 => {
                    debug!(table = %desired.name, %err, "schema drift, refetching actual shape");
                    self.invalidate(&desired.name);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("drift retry exhausted"))
    }

    async fn reconcile(&self, ops: &dyn WarehouseOps, desired: &Table) -> Result<Table> {
        let actual = match self.cached(&desired.name) {
            Some(table) => table,
            None => {
                let fetched = ops.get_table_schema(&desired.name).await?;
                if fetched.exists() {
                    self.store(fetched.clone());
                }
                fetched
            }
        };

        if !actual.exists() {
            ops.create_table(desired).await?;
            debug!(table = %desired.name, columns = desired.columns.len(), "created table");
            self.store(desired.clone());
            return Ok(desired.clone());
        }

        let patch = desired.diff(&actual);
        if patch.is_empty_patch() {
            return Ok(actual);
        }

        ops.patch_table_schema(&patch).await?;
        debug!(
            table = %desired.name,
            added = patch.columns.len(),
            pk_changed = !patch.pk_fields.is_empty() || patch.delete_pk,
            "patched table schema"
        );

        let mut merged = actual;
        merged.apply_patch(&patch);
        merged.partition = desired.partition.clone();
        merged.timestamp_column = desired.timestamp_column.clone();
        self.store(merged.clone());
        Ok(merged)
    }
}
