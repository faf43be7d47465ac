//! In-memory warehouse adapter for tests
//!
//! [`MemoryAdapter`] implements the full adapter contract against process
//! memory. Transactions are snapshots: a transaction clones the table map,
//! operates on the clone, and publishes it on commit, so tests can observe
//! the engine's atomicity guarantees for real. Knobs exist to reject commit
//! modes and to fail the next bulk load with a schema-drift error.

use crate::adapter::{WarehouseAdapter, WarehouseOps, WarehouseTx};
use crate::batch_file::{BatchFileFormat, FileCompression, LoadSource};
use crate::datatype::DataType;
use crate::error::{DbContext, DbOp, IngestError, Result};
use crate::identifier::IdentifierPolicy;
use crate::object::Object;
use crate::stream::{BulkMode, PARTITION_ID_COLUMN};
use crate::table::Table;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// One stored table: its schema descriptor and its rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub schema: Table,
    pub rows: Vec<Object>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    drift_injections: AtomicU32,
    unsupported: Mutex<Vec<BulkMode>>,
    policy: IdentifierPolicy,
}

/// In-memory adapter with snapshot transactions.
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                drift_injections: AtomicU32::new(0),
                unsupported: Mutex::new(Vec::new()),
                policy: IdentifierPolicy {
                    max_length: 63,
                    reserved_words: &["select", "from", "where", "table", "group", "order"],
                    quote_char: '"',
                    lowercase: false,
                },
            }),
        }
    }

    /// Reject the given commit mode at stream creation.
    pub fn with_unsupported_mode(self, mode: BulkMode) -> Self {
        self.inner.unsupported.lock().push(mode);
        self
    }

    /// Make the next bulk load fail with a schema-drift error.
    pub fn inject_drift_once(&self) {
        self.inner.drift_injections.fetch_add(1, Ordering::SeqCst);
    }

    /// Seed a table with a schema and rows.
    pub fn put_table(&self, schema: Table, rows: Vec<Object>) {
        let name = schema.name.clone();
        self.inner
            .state
            .lock()
            .tables
            .insert(name, MemoryTable { schema, rows });
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.inner.state.lock().tables.get(name).cloned()
    }

    pub fn rows(&self, name: &str) -> Vec<Object> {
        self.table(name).map(|t| t.rows).unwrap_or_default()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.rows(name).len()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.inner.state.lock().tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.inner.state.lock().tables.keys().cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Operation bodies shared by the live adapter and its transactions
// ─────────────────────────────────────────────────────────────────

fn exec_get_table_schema(state: &MemoryState, name: &str) -> Table {
    state
        .tables
        .get(name)
        .map(|t| t.schema.clone())
        .unwrap_or_else(|| Table::named(name))
}

fn exec_create_table(state: &mut MemoryState, table: &Table) -> Result<()> {
    if state.tables.contains_key(&table.name) {
        return Err(IngestError::SchemaDrift(format!(
            "table {} already exists",
            table.name
        )));
    }
    state.tables.insert(
        table.name.clone(),
        MemoryTable {
            schema: table.clone(),
            rows: Vec::new(),
        },
    );
    Ok(())
}

fn exec_patch_table_schema(state: &mut MemoryState, patch: &Table) -> Result<()> {
    let table = state.tables.get_mut(&patch.name).ok_or_else(|| {
        IngestError::SchemaDrift(format!("table {} disappeared", patch.name))
    })?;
    table.schema.apply_patch(patch);
    Ok(())
}

fn exec_drop_table(state: &mut MemoryState, name: &str, if_exists: bool) -> Result<()> {
    if state.tables.remove(name).is_none() && !if_exists {
        return Err(IngestError::TableNotExist(name.to_string()));
    }
    Ok(())
}

fn exec_truncate_table(state: &mut MemoryState, name: &str) -> Result<()> {
    if let Some(table) = state.tables.get_mut(name) {
        table.rows.clear();
    }
    Ok(())
}

fn pk_key(row: &Object, pk_fields: &[String]) -> Vec<Value> {
    pk_fields
        .iter()
        .map(|f| row.get(f.as_str()).cloned().unwrap_or(Value::Null))
        .collect()
}

fn upsert_rows(target: &mut Vec<Object>, pk_fields: &[String], incoming: &[Object]) {
    for row in incoming {
        let key = pk_key(row, pk_fields);
        match target.iter_mut().find(|r| pk_key(r, pk_fields) == key) {
            Some(existing) => *existing = row.clone(),
            None => target.push(row.clone()),
        }
    }
}

fn exec_copy_tables(
    state: &mut MemoryState,
    target: &Table,
    source: &Table,
    merge: bool,
) -> Result<u64> {
    let source_rows = state
        .tables
        .get(&source.name)
        .map(|t| t.rows.clone())
        .ok_or_else(|| {
            IngestError::db(
                DbOp::Copy,
                format!("source table {} not found", source.name),
                DbContext::new().table(&target.name),
            )
        })?;
    let moved = source_rows.len() as u64;

    let dst = state.tables.get_mut(&target.name).ok_or_else(|| {
        IngestError::db(
            DbOp::Copy,
            format!("target table {} not found", target.name),
            DbContext::new().table(&target.name),
        )
    })?;

    if merge {
        if target.pk_fields.is_empty() {
            return Err(IngestError::db(
                DbOp::Merge,
                "merge requires a primary key",
                DbContext::new().table(&target.name),
            ));
        }
        let pk: Vec<String> = target.pk_fields.iter().cloned().collect();
        upsert_rows(&mut dst.rows, &pk, &source_rows);
    } else {
        dst.rows.extend(source_rows);
    }
    Ok(moved)
}

fn exec_replace_table(
    state: &mut MemoryState,
    target_name: &str,
    replacement: &Table,
    drop_old: bool,
) -> Result<()> {
    let mut incoming = state.tables.remove(&replacement.name).ok_or_else(|| {
        IngestError::db(
            DbOp::Replace,
            format!("replacement table {} not found", replacement.name),
            DbContext::new().table(target_name),
        )
    })?;
    let displaced = state.tables.remove(target_name);

    incoming.schema = incoming.schema.renamed(target_name);
    state.tables.insert(target_name.to_string(), incoming);

    if !drop_old {
        if let Some(mut old) = displaced {
            old.schema = old.schema.renamed(&replacement.name);
            state.tables.insert(replacement.name.clone(), old);
        }
    }
    Ok(())
}

fn exec_load_table(state: &mut MemoryState, target: &Table, source: &LoadSource) -> Result<u64> {
    if source.format != BatchFileFormat::Ndjson || source.compression != FileCompression::None {
        return Err(IngestError::db(
            DbOp::Load,
            "memory adapter loads plain newline-delimited JSON only",
            DbContext::new().table(&target.name),
        ));
    }

    let mut rows = Vec::new();
    let reader = BufReader::new(File::open(&source.path)?);
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        rows.push(serde_json::from_str::<Object>(&line)?);
    }

    let table = state.tables.get_mut(&target.name).ok_or_else(|| {
        IngestError::db(
            DbOp::Load,
            format!("table {} not found", target.name),
            DbContext::new().table(&target.name),
        )
    })?;
    let loaded = rows.len() as u64;
    table.rows.extend(rows);
    Ok(loaded)
}

fn exec_insert(state: &mut MemoryState, table: &Table, merge: bool, objects: &[Object]) -> Result<()> {
    let stored = state.tables.get_mut(&table.name).ok_or_else(|| {
        IngestError::db(
            DbOp::Insert,
            format!("table {} not found", table.name),
            DbContext::new().table(&table.name),
        )
    })?;
    if merge {
        let pk: Vec<String> = table.pk_fields.iter().cloned().collect();
        if pk.is_empty() {
            return Err(IngestError::db(
                DbOp::Merge,
                "merge requires a primary key",
                DbContext::new().table(&table.name),
            ));
        }
        upsert_rows(&mut stored.rows, &pk, objects);
    } else {
        stored.rows.extend(objects.iter().cloned());
    }
    Ok(())
}

fn exec_delete_partition(
    state: &mut MemoryState,
    table_name: &str,
    partition_id: &str,
) -> Result<u64> {
    let table = state
        .tables
        .get_mut(table_name)
        .ok_or_else(|| IngestError::TableNotExist(table_name.to_string()))?;
    let before = table.rows.len();
    table.rows.retain(|row| {
        row.get(PARTITION_ID_COLUMN)
            .and_then(Value::as_str)
            .map(|id| id != partition_id)
            .unwrap_or(true)
    });
    Ok((before - table.rows.len()) as u64)
}

fn take_drift_injection(inner: &MemoryInner) -> bool {
    inner
        .drift_injections
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ─────────────────────────────────────────────────────────────────
// Live adapter
// ─────────────────────────────────────────────────────────────────

#[async_trait]
impl WarehouseOps for MemoryAdapter {
    async fn get_table_schema(&self, table_name: &str) -> Result<Table> {
        Ok(exec_get_table_schema(&self.inner.state.lock(), table_name))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        exec_create_table(&mut self.inner.state.lock(), table)
    }

    async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
        exec_patch_table_schema(&mut self.inner.state.lock(), patch)
    }

    async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<()> {
        exec_drop_table(&mut self.inner.state.lock(), table_name, if_exists)
    }

    async fn truncate_table(&self, table_name: &str) -> Result<()> {
        exec_truncate_table(&mut self.inner.state.lock(), table_name)
    }

    async fn copy_tables(&self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        exec_copy_tables(&mut self.inner.state.lock(), target, source, merge)
    }

    async fn replace_table(
        &self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        exec_replace_table(&mut self.inner.state.lock(), target_name, replacement, drop_old)
    }

    async fn load_table(&self, target: &Table, source: &LoadSource) -> Result<u64> {
        if take_drift_injection(&self.inner) {
            return Err(IngestError::SchemaDrift("injected".to_string()));
        }
        exec_load_table(&mut self.inner.state.lock(), target, source)
    }

    async fn insert(&self, table: &Table, merge: bool, objects: &[Object]) -> Result<()> {
        exec_insert(&mut self.inner.state.lock(), table, merge, objects)
    }

    async fn delete_partition(&self, table_name: &str, partition_id: &str) -> Result<u64> {
        exec_delete_partition(&mut self.inner.state.lock(), table_name, partition_id)
    }
}

#[async_trait]
impl WarehouseAdapter for MemoryAdapter {
    fn type_id(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn init_database(&self) -> Result<()> {
        Ok(())
    }

    async fn open_tx(&self) -> Result<Box<dyn WarehouseTx>> {
        let snapshot = self.inner.state.lock().clone();
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            staged: Mutex::new(snapshot),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn identifier_policy(&self) -> &IdentifierPolicy {
        &self.inner.policy
    }

    fn full_table_name(&self, name: &str) -> String {
        self.inner.policy.quote(name)
    }

    fn sql_type(&self, data_type: DataType) -> &str {
        match data_type {
            DataType::String | DataType::Unknown => "text",
            DataType::Int64 => "bigint",
            DataType::Float64 => "double precision",
            DataType::Timestamp => "timestamp",
            DataType::Bool => "boolean",
            DataType::Json => "json",
        }
    }

    fn data_type(&self, sql_type: &str) -> DataType {
        match sql_type {
            "bigint" => DataType::Int64,
            "double precision" => DataType::Float64,
            "timestamp" => DataType::Timestamp,
            "boolean" => DataType::Bool,
            "json" => DataType::Json,
            _ => DataType::String,
        }
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        BatchFileFormat::Ndjson
    }

    fn supports_mode(&self, mode: BulkMode) -> bool {
        !self.inner.unsupported.lock().contains(&mode)
    }
}

// ─────────────────────────────────────────────────────────────────
// Snapshot transaction
// ─────────────────────────────────────────────────────────────────

struct MemoryTx {
    inner: Arc<MemoryInner>,
    staged: Mutex<MemoryState>,
}

#[async_trait]
impl WarehouseOps for MemoryTx {
    async fn get_table_schema(&self, table_name: &str) -> Result<Table> {
        Ok(exec_get_table_schema(&self.staged.lock(), table_name))
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        exec_create_table(&mut self.staged.lock(), table)
    }

    async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
        exec_patch_table_schema(&mut self.staged.lock(), patch)
    }

    async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<()> {
        exec_drop_table(&mut self.staged.lock(), table_name, if_exists)
    }

    async fn truncate_table(&self, table_name: &str) -> Result<()> {
        exec_truncate_table(&mut self.staged.lock(), table_name)
    }

    async fn copy_tables(&self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        exec_copy_tables(&mut self.staged.lock(), target, source, merge)
    }

    async fn replace_table(
        &self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        exec_replace_table(&mut self.staged.lock(), target_name, replacement, drop_old)
    }

    async fn load_table(&self, target: &Table, source: &LoadSource) -> Result<u64> {
        if take_drift_injection(&self.inner) {
            return Err(IngestError::SchemaDrift("injected".to_string()));
        }
        exec_load_table(&mut self.staged.lock(), target, source)
    }

    async fn insert(&self, table: &Table, merge: bool, objects: &[Object]) -> Result<()> {
        exec_insert(&mut self.staged.lock(), table, merge, objects)
    }

    async fn delete_partition(&self, table_name: &str, partition_id: &str) -> Result<u64> {
        exec_delete_partition(&mut self.staged.lock(), table_name, partition_id)
    }
}

#[async_trait]
impl WarehouseTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        let staged = self.staged.into_inner();
        *self.inner.state.lock() = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
