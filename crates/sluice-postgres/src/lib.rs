//! Postgres adapter for the sluice bulk ingestion engine
//!
//! Implements the warehouse adapter contract on `tokio-postgres`:
//!
//! - table discovery from `pg_catalog`, primary keys from
//!   `information_schema`
//! - widening-only DDL (`ADD COLUMN IF NOT EXISTS`, `ALTER COLUMN TYPE`)
//! - row and bulk upserts via `ON CONFLICT ON CONSTRAINT`
//! - staging-file loads from the engine's CSV rendering (`\N` nulls)
//! - real transactions on a dedicated connection per commit
//! - atomic table replacement through a rename chain executed as one
//!   simple-query batch
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::AdapterRegistry;
//!
//! let mut registry = AdapterRegistry::new();
//! sluice_postgres::register(&mut registry);
//! let destination = registry
//!     .create_destination("analytics", "postgres", &config)
//!     .await?;
//! ```

mod config;
mod sql;

pub use config::{DbSecret, PostgresConfig};

use async_trait::async_trait;
use sluice::adapter::{WarehouseAdapter, WarehouseOps, WarehouseTx};
use sluice::batch_file::{BatchFileFormat, FileCompression, LoadSource};
use sluice::error::{DbContext, DbOp, IngestError, Result};
use sluice::identifier::IdentifierPolicy;
use sluice::object::Object;
use sluice::registry::{AdapterFactory, AdapterRegistry};
use sluice::stream::PARTITION_ID_COLUMN;
use sluice::table::{SqlColumn, Table};
use sluice::DataType;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};
use validator::Validate;

/// Registry type id of this adapter.
pub const POSTGRES_TYPE_ID: &str = "postgres";

/// Rows per INSERT statement on the bulk-load and row-insert paths.
const INSERT_BATCH_ROWS: usize = 200;

struct PgShared {
    config: PostgresConfig,
    policy: IdentifierPolicy,
}

/// Postgres warehouse adapter.
pub struct PostgresAdapter {
    shared: Arc<PgShared>,
    client: Client,
}

impl PostgresAdapter {
    /// Connect and probe the server.
    pub async fn connect(destination_id: &str, config: PostgresConfig) -> Result<Self> {
        let client = open_client(&config).await?;
        info!(
            destination = destination_id,
            host = %config.host,
            database = %config.database,
            schema = %config.schema,
            "connected to postgres"
        );
        Ok(Self {
            shared: Arc::new(PgShared {
                policy: sql::identifier_policy(),
                config,
            }),
            client,
        })
    }

    fn session(&self) -> PgSession<'_> {
        PgSession {
            client: &self.client,
            shared: &self.shared,
        }
    }
}

async fn open_client(config: &PostgresConfig) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
        .await
        .map_err(|err| IngestError::connect(err.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            warn!(%err, "postgres connection task ended");
        }
    });
    // A plain probe; some proxies do not implement the ping machinery.
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|err| IngestError::connect(err.to_string()))?;
    Ok(client)
}

// ─────────────────────────────────────────────────────────────────
// Session: the operation bodies, shared by adapter and transaction
// ─────────────────────────────────────────────────────────────────

struct PgSession<'a> {
    client: &'a Client,
    shared: &'a PgShared,
}

impl<'a> PgSession<'a> {
    fn schema(&self) -> &str {
        &self.shared.config.schema
    }

    fn full_name(&self, table: &str) -> String {
        sql::full_table_name(self.schema(), table)
    }

    fn ctx(&self, table: &str) -> DbContext {
        let ctx = DbContext::new()
            .database(&self.shared.config.database)
            .schema(self.schema());
        if table.is_empty() {
            ctx
        } else {
            ctx.table(table)
        }
    }

    async fn execute_ddl(&self, op: DbOp, table: &str, statement: &str) -> Result<()> {
        debug!(statement, "executing");
        self.client
            .batch_execute(statement)
            .await
            .map_err(|err| sql::classify(op, self.ctx(table).statement(statement), err))
    }

    async fn get_table_schema(&self, table_name: &str) -> Result<Table> {
        let rows = self
            .client
            .query(sql::TABLE_SCHEMA_QUERY, &[&self.schema(), &table_name])
            .await
            .map_err(|err| {
                sql::classify(
                    DbOp::GetTable,
                    self.ctx(table_name).statement(sql::TABLE_SCHEMA_QUERY),
                    err,
                )
            })?;

        let mut table = Table::named(table_name);
        for row in rows {
            let name: String = row.get(0);
            let sql_type: String = row.get(1);
            let data_type = sql::data_type_for(&sql_type);
            table
                .columns
                .insert(name, SqlColumn::new(sql_type, data_type));
        }
        if !table.exists() {
            return Ok(table);
        }

        let pk_rows = self
            .client
            .query(sql::PRIMARY_KEY_QUERY, &[&self.schema(), &table_name])
            .await
            .map_err(|err| {
                sql::classify(
                    DbOp::GetTable,
                    self.ctx(table_name).statement(sql::PRIMARY_KEY_QUERY),
                    err,
                )
            })?;
        for row in pk_rows {
            let constraint: String = row.get(0);
            let column: String = row.get(1);
            if table.primary_key_name.is_none() && !constraint.is_empty() {
                table.primary_key_name = Some(constraint);
            }
            table.pk_fields.insert(column);
        }
        if let Some(pk_name) = &table.primary_key_name {
            let managed = Table::constraint_name(&table.name);
            if *pk_name != managed {
                warn!(
                    table = %table.name,
                    constraint = %pk_name,
                    "table carries a foreign primary key constraint; it will drive merges"
                );
            }
        }
        Ok(table)
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let statement = sql::create_table_sql(self.schema(), table);
        self.execute_ddl(DbOp::CreateTable, &table.name, &statement).await
    }

    async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
        let full = self.full_name(&patch.name);

        for (name, column) in &patch.columns {
            let add = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                full,
                sql::quote(name),
                column.sql_type
            );
            self.execute_ddl(DbOp::PatchTable, &patch.name, &add).await?;
            let widen = format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                full,
                sql::quote(name),
                column.sql_type,
                sql::quote(name),
                column.sql_type
            );
            self.execute_ddl(DbOp::PatchTable, &patch.name, &widen).await?;
        }

        if patch.delete_pk {
            if let Some(current) = self.get_table_schema(&patch.name).await?.primary_key_name {
                let drop = format!(
                    "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
                    full,
                    sql::quote(&current)
                );
                self.execute_ddl(DbOp::PatchTable, &patch.name, &drop).await?;
            }
        }
        if !patch.pk_fields.is_empty() {
            let pk_name = patch
                .primary_key_name
                .clone()
                .unwrap_or_else(|| Table::constraint_name(&patch.name));
            let pk_columns: Vec<String> = patch.pk_fields.iter().map(|c| sql::quote(c)).collect();
            let add_pk = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                full,
                sql::quote(&pk_name),
                pk_columns.join(", ")
            );
            self.execute_ddl(DbOp::PatchTable, &patch.name, &add_pk).await?;
        }
        Ok(())
    }

    async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<()> {
        let statement = format!(
            "DROP TABLE {}{}",
            if if_exists { "IF EXISTS " } else { "" },
            self.full_name(table_name)
        );
        self.execute_ddl(DbOp::DropTable, table_name, &statement).await
    }

    async fn truncate_table(&self, table_name: &str) -> Result<()> {
        let statement = format!("TRUNCATE TABLE {}", self.full_name(table_name));
        self.execute_ddl(DbOp::Truncate, table_name, &statement).await
    }

    async fn copy_tables(&self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
        let statement = sql::copy_sql(self.schema(), target, source, merge);
        let op = if merge { DbOp::Merge } else { DbOp::Copy };
        self.client
            .execute(statement.as_str(), &[])
            .await
            .map_err(|err| sql::classify(op, self.ctx(&target.name).statement(&statement), err))
    }

    async fn replace_table(
        &self,
        target_name: &str,
        replacement: &Table,
        drop_old: bool,
    ) -> Result<()> {
        let target_exists = self.get_table_schema(target_name).await?.exists();
        let mut statements = Vec::new();

        if target_exists {
            let displaced = format!(
                "{}_old_{}",
                target_name,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            statements.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                self.full_name(target_name),
                sql::quote(&displaced)
            ));
            statements.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                self.full_name(&replacement.name),
                sql::quote(target_name)
            ));
            if drop_old {
                statements.push(format!("DROP TABLE IF EXISTS {}", self.full_name(&displaced)));
            }
        } else {
            statements.push(format!(
                "ALTER TABLE {} RENAME TO {}",
                self.full_name(&replacement.name),
                sql::quote(target_name)
            ));
        }

        // One simple-query batch runs as a single implicit transaction, so
        // readers observe the rename chain as one cutover.
        let batch = statements.join("; ");
        self.execute_ddl(DbOp::Replace, target_name, &batch).await
    }

    async fn load_table(&self, target: &Table, source: &LoadSource) -> Result<u64> {
        if source.format != BatchFileFormat::Csv || source.compression != FileCompression::None {
            return Err(IngestError::db(
                DbOp::Load,
                "this adapter loads plain CSV staging files only",
                self.ctx(&target.name),
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&source.path)
            .map_err(|err| {
                IngestError::db(DbOp::Load, err.to_string(), self.ctx(&target.name))
            })?;
        let headers = reader
            .headers()
            .map_err(|err| {
                IngestError::db(DbOp::Load, err.to_string(), self.ctx(&target.name))
            })?
            .clone();

        // Map each destination column onto its CSV position.
        let positions: Vec<(String, SqlColumn, Option<usize>)> = target
            .columns
            .iter()
            .map(|(name, column)| {
                let index = headers.iter().position(|h| h == name);
                (name.clone(), column.clone(), index)
            })
            .collect();

        let mut loaded = 0u64;
        let mut batch: Vec<Vec<sql::PgValue>> = Vec::with_capacity(INSERT_BATCH_ROWS);

        for record in reader.records() {
            let record = record.map_err(|err| {
                IngestError::db(DbOp::Load, err.to_string(), self.ctx(&target.name))
            })?;
            let mut row = Vec::with_capacity(positions.len());
            for (_, column, index) in &positions {
                let raw = index.and_then(|i| record.get(i));
                let raw = match raw {
                    Some("\\N") | None => None,
                    Some(v) => Some(v),
                };
                row.push(sql::bind_csv(raw, column)?);
            }
            batch.push(row);

            if batch.len() >= INSERT_BATCH_ROWS {
                loaded += self.flush_rows(target, &batch, false).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            loaded += self.flush_rows(target, &batch, false).await?;
        }
        Ok(loaded)
    }

    async fn flush_rows(
        &self,
        table: &Table,
        rows: &[Vec<sql::PgValue>],
        merge: bool,
    ) -> Result<u64> {
        let statement = sql::insert_sql(self.schema(), table, rows.len(), merge);
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = rows
            .iter()
            .flat_map(|row| row.iter().map(sql::as_param))
            .collect();
        let op = if merge { DbOp::Merge } else { DbOp::Insert };
        self.client
            .execute(statement.as_str(), &params)
            .await
            .map_err(|err| sql::classify(op, self.ctx(&table.name).statement(&statement), err))
    }

    async fn insert(&self, table: &Table, merge: bool, objects: &[Object]) -> Result<()> {
        for chunk in objects.chunks(INSERT_BATCH_ROWS) {
            let mut rows = Vec::with_capacity(chunk.len());
            for object in chunk {
                let mut row = Vec::with_capacity(table.columns.len());
                for (name, column) in &table.columns {
                    row.push(sql::bind_json(object.get(name.as_str()), column)?);
                }
                rows.push(row);
            }
            self.flush_rows(table, &rows, merge).await?;
        }
        Ok(())
    }

    async fn delete_partition(&self, table_name: &str, partition_id: &str) -> Result<u64> {
        let statement = format!(
            "DELETE FROM {} WHERE {} = $1",
            self.full_name(table_name),
            sql::quote(PARTITION_ID_COLUMN)
        );
        self.client
            .execute(statement.as_str(), &[&partition_id])
            .await
            .map_err(|err| {
                sql::classify(
                    DbOp::Delete,
                    self.ctx(table_name)
                        .partition(partition_id)
                        .statement(&statement),
                    err,
                )
            })
    }
}

// ─────────────────────────────────────────────────────────────────
// Contract implementations
// ─────────────────────────────────────────────────────────────────

macro_rules! delegate_ops {
    ($target:ty, $session:ident) => {
        #[async_trait]
        impl WarehouseOps for $target {
            async fn get_table_schema(&self, table_name: &str) -> Result<Table> {
                self.$session().get_table_schema(table_name).await
            }

            async fn create_table(&self, table: &Table) -> Result<()> {
                self.$session().create_table(table).await
            }

            async fn patch_table_schema(&self, patch: &Table) -> Result<()> {
                self.$session().patch_table_schema(patch).await
            }

            async fn drop_table(&self, table_name: &str, if_exists: bool) -> Result<()> {
                self.$session().drop_table(table_name, if_exists).await
            }

            async fn truncate_table(&self, table_name: &str) -> Result<()> {
                self.$session().truncate_table(table_name).await
            }

            async fn copy_tables(&self, target: &Table, source: &Table, merge: bool) -> Result<u64> {
                self.$session().copy_tables(target, source, merge).await
            }

            async fn replace_table(
                &self,
                target_name: &str,
                replacement: &Table,
                drop_old: bool,
            ) -> Result<()> {
                self.$session()
                    .replace_table(target_name, replacement, drop_old)
                    .await
            }

            async fn load_table(&self, target: &Table, source: &LoadSource) -> Result<u64> {
                self.$session().load_table(target, source).await
            }

            async fn insert(&self, table: &Table, merge: bool, objects: &[Object]) -> Result<()> {
                self.$session().insert(table, merge, objects).await
            }

            async fn delete_partition(&self, table_name: &str, partition_id: &str) -> Result<u64> {
                self.$session()
                    .delete_partition(table_name, partition_id)
                    .await
            }
        }
    };
}

delegate_ops!(PostgresAdapter, session);
delegate_ops!(PostgresTx, session);

#[async_trait]
impl WarehouseAdapter for PostgresAdapter {
    fn type_id(&self) -> &'static str {
        POSTGRES_TYPE_ID
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|err| IngestError::connect(err.to_string()))
    }

    async fn init_database(&self) -> Result<()> {
        let statement = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            sql::quote(&self.shared.config.schema)
        );
        self.session()
            .execute_ddl(DbOp::InitDatabase, "", &statement)
            .await
    }

    async fn open_tx(&self) -> Result<Box<dyn WarehouseTx>> {
        // Each transaction gets its own connection so concurrent streams
        // never interleave statements inside one BEGIN block.
        let client = open_client(&self.shared.config).await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|err| IngestError::connect(err.to_string()))?;
        Ok(Box::new(PostgresTx {
            shared: self.shared.clone(),
            client,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn identifier_policy(&self) -> &IdentifierPolicy {
        &self.shared.policy
    }

    fn full_table_name(&self, name: &str) -> String {
        sql::full_table_name(&self.shared.config.schema, name)
    }

    fn sql_type(&self, data_type: DataType) -> &str {
        sql::sql_type_for(data_type)
    }

    fn data_type(&self, sql_type: &str) -> DataType {
        sql::data_type_for(sql_type)
    }

    fn batch_file_format(&self) -> BatchFileFormat {
        BatchFileFormat::Csv
    }
}

/// A transaction on its own connection, closed by COMMIT or ROLLBACK.
pub struct PostgresTx {
    shared: Arc<PgShared>,
    client: Client,
}

impl PostgresTx {
    fn session(&self) -> PgSession<'_> {
        PgSession {
            client: &self.client,
            shared: &self.shared,
        }
    }
}

#[async_trait]
impl WarehouseTx for PostgresTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|err| {
                sql::classify(DbOp::Commit, DbContext::new().statement("COMMIT"), err)
            })
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|err| {
                sql::classify(DbOp::Rollback, DbContext::new().statement("ROLLBACK"), err)
            })
    }
}

// ─────────────────────────────────────────────────────────────────
// Factory & registration
// ─────────────────────────────────────────────────────────────────

/// Factory creating connected Postgres adapters from raw destination config.
pub struct PostgresAdapterFactory;

#[async_trait]
impl AdapterFactory for PostgresAdapterFactory {
    fn type_id(&self) -> &'static str {
        POSTGRES_TYPE_ID
    }

    async fn create(
        &self,
        destination_id: &str,
        config: &serde_yaml::Value,
    ) -> Result<Arc<dyn WarehouseAdapter>> {
        let config: PostgresConfig = serde_yaml::from_value(config.clone())
            .map_err(|err| IngestError::config(err.to_string()))?;
        config
            .validate()
            .map_err(|err| IngestError::config(err.to_string()))?;
        let adapter = PostgresAdapter::connect(destination_id, config).await?;
        Ok(Arc::new(adapter))
    }
}

/// Register this adapter in a registry.
pub fn register(registry: &mut AdapterRegistry) {
    registry.register(Arc::new(PostgresAdapterFactory));
}

/// Register this adapter in the process-wide default registry.
pub fn register_global() {
    sluice::register_adapter(Arc::new(PostgresAdapterFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_type_id() {
        assert_eq!(PostgresAdapterFactory.type_id(), "postgres");
    }

    #[test]
    fn test_register() {
        let mut registry = AdapterRegistry::new();
        register(&mut registry);
        assert!(registry.contains("postgres"));
    }

    #[tokio::test]
    async fn test_factory_rejects_bad_config() {
        let bad = serde_yaml::from_str::<serde_yaml::Value>("host: \"\"").unwrap();
        let result = PostgresAdapterFactory.create("d1", &bad).await;
        match result {
            Err(err) => assert!(matches!(err, IngestError::Config(_))),
            Ok(_) => panic!("expected an error"),
        }
    }
}
