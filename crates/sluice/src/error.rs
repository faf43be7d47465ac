//! Error types for the ingestion engine
//!
//! One error enum covers the engine and the adapter contract. Database
//! operations report through [`IngestError::Db`], tagged with the failed
//! operation kind and a structured context payload (database, schema, table,
//! statement, values) so commit failures stay diagnosable.

use crate::state::StreamStatus;
use crate::stream::BulkMode;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IngestError>;

/// The database operation a [`IngestError::Db`] error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOp {
    InitDatabase,
    GetTable,
    CreateTable,
    PatchTable,
    DropTable,
    Truncate,
    Insert,
    Load,
    Copy,
    Merge,
    Replace,
    Delete,
    Commit,
    Rollback,
}

impl fmt::Display for DbOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DbOp::InitDatabase => "init database",
            DbOp::GetTable => "get table schema",
            DbOp::CreateTable => "create table",
            DbOp::PatchTable => "patch table schema",
            DbOp::DropTable => "drop table",
            DbOp::Truncate => "truncate table",
            DbOp::Insert => "insert",
            DbOp::Load => "load table",
            DbOp::Copy => "copy tables",
            DbOp::Merge => "merge rows",
            DbOp::Replace => "replace table",
            DbOp::Delete => "delete rows",
            DbOp::Commit => "commit transaction",
            DbOp::Rollback => "rollback transaction",
        };
        f.write_str(s)
    }
}

/// Structured context attached to database operation failures.
#[derive(Debug, Clone, Default)]
pub struct DbContext {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub partition: Option<String>,
    pub statement: Option<String>,
    pub values: Vec<String>,
}

impl DbContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(mut self, v: impl Into<String>) -> Self {
        self.database = Some(v.into());
        self
    }

    pub fn schema(mut self, v: impl Into<String>) -> Self {
        self.schema = Some(v.into());
        self
    }

    pub fn table(mut self, v: impl Into<String>) -> Self {
        self.table = Some(v.into());
        self
    }

    pub fn partition(mut self, v: impl Into<String>) -> Self {
        self.partition = Some(v.into());
        self
    }

    pub fn statement(mut self, v: impl Into<String>) -> Self {
        self.statement = Some(v.into());
        self
    }

    pub fn values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = values.into_iter().map(Into::into).collect();
        self
    }

    fn is_empty(&self) -> bool {
        self.database.is_none()
            && self.schema.is_none()
            && self.table.is_none()
            && self.partition.is_none()
            && self.statement.is_none()
            && self.values.is_empty()
    }
}

impl fmt::Display for DbContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if let Some(db) = &self.database {
            parts.push(format!("db={db}"));
        }
        if let Some(schema) = &self.schema {
            parts.push(format!("schema={schema}"));
        }
        if let Some(table) = &self.table {
            parts.push(format!("table={table}"));
        }
        if let Some(partition) = &self.partition {
            parts.push(format!("partition={partition}"));
        }
        if let Some(statement) = &self.statement {
            parts.push(format!("statement={statement}"));
        }
        if !self.values.is_empty() {
            parts.push(format!("values=[{}]", self.values.join(", ")));
        }
        write!(f, " [{}]", parts.join(" "))
    }
}

/// Errors produced by the engine and by warehouse adapters.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Invalid destination or stream configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connecting to the warehouse failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// A database operation failed.
    #[error("failed to {op}: {message}{ctx}")]
    Db {
        op: DbOp,
        message: String,
        ctx: DbContext,
    },

    /// The stream already reached a terminal status.
    #[error("stream is not active: status {0}")]
    StreamInactive(StreamStatus),

    /// The adapter does not support the requested commit mode.
    #[error("bulk mode {mode} is not supported by {type_id}")]
    ModeUnsupported { type_id: String, mode: BulkMode },

    /// The actual table shape changed underneath the cached one.
    #[error("table schema changed concurrently: {0}")]
    SchemaDrift(String),

    /// The referenced table does not exist.
    #[error("table does not exist: {0}")]
    TableNotExist(String),

    /// The operation was canceled by the caller.
    #[error("operation canceled")]
    Canceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    pub fn db(op: DbOp, message: impl Into<String>, ctx: DbContext) -> Self {
        Self::Db {
            op,
            message: message.into(),
            ctx,
        }
    }

    pub fn is_schema_drift(&self) -> bool {
        matches!(self, Self::SchemaDrift(_))
    }

    pub fn is_table_not_exist(&self) -> bool {
        matches!(self, Self::TableNotExist(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The operation kind for database errors, if this is one.
    pub fn db_op(&self) -> Option<DbOp> {
        match self {
            Self::Db { op, .. } => Some(*op),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_display_includes_context() {
        let err = IngestError::db(
            DbOp::Load,
            "permission denied",
            DbContext::new()
                .schema("analytics")
                .table("events")
                .statement("INSERT INTO events"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("failed to load table"));
        assert!(rendered.contains("schema=analytics"));
        assert!(rendered.contains("table=events"));
        assert!(rendered.contains("statement=INSERT INTO events"));
    }

    #[test]
    fn test_empty_context_renders_nothing() {
        let err = IngestError::db(DbOp::Insert, "boom", DbContext::new());
        assert_eq!(err.to_string(), "failed to insert: boom");
    }

    #[test]
    fn test_classification_helpers() {
        assert!(IngestError::SchemaDrift("col added".into()).is_schema_drift());
        assert!(IngestError::TableNotExist("t".into()).is_table_not_exist());
        assert!(IngestError::Canceled.is_canceled());
        assert!(!IngestError::config("bad").is_schema_drift());
    }

    #[test]
    fn test_db_op_accessor() {
        let err = IngestError::db(DbOp::Copy, "boom", DbContext::new());
        assert_eq!(err.db_op(), Some(DbOp::Copy));
        assert_eq!(IngestError::Canceled.db_op(), None);
    }
}
