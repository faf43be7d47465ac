//! sluice - bulk ingestion engine for analytical SQL warehouses
//!
//! This crate turns streams of heterogeneous, schemaless records into
//! warehouse tables. For each stream it infers and evolves the table shape,
//! stages rows locally, and commits them under one of four consistency
//! modes: row-at-a-time, atomic batch, full-table replacement, or partition
//! replacement.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      sluice (engine)                            │
//! │  DataType, BatchHeader, Table, TableHelper, BatchFile,          │
//! │  StreamCore + four commit-mode streams, Registry                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  WarehouseAdapter contract                      │
//! │  get/create/patch schema, load, copy, replace, insert, tx       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Adapter implementations                        │
//! │  sluice-postgres, ...  (one crate per warehouse)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let destination = sluice::registry::create_destination(
//!     "analytics", "postgres", &config).await?;
//!
//! let mut stream = destination.create_stream(
//!     "import-42",
//!     "events",
//!     BulkMode::Transactional,
//!     StreamOptions::new().with_primary_key(["id"]).with_merge_rows(),
//! )?;
//!
//! stream.consume_json(br#"{"id": 1, "name": "widget"}"#).await?;
//! let state = stream.complete().await?;
//! assert_eq!(state.status, StreamStatus::Completed);
//! ```

pub mod adapter;
pub mod batch_file;
pub mod datatype;
pub mod destination;
pub mod error;
pub mod identifier;
pub mod object;
pub mod options;
pub mod registry;
pub mod schema;
pub mod state;
pub mod stream;
pub mod table;
pub mod table_helper;
pub mod testing;

pub use adapter::{PassthroughTx, WarehouseAdapter, WarehouseOps, WarehouseTx};
pub use batch_file::{BatchFile, BatchFileFormat, FileCompression, LoadSource};
pub use datatype::DataType;
pub use destination::Destination;
pub use error::{DbContext, DbOp, IngestError, Result};
pub use identifier::IdentifierPolicy;
pub use object::{infer_type, normalize_object, Object, TypePolicy};
pub use options::StreamOptions;
pub use registry::{create_destination, register_adapter, AdapterFactory, AdapterRegistry};
pub use schema::{BatchHeader, Field, SqlTypes};
pub use state::{StreamState, StreamStatus};
pub use stream::{BulkMode, IngestStream, PARTITION_ID_COLUMN};
pub use table::{Granularity, SqlColumn, Table, TablePartition};
pub use table_helper::TableHelper;

// Re-export the traits' companion crates for adapter implementations
pub use async_trait::async_trait;
pub use serde_json::Value as JsonValue;

/// Prelude for callers and adapter implementations.
pub mod prelude {
    pub use crate::adapter::{PassthroughTx, WarehouseAdapter, WarehouseOps, WarehouseTx};
    pub use crate::async_trait;
    pub use crate::batch_file::{BatchFileFormat, FileCompression, LoadSource};
    pub use crate::datatype::DataType;
    pub use crate::destination::Destination;
    pub use crate::error::{DbContext, DbOp, IngestError, Result};
    pub use crate::identifier::IdentifierPolicy;
    pub use crate::object::Object;
    pub use crate::options::StreamOptions;
    pub use crate::registry::{AdapterFactory, AdapterRegistry};
    pub use crate::schema::SqlTypes;
    pub use crate::state::{StreamState, StreamStatus};
    pub use crate::stream::{BulkMode, IngestStream};
    pub use crate::table::{Granularity, SqlColumn, Table};
}
