//! A configured warehouse destination
//!
//! [`Destination`] binds an adapter to a process-wide schema cache and hands
//! out streams. Option validation (merge requires a primary key, partition
//! replace requires a partition id, adapter mode support) happens here, at
//! stream creation, not at first consume.

use crate::adapter::WarehouseAdapter;
use crate::error::{IngestError, Result};
use crate::options::StreamOptions;
use crate::stream::{
    AutoCommitStream, BulkMode, IngestStream, ReplacePartitionStream, ReplaceTableStream,
    StreamCore, TransactionalStream,
};
use crate::table_helper::TableHelper;
use std::sync::Arc;
use tracing::info;

/// A warehouse destination: one adapter plus its schema cache.
///
/// Cloning is cheap; clones share the adapter and the cache. Streams of one
/// destination may run in parallel threads, sharing the adapter's
/// connections.
#[derive(Clone)]
pub struct Destination {
    id: String,
    adapter: Arc<dyn WarehouseAdapter>,
    helper: Arc<TableHelper>,
}

impl Destination {
    pub fn new(id: impl Into<String>, adapter: Arc<dyn WarehouseAdapter>) -> Self {
        Self {
            id: id.into(),
            adapter,
            helper: Arc::new(TableHelper::new()),
        }
    }

    /// Destination id given at registration time.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The adapter's registry type id.
    pub fn type_id(&self) -> &'static str {
        self.adapter.type_id()
    }

    pub fn adapter(&self) -> &Arc<dyn WarehouseAdapter> {
        &self.adapter
    }

    /// Cheap connectivity probe of the underlying adapter.
    pub async fn ping(&self) -> Result<()> {
        self.adapter.ping().await
    }

    /// Release underlying connections.
    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }

    /// Open a stream that lands records into `table_name` under the given
    /// commit mode.
    pub fn create_stream(
        &self,
        stream_id: impl Into<String>,
        table_name: &str,
        mode: BulkMode,
        options: StreamOptions,
    ) -> Result<Box<dyn IngestStream>> {
        if !self.adapter.supports_mode(mode) {
            return Err(IngestError::ModeUnsupported {
                type_id: self.adapter.type_id().to_string(),
                mode,
            });
        }

        let stream_id = stream_id.into();
        info!(
            destination = %self.id,
            stream = %stream_id,
            table = table_name,
            %mode,
            "stream created"
        );

        let core = StreamCore::new(
            stream_id,
            self.adapter.clone(),
            self.helper.clone(),
            table_name,
            mode,
            options,
        )?;

        Ok(match mode {
            BulkMode::AutoCommit => Box::new(AutoCommitStream::new(core)),
            BulkMode::Transactional => Box::new(TransactionalStream::new(core)),
            BulkMode::ReplaceTable => Box::new(ReplaceTableStream::new(core)),
            BulkMode::ReplacePartition => Box::new(ReplacePartitionStream::new(core)?),
        })
    }
}
