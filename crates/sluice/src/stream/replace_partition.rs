//! Partition-snapshot stream: delete the named partition, append the batch
//!
//! Every record is stamped with the caller-chosen partition identifier in a
//! reserved column. `complete` stages the batch into a shadow table, deletes
//! the partition's rows from the destination and appends the shadow's rows.
//! Readers may momentarily observe the destination without the partition;
//! callers needing cutover atomicity use the full-table replace mode.

use super::{
    drop_staging_table, staging_table_for, stream_suffix, IngestStream, StreamCore,
    PARTITION_ID_COLUMN,
};
use crate::adapter::WarehouseOps;
use crate::batch_file::BatchFile;
use crate::error::{IngestError, Result};
use crate::object::Object;
use crate::state::{StreamState, StreamStatus};
use async_trait::async_trait;
use metrics::histogram;
use serde_json::Value;
use std::time::Instant;
use tracing::{info, warn};

pub struct ReplacePartitionStream {
    core: StreamCore,
    file: BatchFile,
    partition_id: String,
    suffix: String,
    reconciled: bool,
    staging_table: Option<String>,
}

impl ReplacePartitionStream {
    pub(crate) fn new(core: StreamCore) -> Result<Self> {
        let partition_id = core.options.partition_id.clone().ok_or_else(|| {
            IngestError::config(
                "replace_partition requires a partition identifier; set the partition option",
            )
        })?;
        let file = BatchFile::new(core.mode, &core.table_name, &core.id);
        Ok(Self {
            core,
            file,
            partition_id,
            suffix: stream_suffix(),
            reconciled: false,
            staging_table: None,
        })
    }

    async fn commit(&mut self) -> Result<()> {
        for attempt in 0..2 {
            match self.try_commit().await {
                Err(err) if err.is_schema_drift() && attempt == 0 => {
                    warn!(stream = %self.core.id, %err, "commit hit schema drift, retrying once");
                    let desired = self.core.desired_table();
                    self.core.helper.invalidate(&desired.name);
                }
                outcome => return outcome,
            }
        }
        unreachable!("drift retry loop always returns")
    }

    async fn try_commit(&mut self) -> Result<()> {
        self.core.check_cancel()?;
        let desired = self.core.desired_table();
        let adapter = self.core.adapter.clone();
        let tx = adapter.open_tx().await?;

        let outcome: Result<()> = {
            let ops: &dyn WarehouseOps = tx.as_ref();
            async {
                let table = self.core.helper.ensure_table(ops, &desired).await?;
                self.core.check_cancel()?;
                let staging = staging_table_for(&table, &self.suffix);
                self.staging_table = Some(staging.name.clone());
                ops.create_table(&staging).await?;
                let source = self.file.finalize(
                    adapter.batch_file_format(),
                    adapter.batch_file_compression(),
                    &staging.column_names(),
                )?;
                ops.load_table(&staging, &source).await?;
                self.core.check_cancel()?;
                let deleted = ops
                    .delete_partition(&table.name, &self.partition_id)
                    .await?;
                let copied = ops.copy_tables(&table, &staging, false).await?;
                info!(
                    stream = %self.core.id,
                    table = %table.name,
                    partition = %self.partition_id,
                    deleted,
                    copied,
                    "partition replaced"
                );
                Ok(())
            }
            .await
        };

        let outcome = match outcome {
            Ok(()) => tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(stream = %self.core.id, %rollback_err, "rollback failed");
                }
                Err(err)
            }
        };

        if let Some(staging) = self.staging_table.take() {
            drop_staging_table(self.core.adapter.as_ref(), &staging).await;
        }
        outcome
    }
}

#[async_trait]
impl IngestStream for ReplacePartitionStream {
    async fn consume(&mut self, mut object: Object) -> Result<StreamState> {
        self.core.ensure_active()?;
        self.core.init().await?;

        object.insert(
            PARTITION_ID_COLUMN.to_string(),
            Value::String(self.partition_id.clone()),
        );
        let (desired, object) = self.core.preprocess(object)?;

        let result: Result<()> = async {
            if !self.reconciled {
                let adapter = self.core.adapter.clone();
                self.core
                    .helper
                    .ensure_table(adapter.as_ref(), &desired)
                    .await?;
                self.reconciled = true;
            }
            self.file.append(&object)
        }
        .await;

        self.core.post_consume(result)
    }

    async fn complete(&mut self) -> Result<StreamState> {
        self.core.ensure_active()?;

        if self.file.rows() == 0 {
            self.file.cleanup();
            self.core.state.transition(StreamStatus::Completed);
            return Ok(self.core.state.clone());
        }

        let started = Instant::now();
        let result = self.commit().await;
        self.file.cleanup();
        histogram!("sluice.commit.duration_ms").record(started.elapsed().as_millis() as f64);

        self.core.post_complete(result)
    }

    async fn abort(&mut self) -> StreamState {
        if self.core.state.status.is_terminal() {
            return self.core.state.clone();
        }
        self.core.state.transition(StreamStatus::Aborted);
        self.file.cleanup();
        self.core.state.clone()
    }

    fn state(&self) -> &StreamState {
        &self.core.state
    }
}
