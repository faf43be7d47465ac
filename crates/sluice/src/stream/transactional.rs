//! Atomic batch stream: stage locally, commit everything or nothing
//!
//! Records append to the local staging file; `complete` opens a transaction,
//! reconciles the destination, bulk-loads the file and commits. With merge,
//! rows land in a shadow table first and are upserted into the destination
//! keyed by its primary key. On any failure the transaction rolls back and
//! the destination is untouched: exactly-once per batch.

use super::{
    drop_staging_table, staging_table_for, stream_suffix, IngestStream, StreamCore,
};
use crate::adapter::WarehouseOps;
use crate::batch_file::BatchFile;
use crate::error::Result;
use crate::object::Object;
use crate::state::{StreamState, StreamStatus};
use async_trait::async_trait;
use metrics::histogram;
use std::time::Instant;
use tracing::{info, warn};

pub struct TransactionalStream {
    core: StreamCore,
    file: BatchFile,
    suffix: String,
    reconciled: bool,
    staging_table: Option<String>,
}

impl TransactionalStream {
    pub(crate) fn new(core: StreamCore) -> Self {
        let file = BatchFile::new(core.mode, &core.table_name, &core.id);
        Self {
            core,
            file,
            suffix: stream_suffix(),
            reconciled: false,
            staging_table: None,
        }
    }

    async fn commit(&mut self) -> Result<()> {
        // Schema drift during commit gets one automatic retry from a fresh
        // reconcile.
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
            let merge = self.core.merge;
            async {
                let table = self.core.helper.ensure_table(ops, &desired).await?;
                self.core.check_cancel()?;
                let source = self.file.finalize(
                    adapter.batch_file_format(),
                    adapter.batch_file_compression(),
                    &table.column_names(),
                )?;
                if merge {
                    let staging = staging_table_for(&table, &self.suffix);
                    self.staging_table = Some(staging.name.clone());
                    ops.create_table(&staging).await?;
                    ops.load_table(&staging, &source).await?;
                    ops.copy_tables(&table, &staging, true).await?;
                } else {
                    ops.load_table(&table, &source).await?;
                }
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

        // The staging table is dropped regardless of outcome.
        if let Some(staging) = self.staging_table.take() {
            drop_staging_table(self.core.adapter.as_ref(), &staging).await;
        }

        outcome
    }
}

#[async_trait]
impl IngestStream for TransactionalStream {
    async fn consume(&mut self, object: Object) -> Result<StreamState> {
        self.core.ensure_active()?;
        self.core.init().await?;
        let (desired, object) = self.core.preprocess(object)?;

        let result: Result<()> = async {
            // Reconcile once, on the first record; the commit re-checks the
            // final header shape inside the transaction.
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
        let rows = self.file.rows();
        let result = self.commit().await;
        self.file.cleanup();
        histogram!("sluice.commit.duration_ms").record(started.elapsed().as_millis() as f64);

        if result.is_ok() {
            info!(
                stream = %self.core.id,
                table = %self.core.table_name,
                rows,
                merge = self.core.merge,
                "batch committed"
            );
        }
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
