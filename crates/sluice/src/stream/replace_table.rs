//! Full-snapshot stream: stage into a shadow table, swap it in atomically
//!
//! Records stage exactly like the transactional mode, but into a shadow
//! table named after the destination plus a per-stream suffix. `complete`
//! bulk-loads the shadow, then swaps it over the destination in a single
//! observable cutover; readers see the old contents until the swap and the
//! new contents after. On failure the shadow is dropped and the original is
//! untouched.

use super::{drop_staging_table, stream_suffix, IngestStream, StreamCore};
use crate::adapter::WarehouseOps;
use crate::batch_file::BatchFile;
use crate::error::Result;
use crate::object::Object;
use crate::state::{StreamState, StreamStatus};
use crate::table::Table;
use async_trait::async_trait;
use metrics::histogram;
use std::time::Instant;
use tracing::{info, warn};

pub struct ReplaceTableStream {
    core: StreamCore,
    file: BatchFile,
    shadow_name: String,
    shadow_created: bool,
}

impl ReplaceTableStream {
    pub(crate) fn new(core: StreamCore) -> Self {
        let file = BatchFile::new(core.mode, &core.table_name, &core.id);
        let shadow_name = core
            .adapter
            .table_name(&format!("{}_tmp_{}", core.table_name, stream_suffix()));
        Self {
            core,
            file,
            shadow_name,
            shadow_created: false,
        }
    }

    /// Desired shape of the shadow table: the destination shape under the
    /// shadow name. It keeps the primary key because it becomes the live
    /// table after the swap.
    fn shadow_table(&self) -> Table {
        let mut shadow = self.core.desired_table().renamed(&self.shadow_name);
        shadow.temporary = true;
        shadow
    }

    async fn commit(&mut self) -> Result<()> {
        for attempt in 0..2 {
            match self.try_commit().await {
                Err(err) if err.is_schema_drift() && attempt == 0 => {
                    warn!(stream = %self.core.id, %err, "commit hit schema drift, retrying once");
                    self.core.helper.invalidate(&self.shadow_name);
                }
                outcome => return outcome,
            }
        }
        unreachable!("drift retry loop always returns")
    }

    async fn try_commit(&mut self) -> Result<()> {
        self.core.check_cancel()?;
        let shadow = self.shadow_table();
        let adapter = self.core.adapter.clone();
        let target = adapter.table_name(&self.core.table_name);
        let tx = adapter.open_tx().await?;

        let outcome: Result<Table> = {
            let ops: &dyn WarehouseOps = tx.as_ref();
            async {
                let table = self.core.helper.ensure_table(ops, &shadow).await?;
                self.core.check_cancel()?;
                let source = self.file.finalize(
                    adapter.batch_file_format(),
                    adapter.batch_file_compression(),
                    &table.column_names(),
                )?;
                ops.load_table(&table, &source).await?;
                Ok(table)
            }
            .await
        };

        let outcome = match outcome {
            Ok(table) => match tx.commit().await {
                Ok(()) => adapter.replace_table(&target, &table, true).await,
                Err(err) => Err(err),
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(stream = %self.core.id, %rollback_err, "rollback failed");
                }
                Err(err)
            }
        };

        self.core.helper.invalidate(&self.shadow_name);
        self.core.helper.invalidate(&target);
        if outcome.is_err() {
            drop_staging_table(self.core.adapter.as_ref(), &self.shadow_name).await;
        }
        outcome
    }
}

#[async_trait]
impl IngestStream for ReplaceTableStream {
    async fn consume(&mut self, object: Object) -> Result<StreamState> {
        self.core.ensure_active()?;
        self.core.init().await?;
        let (_, object) = self.core.preprocess(object)?;

        let result: Result<()> = async {
            if !self.shadow_created {
                let shadow = self.shadow_table();
                let adapter = self.core.adapter.clone();
                self.core
                    .helper
                    .ensure_table(adapter.as_ref(), &shadow)
                    .await?;
                self.shadow_created = true;
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
            if self.shadow_created {
                drop_staging_table(self.core.adapter.as_ref(), &self.shadow_name).await;
                self.core.helper.invalidate(&self.shadow_name);
            }
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
                "table snapshot replaced"
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
        if self.shadow_created {
            drop_staging_table(self.core.adapter.as_ref(), &self.shadow_name).await;
            self.core.helper.invalidate(&self.shadow_name);
        }
        self.core.state.clone()
    }

    fn state(&self) -> &StreamState {
        &self.core.state
    }
}
