//! Row-at-a-time stream: every record is inserted as it arrives
//!
//! Rows become visible to readers immediately. A failed insert is recorded
//! in the stream state and returned to the caller, but the stream stays
//! active; per-row failure is not stream-fatal unless the caller chooses.

use super::{table_covers, IngestStream, StreamCore};
use crate::error::Result;
use crate::object::Object;
use crate::state::{StreamState, StreamStatus};
use crate::table::Table;
use async_trait::async_trait;
use tracing::debug;

pub struct AutoCommitStream {
    core: StreamCore,
    /// The reconciled destination shape, refreshed whenever the header
    /// widens past it.
    table: Option<Table>,
}

impl AutoCommitStream {
    pub(crate) fn new(core: StreamCore) -> Self {
        Self { core, table: None }
    }
}

#[async_trait]
impl IngestStream for AutoCommitStream {
    async fn consume(&mut self, object: Object) -> Result<StreamState> {
        self.core.ensure_active()?;
        self.core.init().await?;
        let (desired, object) = self.core.preprocess(object)?;

        let needs_reconcile = self
            .table
            .as_ref()
            .map(|actual| !table_covers(actual, &desired))
            .unwrap_or(true);

        let result: Result<()> = async {
            if needs_reconcile {
                let adapter = self.core.adapter.clone();
                let reconciled = self
                    .core
                    .helper
                    .ensure_table(adapter.as_ref(), &desired)
                    .await?;
                debug!(
                    stream = %self.core.id,
                    table = %reconciled.name,
                    columns = reconciled.columns.len(),
                    "destination reconciled"
                );
                self.table = Some(reconciled);
            }
            let table = self.table.as_ref().expect("reconciled above");
            self.core
                .adapter
                .insert(table, self.core.merge, std::slice::from_ref(&object))
                .await
        }
        .await;

        self.core.post_consume(result)
    }

    async fn complete(&mut self) -> Result<StreamState> {
        self.core.ensure_active()?;
        self.core.state.transition(StreamStatus::Completed);
        Ok(self.core.state.clone())
    }

    async fn abort(&mut self) -> StreamState {
        self.core.state.transition(StreamStatus::Aborted);
        self.core.state.clone()
    }

    fn state(&self) -> &StreamState {
        &self.core.state
    }
}
