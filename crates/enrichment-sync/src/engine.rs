use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{RunRequest, TableBackend};
use crate::columns::{Column, ColumnSet};
use crate::config::SyncConfig;
use crate::coordinator::{AiRunCoordinator, RunConfiguration};
use crate::edit::EditController;
use crate::error::{SyncError, SyncResult};
use crate::loader::{BatchLoader, LoadOutcome};
use crate::loading::LoadingState;
use crate::model::{GridRow, RowId, TableId};
use crate::realtime::{Handled, RealtimeProcessor};
use crate::sequence::RowSequence;
use crate::state::TableState;
use crate::store::RowMap;
use crate::viewport::ViewportTracker;

/// One table view: the surface the grid talks to.
pub struct EnrichmentTable {
    state: Arc<TableState>,
    coordinator: Arc<AiRunCoordinator>,
    loader: Arc<BatchLoader>,
    viewport: Arc<ViewportTracker>,
    realtime: Arc<RealtimeProcessor>,
    edits: EditController,
}

impl EnrichmentTable {
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn TableBackend>,
        table_id: impl Into<TableId>,
        columns: Vec<Column>,
        ids: Vec<RowId>,
    ) -> Self {
        let state = Arc::new(TableState::new(config, table_id.into(), columns));
        state.extend_sequence(ids);
        let coordinator = Arc::new(AiRunCoordinator::new(state.clone(), backend.clone()));
        let loader = Arc::new(BatchLoader::new(
            state.clone(),
            backend.clone(),
            coordinator.clone(),
        ));
        let viewport = Arc::new(ViewportTracker::new(state.clone(), loader.clone()));
        let realtime = Arc::new(RealtimeProcessor::new(
            state.clone(),
            coordinator.clone(),
            viewport.clone(),
        ));
        let edits = EditController::new(state.clone(), backend, coordinator.clone());
        Self {
            state,
            coordinator,
            loader,
            viewport,
            realtime,
            edits,
        }
    }

    pub async fn on_visible_range_change(
        &self,
        start: usize,
        end: usize,
    ) -> SyncResult<Vec<LoadOutcome>> {
        self.viewport.on_visible_range_change(start, end).await
    }

    pub fn full_data(&self) -> Vec<GridRow> {
        self.state.full_data()
    }

    pub fn ai_loading_state(&self) -> Arc<LoadingState> {
        self.state.loading.snapshot()
    }

    pub async fn on_cell_edit(&self, record_id: &str, field_id: &str, value: Value) -> SyncResult<()> {
        let result = self.edits.edit(record_id, field_id, value).await;
        if matches!(result, Err(SyncError::Update { .. })) && !self.state.rows.is_loaded(record_id) {
            // a fetch that landed under the rejected edit was rolled back too
            if let Err(err) = self.viewport.recheck().await {
                debug!(target = "enrichment::edit", record_id, error = %err, "reload after rollback failed");
            }
        }
        result
    }

    pub async fn on_run_ai(&self, request: RunRequest) -> SyncResult<()> {
        self.coordinator.run(request).await
    }

    pub fn run_configuration(&self) -> RunConfiguration {
        self.coordinator.run_configuration()
    }

    pub fn set_run_configuration(&self, config: RunConfiguration) {
        self.coordinator.set_run_configuration(config);
    }

    /// Replace the column list and re-derive which cells await results.
    pub fn set_columns(&self, columns: Vec<Column>) {
        self.state.set_columns(columns);
        self.coordinator.recompute();
    }

    /// Feed one raw envelope from the message stream.
    pub fn ingest(&self, frame: &[u8]) -> Handled {
        self.realtime.handle_frame(frame)
    }

    pub fn spawn_stream_worker(&self, rx: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()> {
        self.realtime.spawn_worker(rx)
    }

    /// Commit any coalesced growth now instead of waiting for the timer.
    pub fn flush_growth(&self) -> usize {
        self.realtime.flush_growth()
    }

    /// Switch to another table or view. Pending timers are cancelled and
    /// requests still in flight resolve against a stale epoch and are dropped.
    /// The run configuration carries over to the new rows.
    pub fn reset(&self, table_id: impl Into<TableId>, ids: Vec<RowId>) {
        let table_id = table_id.into();
        self.realtime.reset();
        self.viewport.reset();
        self.loader.reset();
        let epoch = self.state.reset(table_id.clone(), ids);
        self.coordinator.recompute();
        info!(
            target = "enrichment::store",
            table_id = %table_id,
            epoch,
            total = self.state.total(),
            "switched table"
        );
    }

    pub fn subscribe_rows(&self) -> watch::Receiver<Arc<RowMap>> {
        self.state.rows.subscribe()
    }

    pub fn subscribe_sequence(&self) -> watch::Receiver<Arc<RowSequence>> {
        self.state.sequence.subscribe()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<Arc<LoadingState>> {
        self.state.loading.subscribe()
    }

    pub fn subscribe_columns(&self) -> watch::Receiver<Arc<ColumnSet>> {
        self.state.subscribe_columns()
    }

    pub fn columns(&self) -> Arc<ColumnSet> {
        self.state.columns()
    }

    pub fn sequence(&self) -> Arc<RowSequence> {
        self.state.sequence()
    }

    pub fn total(&self) -> usize {
        self.state.total()
    }

    pub fn table_id(&self) -> TableId {
        self.state.table_id()
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch()
    }

    pub fn config(&self) -> &SyncConfig {
        self.state.config()
    }

    pub fn last_visible_range(&self) -> Option<(usize, usize)> {
        self.viewport.last_visible_range()
    }

    pub fn max_contiguous_loaded(&self) -> Option<usize> {
        self.loader.max_contiguous_loaded()
    }

    pub fn is_load_in_flight(&self) -> bool {
        self.loader.is_in_flight()
    }

    pub fn pending_growth(&self) -> usize {
        self.realtime.pending_growth()
    }
}
