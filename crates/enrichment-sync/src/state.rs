use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::columns::{Column, ColumnSet};
use crate::config::SyncConfig;
use crate::loading::LoadingMap;
use crate::model::{GridRow, RowId, RowSlot, TableId};
use crate::observable::Observable;
use crate::sequence::RowSequence;
use crate::store::RowStore;

/// Mutable state shared by every component of one table view.
pub struct TableState {
    table_id: RwLock<TableId>,
    epoch: AtomicU64,
    pub(crate) config: SyncConfig,
    pub(crate) rows: RowStore,
    pub(crate) sequence: Observable<RowSequence>,
    pub(crate) loading: LoadingMap,
    columns: Observable<ColumnSet>,
}

impl TableState {
    pub fn new(config: SyncConfig, table_id: TableId, columns: Vec<Column>) -> Self {
        let columns = ColumnSet::new(columns, &config.ai_actions);
        Self {
            table_id: RwLock::new(table_id),
            epoch: AtomicU64::new(0),
            config,
            rows: RowStore::new(),
            sequence: Observable::new(RowSequence::default()),
            loading: LoadingMap::new(),
            columns: Observable::new(columns),
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id.read().clone()
    }

    pub fn is_table(&self, table_id: &str) -> bool {
        *self.table_id.read() == table_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn columns(&self) -> Arc<ColumnSet> {
        self.columns.snapshot()
    }

    pub fn subscribe_columns(&self) -> watch::Receiver<Arc<ColumnSet>> {
        self.columns.subscribe()
    }

    pub(crate) fn set_columns(&self, columns: Vec<Column>) {
        self.columns
            .replace(ColumnSet::new(columns, &self.config.ai_actions));
    }

    pub fn sequence(&self) -> Arc<RowSequence> {
        self.sequence.snapshot()
    }

    pub fn total(&self) -> usize {
        self.sequence.read(RowSequence::len)
    }

    /// Append ids to the sequence in one transition and give new ids
    /// `Unloaded` slots. Returns the ids actually added.
    pub(crate) fn extend_sequence(&self, ids: Vec<RowId>) -> Vec<RowId> {
        let mut added = Vec::new();
        self.sequence.update(|sequence| {
            added = sequence.append_unique(ids);
            !added.is_empty()
        });
        if !added.is_empty() {
            self.rows.ensure_slots(&added);
        }
        added
    }

    /// Render-ready projection: one entry per sequence position.
    pub fn full_data(&self) -> Vec<GridRow> {
        let sequence = self.sequence.snapshot();
        let rows = self.rows.snapshot();
        sequence
            .ids()
            .iter()
            .map(|id| match rows.get(id) {
                Some(RowSlot::Loaded(row)) => GridRow::Loaded {
                    id: id.clone(),
                    row: row.clone(),
                },
                _ => GridRow::Loading { id: id.clone() },
            })
            .collect()
    }

    /// Switch to another table (or reload the same one). Clears rows, the
    /// sequence and loading state, and invalidates in-flight requests.
    pub(crate) fn reset(&self, table_id: TableId, ids: Vec<RowId>) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.table_id.write() = table_id.clone();
        self.rows.reset();
        self.loading.reset();
        let sequence = RowSequence::from_ids(ids);
        self.rows.ensure_slots(sequence.ids());
        self.sequence.replace(sequence);
        debug!(
            target = "enrichment::store",
            table_id = %table_id,
            epoch,
            total = self.total(),
            "table state reset"
        );
        epoch
    }
}
