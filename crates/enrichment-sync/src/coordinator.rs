//! Tracks which AI cells are awaiting a result.
//!
//! The loading map is derived from the run configuration plus current cell
//! contents. A cell the client has no value for yet, including every cell of
//! an unfetched row, counts as empty. Entries are added by
//! [`AiRunCoordinator::recompute`], [`AiRunCoordinator::refresh_rows`] and
//! explicit runs. They are removed by result messages, by a configuration
//! change that takes the row out of scope, and by a refresh that finds the
//! fetched cell already resolved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{RunRequest, TableBackend};
use crate::columns::ColumnSet;
use crate::error::{SyncError, SyncResult};
use crate::model::{AiValue, CellValue, FieldId, RowId, RowSlot};
use crate::sequence::RowSequence;
use crate::state::TableState;
use crate::store::RowMap;

/// Which rows of one AI column are scheduled for computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RunScopeWire", into = "RunScopeWire")]
pub enum RunScope {
    All,
    Rows(HashSet<RowId>),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunScopeWire {
    #[serde(default)]
    is_all: bool,
    #[serde(default)]
    ids: Vec<RowId>,
}

impl From<RunScopeWire> for RunScope {
    fn from(wire: RunScopeWire) -> Self {
        if wire.is_all {
            RunScope::All
        } else {
            RunScope::Rows(wire.ids.into_iter().collect())
        }
    }
}

impl From<RunScope> for RunScopeWire {
    fn from(scope: RunScope) -> Self {
        match scope {
            RunScope::All => RunScopeWire {
                is_all: true,
                ids: Vec::new(),
            },
            RunScope::Rows(ids) => {
                let mut ids: Vec<RowId> = ids.into_iter().collect();
                ids.sort();
                RunScopeWire { is_all: false, ids }
            }
        }
    }
}

impl RunScope {
    fn rows<'a>(&'a self, sequence: &'a RowSequence) -> Box<dyn Iterator<Item = &'a RowId> + 'a> {
        match self {
            RunScope::All => Box::new(sequence.ids().iter()),
            RunScope::Rows(ids) => Box::new(ids.iter()),
        }
    }

    fn contains(&self, row: &str, sequence: &RowSequence) -> bool {
        match self {
            RunScope::All => sequence.contains(row),
            RunScope::Rows(ids) => ids.contains(row),
        }
    }
}

/// AI column id to its scheduled scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunConfiguration(pub HashMap<FieldId, RunScope>);

impl RunConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<FieldId>, scope: RunScope) -> Self {
        self.0.insert(field.into(), scope);
        self
    }
}

/// Loading entries touched by [`AiRunCoordinator::refresh_rows`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Refresh {
    pub marked: usize,
    pub cleared: usize,
}

pub struct AiRunCoordinator {
    state: Arc<TableState>,
    backend: Arc<dyn TableBackend>,
    run_config: RwLock<RunConfiguration>,
}

impl AiRunCoordinator {
    pub fn new(state: Arc<TableState>, backend: Arc<dyn TableBackend>) -> Self {
        Self {
            state,
            backend,
            run_config: RwLock::new(RunConfiguration::default()),
        }
    }

    pub fn run_configuration(&self) -> RunConfiguration {
        self.run_config.read().clone()
    }

    /// Replace the configuration, then rebuild the loading map and drop
    /// entries for rows no longer in scope.
    pub fn set_run_configuration(&self, config: RunConfiguration) {
        *self.run_config.write() = config;
        let valid = self.recompute();
        let dropped = self.state.loading.retain_rows(&valid);
        if dropped > 0 {
            debug!(target = "enrichment::ai", dropped, "dropped stale loading rows");
        }
    }

    /// Mark every scheduled, empty, unfinished cell as loading. Add-only.
    /// Returns the set of rows in scope of any AI column.
    pub fn recompute(&self) -> HashSet<RowId> {
        let columns = self.state.columns();
        let sequence = self.state.sequence();
        let rows = self.state.rows.snapshot();
        let config = self.run_config.read().clone();

        let mut valid = HashSet::new();
        let mut cells: Vec<(RowId, FieldId)> = Vec::new();
        for (field, scope) in &config.0 {
            if !columns.is_ai(field) {
                continue;
            }
            for row in scope.rows(&sequence) {
                valid.insert(row.clone());
                if should_load(&rows, row, field) {
                    push_with_dependent(&columns, &mut cells, row, field);
                }
            }
        }
        let added = self.mark(&cells);
        debug!(
            target = "enrichment::ai",
            scoped_rows = valid.len(),
            added,
            "recomputed loading state"
        );
        valid
    }

    /// Evaluate specific rows against the configuration: mark scheduled
    /// cells that still need a value and clear those a fetch showed resolved.
    pub fn refresh_rows(&self, ids: &[RowId]) -> Refresh {
        let config = self.run_config.read().clone();
        if config.0.is_empty() || ids.is_empty() {
            return Refresh::default();
        }
        let columns = self.state.columns();
        let sequence = self.state.sequence();
        let rows = self.state.rows.snapshot();
        let mut pending: Vec<(RowId, FieldId)> = Vec::new();
        let mut resolved: Vec<(RowId, FieldId)> = Vec::new();
        for (field, scope) in &config.0 {
            if !columns.is_ai(field) {
                continue;
            }
            for row in ids {
                if !scope.contains(row, &sequence) {
                    continue;
                }
                if should_load(&rows, row, field) {
                    push_with_dependent(&columns, &mut pending, row, field);
                } else if rows.get(row).is_some_and(RowSlot::is_loaded) {
                    push_with_dependent(&columns, &mut resolved, row, field);
                }
            }
        }
        let cleared = if resolved.is_empty() {
            0
        } else {
            self.state
                .loading
                .clear(resolved.iter().map(|(row, field)| (row.as_str(), field.as_str())))
        };
        Refresh {
            marked: self.mark(&pending),
            cleared,
        }
    }

    /// Explicit run: reset targeted cells to an empty pending value, mark
    /// them loading and ask the server to schedule the work. Loading entries
    /// are kept on failure; the run may have partially succeeded.
    pub async fn run(&self, mut request: RunRequest) -> SyncResult<()> {
        if request.table_id.is_empty() {
            request.table_id = self.state.table_id();
        }
        let epoch = self.state.epoch();
        if self.state.is_table(&request.table_id) {
            self.prepare_run(&request);
        } else {
            debug!(
                target = "enrichment::ai",
                table_id = %request.table_id,
                "run targets another table; skipping local loading state"
            );
        }
        match self.backend.run(&request).await {
            Ok(()) if !self.state.is_current(epoch) => {
                debug!(target = "enrichment::ai", "table reset while run was in flight");
                Err(SyncError::TableChanged)
            }
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    target = "enrichment::ai",
                    table_id = %request.table_id,
                    error = %err,
                    "run request failed; loading state left in place"
                );
                Err(SyncError::Run(err))
            }
        }
    }

    fn prepare_run(&self, request: &RunRequest) {
        let columns = self.state.columns();
        let sequence = self.state.sequence();
        let requested = request.fields();
        let fields: Vec<FieldId> = if requested.is_empty() {
            columns
                .columns()
                .iter()
                .filter(|column| column.generator.is_some() && columns.is_ai(&column.id))
                .map(|column| column.id.clone())
                .collect()
        } else {
            requested
                .into_iter()
                .filter(|field| columns.is_ai(field))
                .collect()
        };
        if fields.is_empty() {
            return;
        }
        let rows: Vec<RowId> = match (&request.record_ids, request.record_count) {
            (Some(ids), _) => ids.clone(),
            (None, Some(count)) => sequence.ids().iter().take(count).cloned().collect(),
            (None, None) => sequence.ids().to_vec(),
        };

        let mut cells: Vec<(RowId, FieldId)> = Vec::new();
        for row in &rows {
            for field in &fields {
                push_with_dependent(&columns, &mut cells, row, field);
            }
        }
        for row in &rows {
            let resets = cells
                .iter()
                .filter(|(cell_row, _)| cell_row == row)
                .map(|(_, field)| (field.clone(), CellValue::Ai(AiValue::pending())));
            self.state.rows.merge_fields(row, resets);
        }
        let added = self.mark(&cells);
        debug!(
            target = "enrichment::ai",
            rows = rows.len(),
            fields = fields.len(),
            added,
            "marked cells for explicit run"
        );
    }

    fn mark(&self, cells: &[(RowId, FieldId)]) -> usize {
        if cells.is_empty() {
            return 0;
        }
        self.state
            .loading
            .mark(cells.iter().map(|(row, field)| (row.as_str(), field.as_str())))
    }
}

fn push_with_dependent(
    columns: &ColumnSet,
    cells: &mut Vec<(RowId, FieldId)>,
    row: &RowId,
    field: &FieldId,
) {
    cells.push((row.clone(), field.clone()));
    if let Some(dependent) = columns.dependent_of(field) {
        cells.push((row.clone(), dependent.clone()));
    }
}

/// A cell needs a value when it is empty and unfinished. Cells the client
/// holds nothing for are empty.
fn should_load(rows: &RowMap, row: &str, field: &str) -> bool {
    match rows.get(row).and_then(RowSlot::known).and_then(|known| known.get(field)) {
        Some(value) => value.is_empty() && !value.is_finished(),
        None => true,
    }
}
