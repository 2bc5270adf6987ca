use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backend::TableBackend;
use crate::coordinator::AiRunCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::model::RowId;
use crate::state::TableState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    EmptyRange,
    OutOfBounds,
    AlreadyLoaded,
    TableChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { requested: usize, received: usize },
    Skipped(SkipReason),
}

/// Releases the single-flight flag however `load` exits, including when the
/// future is dropped mid-fetch. A guard from before a table reset leaves a
/// newer epoch's flag alone.
struct InFlightGuard<'a> {
    flag: &'a Mutex<Option<u64>>,
    epoch: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut flag = self.flag.lock();
        if *flag == Some(self.epoch) {
            *flag = None;
        }
    }
}

/// Fetches unloaded rows of an index range, one batch at a time.
pub struct BatchLoader {
    state: Arc<TableState>,
    backend: Arc<dyn TableBackend>,
    coordinator: Arc<AiRunCoordinator>,
    /// Epoch of the outstanding fetch, if any.
    in_flight: Mutex<Option<u64>>,
    contiguous: Mutex<Option<usize>>,
}

impl BatchLoader {
    pub fn new(
        state: Arc<TableState>,
        backend: Arc<dyn TableBackend>,
        coordinator: Arc<AiRunCoordinator>,
    ) -> Self {
        Self {
            state,
            backend,
            coordinator,
            in_flight: Mutex::new(None),
            contiguous: Mutex::new(None),
        }
    }

    /// True while a fetch for the current table is outstanding.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .is_some_and(|epoch| self.state.is_current(epoch))
    }

    /// Highest index `i` such that every row in `0..=i` is loaded.
    pub fn max_contiguous_loaded(&self) -> Option<usize> {
        *self.contiguous.lock()
    }

    /// Load the unloaded rows of the inclusive range `[start, end]`.
    ///
    /// A call made while another load is outstanding is dropped, not queued.
    /// Skips are not errors; fetch failures are returned after the
    /// single-flight flag is released.
    pub async fn load(&self, start: usize, end: usize) -> SyncResult<LoadOutcome> {
        let epoch = self.state.epoch();
        {
            let mut flag = self.in_flight.lock();
            if flag.is_some_and(|owner| self.state.is_current(owner)) {
                debug!(target = "enrichment::loader", start, end, "load already in flight; dropping");
                return Ok(LoadOutcome::Skipped(SkipReason::InFlight));
            }
            *flag = Some(epoch);
        }
        let _guard = InFlightGuard {
            flag: &self.in_flight,
            epoch,
        };

        if start > end {
            return Ok(LoadOutcome::Skipped(SkipReason::EmptyRange));
        }
        let sequence = self.state.sequence();
        if end >= sequence.len() {
            debug!(
                target = "enrichment::loader",
                start,
                end,
                total = sequence.len(),
                "range exceeds sequence"
            );
            return Ok(LoadOutcome::Skipped(SkipReason::OutOfBounds));
        }
        let missing: Vec<RowId> = sequence
            .slice(start, end)
            .iter()
            .filter(|id| !self.state.rows.is_loaded(id))
            .cloned()
            .collect();
        if missing.is_empty() {
            trace!(target = "enrichment::loader", start, end, "range already loaded");
            return Ok(LoadOutcome::Skipped(SkipReason::AlreadyLoaded));
        }

        let table_id = self.state.table_id();
        debug!(
            target = "enrichment::loader",
            table_id = %table_id,
            start,
            end,
            count = missing.len(),
            "fetching rows"
        );
        let records = match self.backend.fetch_rows(&table_id, &missing).await {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    target = "enrichment::loader",
                    table_id = %table_id,
                    start,
                    end,
                    error = %err,
                    "row fetch failed"
                );
                return Err(SyncError::Fetch(err));
            }
        };
        if !self.state.is_current(epoch) {
            debug!(
                target = "enrichment::loader",
                table_id = %table_id,
                "discarding rows fetched for a previous table"
            );
            return Ok(LoadOutcome::Skipped(SkipReason::TableChanged));
        }

        let columns = self.state.columns();
        let received = records.len();
        let mut loaded_ids = Vec::with_capacity(received);
        let rows: Vec<_> = records
            .into_iter()
            .map(|record| {
                loaded_ids.push(record.id.clone());
                (record.id, columns.decode_row(record.fields))
            })
            .collect();
        self.state.rows.merge_rows(rows);
        let contiguous = self.advance_contiguous();
        self.coordinator.refresh_rows(&loaded_ids);
        debug!(
            target = "enrichment::loader",
            requested = missing.len(),
            received,
            contiguous = ?contiguous,
            "rows merged"
        );
        Ok(LoadOutcome::Loaded {
            requested: missing.len(),
            received,
        })
    }

    /// Forget the previous table's fetch and cursor. A fetch still
    /// outstanding for it resolves against a stale epoch and is discarded.
    pub(crate) fn reset(&self) {
        *self.in_flight.lock() = None;
        *self.contiguous.lock() = None;
    }

    fn advance_contiguous(&self) -> Option<usize> {
        let sequence = self.state.sequence();
        let rows = self.state.rows.snapshot();
        let mut cursor = self.contiguous.lock();
        let mut next = cursor.map_or(0, |last| last + 1);
        while let Some(id) = sequence.get(next) {
            if !rows.get(id).is_some_and(|slot| slot.is_loaded()) {
                break;
            }
            next += 1;
        }
        *cursor = next.checked_sub(1);
        *cursor
    }
}
