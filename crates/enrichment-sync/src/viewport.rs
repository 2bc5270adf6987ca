use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::loader::{BatchLoader, LoadOutcome};
use crate::scheduler::ScheduledTask;
use crate::sequence::RowSequence;
use crate::state::TableState;
use crate::store::RowMap;

/// Expand a visible range by the configured overscan, clamped to
/// `[0, total - 1]`. `None` when there is nothing to show.
pub fn overscan_range(
    start: usize,
    end: usize,
    total: usize,
    config: &SyncConfig,
) -> Option<(usize, usize)> {
    if total == 0 || start > end || start >= total {
        return None;
    }
    let visible = end - start + 1;
    let margin = config.overscan_for(visible);
    let from = start.saturating_sub(margin);
    let to = end.saturating_add(margin).min(total - 1);
    Some((from, to))
}

/// Split the unloaded indices of `[start, end]` into maximal contiguous runs.
pub fn missing_runs(
    sequence: &RowSequence,
    rows: &RowMap,
    start: usize,
    end: usize,
) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut open: Option<usize> = None;
    for (offset, id) in sequence.slice(start, end).iter().enumerate() {
        let index = start + offset;
        let loaded = rows.get(id).is_some_and(|slot| slot.is_loaded());
        match (loaded, open) {
            (false, None) => open = Some(index),
            (true, Some(run_start)) => {
                runs.push((run_start, index - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(run_start) = open {
        let last = end.min(sequence.len().saturating_sub(1));
        runs.push((run_start, last));
    }
    runs
}

/// Turns visible-range changes from the grid into batch loads.
pub struct ViewportTracker {
    state: Arc<TableState>,
    loader: Arc<BatchLoader>,
    last_visible: Mutex<Option<(usize, usize)>>,
    recheck_timer: ScheduledTask,
}

impl ViewportTracker {
    pub fn new(state: Arc<TableState>, loader: Arc<BatchLoader>) -> Self {
        Self {
            state,
            loader,
            last_visible: Mutex::new(None),
            recheck_timer: ScheduledTask::new("viewport-recheck"),
        }
    }

    pub fn last_visible_range(&self) -> Option<(usize, usize)> {
        *self.last_visible.lock()
    }

    /// Load every missing row of the overscanned visible range, one batch
    /// per contiguous run.
    pub async fn on_visible_range_change(
        &self,
        start: usize,
        end: usize,
    ) -> SyncResult<Vec<LoadOutcome>> {
        *self.last_visible.lock() = Some((start, end));
        let total = self.state.total();
        let Some((from, to)) = overscan_range(start, end, total, self.state.config()) else {
            return Ok(Vec::new());
        };
        let runs = {
            let sequence = self.state.sequence();
            let rows = self.state.rows.snapshot();
            missing_runs(&sequence, &rows, from, to)
        };
        trace!(
            target = "enrichment::viewport",
            start,
            end,
            from,
            to,
            runs = runs.len(),
            "visible range changed"
        );
        self.load_runs(runs).await
    }

    /// Re-evaluate the last visible range (without overscan) against the
    /// current sequence, loading rows that are still missing.
    pub async fn recheck(&self) -> SyncResult<Vec<LoadOutcome>> {
        let Some((start, end)) = self.last_visible_range() else {
            return Ok(Vec::new());
        };
        let total = self.state.total();
        if total == 0 || start >= total || start > end {
            return Ok(Vec::new());
        }
        let end = end.min(total - 1);
        let runs = {
            let sequence = self.state.sequence();
            let rows = self.state.rows.snapshot();
            missing_runs(&sequence, &rows, start, end)
        };
        if !runs.is_empty() {
            debug!(
                target = "enrichment::viewport",
                start,
                end,
                runs = runs.len(),
                "visible rows still missing after growth"
            );
        }
        self.load_runs(runs).await
    }

    /// Schedule a recheck once the grid has had time to pick up new rows.
    /// Repeated growth within the settle delay collapses into one recheck.
    pub fn on_sequence_grown(self: &Arc<Self>) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        self.recheck_timer
            .schedule(self.state.config().growth_settle_delay, move || {
                let Some(tracker) = tracker.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = tracker.recheck().await {
                        debug!(target = "enrichment::viewport", error = %err, "recheck failed");
                    }
                });
            });
    }

    pub fn recheck_pending(&self) -> bool {
        self.recheck_timer.is_pending()
    }

    pub(crate) fn reset(&self) {
        self.recheck_timer.cancel();
        *self.last_visible.lock() = None;
    }

    async fn load_runs(&self, runs: Vec<(usize, usize)>) -> SyncResult<Vec<LoadOutcome>> {
        let mut outcomes = Vec::with_capacity(runs.len());
        let mut first_error: Option<SyncError> = None;
        for (start, end) in runs {
            match self.loader.load(start, end).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    }
}
