//! Authoritative client-side copy of fetched rows.
//!
//! Two merge flavours: batch loads replace whole rows, realtime pushes and
//! edits are field-additive. Fields that reach a row before its fetch does are
//! buffered in a [`RowSlot::Partial`] and laid over the fetched row, so a
//! fetch answered before a job finished never erases the job's result.
//! Neither flavour validates column types; callers decode values with
//! [`crate::columns::ColumnSet`] first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::model::{CellValue, FieldId, Row, RowId, RowSlot};
use crate::observable::Observable;

pub type RowMap = HashMap<RowId, RowSlot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMerge {
    Applied,
    Unchanged,
    /// The row is not fetched yet; the fields wait in its slot and win over
    /// the fetched values when the batch lands.
    Buffered,
}

/// What undoing a rejected field write did to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Nothing else touched the slot; it is back exactly as captured.
    Restored,
    /// Other changes landed meanwhile; only the field was reverted.
    FieldReverted,
    /// The row's fetch landed meanwhile and carried the rejected value. The
    /// pre-edit slot is back and the row must be fetched again.
    Demoted,
    /// The slot is gone (table reset).
    Missing,
}

pub struct RowStore {
    rows: Observable<RowMap>,
}

impl Default for RowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStore {
    pub fn new() -> Self {
        Self {
            rows: Observable::new(RowMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Row>> {
        self.rows
            .read(|rows| rows.get(id).and_then(|slot| slot.row().cloned()))
    }

    pub fn slot(&self, id: &str) -> Option<RowSlot> {
        self.rows.read(|rows| rows.get(id).cloned())
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.rows
            .read(|rows| rows.get(id).is_some_and(RowSlot::is_loaded))
    }

    pub fn snapshot(&self) -> Arc<RowMap> {
        self.rows.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RowMap>> {
        self.rows.subscribe()
    }

    /// Create `Unloaded` slots for ids the store has never seen.
    pub fn ensure_slots(&self, ids: &[RowId]) -> usize {
        let mut created = 0usize;
        self.rows.update(|rows| {
            for id in ids {
                if !rows.contains_key(id) {
                    rows.insert(id.clone(), RowSlot::Unloaded);
                    created += 1;
                }
            }
            created > 0
        });
        created
    }

    /// Row-replacing merge used for batch loads. Buffered fields of a
    /// `Partial` slot are applied on top of the fetched row. Returns how many
    /// slots changed.
    pub fn merge_rows<I>(&self, incoming: I) -> usize
    where
        I: IntoIterator<Item = (RowId, Row)>,
    {
        let mut changed = 0usize;
        let mut overlaid = 0usize;
        self.rows.update(|rows| {
            for (id, mut row) in incoming {
                match rows.get(&id) {
                    Some(RowSlot::Loaded(existing)) if **existing == row => continue,
                    Some(RowSlot::Partial(buffered)) => {
                        row.merge_fields(
                            buffered
                                .fields()
                                .map(|(field, value)| (field.clone(), value.clone())),
                        );
                        overlaid += 1;
                    }
                    _ => {}
                }
                rows.insert(id, RowSlot::Loaded(Arc::new(row)));
                changed += 1;
            }
            changed > 0
        });
        trace!(target = "enrichment::store", changed, overlaid, "merged row batch");
        changed
    }

    /// Field-additive merge for a single row. Rows without a fetched copy,
    /// including ids the sequence has not announced yet, buffer the fields.
    pub fn merge_fields<I>(&self, id: &str, fields: I) -> FieldMerge
    where
        I: IntoIterator<Item = (FieldId, CellValue)>,
    {
        let fields: Vec<(FieldId, CellValue)> = fields.into_iter().collect();
        let mut outcome = FieldMerge::Unchanged;
        self.rows.update(|rows| match rows.get_mut(id) {
            Some(RowSlot::Loaded(row)) => {
                if !merge_into(row, fields) {
                    return false;
                }
                outcome = FieldMerge::Applied;
                true
            }
            Some(RowSlot::Partial(buffered)) => {
                if !merge_into(buffered, fields) {
                    return false;
                }
                outcome = FieldMerge::Buffered;
                true
            }
            _ => {
                let mut buffered = Row::new();
                if !buffered.merge_fields(fields) {
                    return false;
                }
                rows.insert(id.to_string(), RowSlot::Partial(Arc::new(buffered)));
                outcome = FieldMerge::Buffered;
                true
            }
        });
        outcome
    }

    /// Install a slot regardless of what is there now.
    pub fn put_slot(&self, id: &str, slot: RowSlot) {
        self.rows.update(|rows| {
            if rows.get(id) == Some(&slot) {
                return false;
            }
            rows.insert(id.to_string(), slot);
            true
        });
    }

    /// Undo a write of `field` that installed `installed` over `previous`.
    pub fn rollback_field(
        &self,
        id: &str,
        field: &str,
        installed: &RowSlot,
        previous: Option<RowSlot>,
    ) -> Rollback {
        let prior = previous
            .as_ref()
            .and_then(RowSlot::known)
            .and_then(|row| row.get(field))
            .cloned();
        let was_loaded = previous.as_ref().is_some_and(RowSlot::is_loaded);
        let mut outcome = Rollback::Missing;
        self.rows.update(|rows| {
            let Some(current) = rows.get(id).cloned() else {
                return false;
            };
            let next = if current == *installed {
                outcome = Rollback::Restored;
                previous
            } else {
                match &current {
                    RowSlot::Loaded(row) if was_loaded => {
                        outcome = Rollback::FieldReverted;
                        Some(RowSlot::Loaded(Arc::new(revert_field(row, field, prior))))
                    }
                    RowSlot::Loaded(_) => {
                        outcome = Rollback::Demoted;
                        previous
                    }
                    RowSlot::Partial(buffered) => {
                        outcome = Rollback::FieldReverted;
                        let row = revert_field(buffered, field, prior);
                        Some(if row.is_empty() {
                            RowSlot::Unloaded
                        } else {
                            RowSlot::Partial(Arc::new(row))
                        })
                    }
                    RowSlot::Unloaded => {
                        outcome = Rollback::FieldReverted;
                        return false;
                    }
                }
            };
            if next.as_ref() == Some(&current) {
                return false;
            }
            match next {
                Some(slot) => {
                    rows.insert(id.to_string(), slot);
                }
                None => {
                    rows.remove(id);
                }
            }
            true
        });
        outcome
    }

    pub fn reset(&self) {
        self.rows.replace(RowMap::new());
    }
}

/// Clone-on-write only when some field actually differs.
fn merge_into(row: &mut Arc<Row>, fields: Vec<(FieldId, CellValue)>) -> bool {
    if fields.iter().all(|(field, value)| row.get(field) == Some(value)) {
        return false;
    }
    Arc::make_mut(row).merge_fields(fields)
}

fn revert_field(row: &Row, field: &str, prior: Option<CellValue>) -> Row {
    let mut row = Row::clone(row);
    match prior {
        Some(value) => row.set(field, value),
        None => {
            row.remove(field);
        }
    }
    row
}
