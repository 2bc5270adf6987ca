use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use crate::model::{FieldId, RowId};
use crate::observable::Observable;

/// Cells currently awaiting an AI result: row id to the set of column ids.
/// A row never maps to an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadingState {
    cells: HashMap<RowId, BTreeSet<FieldId>>,
}

impl LoadingState {
    pub fn is_loading(&self, row: &str, field: &str) -> bool {
        self.cells.get(row).is_some_and(|fields| fields.contains(field))
    }

    pub fn fields(&self, row: &str) -> Option<&BTreeSet<FieldId>> {
        self.cells.get(row)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&RowId, &BTreeSet<FieldId>)> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn insert(&mut self, row: &str, field: &str) -> bool {
        self.cells
            .entry(row.to_string())
            .or_default()
            .insert(field.to_string())
    }
}

pub struct LoadingMap {
    state: Observable<LoadingState>,
}

impl Default for LoadingMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingMap {
    pub fn new() -> Self {
        Self {
            state: Observable::new(LoadingState::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<LoadingState> {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<LoadingState>> {
        self.state.subscribe()
    }

    pub fn is_loading(&self, row: &str, field: &str) -> bool {
        self.state.read(|state| state.is_loading(row, field))
    }

    /// Mark every `(row, field)` pair; returns how many were newly marked.
    pub fn mark<'a, I>(&self, cells: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut added = 0usize;
        self.state.update(|state| {
            for (row, field) in cells {
                if state.insert(row, field) {
                    added += 1;
                }
            }
            added > 0
        });
        added
    }

    /// Clear the given fields of one row, dropping the row once empty.
    pub fn clear_fields<'a, I>(&self, row: &str, fields: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut removed = 0usize;
        self.state.update(|state| {
            let Some(pending) = state.cells.get_mut(row) else {
                return false;
            };
            for field in fields {
                if pending.remove(field) {
                    removed += 1;
                }
            }
            if pending.is_empty() {
                state.cells.remove(row);
            }
            removed > 0
        });
        removed
    }

    /// Clear `(row, field)` pairs across rows; returns how many were removed.
    pub fn clear<'a, I>(&self, cells: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut removed = 0usize;
        self.state.update(|state| {
            for (row, field) in cells {
                let Some(pending) = state.cells.get_mut(row) else {
                    continue;
                };
                if pending.remove(field) {
                    removed += 1;
                }
                if pending.is_empty() {
                    state.cells.remove(row);
                }
            }
            removed > 0
        });
        removed
    }

    /// Drop entries for rows outside `valid`; returns how many rows were dropped.
    pub fn retain_rows(&self, valid: &HashSet<RowId>) -> usize {
        let mut dropped = 0usize;
        self.state.update(|state| {
            let before = state.cells.len();
            state.cells.retain(|row, _| valid.contains(row));
            dropped = before - state.cells.len();
            dropped > 0
        });
        dropped
    }

    pub fn reset(&self) {
        self.state.replace(LoadingState::default());
    }
}
