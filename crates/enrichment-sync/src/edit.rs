use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::TableBackend;
use crate::coordinator::AiRunCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::model::{AiValue, CellValue, Row, RowSlot};
use crate::state::TableState;

/// Applies cell edits locally before the server confirms them.
///
/// Overlapping edits of the same cell are not sequenced: each one overwrites
/// the store optimistically and whichever response lands last wins.
pub struct EditController {
    state: Arc<TableState>,
    backend: Arc<dyn TableBackend>,
    coordinator: Arc<AiRunCoordinator>,
}

impl EditController {
    pub fn new(
        state: Arc<TableState>,
        backend: Arc<dyn TableBackend>,
        coordinator: Arc<AiRunCoordinator>,
    ) -> Self {
        Self {
            state,
            backend,
            coordinator,
        }
    }

    /// Write `value` into `record_id.field_id`.
    ///
    /// The store takes the new value immediately. A row that is not fetched
    /// yet keeps it buffered, so its batch load still runs and lands beneath
    /// the edit. On failure the slot is put back exactly as it was, unless
    /// other changes landed meanwhile, in which case only the field reverts.
    /// On success the server's representation, if any, replaces the
    /// optimistic one.
    pub async fn edit(&self, record_id: &str, field_id: &str, value: Value) -> SyncResult<()> {
        let previous = self.state.rows.slot(record_id);
        let mut row = match previous.as_ref().and_then(RowSlot::known) {
            Some(known) => Row::clone(known),
            None => Row::new(),
        };
        let optimistic = match row.get(field_id) {
            Some(existing) => existing.with_content(value.clone()),
            None if self.state.columns().is_ai(field_id) => CellValue::Ai(AiValue {
                value: value.clone(),
                is_finished: false,
            }),
            None => CellValue::Plain(value.clone()),
        };
        row.set(field_id, optimistic.clone());
        let installed = if previous.as_ref().is_some_and(RowSlot::is_loaded) {
            RowSlot::Loaded(Arc::new(row))
        } else {
            RowSlot::Partial(Arc::new(row))
        };

        let epoch = self.state.epoch();
        let table_id = self.state.table_id();
        self.state.rows.put_slot(record_id, installed.clone());
        debug!(
            target = "enrichment::edit",
            table_id = %table_id,
            record_id,
            field_id,
            "applied optimistic edit"
        );

        let response = self
            .backend
            .update_cell(&table_id, record_id, field_id, value)
            .await;
        if !self.state.is_current(epoch) {
            debug!(
                target = "enrichment::edit",
                record_id,
                field_id,
                "table reset while edit was in flight; dropping response"
            );
            return Err(SyncError::TableChanged);
        }

        match response {
            Ok(authoritative) => {
                if let Some(raw) = authoritative {
                    let confirmed = reshape_like(&optimistic, raw);
                    self.state
                        .rows
                        .merge_fields(record_id, [(field_id.to_string(), confirmed)]);
                }
                self.coordinator.refresh_rows(&[record_id.to_string()]);
                Ok(())
            }
            Err(err) => {
                let rollback =
                    self.state
                        .rows
                        .rollback_field(record_id, field_id, &installed, previous);
                warn!(
                    target = "enrichment::edit",
                    table_id = %table_id,
                    record_id,
                    field_id,
                    rollback = ?rollback,
                    error = %err,
                    "cell update rejected; rolled back"
                );
                Err(SyncError::Update {
                    record_id: record_id.to_string(),
                    field_id: field_id.to_string(),
                    source: err,
                })
            }
        }
    }
}

/// Decode a server value into the same shape as the optimistic cell.
fn reshape_like(optimistic: &CellValue, raw: Value) -> CellValue {
    match optimistic {
        CellValue::Plain(_) => CellValue::Plain(raw),
        CellValue::Ai(_) if raw.get("value").is_some() => CellValue::from_wire(raw, true),
        // a bare echo carries no completion flag; keep ours
        ai @ CellValue::Ai(_) => ai.with_content(raw),
    }
}
