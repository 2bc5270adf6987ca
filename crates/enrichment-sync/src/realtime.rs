//! Applies the background job stream to the table.
//!
//! Two envelope kinds matter. `progress` announces new row ids; bursts are
//! coalesced and committed as a single sequence transition. `message` carries
//! computed fields for one row; it is applied immediately and resolves the
//! matching loading entries. Anything else, including envelopes for other
//! tables and malformed payloads, is logged and skipped.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::coordinator::AiRunCoordinator;
use crate::error::SyncResult;
use crate::model::{CellValue, FieldId, RowId, TableId};
use crate::scheduler::ScheduledTask;
use crate::state::TableState;
use crate::store::FieldMerge;
use crate::viewport::ViewportTracker;

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ProgressPayload {
    id: TableId,
    #[serde(default)]
    data: Vec<RowId>,
}

#[derive(Deserialize)]
struct MessagePayload {
    data: RecordUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordUpdate {
    table_id: TableId,
    #[serde(default)]
    record_id: Option<RowId>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

/// Decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Growth {
        table_id: TableId,
        ids: Vec<RowId>,
    },
    Result {
        table_id: TableId,
        record_id: RowId,
        fields: Map<String, Value>,
    },
    /// Envelope of a kind this engine does not consume.
    Other(String),
}

/// Decode one raw frame.
pub fn decode_envelope(frame: &[u8]) -> SyncResult<Inbound> {
    let raw: RawEnvelope = serde_json::from_slice(frame)?;
    match raw.kind.as_str() {
        "progress" => {
            let payload: ProgressPayload = serde_json::from_value(raw.data)?;
            Ok(Inbound::Growth {
                table_id: payload.id,
                ids: payload.data,
            })
        }
        "message" => {
            let payload: MessagePayload = serde_json::from_value(raw.data)?;
            let update = payload.data;
            match update.record_id {
                Some(record_id) if !record_id.is_empty() => Ok(Inbound::Result {
                    table_id: update.table_id,
                    record_id,
                    fields: update.metadata,
                }),
                _ => Err(<serde_json::Error as serde::de::Error>::missing_field("recordId").into()),
            }
        }
        other => Ok(Inbound::Other(other.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Growth ids added to the pending batch; the value is the batch size.
    Queued(usize),
    Applied { merge: FieldMerge, cleared: usize },
    Ignored,
    Malformed,
}

pub struct RealtimeProcessor {
    state: Arc<TableState>,
    coordinator: Arc<AiRunCoordinator>,
    viewport: Arc<ViewportTracker>,
    pending: Mutex<Vec<RowId>>,
    flush_timer: ScheduledTask,
}

impl RealtimeProcessor {
    pub fn new(
        state: Arc<TableState>,
        coordinator: Arc<AiRunCoordinator>,
        viewport: Arc<ViewportTracker>,
    ) -> Self {
        Self {
            state,
            coordinator,
            viewport,
            pending: Mutex::new(Vec::new()),
            flush_timer: ScheduledTask::new("growth-flush"),
        }
    }

    /// Consume an ordered frame stream until the sender side closes.
    pub fn spawn_worker(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                processor.handle_frame(&frame);
            }
            debug!(target = "enrichment::realtime", "message stream closed");
        })
    }

    /// Handle one raw frame. Never fails; bad frames are logged.
    pub fn handle_frame(self: &Arc<Self>, frame: &[u8]) -> Handled {
        match decode_envelope(frame) {
            Ok(inbound) => self.handle(inbound),
            Err(err) => {
                warn!(
                    target = "enrichment::realtime",
                    error = %err,
                    len = frame.len(),
                    "dropping malformed envelope"
                );
                Handled::Malformed
            }
        }
    }

    pub fn handle(self: &Arc<Self>, inbound: Inbound) -> Handled {
        match inbound {
            Inbound::Growth { table_id, ids } => {
                if !self.state.is_table(&table_id) {
                    debug!(target = "enrichment::realtime", table_id = %table_id, "growth for another table");
                    return Handled::Ignored;
                }
                self.queue_growth(ids)
            }
            Inbound::Result {
                table_id,
                record_id,
                fields,
            } => {
                if !self.state.is_table(&table_id) {
                    debug!(target = "enrichment::realtime", table_id = %table_id, "result for another table");
                    return Handled::Ignored;
                }
                self.apply_result(&record_id, fields)
            }
            Inbound::Other(kind) => {
                trace!(target = "enrichment::realtime", kind = %kind, "ignoring envelope");
                Handled::Ignored
            }
        }
    }

    pub fn pending_growth(&self) -> usize {
        self.pending.lock().len()
    }

    /// Commit pending growth. Returns how many ids were actually new.
    pub fn flush_growth(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return 0;
        }
        let batch = pending.len();
        let added = self.state.extend_sequence(pending);
        if added.is_empty() {
            trace!(target = "enrichment::realtime", batch, "growth batch had no new ids");
            return 0;
        }
        debug!(
            target = "enrichment::realtime",
            batch,
            added = added.len(),
            total = self.state.total(),
            "sequence grew"
        );
        self.coordinator.recompute();
        self.viewport.on_sequence_grown();
        added.len()
    }

    pub(crate) fn reset(&self) {
        self.flush_timer.cancel();
        self.pending.lock().clear();
    }

    fn queue_growth(self: &Arc<Self>, ids: Vec<RowId>) -> Handled {
        let size = {
            let mut pending = self.pending.lock();
            pending.extend(ids);
            pending.len()
        };
        let delay = self.state.config().growth_delay_for(size);
        if delay.is_zero() {
            self.flush_timer.cancel();
            self.flush_growth();
        } else {
            let processor: Weak<Self> = Arc::downgrade(self);
            self.flush_timer.schedule(delay, move || {
                if let Some(processor) = processor.upgrade() {
                    processor.flush_growth();
                }
            });
        }
        Handled::Queued(size)
    }

    fn apply_result(&self, record_id: &str, metadata: Map<String, Value>) -> Handled {
        let columns = self.state.columns();
        let field_ids: Vec<FieldId> = metadata.keys().cloned().collect();
        let fields: Vec<(FieldId, CellValue)> = metadata
            .into_iter()
            .map(|(field, raw)| {
                let value = columns.decode(&field, raw);
                (field, value)
            })
            .collect();
        let merge = self.state.rows.merge_fields(record_id, fields);
        let cleared = self
            .state
            .loading
            .clear_fields(record_id, field_ids.iter().map(String::as_str));
        trace!(
            target = "enrichment::realtime",
            record_id,
            fields = field_ids.len(),
            merge = ?merge,
            cleared,
            "applied result"
        );
        Handled::Applied { merge, cleared }
    }
}
