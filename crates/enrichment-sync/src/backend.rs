use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BackendError;
use crate::model::{FieldId, RowId, RowRecord, TableId};

/// Parameters of an AI run request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Empty means the engine's current table.
    #[serde(default)]
    pub table_id: TableId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<FieldId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_ids: Option<Vec<FieldId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_ids: Option<Vec<RowId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<usize>,
}

impl RunRequest {
    pub fn for_field(table_id: impl Into<TableId>, field_id: impl Into<FieldId>) -> Self {
        Self {
            table_id: table_id.into(),
            field_id: Some(field_id.into()),
            ..Self::default()
        }
    }

    pub fn with_records<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RowId>,
    {
        self.record_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Requested fields in order, without duplicates.
    pub fn fields(&self) -> Vec<FieldId> {
        let mut fields: Vec<FieldId> = Vec::new();
        let requested = self
            .field_id
            .iter()
            .chain(self.field_ids.iter().flatten());
        for field in requested {
            if !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields
    }
}

/// Remote table service the engine talks to.
#[async_trait]
pub trait TableBackend: Send + Sync {
    async fn fetch_rows(
        &self,
        table_id: &str,
        record_ids: &[RowId],
    ) -> Result<Vec<RowRecord>, BackendError>;

    /// Returns the server's authoritative representation of the field, if any.
    async fn update_cell(
        &self,
        table_id: &str,
        record_id: &str,
        field_id: &str,
        value: Value,
    ) -> Result<Option<Value>, BackendError>;

    /// Schedules computation; results arrive on the message stream.
    async fn run(&self, request: &RunRequest) -> Result<(), BackendError>;
}

/// In-memory adapter for tests and the scenario harness.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: Mutex<HashMap<TableId, HashMap<RowId, Map<String, Value>>>>,
    latency: Mutex<Duration>,
    fail_fetch: AtomicBool,
    fail_update: AtomicBool,
    fail_run: AtomicBool,
    fetches: Mutex<Vec<Vec<RowId>>>,
    updates: Mutex<Vec<(RowId, FieldId, Value)>>,
    runs: Mutex<Vec<RunRequest>>,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_rows<I>(&self, table_id: &str, rows: I)
    where
        I: IntoIterator<Item = RowRecord>,
    {
        let mut tables = self.tables.lock();
        let table = tables.entry(table_id.to_string()).or_default();
        for record in rows {
            table.insert(record.id, record.fields);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_runs(&self, fail: bool) {
        self.fail_run.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> Vec<Vec<RowId>> {
        self.fetches.lock().clone()
    }

    pub fn update_calls(&self) -> Vec<(RowId, FieldId, Value)> {
        self.updates.lock().clone()
    }

    pub fn run_calls(&self) -> Vec<RunRequest> {
        self.runs.lock().clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl TableBackend for InMemoryBackend {
    async fn fetch_rows(
        &self,
        table_id: &str,
        record_ids: &[RowId],
    ) -> Result<Vec<RowRecord>, BackendError> {
        self.fetches.lock().push(record_ids.to_vec());
        self.simulate_latency().await;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BackendError::Request("fetch unavailable".into()));
        }
        let tables = self.tables.lock();
        let table = tables
            .get(table_id)
            .ok_or_else(|| BackendError::UnknownTable(table_id.to_string()))?;
        Ok(record_ids
            .iter()
            .filter_map(|id| {
                table.get(id).map(|fields| RowRecord {
                    id: id.clone(),
                    fields: fields.clone(),
                })
            })
            .collect())
    }

    async fn update_cell(
        &self,
        table_id: &str,
        record_id: &str,
        field_id: &str,
        value: Value,
    ) -> Result<Option<Value>, BackendError> {
        self.updates
            .lock()
            .push((record_id.to_string(), field_id.to_string(), value.clone()));
        self.simulate_latency().await;
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!("{record_id}/{field_id}")));
        }
        let mut tables = self.tables.lock();
        let table = tables
            .get_mut(table_id)
            .ok_or_else(|| BackendError::UnknownTable(table_id.to_string()))?;
        table
            .entry(record_id.to_string())
            .or_default()
            .insert(field_id.to_string(), value.clone());
        Ok(Some(value))
    }

    async fn run(&self, request: &RunRequest) -> Result<(), BackendError> {
        self.runs.lock().push(request.clone());
        self.simulate_latency().await;
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(BackendError::Request("run scheduling failed".into()));
        }
        if !self.tables.lock().contains_key(&request.table_id) {
            return Err(BackendError::UnknownTable(request.table_id.clone()));
        }
        Ok(())
    }
}
