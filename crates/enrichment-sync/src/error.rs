use thiserror::Error;

use crate::model::{FieldId, RowId};

/// Failure reported by the remote table service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("value rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("row fetch failed: {0}")]
    Fetch(#[source] BackendError),
    #[error("cell update failed for {record_id}/{field_id}: {source}")]
    Update {
        record_id: RowId,
        field_id: FieldId,
        #[source]
        source: BackendError,
    },
    #[error("ai run request failed: {0}")]
    Run(#[source] BackendError),
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("table changed while request was in flight")]
    TableChanged,
}

pub type SyncResult<T> = Result<T, SyncError>;
