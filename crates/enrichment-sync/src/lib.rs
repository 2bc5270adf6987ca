//! Row-data synchronization engine for the enrichment table.
//!
//! The grid sees a possibly unbounded, growing list of row ids. This crate
//! keeps the client-side copy of those rows in sync:
//! - loading only the rows near the visible window, one fetch at a time
//! - merging rows and partial results pushed by background jobs
//! - tracking which AI cells are still waiting for a result
//! - applying cell edits optimistically and rolling them back on rejection
//!
//! [`EnrichmentTable`] wires the components together. Every piece of shared
//! state lives in an [`Observable`] so consumers can hold cheap snapshots and
//! subscribe to changes.

pub mod backend;
pub mod columns;
pub mod config;
pub mod coordinator;
pub mod edit;
pub mod engine;
pub mod error;
pub mod loader;
pub mod loading;
pub mod model;
pub mod observable;
pub mod realtime;
pub mod scheduler;
pub mod sequence;
pub mod state;
pub mod store;
pub mod viewport;

pub use backend::{InMemoryBackend, RunRequest, TableBackend};
pub use columns::{Column, ColumnSet};
pub use config::SyncConfig;
pub use coordinator::{AiRunCoordinator, Refresh, RunConfiguration, RunScope};
pub use edit::EditController;
pub use engine::EnrichmentTable;
pub use error::{BackendError, SyncError, SyncResult};
pub use loader::{BatchLoader, LoadOutcome, SkipReason};
pub use loading::{LoadingMap, LoadingState};
pub use model::{AiValue, CellValue, FieldId, GridRow, Row, RowId, RowRecord, RowSlot, TableId};
pub use observable::Observable;
pub use realtime::{Handled, Inbound, RealtimeProcessor, decode_envelope};
pub use scheduler::ScheduledTask;
pub use sequence::RowSequence;
pub use state::TableState;
pub use store::{FieldMerge, Rollback, RowMap, RowStore};
pub use viewport::{ViewportTracker, missing_runs, overscan_range};
