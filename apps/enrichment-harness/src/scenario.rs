//! JSON scenario format and replay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use enrichment_sync::{
    Column, EnrichmentTable, FieldId, GridRow, InMemoryBackend, Row, RowId, RowRecord,
    RunConfiguration, RunRequest, SyncConfig, TableId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub table_id: TableId,
    /// Falls back to `SyncConfig::from_env()`.
    #[serde(default)]
    pub config: Option<SyncConfig>,
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Rows the backend serves, per table.
    #[serde(default)]
    pub tables: BTreeMap<TableId, Vec<RowRecord>>,
    /// Initial row-id sequence; defaults to the backend's rows in order.
    #[serde(default)]
    pub sequence: Option<Vec<RowId>>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum Step {
    Visible {
        start: usize,
        end: usize,
    },
    /// Raw inbound envelope, delivered through the stream worker.
    Envelope {
        frame: Value,
    },
    #[serde(rename_all = "camelCase")]
    Edit {
        record_id: RowId,
        field_id: FieldId,
        value: Value,
    },
    Run(RunRequest),
    RunConfig {
        config: RunConfiguration,
    },
    SleepMs {
        ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Reset {
        table_id: TableId,
        #[serde(default)]
        ids: Option<Vec<RowId>>,
    },
    #[serde(rename_all = "camelCase")]
    Backend {
        latency_ms: Option<u64>,
        fail_fetches: Option<bool>,
        fail_updates: Option<bool>,
        fail_runs: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub table_id: TableId,
    pub epoch: u64,
    pub total: usize,
    pub rows: Vec<RowSummary>,
    pub loading: BTreeMap<RowId, Vec<FieldId>>,
    pub max_contiguous_loaded: Option<usize>,
    pub last_visible_range: Option<(usize, usize)>,
    pub fetch_calls: usize,
    pub update_calls: usize,
    pub run_calls: usize,
    pub errors: Vec<StepError>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSummary {
    pub id: RowId,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Row>,
}

#[derive(Debug, Serialize)]
pub struct StepError {
    pub step: usize,
    pub message: String,
}

struct Runner {
    table: EnrichmentTable,
    backend: Arc<InMemoryBackend>,
    tables: BTreeMap<TableId, Vec<RowRecord>>,
    frames: mpsc::UnboundedSender<Bytes>,
    worker: JoinHandle<()>,
    errors: Vec<StepError>,
}

/// Replay every step and summarise the final state. Engine errors are
/// collected per step; only harness failures abort the replay.
pub async fn replay(scenario: Scenario) -> anyhow::Result<Summary> {
    let Scenario {
        table_id,
        config,
        columns,
        tables,
        sequence,
        steps,
    } = scenario;

    let backend = InMemoryBackend::new();
    for (table, rows) in &tables {
        backend.insert_rows(table, rows.iter().cloned());
    }
    let ids = sequence.unwrap_or_else(|| ids_of(&tables, &table_id));
    let config = config.unwrap_or_else(SyncConfig::from_env);
    let table = EnrichmentTable::new(config, backend.clone(), table_id.clone(), columns, ids);
    let (frames, rx) = mpsc::unbounded_channel();
    let worker = table.spawn_stream_worker(rx);
    info!(table_id = %table_id, total = table.total(), steps = steps.len(), "replaying scenario");

    let mut runner = Runner {
        table,
        backend,
        tables,
        frames,
        worker,
        errors: Vec::new(),
    };
    for (index, step) in steps.into_iter().enumerate() {
        runner.apply(index, step).await?;
    }
    runner.finish().await
}

fn ids_of(tables: &BTreeMap<TableId, Vec<RowRecord>>, table_id: &str) -> Vec<RowId> {
    tables
        .get(table_id)
        .map(|rows| rows.iter().map(|row| row.id.clone()).collect())
        .unwrap_or_default()
}

impl Runner {
    async fn apply(&mut self, index: usize, step: Step) -> anyhow::Result<()> {
        debug!(step = index, kind = ?step, "applying step");
        let outcome = match step {
            Step::Visible { start, end } => self
                .table
                .on_visible_range_change(start, end)
                .await
                .map(|_| ()),
            Step::Envelope { frame } => {
                let frame = serde_json::to_vec(&frame).context("encoding envelope")?;
                self.frames
                    .send(Bytes::from(frame))
                    .context("stream worker stopped")?;
                // let the worker drain the channel before the next step
                tokio::task::yield_now().await;
                Ok(())
            }
            Step::Edit {
                record_id,
                field_id,
                value,
            } => self.table.on_cell_edit(&record_id, &field_id, value).await,
            Step::Run(request) => self.table.on_run_ai(request).await,
            Step::RunConfig { config } => {
                self.table.set_run_configuration(config);
                Ok(())
            }
            Step::SleepMs { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            Step::Reset { table_id, ids } => {
                let ids = ids.unwrap_or_else(|| ids_of(&self.tables, &table_id));
                self.table.reset(table_id, ids);
                Ok(())
            }
            Step::Backend {
                latency_ms,
                fail_fetches,
                fail_updates,
                fail_runs,
            } => {
                if let Some(ms) = latency_ms {
                    self.backend.set_latency(Duration::from_millis(ms));
                }
                if let Some(fail) = fail_fetches {
                    self.backend.fail_fetches(fail);
                }
                if let Some(fail) = fail_updates {
                    self.backend.fail_updates(fail);
                }
                if let Some(fail) = fail_runs {
                    self.backend.fail_runs(fail);
                }
                Ok(())
            }
        };
        if let Err(err) = outcome {
            warn!(step = index, error = %err, "step failed");
            self.errors.push(StepError {
                step: index,
                message: err.to_string(),
            });
        }
        Ok(())
    }

    async fn finish(self) -> anyhow::Result<Summary> {
        let Runner {
            table,
            backend,
            frames,
            worker,
            errors,
            ..
        } = self;
        drop(frames);
        worker.await.context("stream worker panicked")?;

        let rows = table
            .full_data()
            .into_iter()
            .map(|row| match row {
                GridRow::Loaded { id, row } => RowSummary {
                    id,
                    loaded: true,
                    fields: Some(Row::clone(&row)),
                },
                GridRow::Loading { id } => RowSummary {
                    id,
                    loaded: false,
                    fields: None,
                },
            })
            .collect();
        let loading = table
            .ai_loading_state()
            .rows()
            .map(|(row, fields)| (row.clone(), fields.iter().cloned().collect()))
            .collect();

        Ok(Summary {
            table_id: table.table_id(),
            epoch: table.epoch(),
            total: table.total(),
            rows,
            loading,
            max_contiguous_loaded: table.max_contiguous_loaded(),
            last_visible_range: table.last_visible_range(),
            fetch_calls: backend.fetch_calls().len(),
            update_calls: backend.update_calls().len(),
            run_calls: backend.run_calls().len(),
            errors,
        })
    }
}
