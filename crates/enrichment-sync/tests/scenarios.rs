use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use enrichment_sync::{
    AiValue, CellValue, Column, EnrichmentTable, FieldMerge, GridRow, Handled, InMemoryBackend,
    LoadOutcome, RowRecord, RunConfiguration, RunRequest, RunScope, SkipReason, SyncConfig, SyncError,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn ids(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("{prefix}{i}")).collect()
}

fn columns() -> Vec<Column> {
    vec![
        Column::plain("name"),
        Column::generated("summary", "ai_summary"),
        Column::generated("email", "find_email").with_dependent("email_status"),
    ]
}

fn seeded_backend(table: &str, count: usize) -> Arc<InMemoryBackend> {
    let backend = InMemoryBackend::new();
    backend.insert_rows(
        table,
        ids("r", count)
            .into_iter()
            .map(|id| RowRecord::new(id.clone()).with_field("name", json!(format!("name-{id}")))),
    );
    backend
}

fn table(backend: &Arc<InMemoryBackend>, count: usize) -> EnrichmentTable {
    EnrichmentTable::new(
        SyncConfig::default(),
        backend.clone(),
        "t1",
        columns(),
        ids("r", count),
    )
}

fn progress(table: &str, ids: &[&str]) -> Vec<u8> {
    serde_json::to_vec(&json!({"type": "progress", "data": {"id": table, "data": ids}})).unwrap()
}

fn result(table: &str, record: &str, metadata: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "type": "message",
        "data": {"data": {"tableId": table, "recordId": record, "metadata": metadata}}
    }))
    .unwrap()
}

fn loaded_count(table: &EnrichmentTable) -> usize {
    table
        .full_data()
        .iter()
        .filter(|row| matches!(row, GridRow::Loaded { .. }))
        .count()
}

#[test_timeout::tokio_timeout_test]
async fn initial_viewport_loads_the_overscanned_range() {
    let backend = seeded_backend("t1", 3);
    let table = table(&backend, 3);

    let outcomes = table.on_visible_range_change(0, 1).await.unwrap();
    assert_eq!(
        outcomes,
        vec![LoadOutcome::Loaded {
            requested: 3,
            received: 3
        }]
    );
    assert_eq!(backend.fetch_calls(), vec![ids("r", 3)]);

    let data = table.full_data();
    assert_eq!(data.len(), 3);
    for (row, id) in data.iter().zip(ids("r", 3)) {
        assert_eq!(row.id(), id);
        assert_eq!(
            row.row().and_then(|r| r.get("name")),
            Some(&CellValue::Plain(json!(format!("name-{id}"))))
        );
    }
    assert_eq!(table.max_contiguous_loaded(), Some(2));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn growth_outside_the_window_commits_once_without_loading() {
    let backend = seeded_backend("t1", 4);
    let table = table(&backend, 3);
    table.on_visible_range_change(0, 1).await.unwrap();
    let mut sequence = table.subscribe_sequence();
    sequence.borrow_and_update();
    let generation = table.sequence().generation();

    assert_eq!(table.ingest(&progress("t1", &["r4"])), Handled::Queued(1));
    assert_eq!(table.total(), 3);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sequence.has_changed().unwrap());
    assert_eq!(table.sequence().generation(), generation + 1);
    assert_eq!(table.sequence().ids(), ids("r", 4).as_slice());
    assert!(matches!(table.full_data()[3], GridRow::Loading { .. }));

    // settle delay passes; r4 is outside the visible range
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.fetch_calls().len(), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn growth_inside_the_window_is_fetched_after_settling() {
    let backend = seeded_backend("t1", 10);
    let table = table(&backend, 3);
    table.on_visible_range_change(0, 7).await.unwrap();
    assert_eq!(loaded_count(&table), 3);

    table.ingest(&progress("t1", &["r4", "r5"]));
    table.ingest(&progress("t1", &["r6"]));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(table.total(), 6);
    assert_eq!(loaded_count(&table), 6);
    assert_eq!(backend.fetch_calls()[1], ids("r", 6)[3..].to_vec());
}

#[test_timeout::tokio_timeout_test]
async fn ai_result_resolves_its_spinner() {
    let backend = seeded_backend("t1", 2);
    let table = table(&backend, 2);
    table.on_visible_range_change(0, 1).await.unwrap();
    table.set_run_configuration(RunConfiguration::new().with("summary", RunScope::All));
    assert!(table.ai_loading_state().is_loading("r1", "summary"));
    assert!(table.ai_loading_state().is_loading("r2", "summary"));

    table.ingest(&result(
        "t1",
        "r1",
        json!({"summary": {"value": "Strong fit", "isFinished": true}}),
    ));

    let loading = table.ai_loading_state();
    assert!(loading.fields("r1").is_none());
    assert!(loading.is_loading("r2", "summary"));
    let data = table.full_data();
    assert_eq!(
        data[0].row().and_then(|row| row.get("summary")),
        Some(&CellValue::Ai(AiValue {
            value: json!("Strong fit"),
            is_finished: true
        }))
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn rejected_edit_shows_new_then_reverts() {
    let backend = seeded_backend("t1", 2);
    backend.insert_rows("t1", [RowRecord::new("r2").with_field("name", json!("Old"))]);
    let table = table(&backend, 2);
    table.on_visible_range_change(0, 1).await.unwrap();
    let before = table.full_data();

    backend.set_latency(Duration::from_millis(100));
    backend.fail_updates(true);
    let observe = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.full_data()[1]
            .row()
            .and_then(|row| row.get("name"))
            .cloned()
    };
    let (outcome, during) = tokio::join!(table.on_cell_edit("r2", "name", json!("New")), observe);

    assert_eq!(during, Some(CellValue::Plain(json!("New"))));
    assert!(matches!(outcome, Err(SyncError::Update { .. })));
    assert_eq!(table.full_data(), before);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn rapid_identical_loads_issue_one_fetch() {
    let backend = seeded_backend("t1", 10);
    backend.set_latency(Duration::from_millis(50));
    let table = table(&backend, 10);

    let (first, second) = tokio::join!(
        table.on_visible_range_change(0, 9),
        table.on_visible_range_change(0, 9)
    );
    assert_eq!(
        first.unwrap(),
        vec![LoadOutcome::Loaded {
            requested: 10,
            received: 10
        }]
    );
    assert_eq!(second.unwrap(), vec![LoadOutcome::Skipped(SkipReason::InFlight)]);
    assert_eq!(backend.fetch_calls().len(), 1);
    assert!(!table.is_load_in_flight());
}

#[test_timeout::tokio_timeout_test]
async fn every_overscanned_row_is_loaded_after_scrolling() {
    let backend = seeded_backend("t1", 300);
    let table = table(&backend, 300);
    for (start, end) in [(0, 4), (100, 119), (60, 70), (280, 299)] {
        table.on_visible_range_change(start, end).await.unwrap();
        let margin = table.config().overscan_for(end - start + 1);
        let from = start.saturating_sub(margin);
        let to = (end + margin).min(table.total() - 1);
        let data = table.full_data();
        for index in from..=to {
            assert!(
                matches!(data[index], GridRow::Loaded { .. }),
                "row {index} missing after viewing {start}..={end}"
            );
        }
    }
    // nothing is fetched twice
    let fetched: usize = backend.fetch_calls().iter().map(Vec::len).sum();
    assert_eq!(fetched, loaded_count(&table));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn streamed_growth_bursts_produce_one_transition() {
    let backend = seeded_backend("t1", 2);
    let table = table(&backend, 2);
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = table.spawn_stream_worker(rx);
    let generation = table.sequence().generation();

    for batch in [["r3", "r4"], ["r4", "r5"], ["r2", "r6"], ["r6", "r7"]] {
        tx.send(Bytes::from(progress("t1", &batch))).unwrap();
    }
    tx.send(Bytes::from(progress("t2", &["x1"]))).unwrap();
    tx.send(Bytes::from_static(b"{\"type\":\"message\",\"data\":{}}")).unwrap();
    drop(tx);
    worker.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(table.sequence().generation(), generation + 1);
    assert_eq!(table.sequence().ids(), ids("r", 7).as_slice());
}

#[test_timeout::tokio_timeout_test]
async fn result_clears_exactly_the_fields_it_carries() {
    let backend = seeded_backend("t1", 2);
    let table = table(&backend, 2);
    table.on_visible_range_change(0, 1).await.unwrap();
    table.set_run_configuration(
        RunConfiguration::new()
            .with("summary", RunScope::All)
            .with("email", RunScope::All),
    );
    let before = table.ai_loading_state();
    assert_eq!(before.len(), 6);

    table.ingest(&result("t1", "r2", json!({"email": {"value": "a@b.co", "isFinished": true}})));
    let after = table.ai_loading_state();
    assert_eq!(after.len(), 5);
    assert!(!after.is_loading("r2", "email"));
    assert!(after.is_loading("r2", "email_status"));
    assert!(after.is_loading("r1", "email"));
}

#[test_timeout::tokio_timeout_test]
async fn edits_never_change_a_cells_shape() {
    let backend = seeded_backend("t1", 1);
    backend.insert_rows(
        "t1",
        [RowRecord::new("r1")
            .with_field("name", json!("Ada"))
            .with_field("summary", json!({"value": "draft", "isFinished": true}))],
    );
    let table = table(&backend, 1);
    table.on_visible_range_change(0, 0).await.unwrap();

    table.on_cell_edit("r1", "summary", json!("edited")).await.unwrap();
    table.on_cell_edit("r1", "name", json!({"value": "looks like ai"})).await.unwrap();

    let data = table.full_data();
    let row = data[0].row().unwrap();
    assert_eq!(
        row.get("summary"),
        Some(&CellValue::Ai(AiValue {
            value: json!("edited"),
            is_finished: true
        }))
    );
    assert_eq!(row.get("name"), Some(&CellValue::Plain(json!({"value": "looks like ai"}))));
}

#[test_timeout::tokio_timeout_test]
async fn explicit_run_shows_spinners_until_results_arrive() {
    let backend = seeded_backend("t1", 3);
    let table = table(&backend, 3);
    table.on_visible_range_change(0, 2).await.unwrap();

    table
        .on_run_ai(RunRequest {
            field_ids: Some(vec!["email".into()]),
            record_count: Some(2),
            ..RunRequest::default()
        })
        .await
        .unwrap();
    let runs = backend.run_calls();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].table_id, "t1");

    let loading = table.ai_loading_state();
    assert!(loading.is_loading("r1", "email"));
    assert!(loading.is_loading("r2", "email_status"));
    assert!(!loading.is_loading("r3", "email"));

    for id in ["r1", "r2"] {
        table.ingest(&result(
            "t1",
            id,
            json!({
                "email": {"value": format!("{id}@acme.io"), "isFinished": true},
                "email_status": {"value": "valid", "isFinished": true}
            }),
        ));
    }
    assert!(table.ai_loading_state().is_empty());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn switching_tables_discards_late_results() {
    let backend = seeded_backend("t1", 3);
    backend.insert_rows("t2", [RowRecord::new("x1").with_field("name", json!("other"))]);
    backend.set_latency(Duration::from_millis(50));
    let table = table(&backend, 3);

    let switch = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.ingest(&progress("t1", &["r9"]));
        table.reset("t2", vec!["x1".into()]);
    };
    let (outcomes, ()) = tokio::join!(table.on_visible_range_change(0, 2), switch);
    assert_eq!(
        outcomes.unwrap(),
        vec![LoadOutcome::Skipped(SkipReason::TableChanged)]
    );
    assert_eq!(table.table_id(), "t2");
    assert_eq!(table.epoch(), 1);
    assert_eq!(table.pending_growth(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(table.sequence().ids(), ["x1".to_string()].as_slice());
    assert_eq!(table.ingest(&progress("t1", &["r4"])), Handled::Ignored);

    table.on_visible_range_change(0, 0).await.unwrap();
    assert_eq!(loaded_count(&table), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn result_arriving_during_a_fetch_survives_it() {
    let backend = seeded_backend("t1", 2);
    backend.set_latency(Duration::from_millis(100));
    let table = table(&backend, 2);
    table.set_run_configuration(RunConfiguration::new().with("summary", RunScope::All));
    assert!(table.ai_loading_state().is_loading("r1", "summary"));

    let push = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.ingest(&result(
            "t1",
            "r1",
            json!({"summary": {"value": "Strong fit", "isFinished": true}}),
        ))
    };
    let (outcomes, handled) = tokio::join!(table.on_visible_range_change(0, 0), push);
    assert_eq!(
        handled,
        Handled::Applied {
            merge: FieldMerge::Buffered,
            cleared: 1
        }
    );
    let outcomes = outcomes.unwrap();
    assert!(matches!(outcomes.as_slice(), [LoadOutcome::Loaded { .. }]));

    let data = table.full_data();
    assert_eq!(
        data[0].row().and_then(|row| row.get("summary")),
        Some(&CellValue::Ai(AiValue {
            value: json!("Strong fit"),
            is_finished: true
        }))
    );
    let loading = table.ai_loading_state();
    assert!(!loading.is_loading("r1", "summary"));
    assert!(loading.is_loading("r2", "summary"));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reset_during_a_fetch_still_loads_the_new_table() {
    let backend = seeded_backend("t1", 3);
    backend.insert_rows("t2", [RowRecord::new("x1").with_field("name", json!("other"))]);
    backend.set_latency(Duration::from_millis(100));
    let table = table(&backend, 3);

    let switch = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.reset("t2", vec!["x1".into()]);
        table.on_visible_range_change(0, 0).await
    };
    let (stale, fresh) = tokio::join!(table.on_visible_range_change(0, 2), switch);
    assert_eq!(
        stale.unwrap(),
        vec![LoadOutcome::Skipped(SkipReason::TableChanged)]
    );
    assert_eq!(
        fresh.unwrap(),
        vec![LoadOutcome::Loaded {
            requested: 1,
            received: 1
        }]
    );
    assert_eq!(loaded_count(&table), 1);
    assert!(!table.is_load_in_flight());
}

#[test_timeout::tokio_timeout_test]
async fn editing_an_unfetched_row_still_loads_its_other_fields() {
    let backend = seeded_backend("t1", 2);
    backend.insert_rows(
        "t1",
        [RowRecord::new("r1")
            .with_field("name", json!("Ada"))
            .with_field("company", json!("Acme"))],
    );
    let table = table(&backend, 2);
    table.on_cell_edit("r1", "name", json!("Grace")).await.unwrap();
    assert!(matches!(table.full_data()[0], GridRow::Loading { .. }));

    table.on_visible_range_change(0, 0).await.unwrap();
    assert_eq!(backend.fetch_calls().len(), 1);
    let data = table.full_data();
    let row = data[0].row().unwrap();
    assert_eq!(row.get("name"), Some(&CellValue::Plain(json!("Grace"))));
    assert_eq!(row.get("company"), Some(&CellValue::Plain(json!("Acme"))));
}

#[test_timeout::tokio_timeout_test]
async fn unfetched_and_grown_rows_show_spinners_until_resolved() {
    let backend = seeded_backend("t1", 3);
    backend.insert_rows(
        "t1",
        [RowRecord::new("r1").with_field("summary", json!({"value": "done", "isFinished": true}))],
    );
    let table = table(&backend, 2);
    table.set_run_configuration(RunConfiguration::new().with("summary", RunScope::All));
    assert!(table.ai_loading_state().is_loading("r1", "summary"));
    assert!(table.ai_loading_state().is_loading("r2", "summary"));

    table.ingest(&progress("t1", &["r3"]));
    assert_eq!(table.flush_growth(), 1);
    assert!(table.ai_loading_state().is_loading("r3", "summary"));

    table.on_visible_range_change(0, 2).await.unwrap();
    let loading = table.ai_loading_state();
    assert!(!loading.is_loading("r1", "summary"));
    assert!(loading.is_loading("r2", "summary"));
    assert!(loading.is_loading("r3", "summary"));
}

#[test_timeout::tokio_timeout_test]
async fn run_configuration_carries_over_a_table_switch() {
    let backend = seeded_backend("t1", 2);
    let table = table(&backend, 2);
    table.set_run_configuration(RunConfiguration::new().with("summary", RunScope::All));
    table.reset("t2", vec!["x1".into()]);
    let loading = table.ai_loading_state();
    assert!(loading.is_loading("x1", "summary"));
    assert!(loading.fields("r1").is_none());
}
