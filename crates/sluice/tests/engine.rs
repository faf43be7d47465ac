//! End-to-end commit-mode behavior against the in-memory adapter

use serde_json::json;
use sluice::batch_file::staging_path;
use sluice::prelude::*;
use sluice::testing::MemoryAdapter;
use std::sync::Arc;

fn destination(adapter: &MemoryAdapter) -> Destination {
    Destination::new("test-destination", Arc::new(adapter.clone()))
}

fn obj(v: serde_json::Value) -> Object {
    v.as_object().unwrap().clone()
}

fn seeded_table(name: &str, pk: Option<&str>) -> Table {
    let mut table = Table::named(name);
    table
        .columns
        .insert("id".into(), SqlColumn::new("bigint", DataType::Int64));
    table
        .columns
        .insert("v".into(), SqlColumn::new("text", DataType::String));
    if let Some(pk) = pk {
        table.pk_fields.insert(pk.to_string());
        table.primary_key_name = Some(Table::constraint_name(name));
    }
    table
}

// ─────────────────────────────────────────────────────────────────
// Transactional (atomic batch)
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transactional_commits_all_rows() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s1", "events", BulkMode::Transactional, StreamOptions::new())
        .unwrap();

    for i in 0..5 {
        stream.consume(obj(json!({"id": i, "name": "row"}))).await.unwrap();
    }
    // Nothing visible before commit
    assert_eq!(adapter.row_count("events"), 0);

    let state = stream.complete().await.unwrap();
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.processed_rows, 5);
    assert_eq!(state.successful_rows, 5);
    assert_eq!(adapter.row_count("events"), 5);
}

#[tokio::test]
async fn transactional_failure_leaves_destination_untouched() {
    let adapter = MemoryAdapter::new();
    adapter.put_table(seeded_table("events", None), vec![obj(json!({"id": 0, "v": "keep"}))]);

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s2", "events", BulkMode::Transactional, StreamOptions::new())
        .unwrap();
    stream.consume(obj(json!({"id": 1, "v": "a"}))).await.unwrap();

    // Both the first attempt and the automatic drift retry fail
    adapter.inject_drift_once();
    adapter.inject_drift_once();

    let err = stream.complete().await.unwrap_err();
    assert!(err.is_schema_drift());
    assert_eq!(stream.state().status, StreamStatus::Failed);
    assert_eq!(adapter.row_count("events"), 1);
    assert!(!staging_path(BulkMode::Transactional, "events", "s2").exists());
}

#[tokio::test]
async fn transactional_empty_stream_completes_without_table() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s3", "events", BulkMode::Transactional, StreamOptions::new())
        .unwrap();

    let state = stream.complete().await.unwrap();
    assert_eq!(state.status, StreamStatus::Completed);
    assert!(!adapter.has_table("events"));
}

#[tokio::test]
async fn merge_upserts_on_primary_key() {
    let adapter = MemoryAdapter::new();
    adapter.put_table(
        seeded_table("t", Some("id")),
        vec![obj(json!({"id": 1, "v": "a"})), obj(json!({"id": 2, "v": "b"}))],
    );

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s4",
            "t",
            BulkMode::Transactional,
            StreamOptions::new().with_primary_key(["id"]).with_merge_rows(),
        )
        .unwrap();
    stream.consume(obj(json!({"id": 2, "v": "c"}))).await.unwrap();
    stream.consume(obj(json!({"id": 3, "v": "d"}))).await.unwrap();
    stream.complete().await.unwrap();

    let rows = adapter.rows("t");
    assert_eq!(rows.len(), 3);
    let value_of = |id: i64| {
        rows.iter()
            .find(|r| r["id"] == json!(id))
            .map(|r| r["v"].clone())
            .unwrap()
    };
    assert_eq!(value_of(1), json!("a"));
    assert_eq!(value_of(2), json!("c"));
    assert_eq!(value_of(3), json!("d"));

    // The merge staging table is gone regardless of outcome
    assert_eq!(adapter.table_names(), vec!["t".to_string()]);
}

#[tokio::test]
async fn merge_without_primary_key_is_rejected_at_creation() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let result = dest.create_stream(
        "s5",
        "t",
        BulkMode::Transactional,
        StreamOptions::new().with_merge_rows(),
    );
    match result {
        Err(err) => assert!(matches!(err, IngestError::Config(_))),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn schema_drift_retries_once_and_succeeds() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s6", "events", BulkMode::Transactional, StreamOptions::new())
        .unwrap();

    for i in 0..3 {
        stream.consume(obj(json!({"id": i}))).await.unwrap();
    }
    adapter.inject_drift_once();

    let state = stream.complete().await.unwrap();
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(adapter.row_count("events"), 3);
}

// ─────────────────────────────────────────────────────────────────
// ReplaceTable (full snapshot)
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn replace_table_swaps_atomically() {
    let adapter = MemoryAdapter::new();
    adapter.put_table(
        seeded_table("t", None),
        vec![
            obj(json!({"id": 1})),
            obj(json!({"id": 2})),
            obj(json!({"id": 3})),
        ],
    );

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s7", "t", BulkMode::ReplaceTable, StreamOptions::new())
        .unwrap();
    stream.consume(obj(json!({"id": 9}))).await.unwrap();
    stream.consume(obj(json!({"id": 10}))).await.unwrap();

    // Old contents visible until the swap
    assert_eq!(adapter.row_count("t"), 3);

    let state = stream.complete().await.unwrap();
    assert_eq!(state.status, StreamStatus::Completed);

    let rows = adapter.rows("t");
    assert_eq!(rows.len(), 2);
    let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![9, 10]);

    // The shadow table is gone after the swap
    assert_eq!(adapter.table_names(), vec!["t".to_string()]);
}

#[tokio::test]
async fn replace_table_creates_missing_destination() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s8", "fresh", BulkMode::ReplaceTable, StreamOptions::new())
        .unwrap();
    stream.consume(obj(json!({"id": 1}))).await.unwrap();
    stream.complete().await.unwrap();

    assert_eq!(adapter.row_count("fresh"), 1);
    assert_eq!(adapter.table_names(), vec!["fresh".to_string()]);
}

#[tokio::test]
async fn replace_table_abort_cleans_up() {
    let adapter = MemoryAdapter::new();
    adapter.put_table(seeded_table("t", None), vec![obj(json!({"id": 1, "v": "x"}))]);

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s9", "t", BulkMode::ReplaceTable, StreamOptions::new())
        .unwrap();
    for i in 0..10 {
        stream.consume(obj(json!({"id": i}))).await.unwrap();
    }

    let state = stream.abort().await;
    assert_eq!(state.status, StreamStatus::Aborted);

    // Shadow table gone, destination unchanged, staging file deleted
    assert_eq!(adapter.table_names(), vec!["t".to_string()]);
    assert_eq!(adapter.row_count("t"), 1);
    assert!(!staging_path(BulkMode::ReplaceTable, "t", "s9").exists());

    // Terminal state is sticky
    let err = stream.consume(obj(json!({"id": 99}))).await.unwrap_err();
    assert!(matches!(err, IngestError::StreamInactive(_)));
}

// ─────────────────────────────────────────────────────────────────
// ReplacePartition
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn replace_partition_swaps_only_named_partition() {
    let adapter = MemoryAdapter::new();
    let mut schema = seeded_table("t", None);
    schema.columns.insert(
        "__partition_id".into(),
        SqlColumn::new("text", DataType::String),
    );
    adapter.put_table(
        schema,
        vec![
            obj(json!({"id": 1, "__partition_id": "20240114"})),
            obj(json!({"id": 2, "__partition_id": "20240114"})),
            obj(json!({"id": 3, "__partition_id": "20240115"})),
        ],
    );

    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream(
            "s10",
            "t",
            BulkMode::ReplacePartition,
            StreamOptions::new().with_partition("20240115"),
        )
        .unwrap();
    stream.consume(obj(json!({"id": 30}))).await.unwrap();
    stream.consume(obj(json!({"id": 31}))).await.unwrap();
    stream.complete().await.unwrap();

    let rows = adapter.rows("t");
    assert_eq!(rows.len(), 4);
    // The other partition is intact
    assert!(rows.iter().any(|r| r["id"] == json!(1)));
    assert!(rows.iter().any(|r| r["id"] == json!(2)));
    // The named partition was replaced and every new row carries its id
    assert!(!rows.iter().any(|r| r["id"] == json!(3)));
    for id in [30, 31] {
        let row = rows.iter().find(|r| r["id"] == json!(id)).unwrap();
        assert_eq!(row["__partition_id"], json!("20240115"));
    }

    assert_eq!(adapter.table_names(), vec!["t".to_string()]);
}

#[tokio::test]
async fn replace_partition_requires_partition_id() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let result = dest.create_stream("s11", "t", BulkMode::ReplacePartition, StreamOptions::new());
    match result {
        Err(err) => assert!(matches!(err, IngestError::Config(_))),
        Ok(_) => panic!("expected an error"),
    }
}

// ─────────────────────────────────────────────────────────────────
// AutoCommit (row-at-a-time)
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn auto_commit_rows_visible_immediately() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s12", "live", BulkMode::AutoCommit, StreamOptions::new())
        .unwrap();

    stream.consume(obj(json!({"id": 1}))).await.unwrap();
    assert_eq!(adapter.row_count("live"), 1);
    stream.consume(obj(json!({"id": 2}))).await.unwrap();
    assert_eq!(adapter.row_count("live"), 2);

    let state = stream.complete().await.unwrap();
    assert_eq!(state.status, StreamStatus::Completed);
    assert_eq!(state.successful_rows, 2);
}

#[tokio::test]
async fn auto_commit_row_failure_keeps_stream_active() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s13", "live", BulkMode::AutoCommit, StreamOptions::new())
        .unwrap();

    stream.consume(obj(json!({"id": 1}))).await.unwrap();

    // Pull the table out from under the stream: the next insert fails
    adapter.drop_table("live", false).await.unwrap();
    let err = stream.consume(obj(json!({"id": 2}))).await.unwrap_err();
    assert!(err.db_op().is_some());

    let state = stream.state();
    assert_eq!(state.status, StreamStatus::Active);
    assert_eq!(state.processed_rows, 2);
    assert_eq!(state.successful_rows, 1);
    assert_eq!(state.failed_rows(), 1);
    assert_eq!(state.error_row_index, Some(2));
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn auto_commit_widening_reconciles_mid_stream() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s14", "live", BulkMode::AutoCommit, StreamOptions::new())
        .unwrap();

    stream.consume(obj(json!({"a": 1}))).await.unwrap();
    stream.consume(obj(json!({"a": 1, "b": "x"}))).await.unwrap();

    let schema = adapter.table("live").unwrap().schema;
    assert!(schema.has_column("a"));
    assert!(schema.has_column("b"));
}

#[tokio::test]
async fn unsupported_mode_rejected_at_creation() {
    let adapter = MemoryAdapter::new().with_unsupported_mode(BulkMode::AutoCommit);
    let dest = destination(&adapter);
    let result = dest.create_stream("s15", "t", BulkMode::AutoCommit, StreamOptions::new());
    match result {
        Err(err) => assert!(matches!(err, IngestError::ModeUnsupported { .. })),
        Ok(_) => panic!("expected an error"),
    }
}

// ─────────────────────────────────────────────────────────────────
// Lifecycle and cancellation
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn terminal_states_are_sticky() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s16", "t", BulkMode::Transactional, StreamOptions::new())
        .unwrap();
    stream.consume(obj(json!({"id": 1}))).await.unwrap();
    stream.complete().await.unwrap();

    let err = stream.consume(obj(json!({"id": 2}))).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::StreamInactive(StreamStatus::Completed)
    ));
    // Abort after completion does not rewrite the status
    let state = stream.abort().await;
    assert_eq!(state.status, StreamStatus::Completed);

    let err = stream.complete().await.unwrap_err();
    assert!(matches!(err, IngestError::StreamInactive(_)));
}

#[tokio::test]
async fn cancellation_fails_commit_in_progress() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let token = tokio_util::sync::CancellationToken::new();
    let mut stream = dest
        .create_stream(
            "s17",
            "t",
            BulkMode::Transactional,
            StreamOptions::new().with_cancellation(token.clone()),
        )
        .unwrap();
    stream.consume(obj(json!({"id": 1}))).await.unwrap();

    token.cancel();
    let err = stream.complete().await.unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(stream.state().status, StreamStatus::Failed);
    assert_eq!(adapter.row_count("t"), 0);
    assert!(!staging_path(BulkMode::Transactional, "t", "s17").exists());
}

#[tokio::test]
async fn consume_json_paths() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);
    let mut stream = dest
        .create_stream("s18", "t", BulkMode::Transactional, StreamOptions::new())
        .unwrap();

    stream.consume_json(br#"{"id": 1}"#).await.unwrap();
    assert!(stream.consume_json(b"not json").await.is_err());
    let err = stream.consume_json(b"[1, 2]").await.unwrap_err();
    assert!(matches!(err, IngestError::Config(_)));

    let state = stream.complete().await.unwrap();
    assert_eq!(state.successful_rows, 1);
    assert_eq!(adapter.row_count("t"), 1);
}

#[tokio::test]
async fn staging_file_removed_after_complete_and_abort() {
    let adapter = MemoryAdapter::new();
    let dest = destination(&adapter);

    let mut completed = dest
        .create_stream("done", "t", BulkMode::Transactional, StreamOptions::new())
        .unwrap();
    completed.consume(obj(json!({"id": 1}))).await.unwrap();
    assert!(staging_path(BulkMode::Transactional, "t", "done").exists());
    completed.complete().await.unwrap();
    assert!(!staging_path(BulkMode::Transactional, "t", "done").exists());

    let mut aborted = dest
        .create_stream("gone", "t", BulkMode::Transactional, StreamOptions::new())
        .unwrap();
    aborted.consume(obj(json!({"id": 1}))).await.unwrap();
    assert!(staging_path(BulkMode::Transactional, "t", "gone").exists());
    aborted.abort().await;
    assert!(!staging_path(BulkMode::Transactional, "t", "gone").exists());
}
