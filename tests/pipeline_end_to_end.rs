//! End-to-end runs of the export pipeline against a scripted store
//!
//! These tests drive `ExportPipeline::run` from a CSV input file through to the
//! written output and verify:
//! - Batching and retry behavior as observed by the backend
//! - Partial success when keys stay throttled
//! - Abort semantics for permanent backend errors
//! - Output layout, escaping and append mode

mod common;

use std::sync::Arc;

use common::{
    ScriptedStore, conversation, conversation_ids, conversations, memory_store, read_header,
    read_rows, test_config, write_input,
};
use keyset_export::{
    BackendError, Error, ExportPipeline, OutputLayout, RunSummary, Stage, WriteMode,
};
use tokio_test::{assert_err, assert_ok};

const TABLE: &str = "Conversations";

async fn run(
    config: keyset_export::Config,
    store: Arc<ScriptedStore>,
    input: &std::path::Path,
) -> Result<RunSummary, Error> {
    let pipeline = ExportPipeline::new(config, store)?;
    pipeline.run(input).await
}

#[tokio::test]
async fn thirty_keys_with_unprocessed_keys_in_second_batch() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(30);
    let input = write_input(dir.path(), &ids);
    let inner = memory_store(TABLE, conversations(&ids, &["u-b", "u-a", "u-c"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |_, _| None).unprocessed_on(1, 3));

    let mut config = test_config(dir.path());
    config.output.group_field = Some("user_id".into());
    let summary = assert_ok!(run(config, store.clone(), &input).await);

    let calls = store.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].len(), 25);
    assert_eq!(calls[1].len(), 5);
    assert_eq!(calls[2], calls[1][2..].to_vec());

    assert_eq!(summary.input_rows, 30);
    assert_eq!(summary.unique_keys, 30);
    assert_eq!(summary.resolved, 30);
    assert_eq!(summary.unresolved, 0);
    assert_eq!(summary.rows_written, 30);
    assert_eq!(summary.groups, 3);
    assert!(summary.is_complete());

    let out = dir.path().join("out.csv");
    assert_eq!(
        read_header(&out),
        vec!["conversation_id", "user_id", "title", "messages"]
    );
    let rows = read_rows(&out);
    let written: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    let expected: Vec<&str> = ids.iter().map(String::as_str).collect();
    assert_eq!(written, expected);
}

#[tokio::test]
async fn throttled_call_is_retried_with_the_same_keys() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(30);
    let input = write_input(dir.path(), &ids);
    let inner = memory_store(TABLE, conversations(&ids, &["u-a"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |call, _| {
        (call == 1).then(|| BackendError::Throttled("provisioned throughput exceeded".into()))
    }));

    let summary = assert_ok!(run(test_config(dir.path()), store.clone(), &input).await);

    let calls = store.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1], calls[2]);
    assert_eq!(summary.resolved, 30);
}

#[tokio::test]
async fn persistently_throttled_batch_is_partial_success() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(30);
    let input = write_input(dir.path(), &ids);
    let inner = memory_store(TABLE, conversations(&ids, &["u-a"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |_, keys| {
        (keys[0].as_str() == "conv-25").then(|| BackendError::Throttled("hot partition".into()))
    }));

    let summary = assert_ok!(run(test_config(dir.path()), store.clone(), &input).await);

    // one call for the first batch, max_attempts (3) for the second
    assert_eq!(store.call_count(), 4);
    assert_eq!(summary.resolved, 25);
    assert_eq!(summary.unresolved, 5);
    assert!(!summary.is_complete());
    let unresolved: Vec<&str> = summary.unresolved_keys.iter().map(|k| k.as_str()).collect();
    assert_eq!(unresolved, vec!["conv-25", "conv-26", "conv-27", "conv-28", "conv-29"]);
    assert_eq!(read_rows(&dir.path().join("out.csv")).len(), 25);
}

#[tokio::test]
async fn permanent_error_on_second_batch_aborts_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(60);
    let input = write_input(dir.path(), &ids);
    let inner = memory_store(TABLE, conversations(&ids, &["u-a"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |call, _| {
        (call == 1).then(|| BackendError::Unauthorized("security token expired".into()))
    }));

    let err = assert_err!(run(test_config(dir.path()), store.clone(), &input).await);

    assert_eq!(store.call_count(), 2);
    assert_eq!(err.stage(), Some(Stage::Fetch));
    assert_eq!(err.error_code(), "unauthorized");
    match err {
        Error::Stage { source, .. } => match *source {
            Error::Fetch(fetch) => {
                assert_eq!(fetch.batch_index, 1);
                assert_eq!(fetch.completed.records.len(), 25);
            }
            other => panic!("expected fetch error, got {other:?}"),
        },
        other => panic!("expected stage error, got {other:?}"),
    }
    assert!(!dir.path().join("out.csv").exists());
}

#[tokio::test]
async fn unprocessed_keys_are_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(10);
    let input = write_input(dir.path(), &ids);
    let inner = memory_store(TABLE, conversations(&ids, &["u-a"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |_, _| None).unprocessed_on(0, 3));

    let summary = assert_ok!(run(test_config(dir.path()), store.clone(), &input).await);

    let calls = store.calls();
    assert_eq!(calls.len(), 2);
    let retried: Vec<&str> = calls[1].iter().map(|k| k.as_str()).collect();
    assert_eq!(retried, vec!["conv-07", "conv-08", "conv-09"]);
    assert_eq!(summary.resolved, 10);
}

#[tokio::test]
async fn duplicates_blank_rows_and_missing_records_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ids.csv");
    std::fs::write(
        &input,
        "conversation_id,source\nconv-01,a\n,b\nconv-02,c\nconv-01,d\n   ,e\nconv-99,f\n",
    )
    .unwrap();
    let inner = memory_store(
        TABLE,
        vec![
            conversation("conv-01", "u-a", "First"),
            conversation("conv-02", "u-b", "Second"),
        ],
    )
    .await;
    let store = Arc::new(ScriptedStore::new(inner, |_, _| None));

    let summary = assert_ok!(run(test_config(dir.path()), store.clone(), &input).await);

    assert_eq!(summary.input_rows, 6);
    assert_eq!(summary.dropped_rows, 2);
    assert_eq!(summary.input_keys, 4);
    assert_eq!(summary.duplicate_keys, 1);
    assert_eq!(summary.unique_keys, 3);
    assert_eq!(summary.resolved, 2);
    assert_eq!(summary.missing, 1);
    assert!(summary.is_complete());
    assert_eq!(store.calls()[0].len(), 3);
}

#[tokio::test]
async fn grouped_layout_orders_groups_by_first_occurrence() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(4);
    let input = write_input(dir.path(), &ids);
    let records = vec![
        conversation("conv-00", "B", "one"),
        conversation("conv-01", "A", "two"),
        conversation("conv-02", "B", "three"),
        conversation("conv-03", "C", "four"),
    ];
    let store = Arc::new(ScriptedStore::new(memory_store(TABLE, records).await, |_, _| None));

    let mut config = test_config(dir.path());
    config.output.group_field = Some("user_id".into());
    config.output.layout = OutputLayout::Grouped;
    config.output.group_summary = true;
    config.output.columns = vec!["user_id".into(), "conversation_id".into()];

    let summary = assert_ok!(run(config, store, &input).await);

    let rows = read_rows(&dir.path().join("out.csv"));
    let pairs: Vec<(String, String)> = rows.into_iter().map(|r| (r[0].clone(), r[1].clone())).collect();
    assert_eq!(
        pairs,
        vec![
            ("B".into(), "conv-00".into()),
            ("B".into(), "conv-02".into()),
            ("A".into(), "conv-01".into()),
            ("C".into(), "conv-03".into()),
        ]
    );

    let groups_file = summary.group_summary_path.unwrap();
    assert_eq!(
        read_rows(&groups_file),
        vec![
            vec!["B".to_string(), "2".to_string()],
            vec!["A".to_string(), "1".to_string()],
            vec!["C".to_string(), "1".to_string()],
        ]
    );
}

#[tokio::test]
async fn values_with_quotes_and_commas_survive_the_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(1);
    let input = write_input(dir.path(), &ids);
    let records = vec![conversation("conv-00", "u-a", "He said \"hi\", bye")];
    let store = Arc::new(ScriptedStore::new(memory_store(TABLE, records).await, |_, _| None));

    assert_ok!(run(test_config(dir.path()), store, &input).await);

    let out = dir.path().join("out.csv");
    let raw = std::fs::read_to_string(&out).unwrap();
    assert!(raw.contains("\"He said \"\"hi\"\", bye\""), "raw output: {raw}");
    assert_eq!(read_rows(&out)[0][2], "He said \"hi\", bye");
}

#[tokio::test]
async fn append_mode_adds_rows_under_existing_header() {
    let dir = tempfile::tempdir().unwrap();
    let first_ids = conversation_ids(2);
    let all_ids = conversation_ids(4);
    let inner = memory_store(TABLE, conversations(&all_ids, &["u-a"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |_, _| None));

    let input = write_input(dir.path(), &first_ids);
    assert_ok!(run(test_config(dir.path()), store.clone(), &input).await);

    let input = write_input(dir.path(), &all_ids[2..]);
    let mut config = test_config(dir.path());
    config.output.mode = WriteMode::Append;
    let summary = assert_ok!(run(config, store, &input).await);
    assert_eq!(summary.rows_written, 2);

    let raw = std::fs::read_to_string(dir.path().join("out.csv")).unwrap();
    assert_eq!(raw.matches("conversation_id").count(), 1, "header written once");
    let rows = read_rows(&dir.path().join("out.csv"));
    let ids: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["conv-00", "conv-01", "conv-02", "conv-03"]);
}

#[tokio::test]
async fn missing_key_column_fails_in_extract_stage() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ids.csv");
    std::fs::write(&input, "id,source\nconv-00,a\n").unwrap();
    let store = Arc::new(ScriptedStore::new(memory_store(TABLE, vec![]).await, |_, _| None));

    let err = assert_err!(run(test_config(dir.path()), store.clone(), &input).await);
    assert_eq!(err.stage(), Some(Stage::Extract));
    assert_eq!(err.error_code(), "input_error");
    assert_eq!(store.call_count(), 0);
}

#[tokio::test]
async fn missing_input_file_fails_in_extract_stage() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ScriptedStore::new(memory_store(TABLE, vec![]).await, |_, _| None));

    let err = assert_err!(run(test_config(dir.path()), store, &dir.path().join("nope.csv")).await);
    assert_eq!(err.stage(), Some(Stage::Extract));
}

#[tokio::test]
async fn stage_suffix_selects_the_table() {
    let dir = tempfile::tempdir().unwrap();
    let ids = conversation_ids(3);
    let input = write_input(dir.path(), &ids);
    let inner = memory_store("Conversations-prod", conversations(&ids, &["u-a"])).await;
    let store = Arc::new(ScriptedStore::new(inner, |_, _| None));

    let mut config = test_config(dir.path());
    config.backend.stage = Some("prod".into());
    let summary = assert_ok!(run(config, store, &input).await);
    assert_eq!(summary.resolved, 3);
}
