// crates/auditflow-store-sqlite/tests/sqlite_store_unit.rs
// ============================================================================
// Module: SQLite Recorder Integration Tests
// Description: Integration-level tests for the SQLite-backed AuditRecorder.
// Purpose: Validate schema migration, durability across reopen, and
//          AuditRecorder contract conformance against a real database file.
// ============================================================================

//! ## Overview
//! These tests exercise [`SqliteRecorder`] through a temporary database
//! file rather than the in-memory connection the inline unit tests in
//! `store.rs` use, so that reopen/durability behavior is covered against
//! the real file-backed engine.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use auditflow_core::error::RecorderError;
use auditflow_core::hashing::DEFAULT_HASH_ALGORITHM;
use auditflow_core::hashing::hash_bytes;
use auditflow_core::identifiers::EdgeId;
use auditflow_core::identifiers::NodeId;
use auditflow_core::model::Determinism;
use auditflow_core::model::ExportStatus;
use auditflow_core::model::Node;
use auditflow_core::model::NodeStateStatus;
use auditflow_core::model::NodeType;
use auditflow_core::model::ReproducibilityGrade;
use auditflow_core::model::RunStatus;
use auditflow_core::model::TokenOutcomeKind;
use auditflow_core::recorder::AuditRecorder;
use auditflow_core::time::Timestamp;
use auditflow_core::token_manager::TokenManager;
use auditflow_store_sqlite::SqliteRecorder;
use auditflow_store_sqlite::SqliteStoreConfig;
use auditflow_store_sqlite::SqliteStoreMode;
use auditflow_store_sqlite::SqliteSyncMode;
use tempfile::NamedTempFile;

fn config(path: std::path::PathBuf) -> SqliteStoreConfig {
    SqliteStoreConfig { path, busy_timeout_ms: 5_000, journal_mode: SqliteStoreMode::Wal, sync_mode: SqliteSyncMode::Full }
}

fn sample_node(node_id: &str, node_type: NodeType) -> Node {
    Node {
        node_id: NodeId::new(node_id),
        run_id: auditflow_core::identifiers::RunId::from_raw(1).expect("non-zero"),
        plugin_name: "stub".to_string(),
        plugin_version: "1.0.0".to_string(),
        node_type,
        determinism: Determinism::Deterministic,
        config_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"{}"),
        config_json: serde_json::json!({}),
        input_schema_contract: None,
        output_schema_contract: None,
    }
}

#[test]
fn schema_initializes_on_a_fresh_file_and_accepts_a_full_run_lifecycle() {
    let file = NamedTempFile::new().expect("temp file");
    let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
    let now = Timestamp::now();
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");

    let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).expect("begin run");

    let source = sample_node("source-node", NodeType::Source);
    let sink = sample_node("sink-node", NodeType::Sink);
    recorder.register_node(run_id, Node { run_id, ..source.clone() }).expect("register source");
    recorder.register_node(run_id, Node { run_id, ..sink.clone() }).expect("register sink");
    let edge_id = EdgeId::from_raw(1).expect("non-zero");
    recorder.register_edge(run_id, edge_id, source.node_id.clone(), sink.node_id.clone(), "on_success".to_string()).expect("register edge");

    let row_id = recorder.create_row(run_id, source.node_id.clone(), 0, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row-0"), None, now).expect("create row");
    let mut tokens = TokenManager::new();
    let token = tokens.create_original(row_id, now);
    recorder.create_token(run_id, token.clone()).expect("create token");

    let state_id = recorder.begin_node_state(run_id, token.token_id, sink.node_id.clone(), 1, None, now).expect("begin node state");
    recorder.complete_node_state(state_id, NodeStateStatus::Completed, None, None, now).expect("complete node state");
    recorder
        .record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Completed, Some("sink-node".to_string()), None, now)
        .expect("record outcome");

    recorder.finalize_run(run_id, RunStatus::Completed, now).expect("finalize run");

    let stored = recorder.get_run(run_id).expect("run persisted");
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(recorder.get_unprocessed_rows(run_id).is_empty());

    let explanation = recorder.explain_row(run_id, row_id).expect("explain row");
    assert_eq!(explanation.tokens.len(), 1);
    assert_eq!(explanation.outcomes.len(), 1);
}

#[test]
fn reopening_an_existing_database_preserves_runs_and_counters_across_restarts() {
    let file = NamedTempFile::new().expect("temp file");
    let now = Timestamp::now();
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");

    let (run_id, row_id) = {
        let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
        let run_id = recorder.begin_run(digest.clone(), DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).expect("begin run");
        let row_id =
            recorder.create_row(run_id, NodeId::new("source-node"), 0, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row-0"), None, now).expect("create row");
        (run_id, row_id)
    };

    let mut reopened = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("reopen recorder");
    assert_eq!(reopened.get_run(run_id).expect("run survives reopen").run_id, run_id);
    assert_eq!(reopened.get_row(run_id, row_id).expect("row survives reopen").row_id, row_id);

    let err = reopened.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap_err();
    assert!(matches!(err, RecorderError::RunAlreadyOpen), "a still-Running run rehydrated from disk must block a second begin_run");

    let second_row =
        reopened.create_row(run_id, NodeId::new("source-node"), 1, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row-1"), None, now).expect("create row");
    assert_ne!(second_row, row_id, "row ids must not collide after reopen");
}

#[test]
fn duplicate_node_registration_is_reported_as_a_recorder_error_not_a_panic() {
    let file = NamedTempFile::new().expect("temp file");
    let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
    let now = Timestamp::now();
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
    let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).expect("begin run");

    let node = sample_node("dup-node", NodeType::Transform);
    recorder.register_node(run_id, Node { run_id, ..node.clone() }).expect("first registration succeeds");
    let err = recorder.register_node(run_id, Node { run_id, ..node }).unwrap_err();
    assert!(matches!(err, RecorderError::DuplicateRegistration { .. }));
}

#[test]
fn a_second_terminal_outcome_for_the_same_token_is_rejected() {
    let file = NamedTempFile::new().expect("temp file");
    let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
    let now = Timestamp::now();
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
    let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).expect("begin run");
    let row_id =
        recorder.create_row(run_id, NodeId::new("source-node"), 0, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row-0"), None, now).expect("create row");
    let mut tokens = TokenManager::new();
    let token = tokens.create_original(row_id, now);
    recorder.create_token(run_id, token.clone()).expect("create token");

    recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Failed, None, None, now).expect("first outcome succeeds");
    let err = recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Failed, None, None, now).unwrap_err();
    assert!(matches!(err, RecorderError::TokenAlreadyTerminal { .. }));
}

#[test]
fn payload_refs_for_run_surfaces_every_referenced_hash() {
    let file = NamedTempFile::new().expect("temp file");
    let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
    let now = Timestamp::now();
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
    let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).expect("begin run");

    let payload_ref = hash_bytes(DEFAULT_HASH_ALGORITHM, b"retained-payload");
    recorder
        .create_row(run_id, NodeId::new("source-node"), 0, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row-0"), Some(payload_ref.clone()), now)
        .expect("create row");

    let refs = recorder.payload_refs_for_run(run_id);
    assert!(refs.iter().any(|r| r.hash == payload_ref));
}

#[test]
fn set_reproducibility_grade_and_export_status_round_trip_through_storage() {
    let file = NamedTempFile::new().expect("temp file");
    let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
    let now = Timestamp::now();
    let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
    let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).expect("begin run");

    recorder.set_reproducibility_grade(run_id, ReproducibilityGrade::Degraded).expect("set grade");
    assert_eq!(recorder.get_run(run_id).expect("run exists").reproducibility_grade, ReproducibilityGrade::Degraded);

    recorder.set_export_status(run_id, ExportStatus::Failed, Some("disk full".to_string())).expect("set export status");
    let stored = recorder.get_run(run_id).expect("run exists");
    assert_eq!(stored.export_status, ExportStatus::Failed);
    assert_eq!(stored.export_error, Some("disk full".to_string()));
}

#[test]
fn unknown_run_lookups_report_unknown_run_rather_than_panicking() {
    let file = NamedTempFile::new().expect("temp file");
    let mut recorder = SqliteRecorder::open(&config(file.path().to_path_buf())).expect("open recorder");
    let missing = auditflow_core::identifiers::RunId::from_raw(999).expect("non-zero");

    assert!(recorder.get_run(missing).is_none());
    let err = recorder.set_reproducibility_grade(missing, ReproducibilityGrade::Degraded).unwrap_err();
    assert!(matches!(err, RecorderError::UnknownRun { .. }));
}
