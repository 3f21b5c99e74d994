// crates/auditflow-cli/tests/store_wiring.rs
// ============================================================================
// Module: CLI Store Wiring Integration Tests
// Description: Exercises the library's store-opening and config-loading
//              helpers against real files, end to end with a retention
//              purge pass.
// ============================================================================

//! Integration tests exercising the library's store-opening and
//! config-loading helpers against real files, end to end with a retention
//! purge pass.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions are permitted."
)]

use auditflow_cli::load_orchestrator_config;
use auditflow_cli::open_audit_store;
use auditflow_cli::open_payload_store;
use auditflow_core::hashing::DEFAULT_HASH_ALGORITHM;
use auditflow_core::hashing::hash_bytes;
use auditflow_core::identifiers::NodeId;
use auditflow_core::model::RunStatus;
use auditflow_core::payload::PayloadStore;
use auditflow_core::recorder::AuditRecorder;
use auditflow_core::retention::RetentionPurgeManager;
use auditflow_core::time::Timestamp;
use tempfile::TempDir;

#[test]
fn load_orchestrator_config_accepts_an_empty_object_and_applies_defaults() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, b"{}").expect("write config");

    let config = load_orchestrator_config(&path).expect("load config");
    assert_eq!(config.retention.retention_days, 90);
    assert!(config.checkpoint.enabled);
}

#[test]
fn load_orchestrator_config_reports_a_missing_file_without_panicking() {
    let err = load_orchestrator_config(std::path::Path::new("/does/not/exist.json")).unwrap_err();
    assert!(matches!(err, auditflow_cli::CliError::Config { .. }));
}

#[test]
fn open_audit_store_and_payload_store_round_trip_a_retention_purge() {
    let dir = TempDir::new().expect("temp dir");
    let mut recorder = open_audit_store(&dir.path().join("audit.sqlite3")).expect("open audit store");
    let payload_store = open_payload_store(&dir.path().join("payloads")).expect("open payload store");

    let old = Timestamp::parse("2026-01-01T00:00:00Z").expect("parse");
    let config_digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
    let run_id = recorder.begin_run(config_digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), old).expect("begin run");

    let payload_ref = payload_store.put(DEFAULT_HASH_ALGORITHM, b"stale row bytes").expect("put payload");
    recorder.create_row(run_id, NodeId::new("source"), 0, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row-0"), Some(payload_ref.clone()), old).expect("create row");
    recorder.finalize_run(run_id, RunStatus::Completed, old).expect("finalize run");

    let manager = RetentionPurgeManager::new();
    let as_of = Timestamp::parse("2026-06-01T00:00:00Z").expect("parse");
    let expired = manager.find_expired_payload_refs(&recorder, 90, as_of);
    assert!(expired.iter().any(|r| r.hash == payload_ref));

    let hashes: Vec<_> = expired.iter().map(|r| r.hash.clone()).collect();
    let result = manager.purge_payloads(&payload_store, &hashes, old, as_of);
    assert_eq!(result.deleted_count, 1);
    assert!(!payload_store.exists(&payload_ref).expect("exists"));

    manager.update_grade_after_purge(&mut recorder, run_id).expect("downgrade grade");
    let run = recorder.get_run(run_id).expect("run persisted");
    assert_eq!(run.reproducibility_grade, auditflow_core::model::ReproducibilityGrade::Degraded);
}
