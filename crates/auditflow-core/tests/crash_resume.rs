// crates/auditflow-core/tests/crash_resume.rs
// ============================================================================
// Module: Crash and Resume Integration Tests
// Description: Simulates a run that crashed after three rows settled, with
//              two further rows already recorded but never reaching a
//              terminal outcome, then resumes it and checks the result
//              matches an uninterrupted baseline run over the same data.
// ============================================================================

//! Integration tests simulating a run that crashed after three rows settled, with two further rows already recorded but never reaching a terminal outcome, then resuming it and checking the result matches an uninterrupted baseline run over the same data.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions are permitted.")]

mod support;

use auditflow_core::checkpoint::CheckpointManager;
use auditflow_core::config::OrchestratorConfig;
use auditflow_core::graph::ExecutionGraph;
use auditflow_core::hashing::DEFAULT_HASH_ALGORITHM;
use auditflow_core::hashing::canonical_json_bytes;
use auditflow_core::hashing::hash_bytes;
use auditflow_core::identifiers::RunId;
use auditflow_core::model::RunStatus;
use auditflow_core::orchestrator::Orchestrator;
use auditflow_core::orchestrator::RunPlugins;
use auditflow_core::payload::InMemoryPayloadStore;
use auditflow_core::payload::PayloadStore;
use auditflow_core::plugins::Sink;
use auditflow_core::recorder::AuditRecorder;
use auditflow_core::recorder::InMemoryRecorder;
use auditflow_core::row_processor::ProcessorConfig;
use auditflow_core::time::Timestamp;
use serde_json::Value;
use serde_json::json;
use support::CapturingSink;
use support::FixedSource;
use support::linear_specs;

fn all_rows() -> Vec<Value> {
    (1..=5).map(|n| json!({ "n": n })).collect()
}

#[test]
fn a_run_crashed_after_three_rows_resumes_the_remaining_two_and_matches_an_uninterrupted_baseline() {
    let rows = all_rows();

    // Baseline: every row processed in a single uninterrupted run.
    let mut baseline_source = FixedSource::new(rows.clone());
    let mut baseline_sink = CapturingSink::default();
    let mut baseline_plugins = RunPlugins {
        source: &mut baseline_source,
        sinks: [("clean".to_string(), &mut baseline_sink as &mut dyn Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };
    let mut baseline_recorder = InMemoryRecorder::new();
    let baseline_payload_store = InMemoryPayloadStore::new();
    let mut baseline_orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let baseline_summary = baseline_orchestrator
        .run(linear_specs("clean"), &mut baseline_plugins, &ProcessorConfig::default(), &mut baseline_recorder, &baseline_payload_store, None)
        .expect("baseline run succeeds");
    assert_eq!(baseline_summary.rows_completed, 5);

    // Crashed run: only the first three rows go through the real orchestrator.
    let mut crashed_source = FixedSource::new(rows[0..3].to_vec());
    let mut crashed_sink = CapturingSink::default();
    let mut crashed_plugins = RunPlugins {
        source: &mut crashed_source,
        sinks: [("clean".to_string(), &mut crashed_sink as &mut dyn Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };
    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());
    let partial_summary = orchestrator
        .run(linear_specs("clean"), &mut crashed_plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None)
        .expect("partial run succeeds");
    assert_eq!(partial_summary.rows_completed, 3);
    let run_id = partial_summary.run_id;

    // Rows 4 and 5 arrived at the source but the process died before either
    // reached a terminal outcome: recorded as rows with no token.
    let specs = linear_specs("clean");
    let graph = ExecutionGraph::from_plugin_specs(run_id, specs.clone()).expect("graph builds");
    let source_id = graph.source();
    let now = Timestamp::now();
    for (row_index, row) in rows[3..5].iter().enumerate() {
        let bytes = canonical_json_bytes(row).expect("row serializes");
        let hash = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
        let payload_ref = payload_store.put(DEFAULT_HASH_ALGORITHM, &bytes).expect("payload stores");
        recorder
            .create_row(run_id, source_id.clone(), (row_index + 3) as u64, hash, Some(payload_ref), now)
            .expect("row records");
    }

    let entry_node = graph.get_sink_id_map().get("clean").cloned().expect("clean sink registered");
    let last_token_id = auditflow_core::identifiers::TokenId::from_raw(3).expect("non-zero");
    let checkpoint = CheckpointManager::new(OrchestratorConfig::default().checkpoint)
        .build_checkpoint(run_id, last_token_id, entry_node, &graph, json!({}), now);
    recorder.record_checkpoint(checkpoint);
    recorder.finalize_run(run_id, RunStatus::Failed, now).expect("run re-finalizes as failed");

    let mut resume_source = FixedSource::new(Vec::new());
    let mut resume_plugins = RunPlugins {
        source: &mut resume_source,
        sinks: [("clean".to_string(), &mut crashed_sink as &mut dyn Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };
    let resume_summary = orchestrator
        .resume(run_id, specs, &mut resume_plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None)
        .expect("resume succeeds");

    assert_eq!(resume_summary.status, RunStatus::Completed);
    assert_eq!(resume_summary.rows_seen, 2);
    assert_eq!(resume_summary.rows_completed, 2);

    assert_eq!(crashed_sink.written, baseline_sink.written, "resumed output must concatenate to the same rows as the baseline run");
}
