// crates/auditflow-core/tests/linear_pipeline.rs
// ============================================================================
// Module: Linear Pipeline Integration Tests
// Description: Drives a plain source-to-sink pipeline through a full run,
//              and checks the universal invariants and round-trip/boundary
//              properties that hold for every run shape.
// ============================================================================

//! Integration tests driving a plain source-to-sink pipeline through a full run, checking the universal invariants and round-trip/boundary properties that hold for every run shape.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions are permitted.")]

mod support;

use auditflow_core::config::OrchestratorConfig;
use auditflow_core::model::RunStatus;
use auditflow_core::orchestrator::Orchestrator;
use auditflow_core::orchestrator::RunPlugins;
use auditflow_core::payload::InMemoryPayloadStore;
use auditflow_core::recorder::AuditRecorder;
use auditflow_core::recorder::InMemoryRecorder;
use auditflow_core::row_processor::ProcessorConfig;
use serde_json::json;
use support::CapturingSink;
use support::FixedSource;
use support::QuarantiningSource;
use support::linear_specs;

#[test]
fn ten_rows_with_no_fanout_produce_ten_rows_one_token_each_and_one_artifact() {
    let rows: Vec<_> = (0..10).map(|i| json!({ "n": i })).collect();
    let mut source = FixedSource::new(rows.clone());
    let mut sink = CapturingSink::default();
    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [("clean".to_string(), &mut sink as &mut dyn auditflow_core::plugins::Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let summary = orchestrator
        .run(linear_specs("clean"), &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None)
        .expect("run succeeds");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_seen, 10);
    assert_eq!(summary.rows_completed, 10);
    assert_eq!(summary.rows_quarantined, 0);
    assert_eq!(summary.rows_failed, 0);
    assert_eq!(sink.written, rows);

    for index in 0..rows.len() as u64 {
        let row_id = row_id_at(&recorder, summary.run_id, index);
        let stored_row = recorder.get_row(summary.run_id, row_id).expect("row exists");
        assert_eq!(stored_row.row_index, index);
        let explanation = recorder.explain_row(summary.run_id, stored_row.row_id).expect("row explains");
        assert_eq!(explanation.tokens.len(), 1, "no fanout means exactly one token per row");
        assert_eq!(explanation.outcomes.len(), 1, "a settled token has exactly one terminal outcome");
        assert!(explanation.outcomes[0].is_terminal);
    }
}

#[test]
fn an_empty_source_produces_a_completed_run_with_zero_rows() {
    let mut source = FixedSource::new(Vec::new());
    let mut sink = CapturingSink::default();
    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [("clean".to_string(), &mut sink as &mut dyn auditflow_core::plugins::Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let summary = orchestrator
        .run(linear_specs("clean"), &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None)
        .expect("run succeeds");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_seen, 0);
    assert_eq!(summary.rows_completed, 0);
    assert!(sink.written.is_empty());
}

#[test]
fn two_quarantined_rows_and_three_valid_rows_split_between_their_destinations() {
    struct MixedSource {
        rows: Vec<(bool, serde_json::Value)>,
    }
    impl auditflow_core::plugins::Source for MixedSource {
        fn load(
            &mut self,
            _ctx: &auditflow_core::plugins::PluginContext,
        ) -> Result<Box<dyn Iterator<Item = auditflow_core::plugins::SourceRow> + '_>, auditflow_core::plugins::PluginError> {
            let rows = std::mem::take(&mut self.rows);
            Ok(Box::new(rows.into_iter().map(|(valid, data)| {
                if valid {
                    auditflow_core::plugins::SourceRow::Valid { data, contract: auditflow_core::schema::SchemaContract::Observed }
                } else {
                    auditflow_core::plugins::SourceRow::Quarantined {
                        data,
                        error: "bad row".to_string(),
                        destination: "quarantine".to_string(),
                    }
                }
            })))
        }
    }

    let mut source = MixedSource {
        rows: vec![
            (false, json!({"bad": 1})),
            (true, json!({"n": 1})),
            (true, json!({"n": 2})),
            (false, json!({"bad": 2})),
            (true, json!({"n": 3})),
        ],
    };
    let mut clean_sink = CapturingSink::default();
    let mut quarantine_sink = CapturingSink::default();
    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [
            ("clean".to_string(), &mut clean_sink as &mut dyn auditflow_core::plugins::Sink),
            ("quarantine".to_string(), &mut quarantine_sink as &mut dyn auditflow_core::plugins::Sink),
        ]
        .into_iter()
        .collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let mut specs = linear_specs("clean");
    if let auditflow_core::graph::NodeKind::Source { quarantine_sink, .. } = &mut specs[0].kind {
        *quarantine_sink = Some("quarantine".to_string());
    }
    specs.push(auditflow_core::graph::NodeSpec {
        plugin_name: "capturing_sink".to_string(),
        plugin_version: "1.0.0".to_string(),
        determinism: auditflow_core::model::Determinism::IoWrite,
        config: json!({"name": "quarantine"}),
        kind: auditflow_core::graph::NodeKind::Sink { name: "quarantine".to_string() },
    });

    let summary = orchestrator.run(specs, &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None).expect("run succeeds");

    assert_eq!(summary.rows_seen, 5);
    assert_eq!(summary.rows_quarantined, 2);
    assert_eq!(summary.rows_completed, 3);
    assert_eq!(clean_sink.written.len(), 3);
    assert_eq!(quarantine_sink.written.len(), 2);
}

#[test]
fn every_step_index_a_token_visits_strictly_increases() {
    let rows = vec![json!({"n": 1})];
    let mut source = FixedSource::new(rows);
    let mut sink = CapturingSink::default();
    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [("clean".to_string(), &mut sink as &mut dyn auditflow_core::plugins::Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let summary = orchestrator
        .run(linear_specs("clean"), &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None)
        .expect("run succeeds");

    let row_id = row_id_at(&recorder, summary.run_id, 0);
    let explanation = recorder.explain_row(summary.run_id, row_id).expect("row explains");
    let steps: Vec<u32> = explanation.node_states.iter().map(|state| state.step_index).collect();
    assert!(steps.windows(2).all(|pair| pair[0] <= pair[1]), "node states must be recorded in non-decreasing step order: {steps:?}");
}

#[test]
fn a_row_that_reaches_a_sink_is_recorded_as_attributable_and_terminal() {
    let rows = vec![json!({"n": 7})];
    let mut source = FixedSource::new(rows);
    let mut sink = CapturingSink::default();
    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [("clean".to_string(), &mut sink as &mut dyn auditflow_core::plugins::Sink)].into_iter().collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let summary = orchestrator
        .run(linear_specs("clean"), &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None)
        .expect("run succeeds");

    let row_id = row_id_at(&recorder, summary.run_id, 0);
    let explanation = recorder.explain_row(summary.run_id, row_id).expect("row explains");
    assert_eq!(explanation.outcomes.len(), 1);
    let outcome = &explanation.outcomes[0];
    assert!(outcome.is_terminal);
    assert_eq!(outcome.sink_name.as_deref(), Some("clean"));
}

#[test]
fn quarantined_row_reaches_the_quarantine_sink() {
    let mut source = QuarantiningSource { rows: vec![json!({"bad": true})], destination: "quarantine".to_string() };
    let mut clean_sink = CapturingSink::default();
    let mut quarantine_sink = CapturingSink::default();
    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [
            ("clean".to_string(), &mut clean_sink as &mut dyn auditflow_core::plugins::Sink),
            ("quarantine".to_string(), &mut quarantine_sink as &mut dyn auditflow_core::plugins::Sink),
        ]
        .into_iter()
        .collect(),
        transforms: Default::default(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let mut specs = linear_specs("clean");
    if let auditflow_core::graph::NodeKind::Source { quarantine_sink, .. } = &mut specs[0].kind {
        *quarantine_sink = Some("quarantine".to_string());
    }
    specs.push(auditflow_core::graph::NodeSpec {
        plugin_name: "capturing_sink".to_string(),
        plugin_version: "1.0.0".to_string(),
        determinism: auditflow_core::model::Determinism::IoWrite,
        config: json!({"name": "quarantine"}),
        kind: auditflow_core::graph::NodeKind::Sink { name: "quarantine".to_string() },
    });

    let summary = orchestrator.run(specs, &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None).expect("run succeeds");

    assert_eq!(summary.rows_quarantined, 1);
    assert_eq!(quarantine_sink.written.len(), 1);
    assert!(clean_sink.written.is_empty());
}

/// Rows are assigned ids in creation order starting from `1` by a freshly
/// constructed [`InMemoryRecorder`], so a test that records exactly the rows
/// under test can address them by position without a row-listing query.
fn row_id_at(
    recorder: &InMemoryRecorder,
    run_id: auditflow_core::identifiers::RunId,
    row_index: u64,
) -> auditflow_core::identifiers::RowId {
    let row_id = auditflow_core::identifiers::RowId::from_raw(row_index + 1).expect("row index + 1 is non-zero");
    recorder.get_row(run_id, row_id).expect("row exists at this position");
    row_id
}
