// crates/auditflow-core/tests/transform_discard.rs
// ============================================================================
// Module: Transform Discard Integration Tests
// Description: A transform that rejects the middle row of three, routed to
//              discard rather than an error sink.
// ============================================================================

//! Integration tests for a transform that rejects the middle row of three, routed to discard rather than an error sink.

#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions are permitted.")]

mod support;

use auditflow_core::config::OrchestratorConfig;
use auditflow_core::graph::ErrorRoute;
use auditflow_core::identifiers::NodeId;
use auditflow_core::model::RunStatus;
use auditflow_core::orchestrator::Orchestrator;
use auditflow_core::orchestrator::RunPlugins;
use auditflow_core::payload::InMemoryPayloadStore;
use auditflow_core::plugins::Sink;
use auditflow_core::plugins::Transform;
use auditflow_core::recorder::InMemoryRecorder;
use auditflow_core::row_processor::ProcessorConfig;
use serde_json::json;
use support::CapturingSink;
use support::FailingAtPositions;
use support::FixedSource;
use support::linear_transform_specs;

#[test]
fn a_transform_failure_on_the_middle_row_of_three_discards_only_that_row() {
    let rows = vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})];
    let mut source = FixedSource::new(rows);
    let mut sink = CapturingSink::default();
    let transform = FailingAtPositions::new(vec![1]);

    let specs = linear_transform_specs("clean", ErrorRoute::Discard, None);
    let transform_id = {
        let graph = auditflow_core::graph::ExecutionGraph::from_plugin_specs(
            auditflow_core::identifiers::RunId::from_raw(1).expect("non-zero"),
            specs.clone(),
        )
        .expect("graph builds");
        graph.get_transform_id_map().get("raw").cloned().expect("transform registered")
    };

    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [("clean".to_string(), &mut sink as &mut dyn Sink)].into_iter().collect(),
        transforms: [(transform_id, &transform as &dyn Transform)].into_iter().collect::<std::collections::BTreeMap<NodeId, &dyn Transform>>(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let summary = orchestrator.run(specs, &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None).expect("run succeeds");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rows_seen, 3);
    assert_eq!(summary.rows_completed, 2);
    assert_eq!(summary.rows_failed, 1);
    assert_eq!(sink.written, vec![json!({"n": 1}), json!({"n": 3})]);
}

#[test]
fn a_transform_failure_diverted_to_an_error_sink_still_settles_terminally() {
    let rows = vec![json!({"n": 1}), json!({"n": 2})];
    let mut source = FixedSource::new(rows);
    let mut clean_sink = CapturingSink::default();
    let mut error_sink = CapturingSink::default();
    let transform = FailingAtPositions::new(vec![0]);

    let specs = linear_transform_specs("clean", ErrorRoute::Sink("errors".to_string()), Some("errors"));
    let transform_id = {
        let graph = auditflow_core::graph::ExecutionGraph::from_plugin_specs(
            auditflow_core::identifiers::RunId::from_raw(1).expect("non-zero"),
            specs.clone(),
        )
        .expect("graph builds");
        graph.get_transform_id_map().get("raw").cloned().expect("transform registered")
    };

    let mut plugins = RunPlugins {
        source: &mut source,
        sinks: [
            ("clean".to_string(), &mut clean_sink as &mut dyn Sink),
            ("errors".to_string(), &mut error_sink as &mut dyn Sink),
        ]
        .into_iter()
        .collect(),
        transforms: [(transform_id, &transform as &dyn Transform)].into_iter().collect::<std::collections::BTreeMap<NodeId, &dyn Transform>>(),
        gates: Default::default(),
        aggregations: Default::default(),
    };

    let mut recorder = InMemoryRecorder::new();
    let payload_store = InMemoryPayloadStore::new();
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());

    let summary = orchestrator.run(specs, &mut plugins, &ProcessorConfig::default(), &mut recorder, &payload_store, None).expect("run succeeds");

    assert_eq!(summary.rows_completed, 2, "an error-sink delivery is a completed terminal outcome, not a failure");
    assert_eq!(summary.rows_failed, 0);
    assert_eq!(error_sink.written, vec![json!({"n": 1})]);
    assert_eq!(clean_sink.written, vec![json!({"n": 2})]);
}
