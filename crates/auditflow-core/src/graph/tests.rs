use serde_json::json;

use super::ErrorRoute;
use super::ExecutionGraph;
use super::NodeKind;
use super::NodeSpec;
use super::RouteDestination;
use crate::identifiers::RunId;
use crate::model::Determinism;
use crate::model::EdgeMode;
use crate::schema::SchemaContract;

fn run_id() -> RunId {
    RunId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"))
}

fn source(on_success: &str) -> NodeSpec {
    NodeSpec {
        plugin_name: "demo-source".to_string(),
        plugin_version: "1.0.0".to_string(),
        determinism: Determinism::IoRead,
        config: json!({}),
        kind: NodeKind::Source {
            on_success: on_success.to_string(),
            quarantine_sink: None,
            output_schema: SchemaContract::Observed,
        },
    }
}

fn transform(input: &str, on_success: &str) -> NodeSpec {
    NodeSpec {
        plugin_name: "demo-transform".to_string(),
        plugin_version: "1.0.0".to_string(),
        determinism: Determinism::Deterministic,
        config: json!({ "input": input }),
        kind: NodeKind::Transform {
            input: input.to_string(),
            on_success: on_success.to_string(),
            on_error: ErrorRoute::Discard,
            input_schema: SchemaContract::Observed,
            output_schema: SchemaContract::Observed,
        },
    }
}

fn sink(name: &str) -> NodeSpec {
    NodeSpec {
        plugin_name: "demo-sink".to_string(),
        plugin_version: "1.0.0".to_string(),
        determinism: Determinism::IoWrite,
        config: json!({ "name": name }),
        kind: NodeKind::Sink { name: name.to_string() },
    }
}

#[test]
fn linear_pipeline_builds_and_assigns_steps() {
    let specs = vec![source("raw"), transform("raw", "clean"), sink("clean")];
    let graph = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap();
    assert_eq!(graph.nodes().len(), 3);
    assert_eq!(graph.edges().len(), 2);
    assert_eq!(graph.step_index(&graph.source()), Some(0));
    assert_eq!(graph.get_terminal_sink_map().len(), 1);
}

#[test]
fn two_sources_are_rejected() {
    let specs = vec![source("raw"), source("raw2"), sink("raw"), sink("raw2")];
    let err = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap_err();
    assert!(matches!(err, crate::error::GraphError::SourceCountInvalid { count: 2 }));
}

#[test]
fn no_sinks_is_rejected() {
    let specs = vec![source("raw")];
    let err = ExecutionGraph::from_plugin_specs(run_id(), specs);
    assert!(err.is_err());
}

#[test]
fn dangling_connection_is_rejected() {
    let specs = vec![source("raw"), sink("somewhere_else")];
    let err = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap_err();
    assert!(matches!(err, crate::error::GraphError::DanglingConnection { .. }));
}

#[test]
fn duplicate_fork_branch_name_is_rejected() {
    let specs = vec![
        source("raw"),
        NodeSpec {
            plugin_name: "demo-gate".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config: json!({}),
            kind: NodeKind::Gate {
                input: "raw".to_string(),
                condition: "true".to_string(),
                routes: [("true".to_string(), "fork".to_string())].into_iter().collect(),
                fork_to: vec!["left".to_string(), "left".to_string()],
            },
        },
        sink("left"),
    ];
    let err = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap_err();
    assert!(matches!(err, crate::error::GraphError::DuplicateEdgeLabel { .. }));
}

#[test]
fn gate_route_resolves_to_sink() {
    let specs = vec![
        source("raw"),
        NodeSpec {
            plugin_name: "demo-gate".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config: json!({}),
            kind: NodeKind::Gate {
                input: "raw".to_string(),
                condition: "row['ok'] == true".to_string(),
                routes: [
                    ("true".to_string(), "accepted".to_string()),
                    ("false".to_string(), "rejected".to_string()),
                ]
                .into_iter()
                .collect(),
                fork_to: vec![],
            },
        },
        sink("accepted"),
        sink("rejected"),
    ];
    let graph = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap();
    let gate_id = graph.get_config_gate_id_map().get("raw").cloned().unwrap();
    let resolved = graph.get_route_resolution_map().get(&(gate_id, "true".to_string())).unwrap();
    assert_eq!(resolved, &RouteDestination::Sink("accepted".to_string()));
}

#[test]
fn fork_and_coalesce_join_two_branches() {
    let specs = vec![
        source("raw"),
        NodeSpec {
            plugin_name: "demo-gate".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config: json!({}),
            kind: NodeKind::Gate {
                input: "raw".to_string(),
                condition: "true".to_string(),
                routes: [("true".to_string(), "fork".to_string())].into_iter().collect(),
                fork_to: vec!["left".to_string(), "right".to_string()],
            },
        },
        transform("left", "left_done"),
        transform("right", "right_done"),
        NodeSpec {
            plugin_name: "demo-coalesce".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config: json!({}),
            kind: NodeKind::Coalesce {
                name: "joined".to_string(),
                branches: [
                    ("left".to_string(), "left_done".to_string()),
                    ("right".to_string(), "right_done".to_string()),
                ]
                .into_iter()
                .collect(),
                on_success: "merged".to_string(),
            },
        },
        sink("merged"),
    ];
    let graph = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap();
    assert_eq!(graph.get_branch_to_coalesce_map().get("left"), Some(&"joined".to_string()));
    assert_eq!(graph.get_branch_to_coalesce_map().get("right"), Some(&"joined".to_string()));
    let gate_id = graph.get_config_gate_id_map().get("raw").cloned().unwrap();
    let left_edge = graph.edge_by_label(&gate_id, "left").unwrap();
    assert_eq!(left_edge.default_mode, EdgeMode::Copy);
}

#[test]
fn unknown_fork_branch_is_rejected() {
    let specs = vec![
        source("raw"),
        NodeSpec {
            plugin_name: "demo-gate".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config: json!({}),
            kind: NodeKind::Gate {
                input: "raw".to_string(),
                condition: "true".to_string(),
                routes: [("true".to_string(), "fork".to_string())].into_iter().collect(),
                fork_to: vec!["left".to_string()],
            },
        },
        sink("left"),
    ];
    let err = ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap_err();
    assert!(matches!(err, crate::error::GraphError::DanglingConnection { .. }));
}
