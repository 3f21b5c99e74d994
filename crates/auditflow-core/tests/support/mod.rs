// crates/auditflow-core/tests/support/mod.rs
// ============================================================================
// Module: Orchestrator Test Helpers
// Description: Shared plugin stubs and graph builders for the spec-scenario
//              integration suites.
// Purpose: Reduce duplication across integration tests for the orchestrator.
// ============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]

use auditflow_core::graph::ErrorRoute;
use auditflow_core::graph::NodeKind;
use auditflow_core::graph::NodeSpec;
use auditflow_core::hashing::DEFAULT_HASH_ALGORITHM;
use auditflow_core::hashing::hash_bytes;
use auditflow_core::model::Determinism;
use auditflow_core::plugins::ArtifactDescriptor;
use auditflow_core::plugins::Gate;
use auditflow_core::plugins::GateAction;
use auditflow_core::plugins::GateResult;
use auditflow_core::plugins::PluginContext;
use auditflow_core::plugins::PluginError;
use auditflow_core::plugins::Sink;
use auditflow_core::plugins::Source;
use auditflow_core::plugins::SourceRow;
use auditflow_core::plugins::Transform;
use auditflow_core::plugins::TransformResult;
use auditflow_core::schema::SchemaContract;
use auditflow_expr::evaluate;
use auditflow_expr::parse_condition;
use serde_json::Value;

/// A source that emits a fixed, pre-built row sequence and nothing else.
pub struct FixedSource {
    pub rows: Vec<Value>,
}

impl FixedSource {
    #[must_use]
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }
}

impl Source for FixedSource {
    fn load(&mut self, _ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow> + '_>, PluginError> {
        let rows = std::mem::take(&mut self.rows);
        Ok(Box::new(rows.into_iter().map(|data| SourceRow::Valid { data, contract: SchemaContract::Observed })))
    }
}

/// A source that quarantines every row it emits, for exercising the
/// quarantine-sink path without a real validating plugin.
pub struct QuarantiningSource {
    pub rows: Vec<Value>,
    pub destination: String,
}

impl Source for QuarantiningSource {
    fn load(&mut self, _ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow> + '_>, PluginError> {
        let rows = std::mem::take(&mut self.rows);
        let destination = self.destination.clone();
        Ok(Box::new(rows.into_iter().map(move |data| SourceRow::Quarantined {
            data,
            error: "failed source validation".to_string(),
            destination: destination.clone(),
        })))
    }
}

/// A sink that records every row it is asked to write, in delivery order.
#[derive(Default)]
pub struct CapturingSink {
    pub written: Vec<Value>,
}

impl Sink for CapturingSink {
    fn write(&mut self, rows: &[Value], _ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError> {
        self.written.extend(rows.iter().cloned());
        Ok(ArtifactDescriptor {
            path: "memory".to_string(),
            size: rows.len() as u64,
            content_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"sink"),
        })
    }
}

/// Doubles the integer under `field`, failing on any row where that field is
/// missing or not an integer.
pub struct DoublingTransform {
    pub field: &'static str,
}

impl Transform for DoublingTransform {
    fn process(&self, row: &Value, _ctx: &PluginContext) -> TransformResult {
        match row.get(self.field).and_then(Value::as_i64) {
            Some(value) => {
                let mut next = row.clone();
                next[self.field] = Value::from(value * 2);
                TransformResult::Success { row: next, reason: None }
            }
            None => TransformResult::Error { reason: format!("missing integer field {}", self.field), retryable: false },
        }
    }
}

/// Fails on rows at the given zero-based positions (in evaluation order),
/// succeeding on every other row by passing it through unchanged.
pub struct FailingAtPositions {
    pub fail_at: Vec<usize>,
    pub seen: std::cell::RefCell<usize>,
}

impl FailingAtPositions {
    #[must_use]
    pub fn new(fail_at: Vec<usize>) -> Self {
        Self { fail_at, seen: std::cell::RefCell::new(0) }
    }
}

impl Transform for FailingAtPositions {
    fn process(&self, row: &Value, _ctx: &PluginContext) -> TransformResult {
        let position = *self.seen.borrow();
        *self.seen.borrow_mut() += 1;
        if self.fail_at.contains(&position) {
            TransformResult::Error { reason: format!("row at position {position} rejected"), retryable: false }
        } else {
            TransformResult::Success { row: row.clone(), reason: None }
        }
    }
}

/// A gate that evaluates a real `auditflow-expr` condition against the row
/// and routes to one of two labels depending on the boolean result.
pub struct ConditionGate {
    pub condition: String,
    pub true_label: String,
    pub false_label: String,
}

impl Gate for ConditionGate {
    fn evaluate(&self, row: &Value, _ctx: &PluginContext) -> GateResult {
        let expr = parse_condition(&self.condition).expect("condition parses");
        let matched = matches!(evaluate(&expr, row), Ok(Value::Bool(true)));
        let label = if matched { self.true_label.clone() } else { self.false_label.clone() };
        GateResult { row: row.clone(), action: GateAction::RouteTo(label) }
    }
}

/// A gate that always forks the row across every declared branch.
pub struct AlwaysFork;

impl Gate for AlwaysFork {
    fn evaluate(&self, row: &Value, _ctx: &PluginContext) -> GateResult {
        GateResult { row: row.clone(), action: GateAction::RouteTo("fork".to_string()) }
    }
}

/// Appends a tag under `field` naming which fork branch produced the row.
pub struct TagTransform {
    pub field: &'static str,
    pub tag: &'static str,
}

impl Transform for TagTransform {
    fn process(&self, row: &Value, _ctx: &PluginContext) -> TransformResult {
        let mut next = row.clone();
        next[self.field] = Value::from(self.tag);
        TransformResult::Success { row: next, reason: None }
    }
}

/// Builds a minimal `source -> sink` node spec pair.
#[must_use]
pub fn linear_specs(sink_name: &str) -> Vec<NodeSpec> {
    vec![
        NodeSpec {
            plugin_name: "fixed_source".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::IoRead,
            config: serde_json::json!({}),
            kind: NodeKind::Source { on_success: sink_name.to_string(), quarantine_sink: None, output_schema: SchemaContract::Observed },
        },
        NodeSpec {
            plugin_name: "capturing_sink".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::IoWrite,
            config: serde_json::json!({"name": sink_name}),
            kind: NodeKind::Sink { name: sink_name.to_string() },
        },
    ]
}

/// Builds a `source -> transform -> sink` node spec triple. `on_error`
/// controls where the transform diverts rejected rows.
#[must_use]
pub fn linear_transform_specs(sink_name: &str, on_error: ErrorRoute, error_sink_name: Option<&str>) -> Vec<NodeSpec> {
    let mut specs = vec![
        NodeSpec {
            plugin_name: "fixed_source".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::IoRead,
            config: serde_json::json!({}),
            kind: NodeKind::Source { on_success: "raw".to_string(), quarantine_sink: None, output_schema: SchemaContract::Observed },
        },
        NodeSpec {
            plugin_name: "doubling_transform".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::Deterministic,
            config: serde_json::json!({}),
            kind: NodeKind::Transform {
                input: "raw".to_string(),
                on_success: sink_name.to_string(),
                on_error,
                input_schema: SchemaContract::Observed,
                output_schema: SchemaContract::Observed,
            },
        },
        NodeSpec {
            plugin_name: "capturing_sink".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::IoWrite,
            config: serde_json::json!({"name": sink_name}),
            kind: NodeKind::Sink { name: sink_name.to_string() },
        },
    ];
    if let Some(error_sink_name) = error_sink_name {
        specs.push(NodeSpec {
            plugin_name: "capturing_sink".to_string(),
            plugin_version: "1.0.0".to_string(),
            determinism: Determinism::IoWrite,
            config: serde_json::json!({"name": error_sink_name}),
            kind: NodeKind::Sink { name: error_sink_name.to_string() },
        });
    }
    specs
}

/// Returns the fork-branch node name used downstream of `gate_input`.
#[must_use]
pub fn branch_connection(branch: &str) -> String {
    format!("branch_{branch}")
}
