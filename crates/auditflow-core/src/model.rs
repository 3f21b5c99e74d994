// crates/auditflow-core/src/model.rs
// ============================================================================
// Module: Audit Entity Model
// Description: Run, node, edge, row, token, and lineage record types.
// Purpose: Define the shared vocabulary recorded by the audit recorder.
// Dependencies: crate::{identifiers, hashing, schema, time}, serde
// ============================================================================

//! ## Overview
//! These types mirror the normative audit schema (runs, nodes, edges, rows,
//! tokens, node_states, routing_events, operations, calls, token_outcomes,
//! checkpoints). They are plain data; the recorder owns mutation discipline
//! and the append-only write contract.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::hashing::HashDigest;
use crate::identifiers::CallId;
use crate::identifiers::CheckpointId;
use crate::identifiers::EdgeId;
use crate::identifiers::EventId;
use crate::identifiers::GroupId;
use crate::identifiers::NodeId;
use crate::identifiers::OperationId;
use crate::identifiers::OutcomeId;
use crate::identifiers::RowId;
use crate::identifiers::RunId;
use crate::identifiers::StateId;
use crate::identifiers::TokenId;
use crate::schema::SchemaContract;
use crate::time::Timestamp;

/// Terminal and non-terminal lifecycle states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is actively processing rows.
    Running,
    /// The run finished successfully.
    Completed,
    /// The run ended due to an unrecoverable error.
    Failed,
    /// The run ended due to a cooperative shutdown request.
    Interrupted,
}

impl RunStatus {
    /// Returns whether this status is terminal (non-`Running`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Export-step outcome for a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    /// No export was configured.
    NotConfigured,
    /// Export succeeded.
    Completed,
    /// Export was attempted and failed.
    Failed,
}

/// Classification of whether a run can still be replayed byte-identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReproducibilityGrade {
    /// Every referenced payload is still present.
    Full,
    /// At least one referenced payload has been purged.
    Degraded,
}

/// A single pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: RunId,
    /// Wall-clock time the run began.
    pub started_at: Timestamp,
    /// Wall-clock time the run reached a terminal status, if any.
    pub completed_at: Option<Timestamp>,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Hash of the run's canonicalized configuration.
    pub config_hash: HashDigest,
    /// Canonical version string identifying the hashing scheme in use.
    pub canonical_version: String,
    /// Serialized schema contract negotiated for the run, plus its hash.
    pub schema_contract: Option<(SchemaContract, HashDigest)>,
    /// Source-level schema, persisted for resume rehydration.
    pub source_schema: Option<Value>,
    /// Export-step status.
    pub export_status: ExportStatus,
    /// Export-step error message, if the export failed.
    pub export_error: Option<String>,
    /// Reproducibility classification, downgraded after payload purge.
    pub reproducibility_grade: ReproducibilityGrade,
}

/// The role a node plays in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Emits rows into the graph.
    Source,
    /// Transforms one row into zero or one rows.
    Transform,
    /// Buffers rows and transforms a batch.
    Aggregation,
    /// Evaluates a condition and routes the token.
    Gate,
    /// Joins multiple fork branches into one token.
    Coalesce,
    /// Terminal write destination.
    Sink,
}

/// Declared determinism of a node's processing, informing replay guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Same input always produces the same output.
    Deterministic,
    /// Output may vary across runs given the same input.
    NonDeterministic,
    /// Reads from outside the pipeline (network, filesystem, clock).
    IoRead,
    /// Writes to outside the pipeline.
    IoWrite,
}

/// One node in a run's installed execution graph.
///
/// # Invariants
/// - Registered once at run start; never mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier (deterministic content hash).
    pub node_id: NodeId,
    /// Owning run.
    pub run_id: RunId,
    /// Plugin name that implements this node.
    pub plugin_name: String,
    /// Plugin version string.
    pub plugin_version: String,
    /// Node role in the graph.
    pub node_type: NodeType,
    /// Declared determinism.
    pub determinism: Determinism,
    /// Hash of the node's canonicalized configuration.
    pub config_hash: HashDigest,
    /// Raw configuration, for audit display.
    pub config_json: Value,
    /// Effective input schema contract, if any (sources have none).
    pub input_schema_contract: Option<SchemaContract>,
    /// Effective output schema contract, if any (sinks have none).
    pub output_schema_contract: Option<SchemaContract>,
}

/// Routing semantics for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// Consumes the token; no sibling is created.
    Move,
    /// Creates a sibling token (fork branch).
    Copy,
    /// Quarantine/error side-channel, not reached by forward traversal.
    Divert,
}

/// One labeled connection between two nodes.
///
/// # Invariants
/// - At most one edge per `(from_node, label)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier.
    pub edge_id: EdgeId,
    /// Owning run.
    pub run_id: RunId,
    /// Upstream node.
    pub from_node: NodeId,
    /// Downstream node.
    pub to_node: NodeId,
    /// Connection-name label, unique per `(from_node, label)`.
    pub label: String,
    /// Default routing mode for tokens traversing this edge.
    pub default_mode: EdgeMode,
}

/// One immutable source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Row identifier.
    pub row_id: RowId,
    /// Owning run.
    pub run_id: RunId,
    /// Source node that emitted this row.
    pub source_node_id: NodeId,
    /// Zero-based position in the source's emission order.
    pub row_index: u64,
    /// Hash of the row's canonicalized source data.
    pub source_data_hash: HashDigest,
    /// Content-addressed reference into the payload store, if retained.
    pub source_data_ref: Option<HashDigest>,
    /// Wall-clock time the row was recorded.
    pub created_at: Timestamp,
}

/// One position of a row in the execution graph.
///
/// # Invariants
/// - All tokens for one row share the same `row_id`.
/// - The parent chain is acyclic and rooted at the row's original token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub token_id: TokenId,
    /// Owning row.
    pub row_id: RowId,
    /// Parent token, `None` for the original token of a row.
    pub parent_token_id: Option<TokenId>,
    /// Fork branch name, if this token was created by a fork.
    pub branch_name: Option<String>,
    /// Shared identifier across all siblings created by one fork.
    pub fork_group_id: Option<GroupId>,
    /// Shared identifier across all parents merged at one coalesce.
    pub join_group_id: Option<GroupId>,
    /// Shared identifier across all siblings created by one expansion.
    pub expand_group_id: Option<GroupId>,
    /// Wall-clock time the token was created.
    pub created_at: Timestamp,
}

/// Lifecycle status of one node-state attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStateStatus {
    /// The attempt is in progress.
    Running,
    /// The attempt finished successfully.
    Completed,
    /// The attempt finished with an error.
    Failed,
    /// The attempt was not executed (e.g. held at a coalesce).
    Skipped,
}

/// One attempt of one token at one node.
///
/// # Invariants
/// - Unique per `(token_id, step_index, attempt)`.
/// - `step_index` is strictly positive and reflects topological position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Node-state identifier.
    pub state_id: StateId,
    /// Token this attempt belongs to.
    pub token_id: TokenId,
    /// Owning run.
    pub run_id: RunId,
    /// Node this attempt executed at.
    pub node_id: NodeId,
    /// Topological step index, assigned by the graph's step map.
    pub step_index: u32,
    /// 1-based attempt counter within `(token_id, node_id)`.
    pub attempt: u32,
    /// Current attempt status.
    pub status: NodeStateStatus,
    /// Hash of the canonicalized input row, if computed.
    pub input_hash: Option<HashDigest>,
    /// Hash of the canonicalized output row, if the attempt completed.
    pub output_hash: Option<HashDigest>,
    /// Structured error payload, if the attempt failed.
    pub error_json: Option<Value>,
    /// Wall-clock time the attempt started.
    pub started_at: Timestamp,
    /// Wall-clock time the attempt reached a terminal status.
    pub completed_at: Option<Timestamp>,
}

/// Routing semantics recorded for one edge-choice decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// The token moved along the edge (consumed).
    Move,
    /// A sibling token was created along the edge (fork).
    Copy,
    /// The token was diverted along a quarantine/error edge.
    Divert,
}

/// One edge-choice decision made by a node.
///
/// # Invariants
/// - `ordinal` is `0` unless multiple events are emitted for one state
///   (e.g. a fork), in which case ordinals increase monotonically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Routing-event identifier.
    pub event_id: EventId,
    /// Node-state that produced this decision.
    pub state_id: StateId,
    /// Edge chosen.
    pub edge_id: EdgeId,
    /// Shared identifier across all events from one routing decision.
    pub routing_group_id: GroupId,
    /// Emission order among sibling events from the same decision.
    pub ordinal: u32,
    /// Routing mode applied.
    pub mode: RoutingMode,
    /// Hash of the canonicalized routing reason payload, if any.
    pub reason_hash: Option<HashDigest>,
    /// Content-addressed reference to the full reason payload.
    pub reason_ref: Option<HashDigest>,
    /// Wall-clock time the decision was recorded.
    pub created_at: Timestamp,
}

/// Lifecycle status of a granular plugin-level I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// The operation finished successfully.
    Completed,
    /// The operation finished with an error.
    Failed,
    /// The operation was deliberately left open (asynchronous batch sinks).
    Pending,
}

/// One granular audit record of plugin-level I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation identifier.
    pub operation_id: OperationId,
    /// Owning run.
    pub run_id: RunId,
    /// Node this operation executed at.
    pub node_id: NodeId,
    /// Operation kind (e.g. `"source_load"`, `"sink_write"`, `"aggregation_flush"`).
    pub operation_type: String,
    /// Current status.
    pub status: OperationStatus,
    /// Content-addressed reference to the operation's input payload.
    pub input_data_ref: Option<HashDigest>,
    /// Content-addressed reference to the operation's output payload.
    pub output_data_ref: Option<HashDigest>,
    /// Wall-clock time the operation started.
    pub started_at: Timestamp,
    /// Wall-clock time the operation reached a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Error message, if the operation failed.
    pub error: Option<String>,
}

/// Attachment point for a [`Call`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CallParent {
    /// Attached to a node-state attempt.
    NodeState {
        /// Parent node-state identifier.
        state_id: StateId,
    },
    /// Attached to an operation.
    Operation {
        /// Parent operation identifier.
        operation_id: OperationId,
    },
}

/// Lifecycle status of a side-call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The call finished successfully.
    Completed,
    /// The call finished with an error.
    Failed,
}

/// An optional side-call record (e.g. an HTTP request) attached to a node
/// state or operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Call identifier.
    pub call_id: CallId,
    /// Owning run.
    pub run_id: RunId,
    /// Parent record this call is attached to.
    pub parent: CallParent,
    /// Hash of the canonicalized request payload.
    pub request_hash: Option<HashDigest>,
    /// Content-addressed reference to the full request payload.
    pub request_ref: Option<HashDigest>,
    /// Hash of the canonicalized response payload.
    pub response_hash: Option<HashDigest>,
    /// Content-addressed reference to the full response payload.
    pub response_ref: Option<HashDigest>,
    /// Call kind (e.g. `"http"`).
    pub call_type: String,
    /// Terminal status.
    pub status: CallStatus,
}

/// Terminal classification of one token at one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOutcomeKind {
    /// Delivered to a sink successfully.
    Completed,
    /// Routed to the quarantine sink.
    Quarantined,
    /// Terminated due to an unrecoverable error with no sink delivery.
    Failed,
    /// Superseded by fork children (terminal for the parent only).
    Forked,
    /// Held at a coalesce or aggregation and never resolved by run end.
    Skipped,
}

/// One terminal outcome record for a token.
///
/// # Invariants
/// - Every token reaches exactly one terminal outcome.
/// - `Completed` requires a non-null `sink_name` and an existing completed
///   node-state at that sink for the same token (durability rule: recorded
///   only after the sink write succeeds).
/// - `Quarantined` requires a non-null `error_hash` and the configured
///   quarantine sink name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenOutcome {
    /// Outcome identifier.
    pub outcome_id: OutcomeId,
    /// Owning run.
    pub run_id: RunId,
    /// Token this outcome terminates.
    pub token_id: TokenId,
    /// Outcome classification.
    pub outcome: TokenOutcomeKind,
    /// Whether this outcome is terminal (always `true` today; reserved for
    /// future intermediate classifications).
    pub is_terminal: bool,
    /// Sink the token was delivered to, for `Completed` and `Quarantined`.
    pub sink_name: Option<String>,
    /// Hash of the canonicalized error payload, for `Failed`/`Quarantined`.
    pub error_hash: Option<HashDigest>,
    /// Wall-clock time the outcome was recorded.
    pub recorded_at: Timestamp,
}

/// One periodic snapshot of in-flight aggregation state, used for crash
/// recovery.
///
/// # Invariants
/// - Unique and ascending per `(run_id, sequence_number)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Owning run.
    pub run_id: RunId,
    /// Last token processed before this checkpoint was taken.
    pub token_id: TokenId,
    /// Node the checkpoint was taken at.
    pub node_id: NodeId,
    /// Ascending sequence number within the run.
    pub sequence_number: u64,
    /// Opaque serialized aggregation-executor state.
    pub aggregation_state_json: Value,
    /// Wall-clock time the checkpoint was taken.
    pub created_at: Timestamp,
    /// Hash of every node and edge upstream of `node_id`.
    pub upstream_topology_hash: HashDigest,
    /// Hash of the checkpoint node's own configuration.
    pub checkpoint_node_config_hash: HashDigest,
    /// Aggregation-state schema version; bumped only on format changes.
    pub format_version: u32,
}

/// One recorded transform failure, kept for post-hoc review independent of
/// the node-state/outcome trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformError {
    /// Owning run.
    pub run_id: RunId,
    /// Node the transform executed at.
    pub node_id: NodeId,
    /// Token the transform was processing.
    pub token_id: TokenId,
    /// Short machine-readable reason (e.g. `"validation_failed"`).
    pub reason: String,
    /// Whether the orchestrator may retry this transform.
    pub retryable: bool,
    /// Wall-clock time the failure was recorded.
    pub created_at: Timestamp,
}

/// Freeform attributes captured for one row as it flows through the graph.
pub type RowFields = BTreeMap<String, Value>;
