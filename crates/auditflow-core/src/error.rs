// crates/auditflow-core/src/error.rs
// ============================================================================
// Module: Error Taxonomy
// Description: Per-subsystem error enums for graph, recorder, checkpoint,
//              and orchestrator boundaries.
// Purpose: Give every fallible boundary a stable, programmatically matchable
//          error type instead of stringly-typed failures.
// Dependencies: crate::{model, schema}, thiserror
// ============================================================================

//! Per-subsystem error enums for the graph, recorder, checkpoint, and
//! orchestrator boundaries, giving every fallible boundary a stable,
//! programmatically matchable error type instead of stringly-typed failures.

use auditflow_expr::ParseError;
use thiserror::Error;

use crate::identifiers::NodeId;
use crate::identifiers::RowId;
use crate::identifiers::RunId;
use crate::identifiers::TokenId;
use crate::schema::SchemaError;

/// Graph build/validation failures, raised before any run is created.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph contains no source node, or more than one.
    #[error("graph must declare exactly one source, found {count}")]
    SourceCountInvalid {
        /// Number of source nodes found.
        count: usize,
    },
    /// The graph declares no sinks.
    #[error("graph must declare at least one sink")]
    NoSinks,
    /// The underlying multigraph contains a cycle.
    #[error("graph contains a cycle through node {node_id}")]
    CycleDetected {
        /// A node on the detected cycle.
        node_id: NodeId,
    },
    /// A non-source node is not reachable from the source via MOVE/COPY edges.
    #[error("node {node_id} is not reachable from the source")]
    UnreachableNode {
        /// The unreachable node.
        node_id: NodeId,
    },
    /// Two edges share the same `(from_node, label)` pair.
    #[error("duplicate edge label {label:?} from node {from_node}")]
    DuplicateEdgeLabel {
        /// Upstream node.
        from_node: NodeId,
        /// Duplicated label.
        label: String,
    },
    /// A producer's `on_success` connection has no matching consumer.
    #[error("connection {connection:?} from node {from_node} has no consumer")]
    DanglingConnection {
        /// Upstream node.
        from_node: NodeId,
        /// Unconsumed connection name.
        connection: String,
    },
    /// A gate route names a sink that was never configured.
    #[error("gate {gate} route {route:?} targets unknown sink {sink:?}")]
    UnknownRouteSink {
        /// Gate node.
        gate: NodeId,
        /// Route label.
        route: String,
        /// Unknown sink name.
        sink: String,
    },
    /// A gate route to a processing-node connection is consumed by more than
    /// one downstream node, or by none.
    #[error("gate {gate} route {route:?} must be consumed by exactly one downstream node, found {count}")]
    RouteFanoutInvalid {
        /// Gate node.
        gate: NodeId,
        /// Route label.
        route: String,
        /// Number of consumers found.
        count: usize,
    },
    /// A coalesce branch name is declared by more than one coalesce, or by
    /// no fork's `fork_to` list.
    #[error("fork branch {branch:?} is misconfigured: {reason}")]
    InvalidForkBranch {
        /// Branch name.
        branch: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A coalesce has no `on_success` and no consumer downstream.
    #[error("coalesce {coalesce} has no downstream consumer")]
    TerminalCoalesce {
        /// Coalesce node.
        coalesce: NodeId,
    },
    /// Schema compatibility failed across an edge.
    #[error("schema incompatible on edge {from_node} -> {to_node}: {source}")]
    SchemaIncompatible {
        /// Upstream node.
        from_node: NodeId,
        /// Downstream node.
        to_node: NodeId,
        /// Underlying schema error.
        #[source]
        source: SchemaError,
    },
    /// A non-source node declares `on_error` routing to a sink that was not
    /// configured, or no `__quarantine__` edge exists when one is required.
    #[error("required quarantine edge is missing for node {node_id}")]
    MissingQuarantineEdge {
        /// Node that needed a quarantine route.
        node_id: NodeId,
    },
    /// A gate's condition text failed to parse.
    #[error("gate {node_id} has an invalid condition: {source}")]
    InvalidGateCondition {
        /// Gate node.
        node_id: NodeId,
        /// Underlying parse error.
        #[source]
        source: ParseError,
    },
}

/// Append-only write contract violations raised by the audit recorder.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecorderError {
    /// A second run was started while one was already open.
    #[error("an open run already exists; only one run may be in progress at a time")]
    RunAlreadyOpen,
    /// `register_node`, `register_edge`, or `register_sink` was called
    /// twice for the same id.
    #[error("duplicate registration of {kind} {id} in run {run_id}")]
    DuplicateRegistration {
        /// Kind of record (e.g. `"node"`, `"edge"`, `"sink"`).
        kind: &'static str,
        /// Duplicated identifier, rendered for display.
        id: String,
        /// Owning run.
        run_id: RunId,
    },
    /// `begin_node_state` was called while another attempt for the same
    /// `(token, node, attempt)` was already `Running`.
    #[error("node state already running for token {token_id} attempt {attempt}")]
    NodeStateAlreadyRunning {
        /// Token with a conflicting in-flight attempt.
        token_id: TokenId,
        /// Conflicting attempt number.
        attempt: u32,
    },
    /// `record_token_outcome` was called for a token that already has a
    /// terminal outcome.
    #[error("token {token_id} already has a terminal outcome")]
    TokenAlreadyTerminal {
        /// Token with an existing terminal outcome.
        token_id: TokenId,
    },
    /// A `Completed` outcome was recorded with no matching completed
    /// node-state at the named sink.
    #[error("completed outcome for token {token_id} at sink {sink_name:?} has no matching completed node state")]
    MissingSinkNodeState {
        /// Token the outcome was recorded for.
        token_id: TokenId,
        /// Sink name claimed by the outcome.
        sink_name: String,
    },
    /// A row lookup failed because no such row exists in this run.
    #[error("row {row_id} not found in run {run_id}")]
    UnknownRow {
        /// Missing row.
        row_id: RowId,
        /// Run searched.
        run_id: RunId,
    },
    /// A run lookup failed because no such run exists.
    #[error("run {run_id} not found")]
    UnknownRun {
        /// Missing run.
        run_id: RunId,
    },
    /// A durable backend (e.g. the SQLite recorder) failed to read or write
    /// its storage. The in-memory recorder never raises this variant.
    #[error("audit recorder storage error: {0}")]
    Store(String),
}

/// Resume-time checkpoint compatibility failures.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// No checkpoint exists for the run being resumed.
    #[error("no checkpoint found for run {run_id}")]
    NoCheckpointFound {
        /// Run being resumed.
        run_id: RunId,
    },
    /// The checkpoint's aggregation-state format version does not match the
    /// current build's.
    #[error("checkpoint format version {found} is incompatible with current version {expected}")]
    IncompatibleCheckpointError {
        /// Version recorded on the checkpoint.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
    /// The checkpoint's topology or node-config hash does not match the
    /// graph being resumed against.
    #[error("checkpoint hash mismatch: {reason}")]
    CheckpointCorruptionError {
        /// Human-readable mismatch description.
        reason: String,
    },
    /// The run is not in a resumable state (not found, still running, or
    /// already completed).
    #[error("run {run_id} is not resumable: {reason}")]
    RunNotResumable {
        /// Run that was requested to resume.
        run_id: RunId,
        /// Reason the run cannot be resumed.
        reason: String,
    },
}

/// Errors raised by the content-addressed payload store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The underlying store reported an I/O failure.
    #[error("payload store io error: {0}")]
    Io(String),
    /// A `delete` was requested for a hash with live references remaining.
    #[error("payload {0} still has live references and cannot be deleted")]
    StillReferenced(String),
}

/// Signals a cooperative shutdown request.
///
/// This is deliberately not an [`std::error::Error`] impl: it is not a
/// failure, it is the only mechanism by which a run ends in `Interrupted`
/// status. Durable outcomes already recorded before the flag was observed
/// remain valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GracefulShutdown {
    /// Run being shut down.
    pub run_id: RunId,
    /// Number of source rows processed before the shutdown was observed.
    pub rows_processed: u64,
}

/// An operation was deliberately left pending by an asynchronous batch sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPendingError;

/// Top-level orchestrator error, wrapping every subsystem's failures.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Graph validation failed before the run was created.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// The recorder rejected a write as a contract violation.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// The payload store reported an error.
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Checkpoint or resume compatibility failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// A runtime invariant was breached; always fatal.
    #[error("orchestration invariant breached: {0}")]
    Invariant(String),
    /// A routing decision referenced a destination that does not exist.
    #[error("route validation failed: {0}")]
    RouteValidation(String),
    /// A source or sink plugin raised an error outside the
    /// transform-error path; fatal unless explicitly marked retryable.
    #[error("external plugin error at node {node_id}: {message}")]
    External {
        /// Node that raised the error.
        node_id: NodeId,
        /// Error message from the plugin.
        message: String,
        /// Whether the orchestrator may retry.
        retryable: bool,
    },
}
