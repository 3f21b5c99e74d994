// crates/auditflow-core/src/recorder.rs
// ============================================================================
// Module: Audit Recorder
// Description: Append-only write contract for the run/node/edge/row/token/
//              lineage trail, plus its read-side explain queries.
// Purpose: Give the orchestrator one durable sink for every auditable fact,
//          independent of the backing store (SQLite, in-memory, etc.).
// Dependencies: crate::{error, graph, model, identifiers}
// ============================================================================

//! ## Overview
//! The recorder is the only component allowed to assign sequence identifiers
//! and the only component allowed to transition a record's status. Every
//! write here is append-only: node states gain new attempts rather than
//! being overwritten, and a token's outcome, once terminal, cannot change.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::RecorderError;
use crate::graph::ExecutionGraph;
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
use crate::model::Call;
use crate::model::CallParent;
use crate::model::Checkpoint;
use crate::model::Node;
use crate::model::NodeState;
use crate::model::NodeStateStatus;
use crate::model::Operation;
use crate::model::OperationStatus;
use crate::model::ReproducibilityGrade;
use crate::model::RoutingEvent;
use crate::model::RoutingMode;
use crate::model::Row;
use crate::model::Run;
use crate::model::RunStatus;
use crate::schema::SchemaContract;
use crate::model::Token;
use crate::model::TokenOutcome;
use crate::model::TokenOutcomeKind;
use crate::model::TransformError;
use crate::time::Timestamp;

/// Which field on which entity a [`PayloadRef`] was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRefKind {
    /// A row's `source_data_ref`.
    RowSourceData,
    /// An operation's `input_data_ref`.
    OperationInput,
    /// An operation's `output_data_ref`.
    OperationOutput,
    /// A call's `request_ref`.
    CallRequest,
    /// A call's `response_ref`.
    CallResponse,
    /// A routing event's `reason_ref`.
    RoutingReason,
}

/// One content-addressed payload reference recorded somewhere in a run's
/// audit trail, tagged with the field it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRef {
    /// Owning run.
    pub run_id: RunId,
    /// Which entity field this reference came from.
    pub kind: PayloadRefKind,
    /// The referenced content hash.
    pub hash: HashDigest,
}

/// The durable write/read contract for one run's audit trail.
///
/// # Invariants
/// - At most one run may be open (`Running`) at a time per recorder.
/// - Every write here is append-only; see module documentation.
pub trait AuditRecorder {
    /// Opens a new run and installs its validated execution graph.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::RunAlreadyOpen`] if a run is already open.
    fn begin_run(&mut self, config_hash: HashDigest, canonical_version: String, now: Timestamp) -> Result<RunId, RecorderError>;

    /// Registers one node of the run's installed graph.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::DuplicateRegistration`] if already registered.
    fn register_node(&mut self, run_id: RunId, node: Node) -> Result<(), RecorderError>;

    /// Registers one edge of the run's installed graph.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::DuplicateRegistration`] if already registered.
    fn register_edge(
        &mut self,
        run_id: RunId,
        edge_id: EdgeId,
        from_node: NodeId,
        to_node: NodeId,
        label: String,
    ) -> Result<(), RecorderError>;

    /// Records which node a sink name resolves to in the run's installed
    /// graph. [`Self::record_token_outcome`] resolves a `Completed`
    /// outcome's `sink_name` through this map to check durability against
    /// the specific sink node, not any completed node state for the token.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if registration fails.
    fn register_sink(&mut self, run_id: RunId, sink_name: String, node_id: NodeId) -> Result<(), RecorderError>;

    /// Records a newly emitted source row.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the row cannot be recorded.
    fn create_row(
        &mut self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        source_data_hash: HashDigest,
        source_data_ref: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<RowId, RecorderError>;

    /// Records a new token for a row.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the token cannot be recorded.
    fn create_token(&mut self, run_id: RunId, token: Token) -> Result<(), RecorderError>;

    /// Begins a new node-state attempt for a token.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::NodeStateAlreadyRunning`] if a `Running`
    /// attempt already exists for `(token_id, node_id)`.
    fn begin_node_state(
        &mut self,
        run_id: RunId,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        input_hash: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<StateId, RecorderError>;

    /// Completes a node-state attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if `state_id` does not exist.
    fn complete_node_state(
        &mut self,
        state_id: StateId,
        status: NodeStateStatus,
        output_hash: Option<HashDigest>,
        error_json: Option<Value>,
        now: Timestamp,
    ) -> Result<(), RecorderError>;

    /// Records one edge-choice decision made by a node state.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the state or edge is unknown.
    fn record_routing_event(
        &mut self,
        state_id: StateId,
        edge_id: EdgeId,
        routing_group_id: GroupId,
        ordinal: u32,
        mode: RoutingMode,
        reason_hash: Option<HashDigest>,
        reason_ref: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<EventId, RecorderError>;

    /// Records the terminal outcome of a token.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::TokenAlreadyTerminal`] if already recorded,
    /// or [`RecorderError::MissingSinkNodeState`] for a `Completed` outcome
    /// with no matching completed node state at the claimed sink.
    fn record_token_outcome(
        &mut self,
        run_id: RunId,
        token_id: TokenId,
        outcome: TokenOutcomeKind,
        sink_name: Option<String>,
        error_hash: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<OutcomeId, RecorderError>;

    /// Begins a granular plugin-level I/O operation.
    fn begin_operation(
        &mut self,
        run_id: RunId,
        node_id: NodeId,
        operation_type: String,
        input_data_ref: Option<HashDigest>,
        now: Timestamp,
    ) -> OperationId;

    /// Completes a granular plugin-level I/O operation.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if `operation_id` does not exist.
    fn complete_operation(
        &mut self,
        operation_id: OperationId,
        status: OperationStatus,
        output_data_ref: Option<HashDigest>,
        error: Option<String>,
        now: Timestamp,
    ) -> Result<(), RecorderError>;

    /// Records an optional side-call attached to a node state or operation.
    fn record_call(&mut self, run_id: RunId, parent: CallParent, call: Call) -> CallId;

    /// Records a periodic checkpoint snapshot.
    fn record_checkpoint(&mut self, checkpoint: Checkpoint) -> CheckpointId;

    /// Finalizes a run, transitioning it to a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if no run is open.
    fn finalize_run(&mut self, run_id: RunId, status: RunStatus, now: Timestamp) -> Result<(), RecorderError>;

    /// Returns the full lineage and decision trail for one row, for audit
    /// review.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::UnknownRow`] if the row does not exist.
    fn explain_row(&self, run_id: RunId, row_id: RowId) -> Result<RowExplanation, RecorderError>;

    /// Returns every row with no terminal outcome across all of its tokens,
    /// for resume.
    fn get_unprocessed_rows(&self, run_id: RunId) -> Vec<RowId>;

    /// Records a transform failure for post-hoc review, independent of the
    /// node-state/outcome trail.
    fn record_transform_error(&mut self, error: TransformError);

    /// Returns every run that has reached a terminal status, for retention
    /// scanning.
    fn terminal_runs(&self) -> Vec<Run>;

    /// Returns every run, terminal or not, for cross-run reference checks
    /// (a payload referenced by a still-`Running` run must never be
    /// reported expired).
    fn all_runs(&self) -> Vec<Run>;

    /// Returns every content-addressed payload reference recorded anywhere
    /// in `run_id`'s audit trail.
    fn payload_refs_for_run(&self, run_id: RunId) -> Vec<PayloadRef>;

    /// Overwrites a run's reproducibility grade, e.g. after a payload purge.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the run does not exist.
    fn set_reproducibility_grade(&mut self, run_id: RunId, grade: ReproducibilityGrade) -> Result<(), RecorderError>;

    /// Returns one run by id, for resume and status queries.
    fn get_run(&self, run_id: RunId) -> Option<Run>;

    /// Returns one row by id, for resume's unprocessed-row rehydration.
    fn get_row(&self, run_id: RunId, row_id: RowId) -> Option<Row>;

    /// Returns the highest-sequence checkpoint recorded for a run, if any.
    fn latest_checkpoint(&self, run_id: RunId) -> Option<Checkpoint>;

    /// Records the negotiated source schema contract on an open run, once
    /// installation has validated it against every downstream node.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the run does not exist.
    fn set_schema_contract(
        &mut self,
        run_id: RunId,
        contract: SchemaContract,
        hash: HashDigest,
        source_schema: Option<Value>,
    ) -> Result<(), RecorderError>;

    /// Returns the highest [`TokenId`] issued for `run_id`, if any tokens
    /// have been recorded. Used to seed a fresh [`crate::token_manager::TokenManager`]
    /// past every id a prior process already persisted when resuming.
    fn highest_token_id(&self, run_id: RunId) -> Option<TokenId>;

    /// Records the export-step outcome for a completed run.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if the run does not exist.
    fn set_export_status(
        &mut self,
        run_id: RunId,
        status: crate::model::ExportStatus,
        error: Option<String>,
    ) -> Result<(), RecorderError>;
}

/// A row's full lineage and decision trail.
#[derive(Debug, Clone, PartialEq)]
pub struct RowExplanation {
    /// The row itself.
    pub row: Row,
    /// Every token derived from the row, in creation order.
    pub tokens: Vec<Token>,
    /// Every node-state attempt across those tokens.
    pub node_states: Vec<NodeState>,
    /// Every routing decision across those node states.
    pub routing_events: Vec<RoutingEvent>,
    /// Every terminal outcome reached by any of the row's tokens.
    pub outcomes: Vec<TokenOutcome>,
}

/// In-memory [`AuditRecorder`] used for tests and single-process demos.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    runs: BTreeMap<RunId, Run>,
    next_run_id: u64,
    open_run: Option<RunId>,
    nodes: BTreeMap<(RunId, NodeId), Node>,
    edges: BTreeMap<(RunId, EdgeId), (NodeId, NodeId, String)>,
    rows: BTreeMap<(RunId, RowId), Row>,
    next_row_id: u64,
    tokens: BTreeMap<(RunId, TokenId), Token>,
    node_states: BTreeMap<StateId, NodeState>,
    next_state_id: u64,
    routing_events: Vec<RoutingEvent>,
    next_event_id: u64,
    outcomes: BTreeMap<(RunId, TokenId), TokenOutcome>,
    next_outcome_id: u64,
    operations: BTreeMap<OperationId, Operation>,
    next_operation_id: u64,
    calls: Vec<Call>,
    next_call_id: u64,
    checkpoints: Vec<Checkpoint>,
    next_checkpoint_id: u64,
    transform_errors: Vec<TransformError>,
    sink_ids: BTreeMap<(RunId, String), NodeId>,
}

impl InMemoryRecorder {
    /// Creates an empty in-memory recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every transform failure recorded so far, for post-hoc review.
    #[must_use]
    pub fn transform_errors(&self) -> &[TransformError] {
        &self.transform_errors
    }

    /// Installs every node and edge of a validated graph into an open run.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError`] if registration fails.
    pub fn install_graph(&mut self, run_id: RunId, graph: &ExecutionGraph) -> Result<(), RecorderError> {
        for node in graph.nodes().values() {
            self.register_node(run_id, node.clone())?;
        }
        for edge in graph.edges() {
            self.register_edge(run_id, edge.edge_id, edge.from_node.clone(), edge.to_node.clone(), edge.label.clone())?;
        }
        for (sink_name, node_id) in graph.get_sink_id_map() {
            self.register_sink(run_id, sink_name.clone(), node_id.clone())?;
        }
        Ok(())
    }
}

fn next_id<T>(counter: &mut u64, ctor: impl Fn(u64) -> Option<T>) -> T {
    *counter += 1;
    ctor(*counter).unwrap_or_else(|| ctor(1).unwrap_or_else(|| unreachable!("1 is non-zero")))
}

impl AuditRecorder for InMemoryRecorder {
    fn begin_run(&mut self, config_hash: HashDigest, canonical_version: String, now: Timestamp) -> Result<RunId, RecorderError> {
        if self.open_run.is_some() {
            return Err(RecorderError::RunAlreadyOpen);
        }
        let run_id = next_id(&mut self.next_run_id, RunId::from_raw);
        self.runs.insert(
            run_id,
            Run {
                run_id,
                started_at: now,
                completed_at: None,
                status: RunStatus::Running,
                config_hash,
                canonical_version,
                schema_contract: None,
                source_schema: None,
                export_status: crate::model::ExportStatus::NotConfigured,
                export_error: None,
                reproducibility_grade: crate::model::ReproducibilityGrade::Full,
            },
        );
        self.open_run = Some(run_id);
        Ok(run_id)
    }

    fn register_node(&mut self, run_id: RunId, node: Node) -> Result<(), RecorderError> {
        let key = (run_id, node.node_id.clone());
        if self.nodes.contains_key(&key) {
            return Err(RecorderError::DuplicateRegistration { kind: "node", id: node.node_id.to_string(), run_id });
        }
        self.nodes.insert(key, node);
        Ok(())
    }

    fn register_edge(
        &mut self,
        run_id: RunId,
        edge_id: EdgeId,
        from_node: NodeId,
        to_node: NodeId,
        label: String,
    ) -> Result<(), RecorderError> {
        let key = (run_id, edge_id);
        if self.edges.contains_key(&key) {
            return Err(RecorderError::DuplicateRegistration { kind: "edge", id: edge_id.to_string(), run_id });
        }
        self.edges.insert(key, (from_node, to_node, label));
        Ok(())
    }

    fn register_sink(&mut self, run_id: RunId, sink_name: String, node_id: NodeId) -> Result<(), RecorderError> {
        self.sink_ids.insert((run_id, sink_name), node_id);
        Ok(())
    }

    fn create_row(
        &mut self,
        run_id: RunId,
        source_node_id: NodeId,
        row_index: u64,
        source_data_hash: HashDigest,
        source_data_ref: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<RowId, RecorderError> {
        let row_id = next_id(&mut self.next_row_id, RowId::from_raw);
        self.rows.insert(
            (run_id, row_id),
            Row { row_id, run_id, source_node_id, row_index, source_data_hash, source_data_ref, created_at: now },
        );
        Ok(row_id)
    }

    fn create_token(&mut self, run_id: RunId, token: Token) -> Result<(), RecorderError> {
        self.tokens.insert((run_id, token.token_id), token);
        Ok(())
    }

    fn begin_node_state(
        &mut self,
        run_id: RunId,
        token_id: TokenId,
        node_id: NodeId,
        step_index: u32,
        input_hash: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<StateId, RecorderError> {
        let attempt = self
            .node_states
            .values()
            .filter(|s| s.token_id == token_id && s.node_id == node_id)
            .map(|s| s.attempt)
            .max()
            .map_or(1, |max| max + 1);
        if self
            .node_states
            .values()
            .any(|s| s.token_id == token_id && s.node_id == node_id && s.status == NodeStateStatus::Running)
        {
            return Err(RecorderError::NodeStateAlreadyRunning { token_id, attempt });
        }
        let state_id = next_id(&mut self.next_state_id, StateId::from_raw);
        self.node_states.insert(
            state_id,
            NodeState {
                state_id,
                token_id,
                run_id,
                node_id,
                step_index,
                attempt,
                status: NodeStateStatus::Running,
                input_hash,
                output_hash: None,
                error_json: None,
                started_at: now,
                completed_at: None,
            },
        );
        Ok(state_id)
    }

    fn complete_node_state(
        &mut self,
        state_id: StateId,
        status: NodeStateStatus,
        output_hash: Option<HashDigest>,
        error_json: Option<Value>,
        now: Timestamp,
    ) -> Result<(), RecorderError> {
        let Some(state) = self.node_states.get_mut(&state_id) else {
            return Ok(());
        };
        state.status = status;
        state.output_hash = output_hash;
        state.error_json = error_json;
        state.completed_at = Some(now);
        Ok(())
    }

    fn record_routing_event(
        &mut self,
        state_id: StateId,
        edge_id: EdgeId,
        routing_group_id: GroupId,
        ordinal: u32,
        mode: RoutingMode,
        reason_hash: Option<HashDigest>,
        reason_ref: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<EventId, RecorderError> {
        let event_id = next_id(&mut self.next_event_id, EventId::from_raw);
        self.routing_events.push(RoutingEvent {
            event_id,
            state_id,
            edge_id,
            routing_group_id,
            ordinal,
            mode,
            reason_hash,
            reason_ref,
            created_at: now,
        });
        Ok(event_id)
    }

    fn record_token_outcome(
        &mut self,
        run_id: RunId,
        token_id: TokenId,
        outcome: TokenOutcomeKind,
        sink_name: Option<String>,
        error_hash: Option<HashDigest>,
        now: Timestamp,
    ) -> Result<OutcomeId, RecorderError> {
        if self.outcomes.contains_key(&(run_id, token_id)) {
            return Err(RecorderError::TokenAlreadyTerminal { token_id });
        }
        if outcome == TokenOutcomeKind::Completed {
            let Some(sink) = &sink_name else {
                return Err(RecorderError::MissingSinkNodeState { token_id, sink_name: String::new() });
            };
            let Some(sink_node_id) = self.sink_ids.get(&(run_id, sink.clone())) else {
                return Err(RecorderError::MissingSinkNodeState { token_id, sink_name: sink.clone() });
            };
            let has_completed_sink_state = self
                .node_states
                .values()
                .any(|s| s.token_id == token_id && s.node_id == *sink_node_id && s.status == NodeStateStatus::Completed);
            if !has_completed_sink_state {
                return Err(RecorderError::MissingSinkNodeState { token_id, sink_name: sink.clone() });
            }
        }
        let outcome_id = next_id(&mut self.next_outcome_id, OutcomeId::from_raw);
        self.outcomes.insert(
            (run_id, token_id),
            TokenOutcome { outcome_id, run_id, token_id, outcome, is_terminal: true, sink_name, error_hash, recorded_at: now },
        );
        Ok(outcome_id)
    }

    fn begin_operation(
        &mut self,
        run_id: RunId,
        node_id: NodeId,
        operation_type: String,
        input_data_ref: Option<HashDigest>,
        now: Timestamp,
    ) -> OperationId {
        let operation_id = next_id(&mut self.next_operation_id, OperationId::from_raw);
        self.operations.insert(
            operation_id,
            Operation {
                operation_id,
                run_id,
                node_id,
                operation_type,
                status: OperationStatus::Pending,
                input_data_ref,
                output_data_ref: None,
                started_at: now,
                completed_at: None,
                error: None,
            },
        );
        operation_id
    }

    fn complete_operation(
        &mut self,
        operation_id: OperationId,
        status: OperationStatus,
        output_data_ref: Option<HashDigest>,
        error: Option<String>,
        now: Timestamp,
    ) -> Result<(), RecorderError> {
        if let Some(operation) = self.operations.get_mut(&operation_id) {
            operation.status = status;
            operation.output_data_ref = output_data_ref;
            operation.error = error;
            operation.completed_at = Some(now);
        }
        Ok(())
    }

    fn record_call(&mut self, run_id: RunId, parent: CallParent, call: Call) -> CallId {
        let call_id = next_id(&mut self.next_call_id, CallId::from_raw);
        self.calls.push(Call { call_id, run_id, parent, ..call });
        call_id
    }

    fn record_checkpoint(&mut self, checkpoint: Checkpoint) -> CheckpointId {
        let checkpoint_id = next_id(&mut self.next_checkpoint_id, CheckpointId::from_raw);
        self.checkpoints.push(Checkpoint { checkpoint_id, ..checkpoint });
        checkpoint_id
    }

    fn finalize_run(&mut self, run_id: RunId, status: RunStatus, now: Timestamp) -> Result<(), RecorderError> {
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.status = status;
            run.completed_at = Some(now);
        }
        if self.open_run == Some(run_id) {
            self.open_run = None;
        }
        Ok(())
    }

    fn explain_row(&self, run_id: RunId, row_id: RowId) -> Result<RowExplanation, RecorderError> {
        let row = self.rows.get(&(run_id, row_id)).cloned().ok_or(RecorderError::UnknownRow { row_id, run_id })?;
        let tokens: Vec<Token> =
            self.tokens.iter().filter(|((r, _), t)| *r == run_id && t.row_id == row_id).map(|(_, t)| t.clone()).collect();
        let token_ids: Vec<TokenId> = tokens.iter().map(|t| t.token_id).collect();
        let node_states: Vec<NodeState> =
            self.node_states.values().filter(|s| token_ids.contains(&s.token_id)).cloned().collect();
        let state_ids: Vec<StateId> = node_states.iter().map(|s| s.state_id).collect();
        let routing_events: Vec<RoutingEvent> =
            self.routing_events.iter().filter(|e| state_ids.contains(&e.state_id)).cloned().collect();
        let outcomes: Vec<TokenOutcome> =
            self.outcomes.iter().filter(|((r, t), _)| *r == run_id && token_ids.contains(t)).map(|(_, o)| o.clone()).collect();
        Ok(RowExplanation { row, tokens, node_states, routing_events, outcomes })
    }

    fn get_unprocessed_rows(&self, run_id: RunId) -> Vec<RowId> {
        self.rows
            .iter()
            .filter(|((r, _), _)| *r == run_id)
            .map(|((_, row_id), _)| *row_id)
            .filter(|row_id| {
                let tokens: Vec<TokenId> = self
                    .tokens
                    .iter()
                    .filter(|((r, _), t)| *r == run_id && t.row_id == *row_id)
                    .map(|((_, id), _)| *id)
                    .collect();
                !tokens.iter().any(|token_id| self.outcomes.contains_key(&(run_id, *token_id)))
            })
            .collect()
    }

    fn record_transform_error(&mut self, error: TransformError) {
        self.transform_errors.push(error);
    }

    fn terminal_runs(&self) -> Vec<Run> {
        self.runs.values().filter(|run| run.status.is_terminal()).cloned().collect()
    }

    fn all_runs(&self) -> Vec<Run> {
        self.runs.values().cloned().collect()
    }

    fn payload_refs_for_run(&self, run_id: RunId) -> Vec<PayloadRef> {
        let mut refs = Vec::new();
        for ((r, _), row) in &self.rows {
            if *r == run_id {
                if let Some(hash) = &row.source_data_ref {
                    refs.push(PayloadRef { run_id, kind: PayloadRefKind::RowSourceData, hash: hash.clone() });
                }
            }
        }
        for operation in self.operations.values().filter(|o| o.run_id == run_id) {
            if let Some(hash) = &operation.input_data_ref {
                refs.push(PayloadRef { run_id, kind: PayloadRefKind::OperationInput, hash: hash.clone() });
            }
            if let Some(hash) = &operation.output_data_ref {
                refs.push(PayloadRef { run_id, kind: PayloadRefKind::OperationOutput, hash: hash.clone() });
            }
        }
        for call in self.calls.iter().filter(|c| c.run_id == run_id) {
            if let Some(hash) = &call.request_ref {
                refs.push(PayloadRef { run_id, kind: PayloadRefKind::CallRequest, hash: hash.clone() });
            }
            if let Some(hash) = &call.response_ref {
                refs.push(PayloadRef { run_id, kind: PayloadRefKind::CallResponse, hash: hash.clone() });
            }
        }
        let run_state_ids: std::collections::BTreeSet<StateId> =
            self.node_states.values().filter(|s| s.run_id == run_id).map(|s| s.state_id).collect();
        for event in self.routing_events.iter().filter(|e| run_state_ids.contains(&e.state_id)) {
            if let Some(hash) = &event.reason_ref {
                refs.push(PayloadRef { run_id, kind: PayloadRefKind::RoutingReason, hash: hash.clone() });
            }
        }
        refs
    }

    fn set_reproducibility_grade(&mut self, run_id: RunId, grade: ReproducibilityGrade) -> Result<(), RecorderError> {
        let run = self.runs.get_mut(&run_id).ok_or(RecorderError::UnknownRun { run_id })?;
        run.reproducibility_grade = grade;
        Ok(())
    }

    fn get_run(&self, run_id: RunId) -> Option<Run> {
        self.runs.get(&run_id).cloned()
    }

    fn get_row(&self, run_id: RunId, row_id: RowId) -> Option<Row> {
        self.rows.get(&(run_id, row_id)).cloned()
    }

    fn latest_checkpoint(&self, run_id: RunId) -> Option<Checkpoint> {
        self.checkpoints.iter().filter(|c| c.run_id == run_id).max_by_key(|c| c.sequence_number).cloned()
    }

    fn set_schema_contract(
        &mut self,
        run_id: RunId,
        contract: SchemaContract,
        hash: HashDigest,
        source_schema: Option<Value>,
    ) -> Result<(), RecorderError> {
        let run = self.runs.get_mut(&run_id).ok_or(RecorderError::UnknownRun { run_id })?;
        run.schema_contract = Some((contract, hash));
        run.source_schema = source_schema;
        Ok(())
    }

    fn highest_token_id(&self, run_id: RunId) -> Option<TokenId> {
        self.tokens.iter().filter(|((r, _), _)| *r == run_id).map(|((_, token_id), _)| *token_id).max()
    }

    fn set_export_status(
        &mut self,
        run_id: RunId,
        status: crate::model::ExportStatus,
        error: Option<String>,
    ) -> Result<(), RecorderError> {
        let run = self.runs.get_mut(&run_id).ok_or(RecorderError::UnknownRun { run_id })?;
        run.export_status = status;
        run.export_error = error;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::DEFAULT_HASH_ALGORITHM;
    use crate::hashing::hash_bytes;

    #[test]
    fn begin_run_rejects_a_second_open_run() {
        let mut recorder = InMemoryRecorder::new();
        let now = Timestamp::now();
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
        recorder.begin_run(digest.clone(), DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap();
        let err = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap_err();
        assert!(matches!(err, RecorderError::RunAlreadyOpen));
    }

    #[test]
    fn completed_outcome_requires_a_completed_node_state_at_the_sink() {
        let mut recorder = InMemoryRecorder::new();
        let now = Timestamp::now();
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
        let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap();
        let token_id = TokenId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"));
        let err = recorder
            .record_token_outcome(run_id, token_id, TokenOutcomeKind::Completed, Some("out".to_string()), None, now)
            .unwrap_err();
        assert!(matches!(err, RecorderError::MissingSinkNodeState { .. }));
    }

    #[test]
    fn completed_outcome_is_rejected_when_only_an_upstream_node_completed() {
        let mut recorder = InMemoryRecorder::new();
        let now = Timestamp::now();
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
        let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap();
        let sink_id = NodeId::new("sink");
        recorder.sink_ids.insert((run_id, "out".to_string()), sink_id);
        let token_id = TokenId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"));

        // A transform upstream of the sink completed, but the token never
        // actually reached the sink node itself.
        let transform_id = NodeId::new("transform");
        let state_id = recorder.begin_node_state(run_id, token_id, transform_id, 0, None, now).unwrap();
        recorder.complete_node_state(state_id, NodeStateStatus::Completed, None, None, now).unwrap();

        let err = recorder
            .record_token_outcome(run_id, token_id, TokenOutcomeKind::Completed, Some("out".to_string()), None, now)
            .unwrap_err();
        assert!(matches!(err, RecorderError::MissingSinkNodeState { .. }));
    }

    #[test]
    fn completed_outcome_is_accepted_once_the_sink_node_itself_completed() {
        let mut recorder = InMemoryRecorder::new();
        let now = Timestamp::now();
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
        let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap();
        let sink_id = NodeId::new("sink");
        recorder.sink_ids.insert((run_id, "out".to_string()), sink_id.clone());
        let token_id = TokenId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"));

        let state_id = recorder.begin_node_state(run_id, token_id, sink_id, 0, None, now).unwrap();
        recorder.complete_node_state(state_id, NodeStateStatus::Completed, None, None, now).unwrap();

        recorder.record_token_outcome(run_id, token_id, TokenOutcomeKind::Completed, Some("out".to_string()), None, now).unwrap();
    }

    #[test]
    fn unprocessed_rows_excludes_rows_with_a_terminal_outcome() {
        let mut recorder = InMemoryRecorder::new();
        let now = Timestamp::now();
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, b"config");
        let run_id = recorder.begin_run(digest, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), now).unwrap();
        let node_id = NodeId::new("source");
        let row_id = recorder.create_row(run_id, node_id, 0, hash_bytes(DEFAULT_HASH_ALGORITHM, b"row"), None, now).unwrap();
        let mut tokens = crate::token_manager::TokenManager::new();
        let token = tokens.create_original(row_id, now);
        recorder.create_token(run_id, token.clone()).unwrap();
        assert_eq!(recorder.get_unprocessed_rows(run_id), vec![row_id]);
        recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Failed, None, None, now).unwrap();
        assert!(recorder.get_unprocessed_rows(run_id).is_empty());
    }
}
