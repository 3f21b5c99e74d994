// crates/auditflow-core/src/row_processor.rs
// ============================================================================
// Module: Row Processor
// Description: Drives one token along MOVE/COPY edges through the graph.
// Purpose: Translate transform/gate/coalesce/aggregation outcomes into the
//          recorder's node-state and routing-event trail, and collect the
//          sink deliveries the orchestrator flushes at write time.
// Dependencies: crate::{aggregation, coalesce, error, graph, identifiers,
//               model, plugins, recorder, schema, time, token_manager}
// ============================================================================

//! ## Overview
//! A token enters the processor wherever the source (or a resumed
//! checkpoint) hands it off, and is walked node by node until it either
//! reaches a sink, is dropped by a discarding transform, or is held at a
//! coalesce/aggregation awaiting more arrivals. Fork produces more than one
//! continuation per step, so traversal is a work queue rather than a single
//! recursive call.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::aggregation::AggregationConfig;
use crate::aggregation::AggregationExecutor;
use crate::aggregation::SubmitOutcome as AggregationSubmitOutcome;
use crate::coalesce::CoalesceConfig;
use crate::coalesce::CoalesceExecutor;
use crate::coalesce::SubmitOutcome as CoalesceSubmitOutcome;
use crate::coalesce::TimeoutOutcome as CoalesceTimeoutOutcome;
use crate::error::OrchestratorError;
use crate::graph::ErrorRoute;
use crate::graph::ExecutionGraph;
use crate::graph::NodeKind;
use crate::graph::RouteDestination;
use crate::identifiers::NodeId;
use crate::identifiers::RunId;
use crate::model::NodeStateStatus;
use crate::model::NodeType;
use crate::model::Token;
use crate::model::TransformError;
use crate::plugins::BatchTransform;
use crate::plugins::Gate;
use crate::plugins::GateAction;
use crate::plugins::PluginContext;
use crate::plugins::Transform;
use crate::plugins::TransformResult;
use crate::recorder::AuditRecorder;
use crate::schema::SchemaContract;
use crate::time::Timestamp;
use crate::token_manager::TokenManager;

/// Trait-object plugin lookup for one run's transform, gate, and aggregation
/// nodes. Sources and sinks are driven directly by the orchestrator.
#[derive(Default)]
pub struct PluginSet<'a> {
    /// Transform plugin per transform node.
    pub transforms: BTreeMap<NodeId, &'a dyn Transform>,
    /// Gate plugin per gate node.
    pub gates: BTreeMap<NodeId, &'a dyn Gate>,
    /// Batch transform plugin per aggregation node.
    pub aggregations: BTreeMap<NodeId, &'a dyn BatchTransform>,
}

/// Per-node declarative configuration the row processor needs beyond what
/// the graph itself carries.
#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    /// Coalesce configuration, keyed by coalesce name.
    pub coalesce: BTreeMap<String, CoalesceConfig>,
    /// Aggregation configuration, keyed by node identifier.
    pub aggregation: BTreeMap<NodeId, AggregationConfig>,
}

/// One row ready to be buffered at a sink.
#[derive(Debug, Clone)]
pub struct SinkDelivery {
    /// Sink name the row is routed to.
    pub sink_name: String,
    /// Token delivered.
    pub token: Token,
    /// Row payload.
    pub row: Value,
}

/// Accumulated effect of walking one token (and any descendants it forks
/// into) through the graph.
#[derive(Debug, Clone, Default)]
pub struct RowOutcome {
    /// Rows ready to be buffered at a sink.
    pub sink_deliveries: Vec<SinkDelivery>,
    /// Tokens dropped by a discarding transform, with no sink delivery.
    pub discarded: Vec<Token>,
}

/// Owns the per-run coalesce and aggregation state and drives tokens through
/// the graph.
///
/// `max_workers` is accepted and validated but does not change `drain_queue`'s
/// execution order: the work queue it drives is a single-threaded stack, one
/// [`WorkItem`] at a time. This mirrors the config's own original, whose
/// `max_workers` knob is wired from the CLI down to a `TransformExecutor` but
/// is exercised only by parameter-passing tests, never by a test asserting
/// two rows actually ran concurrently — see SPEC_FULL.md's concurrency
/// section for the reasoning behind keeping parity with that scope here.
#[derive(Debug)]
pub struct RowProcessor {
    coalesce: CoalesceExecutor,
    aggregation: AggregationExecutor,
    max_workers: u32,
}

impl Default for RowProcessor {
    fn default() -> Self {
        Self { coalesce: CoalesceExecutor::default(), aggregation: AggregationExecutor::default(), max_workers: 1 }
    }
}

struct WorkItem {
    node_id: NodeId,
    token: Token,
    row: Value,
    contract: SchemaContract,
}

impl RowProcessor {
    /// Creates a processor with empty coalesce/aggregation state and an
    /// unbounded (`max_workers == 1`) worker count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a processor with empty coalesce/aggregation state and the
    /// given worker cap. `0` is treated as `1`: a cap below one worker has
    /// no meaningful interpretation, so this clamps rather than erroring.
    #[must_use]
    pub fn with_max_workers(max_workers: u32) -> Self {
        Self { max_workers: max_workers.max(1), ..Self::default() }
    }

    /// The configured worker cap. See the struct-level doc comment for why
    /// this does not currently change `drain_queue`'s execution order.
    #[must_use]
    pub const fn max_workers(&self) -> u32 {
        self.max_workers
    }

    /// Walks `token` starting at `node_id`, recording every node-state and
    /// routing decision along the way.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] if the graph's routing tables are
    /// inconsistent with its edges (an invariant violation) or the recorder
    /// rejects a write.
    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    pub fn process_token(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        tokens: &mut TokenManager,
        run_id: RunId,
        node_id: NodeId,
        token: Token,
        row: Value,
        contract: SchemaContract,
        now: Timestamp,
    ) -> Result<RowOutcome, OrchestratorError> {
        let queue = vec![WorkItem { node_id, token, row, contract }];
        self.drain_queue(graph, plugins, config, recorder, tokens, run_id, now, queue)
    }

    /// Times out every coalesce group whose `timeout_seconds` has elapsed,
    /// continuing `Emit` outcomes downstream and reporting timed-out groups'
    /// tokens as discarded. [`CoalesceExecutor`] is private to this type, so
    /// the orchestrator must drive its timeout sweep through here — call this
    /// once per source row (or on whatever cadence the run loop ticks at).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] under the same conditions as
    /// [`Self::process_token`], plus a contract-merge failure translated to
    /// [`OrchestratorError::Invariant`].
    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    pub fn flush_expired_coalesces(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        tokens: &mut TokenManager,
        run_id: RunId,
        now: Timestamp,
    ) -> Result<RowOutcome, OrchestratorError> {
        let expired = self
            .coalesce
            .flush_expired(&config.coalesce, now, tokens)
            .map_err(|err| OrchestratorError::Invariant(err.to_string()))?;

        let mut queue = Vec::new();
        let mut discarded = Vec::new();
        for ((_, coalesce_name), result) in expired {
            let node_id = graph
                .get_coalesce_id_map()
                .get(&coalesce_name)
                .cloned()
                .ok_or_else(|| OrchestratorError::Invariant(format!("no coalesce node for {coalesce_name}")))?;
            match result {
                CoalesceTimeoutOutcome::Emit { token, row, contract } => {
                    if let Some(next) = Self::next_via_continue(graph, &node_id) {
                        queue.push(WorkItem { node_id: next, token, row, contract });
                    }
                }
                CoalesceTimeoutOutcome::Failed { tokens: failed } => discarded.extend(failed),
            }
        }
        let mut outcome = self.drain_queue(graph, plugins, config, recorder, tokens, run_id, now, queue)?;
        outcome.discarded.extend(discarded);
        Ok(outcome)
    }

    /// Force-flushes one aggregation node's buffer, continuing any emitted
    /// rows downstream. Used for flush-on-end triggers and for any
    /// non-empty buffer remaining when a run ends. Returns an empty outcome
    /// if the node has no configuration, no plugin, or no buffered rows.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::External`] if the batch transform itself
    /// reports an error with no token to attach it to, and the same errors
    /// as [`Self::process_token`] otherwise.
    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    pub fn force_flush_aggregation(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        tokens: &mut TokenManager,
        run_id: RunId,
        node_id: &NodeId,
        now: Timestamp,
    ) -> Result<RowOutcome, OrchestratorError> {
        let Some(agg_config) = config.aggregation.get(node_id) else {
            return Ok(RowOutcome::default());
        };
        let Some(plugin) = plugins.aggregations.get(node_id) else {
            return Ok(RowOutcome::default());
        };
        let ctx = PluginContext { run_id, node_id: node_id.clone() };
        let node_key = node_id.as_str().to_string();
        let Some(result) = self.aggregation.force_flush(&node_key, agg_config, *plugin, &ctx, tokens, now) else {
            return Ok(RowOutcome::default());
        };
        let output_schema = match graph.kind(node_id) {
            Some(NodeKind::Aggregation { output_schema, .. }) => output_schema.clone(),
            _ => SchemaContract::Observed,
        };

        match result {
            AggregationSubmitOutcome::Emit { rows, tokens: out_tokens } => {
                let mut queue = Vec::new();
                if let Some(next) = Self::next_via_continue(graph, node_id) {
                    for (row, token) in rows.into_iter().zip(out_tokens) {
                        queue.push(WorkItem { node_id: next.clone(), token, row, contract: output_schema.clone() });
                    }
                }
                self.drain_queue(graph, plugins, config, recorder, tokens, run_id, now, queue)
            }
            AggregationSubmitOutcome::Buffered => Ok(RowOutcome::default()),
            AggregationSubmitOutcome::Error { reason, retryable } => {
                Err(OrchestratorError::External { node_id: node_id.clone(), message: reason, retryable })
            }
        }
    }

    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    fn drain_queue(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        tokens: &mut TokenManager,
        run_id: RunId,
        now: Timestamp,
        mut queue: Vec<WorkItem>,
    ) -> Result<RowOutcome, OrchestratorError> {
        let mut outcome = RowOutcome::default();

        while let Some(item) = queue.pop() {
            let WorkItem { node_id, token, row, contract } = item;
            let node_type = graph
                .nodes()
                .get(&node_id)
                .map(|n| n.node_type)
                .ok_or_else(|| OrchestratorError::Invariant(format!("node {node_id} missing from graph")))?;

            if node_type == NodeType::Sink {
                let sink_name = graph
                    .get_sink_id_map()
                    .iter()
                    .find(|(_, id)| **id == node_id)
                    .map(|(name, _)| name.clone())
                    .unwrap_or_default();
                outcome.sink_deliveries.push(SinkDelivery { sink_name, token, row });
                continue;
            }

            let kind = graph
                .kind(&node_id)
                .ok_or_else(|| OrchestratorError::Invariant(format!("node {node_id} has no kind")))?;

            match kind.clone() {
                NodeKind::Source { .. } => {
                    return Err(OrchestratorError::Invariant("row processor reached a source mid-traversal".to_string()));
                }
                NodeKind::Transform { on_error, output_schema, .. } => {
                    self.step_transform(
                        graph, plugins, recorder, run_id, &node_id, token, row, &output_schema, &on_error, now, &mut queue,
                        &mut outcome,
                    )?;
                }
                NodeKind::Gate { fork_to, .. } => {
                    self.step_gate(graph, plugins, recorder, tokens, run_id, &node_id, token, row, &contract, &fork_to, now, &mut queue)?;
                }
                NodeKind::Coalesce { name, .. } => {
                    self.step_coalesce(graph, config, tokens, &name, &node_id, token, row, contract, now, &mut queue)?;
                }
                NodeKind::Aggregation { output_schema, .. } => {
                    self.step_aggregation(graph, plugins, config, tokens, run_id, &node_id, token, row, &output_schema, now, &mut queue)?;
                }
                NodeKind::Sink { .. } => {
                    return Err(OrchestratorError::Invariant(format!("sink node {node_id} reached drain_queue's node-kind match; sinks must be handled via node_type above")));
                }
            }
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    fn step_transform(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        recorder: &mut dyn AuditRecorder,
        run_id: RunId,
        node_id: &NodeId,
        token: Token,
        row: Value,
        output_schema: &SchemaContract,
        on_error: &ErrorRoute,
        now: Timestamp,
        queue: &mut Vec<WorkItem>,
        outcome: &mut RowOutcome,
    ) -> Result<(), OrchestratorError> {
        let step_index = graph.step_index(node_id).unwrap_or_default();
        let state_id = recorder.begin_node_state(run_id, token.token_id, node_id.clone(), step_index, None, now)?;
        let ctx = PluginContext { run_id, node_id: node_id.clone() };
        let plugin = plugins
            .transforms
            .get(node_id)
            .ok_or_else(|| OrchestratorError::Invariant(format!("no transform plugin registered for {node_id}")))?;

        match plugin.process(&row, &ctx) {
            TransformResult::Success { row: new_row, .. } => {
                recorder.complete_node_state(state_id, NodeStateStatus::Completed, None, None, now)?;
                if let Some(next) = Self::next_via_continue(graph, node_id) {
                    queue.push(WorkItem { node_id: next, token, row: new_row, contract: output_schema.clone() });
                }
            }
            TransformResult::Error { reason, retryable } => {
                recorder.complete_node_state(
                    state_id,
                    NodeStateStatus::Failed,
                    None,
                    Some(serde_json::json!({ "reason": reason })),
                    now,
                )?;
                recorder.record_transform_error(TransformError {
                    run_id,
                    node_id: node_id.clone(),
                    token_id: token.token_id,
                    reason: reason.clone(),
                    retryable,
                    created_at: now,
                });
                match on_error {
                    ErrorRoute::Sink(sink_name) => {
                        outcome.sink_deliveries.push(SinkDelivery { sink_name: sink_name.clone(), token, row });
                    }
                    ErrorRoute::Discard => outcome.discarded.push(token),
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    fn step_gate(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        recorder: &mut dyn AuditRecorder,
        tokens: &mut TokenManager,
        run_id: RunId,
        node_id: &NodeId,
        token: Token,
        row: Value,
        contract: &SchemaContract,
        fork_to: &[String],
        now: Timestamp,
        queue: &mut Vec<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let step_index = graph.step_index(node_id).unwrap_or_default();
        let state_id = recorder.begin_node_state(run_id, token.token_id, node_id.clone(), step_index, None, now)?;
        let ctx = PluginContext { run_id, node_id: node_id.clone() };
        let plugin =
            plugins.gates.get(node_id).ok_or_else(|| OrchestratorError::Invariant(format!("no gate plugin registered for {node_id}")))?;
        let result = plugin.evaluate(&row, &ctx);
        recorder.complete_node_state(state_id, NodeStateStatus::Completed, None, None, now)?;

        let route_label = match &result.action {
            GateAction::Continue => "continue".to_string(),
            GateAction::RouteToSink(label) | GateAction::RouteTo(label) => label.clone(),
        };
        let destination = graph.get_route_resolution_map().get(&(node_id.clone(), route_label.clone())).cloned();
        match destination {
            Some(RouteDestination::Sink(sink_name)) => {
                let sink_id = graph
                    .get_sink_id_map()
                    .get(&sink_name)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::RouteValidation(format!("unknown sink {sink_name}")))?;
                queue.push(WorkItem { node_id: sink_id, token, row: result.row, contract: contract.clone() });
            }
            Some(RouteDestination::ProcessingNode(target)) => {
                queue.push(WorkItem { node_id: target, token, row: result.row, contract: contract.clone() });
            }
            Some(RouteDestination::Fork) => {
                let children = tokens.fork(&token, fork_to, now);
                for (ordinal, (branch_name, child)) in fork_to.iter().zip(children).enumerate() {
                    let Some(edge) = graph.edge_by_label(node_id, branch_name) else {
                        return Err(OrchestratorError::RouteValidation(format!("fork branch {branch_name} has no edge")));
                    };
                    let (edge_id, target) = (edge.edge_id, edge.to_node.clone());
                    let Some(fork_group_id) = child.fork_group_id else {
                        return Err(OrchestratorError::Invariant(format!("forked child for branch {branch_name} has no fork_group_id")));
                    };
                    recorder.record_routing_event(
                        state_id,
                        edge_id,
                        fork_group_id,
                        u32::try_from(ordinal).unwrap_or(u32::MAX),
                        crate::model::RoutingMode::Copy,
                        None,
                        None,
                        now,
                    )?;
                    queue.push(WorkItem { node_id: target, token: child, row: result.row.clone(), contract: contract.clone() });
                }
            }
            None => {
                return Err(OrchestratorError::RouteValidation(format!(
                    "gate {node_id} has no resolution for route {route_label:?}"
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    fn step_coalesce(
        &mut self,
        graph: &ExecutionGraph,
        config: &ProcessorConfig,
        tokens: &mut TokenManager,
        coalesce_name: &str,
        node_id: &NodeId,
        token: Token,
        row: Value,
        contract: SchemaContract,
        now: Timestamp,
        queue: &mut Vec<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let Some(coalesce_config) = config.coalesce.get(coalesce_name) else {
            return Err(OrchestratorError::Invariant(format!("no coalesce configuration for {coalesce_name}")));
        };
        let Some(fork_group_id) = token.fork_group_id else {
            return Err(OrchestratorError::Invariant(format!(
                "token {} arrived at coalesce {coalesce_name} with no fork_group_id",
                token.token_id
            )));
        };
        let branch_name = token.branch_name.clone().unwrap_or_default();

        let submit = self
            .coalesce
            .submit(coalesce_name, coalesce_config, fork_group_id, token, branch_name, row, contract, now, tokens)
            .map_err(|err| OrchestratorError::Invariant(err.to_string()))?;

        if let CoalesceSubmitOutcome::Emit { token, row, contract } = submit {
            if let Some(next) = Self::next_via_continue(graph, node_id) {
                queue.push(WorkItem { node_id: next, token, row, contract });
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    fn step_aggregation(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        config: &ProcessorConfig,
        tokens: &mut TokenManager,
        run_id: RunId,
        node_id: &NodeId,
        token: Token,
        row: Value,
        output_schema: &SchemaContract,
        now: Timestamp,
        queue: &mut Vec<WorkItem>,
    ) -> Result<(), OrchestratorError> {
        let Some(agg_config) = config.aggregation.get(node_id) else {
            return Err(OrchestratorError::Invariant(format!("no aggregation configuration for {node_id}")));
        };
        let plugin = plugins
            .aggregations
            .get(node_id)
            .ok_or_else(|| OrchestratorError::Invariant(format!("no batch transform plugin registered for {node_id}")))?;
        let ctx = PluginContext { run_id, node_id: node_id.clone() };
        let node_key = node_id.as_str().to_string();

        let submit = self.aggregation.submit(&node_key, agg_config, *plugin, &ctx, token, row, now, tokens);
        match submit {
            AggregationSubmitOutcome::Emit { rows, tokens: out_tokens } => {
                if let Some(next) = Self::next_via_continue(graph, node_id) {
                    for (out_row, out_token) in rows.into_iter().zip(out_tokens) {
                        queue.push(WorkItem { node_id: next.clone(), token: out_token, row: out_row, contract: output_schema.clone() });
                    }
                }
            }
            AggregationSubmitOutcome::Buffered => {}
            AggregationSubmitOutcome::Error { .. } => {
                // Batch failure is surfaced to the orchestrator via the
                // aggregation's own transform_errors entry at flush time; no
                // per-row token exists yet to attach it to here.
            }
        }
        Ok(())
    }

    fn next_via_continue(graph: &ExecutionGraph, node_id: &NodeId) -> Option<NodeId> {
        graph.edge_by_label(node_id, "continue").map(|edge| edge.to_node.clone())
    }

    /// Force-flushes every held coalesce group regardless of elapsed time,
    /// continuing `Emit` outcomes downstream. Used at run end so no coalesce
    /// is left silently buffered.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] under the same conditions as
    /// [`Self::flush_expired_coalesces`].
    #[allow(clippy::too_many_arguments, reason = "graph traversal needs the full run context")]
    pub fn flush_all_coalesces(
        &mut self,
        graph: &ExecutionGraph,
        plugins: &PluginSet<'_>,
        config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        tokens: &mut TokenManager,
        run_id: RunId,
        now: Timestamp,
    ) -> Result<RowOutcome, OrchestratorError> {
        let expired = self
            .coalesce
            .force_flush_all(&config.coalesce, now, tokens)
            .map_err(|err| OrchestratorError::Invariant(err.to_string()))?;

        let mut queue = Vec::new();
        let mut discarded = Vec::new();
        for ((_, coalesce_name), result) in expired {
            let node_id = graph
                .get_coalesce_id_map()
                .get(&coalesce_name)
                .cloned()
                .ok_or_else(|| OrchestratorError::Invariant(format!("no coalesce node for {coalesce_name}")))?;
            match result {
                CoalesceTimeoutOutcome::Emit { token, row, contract } => {
                    if let Some(next) = Self::next_via_continue(graph, &node_id) {
                        queue.push(WorkItem { node_id: next, token, row, contract });
                    }
                }
                CoalesceTimeoutOutcome::Failed { tokens: failed } => discarded.extend(failed),
            }
        }
        let mut outcome = self.drain_queue(graph, plugins, config, recorder, tokens, run_id, now, queue)?;
        outcome.discarded.extend(discarded);
        Ok(outcome)
    }

    /// Returns the current buffered snapshot for `node_id`'s aggregation, if
    /// any rows are held, for inclusion in a checkpoint.
    #[must_use]
    pub fn aggregation_snapshot(&self, node_id: &NodeId) -> Option<&crate::aggregation::AggregationSnapshot> {
        self.aggregation.snapshot(node_id.as_str())
    }

    /// Restores a previously checkpointed aggregation snapshot for `node_id`,
    /// replacing any buffer already held for that node.
    pub fn restore_aggregation(&mut self, node_id: &NodeId, snapshot: crate::aggregation::AggregationSnapshot) {
        self.aggregation.restore(node_id.as_str().to_string(), snapshot);
    }
}
