// crates/auditflow-core/src/orchestrator.rs
// ============================================================================
// Module: Orchestrator
// Description: Drives one run end to end: graph install, schema negotiation,
//              source iteration, checkpointing, sink delivery, and resume.
// Purpose: The single entry point that turns a set of plugin specs and live
//          plugin instances into a fully audited run.
// Dependencies: crate::{aggregation, checkpoint, config, error, graph,
//               hashing, identifiers, model, payload, plugins, recorder,
//               row_processor, schema, time, token_manager}
// ============================================================================

//! ## Overview
//! The orchestrator owns no durable state itself — every fact it produces is
//! handed to the [`crate::recorder::AuditRecorder`] immediately. Its own
//! fields (`row_processor`, `tokens`, `checkpoint_manager`) are the in-memory
//! working set a crashed process loses and a resumed one must rebuild from
//! the recorder and the payload store. A fresh run and a resumed run share
//! almost every step; the two differ only in where their rows come from
//! (the source plugin versus rehydrated payloads) and in which bookkeeping
//! (`begin_run`, graph installation, schema negotiation) has already
//! happened before this process started.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::Value;

use crate::aggregation::AggregationSnapshot;
use crate::checkpoint::CheckpointManager;
use crate::checkpoint::can_resume;
use crate::checkpoint::check_format_version;
use crate::checkpoint::get_unprocessed_row_data;
use crate::checkpoint::unprocessed_row_ids;
use crate::config::OrchestratorConfig;
use crate::error::CheckpointError;
use crate::error::OrchestratorError;
use crate::graph::ExecutionGraph;
use crate::graph::NodeSpec;
use crate::hashing::DEFAULT_HASH_ALGORITHM;
use crate::hashing::HashDigest;
use crate::hashing::canonical_json_bytes;
use crate::hashing::hash_bytes;
use crate::hashing::hash_canonical_json;
use crate::identifiers::NodeId;
use crate::identifiers::RowId;
use crate::identifiers::RunId;
use crate::identifiers::TokenId;
use crate::model::ExportStatus;
use crate::model::NodeStateStatus;
use crate::model::NodeType;
use crate::model::RoutingMode;
use crate::model::RunStatus;
use crate::model::Token;
use crate::model::TokenOutcomeKind;
use crate::payload::PayloadStore;
use crate::plugins::ArtifactDescriptor;
use crate::plugins::BatchTransform;
use crate::plugins::Gate;
use crate::plugins::PluginContext;
use crate::plugins::PluginError;
use crate::plugins::Sink;
use crate::plugins::Source;
use crate::plugins::SourceRow;
use crate::plugins::Transform;
use crate::recorder::AuditRecorder;
use crate::row_processor::PluginSet;
use crate::row_processor::ProcessorConfig;
use crate::row_processor::RowOutcome;
use crate::row_processor::RowProcessor;
use crate::row_processor::SinkDelivery;
use crate::schema::SchemaContract;
use crate::time::Timestamp;
use crate::token_manager::TokenManager;

// ============================================================================
// SECTION: Plugin Bundle
// ============================================================================

/// Live plugin instances for one run. Sources and sinks are driven directly
/// by the orchestrator; transforms, gates, and aggregations are looked up by
/// [`crate::row_processor::RowProcessor`] through the [`PluginSet`] built
/// from this bundle's last three fields.
pub struct RunPlugins<'a> {
    /// The run's single source.
    pub source: &'a mut dyn Source,
    /// Sink plugin by sink name.
    pub sinks: BTreeMap<String, &'a mut dyn Sink>,
    /// Transform plugin by transform node.
    pub transforms: BTreeMap<NodeId, &'a dyn Transform>,
    /// Gate plugin by gate node.
    pub gates: BTreeMap<NodeId, &'a dyn Gate>,
    /// Batch transform plugin by aggregation node.
    pub aggregations: BTreeMap<NodeId, &'a dyn BatchTransform>,
}

fn plugin_set<'a>(
    transforms: &BTreeMap<NodeId, &'a dyn Transform>,
    gates: &BTreeMap<NodeId, &'a dyn Gate>,
    aggregations: &BTreeMap<NodeId, &'a dyn BatchTransform>,
) -> PluginSet<'a> {
    PluginSet { transforms: transforms.clone(), gates: gates.clone(), aggregations: aggregations.clone() }
}

/// Exports a completed run's audit trail to an external destination (a file,
/// an object store, a downstream index). Out of scope: what the export
/// actually contains; this crate only records whether it succeeded.
pub trait Exporter {
    /// Performs the export, reading whatever the implementation needs from
    /// `recorder`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable failure message; the orchestrator records it
    /// on the run via [`AuditRecorder::set_export_status`] and otherwise
    /// leaves the run's terminal status unaffected.
    fn export(&mut self, run_id: RunId, recorder: &dyn AuditRecorder) -> Result<(), String>;
}

// ============================================================================
// SECTION: Results
// ============================================================================

/// Summary of one completed, interrupted, or resumed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// The run summarized.
    pub run_id: RunId,
    /// Terminal status the run finished in.
    pub status: RunStatus,
    /// Source rows observed this invocation (fresh rows for a new run,
    /// replayed rows for a resume).
    pub rows_seen: u64,
    /// Tokens that reached a sink successfully.
    pub rows_completed: u64,
    /// Rows diverted to the quarantine sink.
    pub rows_quarantined: u64,
    /// Tokens that ended in `Failed` or `Skipped`.
    pub rows_failed: u64,
    /// Wall-clock time this invocation began.
    pub started_at: Timestamp,
    /// Wall-clock time this invocation reached a terminal status.
    pub completed_at: Timestamp,
}

#[derive(Debug, Default)]
struct RunStats {
    rows_seen: u64,
    rows_completed: u64,
    rows_quarantined: u64,
    rows_failed: u64,
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Drives one run's rows through its [`ExecutionGraph`], owning the
/// in-process state ([`RowProcessor`]'s coalesce/aggregation buffers,
/// [`TokenManager`]'s counters, [`CheckpointManager`]'s schedule) that a
/// resumed process must rebuild rather than inherit.
pub struct Orchestrator {
    row_processor: RowProcessor,
    tokens: TokenManager,
    checkpoint_manager: CheckpointManager,
    config: OrchestratorConfig,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Creates an orchestrator from a fresh configuration.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        let checkpoint_manager = CheckpointManager::new(config.checkpoint.clone());
        let row_processor = RowProcessor::with_max_workers(config.concurrency.max_workers);
        Self { row_processor, tokens: TokenManager::new(), checkpoint_manager, config, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// Returns a handle the caller may set from a signal handler to request
    /// a cooperative shutdown; observed at most once per source row.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Starts a new run: opens it, builds and installs its graph, negotiates
    /// the source's schema contract, then drives every row the source yields
    /// to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] on any graph, recorder, payload, or
    /// plugin failure. The run is finalized as `Failed` before the error is
    /// returned, except when graph construction itself fails before the
    /// graph can be installed.
    #[allow(clippy::too_many_arguments, reason = "starting a run needs the full run context")]
    pub fn run(
        &mut self,
        specs: Vec<NodeSpec>,
        plugins: &mut RunPlugins<'_>,
        processor_config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        payload_store: &dyn PayloadStore,
        exporter: Option<&mut dyn Exporter>,
    ) -> Result<RunSummary, OrchestratorError> {
        let started_at = Timestamp::now();
        let config_hash = build_config_hash(&specs);
        let run_id = recorder.begin_run(config_hash, DEFAULT_HASH_ALGORITHM.canonical_version().to_string(), started_at)?;

        let graph = match ExecutionGraph::from_plugin_specs(run_id, specs) {
            Ok(graph) => graph,
            Err(err) => {
                let _ = recorder.finalize_run(run_id, RunStatus::Failed, Timestamp::now());
                return Err(err.into());
            }
        };

        match self.run_fresh(run_id, &graph, plugins, processor_config, recorder, payload_store, started_at) {
            Ok(summary) => {
                if let Some(exporter) = exporter {
                    record_export(recorder, run_id, exporter);
                }
                Ok(summary)
            }
            Err(err) => {
                let _ = recorder.finalize_run(run_id, RunStatus::Failed, Timestamp::now());
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments, reason = "driving one run needs the full run context")]
    fn run_fresh(
        &mut self,
        run_id: RunId,
        graph: &ExecutionGraph,
        plugins: &mut RunPlugins<'_>,
        processor_config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        payload_store: &dyn PayloadStore,
        started_at: Timestamp,
    ) -> Result<RunSummary, OrchestratorError> {
        install_graph(recorder, run_id, graph)?;
        negotiate_schema_contract(recorder, run_id, graph, &*plugins.source)?;

        let RunPlugins { source, sinks, transforms, gates, aggregations } = plugins;
        let plugins_set = plugin_set(transforms, gates, aggregations);
        start_plugins(&mut **source, sinks, graph, run_id)?;

        let mut stats = RunStats::default();
        let entry_node = entry_point(graph);
        let source_ctx = PluginContext { run_id, node_id: graph.source() };
        let rows = source.load(&source_ctx).map_err(|err| external(graph.source(), err))?;

        let mut row_index = 0u64;
        for source_row in rows {
            let now = Timestamp::now();
            stats.rows_seen += 1;
            match source_row {
                SourceRow::Valid { data, contract } => {
                    let row_id = record_new_row(recorder, payload_store, run_id, graph.source(), row_index, &data, now)?;
                    let token = self.tokens.create_original(row_id, now);
                    recorder.create_token(run_id, token.clone())?;
                    self.process_token_and_settle(
                        graph, &plugins_set, sinks, processor_config, recorder, run_id, entry_node.clone(), token.clone(), data, contract,
                        now, &mut stats,
                    )?;
                    if self.checkpoint_manager.observe_row() {
                        self.take_checkpoint(recorder, graph, run_id, token.token_id, &entry_node, now);
                    }
                }
                SourceRow::Quarantined { data, error, destination } => {
                    stats.rows_quarantined += 1;
                    self.quarantine_row(graph, sinks, recorder, payload_store, run_id, row_index, data, error, destination, now)?;
                }
            }
            row_index += 1;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }

        let interrupted = self.shutdown.load(Ordering::SeqCst);
        self.flush_all_buffers(graph, &plugins_set, sinks, processor_config, recorder, run_id, Timestamp::now(), &mut stats)?;
        stop_plugins(&mut **source, sinks, graph, run_id)?;

        let completed_at = Timestamp::now();
        let status = if interrupted { RunStatus::Interrupted } else { RunStatus::Completed };
        recorder.finalize_run(run_id, status, completed_at)?;

        Ok(RunSummary {
            run_id,
            status,
            rows_seen: stats.rows_seen,
            rows_completed: stats.rows_completed,
            rows_quarantined: stats.rows_quarantined,
            rows_failed: stats.rows_failed,
            started_at,
            completed_at,
        })
    }

    /// Resumes a run that ended `Failed` or `Interrupted`, replaying every
    /// row with no terminal outcome against the current graph.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::RunNotResumable`] (wrapped) when
    /// [`can_resume`] rejects the run, or any error [`Self::run`] can raise.
    /// Unlike [`Self::run`], a failure here does not finalize the run again;
    /// its last-recorded terminal status is left unchanged until this call
    /// either succeeds or the caller retries.
    #[allow(clippy::too_many_arguments, reason = "resuming a run needs the full run context")]
    pub fn resume(
        &mut self,
        run_id: RunId,
        specs: Vec<NodeSpec>,
        plugins: &mut RunPlugins<'_>,
        processor_config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        payload_store: &dyn PayloadStore,
        exporter: Option<&mut dyn Exporter>,
    ) -> Result<RunSummary, OrchestratorError> {
        let started_at = Timestamp::now();
        let run = recorder.get_run(run_id);
        let checkpoint = recorder.latest_checkpoint(run_id);
        let graph = ExecutionGraph::from_plugin_specs(run_id, specs)?;

        let check = can_resume(run.as_ref(), checkpoint.as_ref(), &graph);
        if !check.can_resume {
            return Err(CheckpointError::RunNotResumable { run_id, reason: check.reason }.into());
        }
        let checkpoint = checkpoint.ok_or(CheckpointError::NoCheckpointFound { run_id })?;
        check_format_version(&checkpoint, self.config.checkpoint.format_version)?;

        if let Some(highest) = recorder.highest_token_id(run_id) {
            self.tokens.seed_token_counter(highest.get());
        }
        restore_aggregation_state(&graph, &mut self.row_processor, &checkpoint.aggregation_state_json);
        let buffered = buffered_row_ids(&checkpoint.aggregation_state_json);

        let row_refs: Vec<(RowId, u64, Option<HashDigest>)> = unprocessed_row_ids(recorder, run_id, &buffered)
            .into_iter()
            .filter_map(|row_id| recorder.get_row(run_id, row_id))
            .map(|row| (row.row_id, row.row_index, row.source_data_ref))
            .collect();
        let unprocessed = get_unprocessed_row_data(&row_refs, payload_store)?;

        let RunPlugins { source, sinks, transforms, gates, aggregations } = plugins;
        let plugins_set = plugin_set(transforms, gates, aggregations);
        start_plugins(&mut **source, sinks, &graph, run_id)?;

        let mut stats = RunStats::default();
        let entry_node = entry_point(&graph);
        let contract = source_output_contract(&graph);

        for row in unprocessed {
            let now = Timestamp::now();
            stats.rows_seen += 1;
            let data: Value = serde_json::from_slice(&row.source_data)
                .map_err(|err| OrchestratorError::Invariant(format!("row {} payload is not valid json: {err}", row.row_id)))?;
            let token = self.tokens.create_original(row.row_id, now);
            recorder.create_token(run_id, token.clone())?;
            self.process_token_and_settle(
                &graph, &plugins_set, sinks, processor_config, recorder, run_id, entry_node.clone(), token.clone(), data, contract.clone(),
                now, &mut stats,
            )?;
            if self.checkpoint_manager.observe_row() {
                self.take_checkpoint(recorder, &graph, run_id, token.token_id, &entry_node, now);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }

        let interrupted = self.shutdown.load(Ordering::SeqCst);
        self.flush_all_buffers(&graph, &plugins_set, sinks, processor_config, recorder, run_id, Timestamp::now(), &mut stats)?;
        stop_plugins(&mut **source, sinks, &graph, run_id)?;

        let completed_at = Timestamp::now();
        let status = if interrupted { RunStatus::Interrupted } else { RunStatus::Completed };
        recorder.finalize_run(run_id, status, completed_at)?;

        if let Some(exporter) = exporter {
            record_export(recorder, run_id, exporter);
        }

        Ok(RunSummary {
            run_id,
            status,
            rows_seen: stats.rows_seen,
            rows_completed: stats.rows_completed,
            rows_quarantined: stats.rows_quarantined,
            rows_failed: stats.rows_failed,
            started_at,
            completed_at,
        })
    }

    #[allow(clippy::too_many_arguments, reason = "walking one token needs the full run context")]
    fn process_token_and_settle(
        &mut self,
        graph: &ExecutionGraph,
        plugins_set: &PluginSet<'_>,
        sinks: &mut BTreeMap<String, &mut dyn Sink>,
        processor_config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        run_id: RunId,
        entry_node: NodeId,
        token: Token,
        row: Value,
        contract: SchemaContract,
        now: Timestamp,
        stats: &mut RunStats,
    ) -> Result<(), OrchestratorError> {
        let outcome = self.row_processor.process_token(
            graph, plugins_set, processor_config, recorder, &mut self.tokens, run_id, entry_node, token, row, contract, now,
        )?;
        settle_outcome(recorder, graph, sinks, run_id, outcome, now, TokenOutcomeKind::Failed, stats)?;

        let expired = self.row_processor.flush_expired_coalesces(graph, plugins_set, processor_config, recorder, &mut self.tokens, run_id, now)?;
        settle_outcome(recorder, graph, sinks, run_id, expired, now, TokenOutcomeKind::Skipped, stats)
    }

    #[allow(clippy::too_many_arguments, reason = "quarantine bookkeeping needs the full run context")]
    fn quarantine_row(
        &mut self,
        graph: &ExecutionGraph,
        sinks: &mut BTreeMap<String, &mut dyn Sink>,
        recorder: &mut dyn AuditRecorder,
        payload_store: &dyn PayloadStore,
        run_id: RunId,
        row_index: u64,
        data: Value,
        error: String,
        destination: String,
        now: Timestamp,
    ) -> Result<(), OrchestratorError> {
        let source_id = graph.source();
        let row_id = record_new_row(recorder, payload_store, run_id, source_id.clone(), row_index, &data, now)?;
        let token = self.tokens.create_original(row_id, now);
        recorder.create_token(run_id, token.clone())?;

        let state_id = recorder.begin_node_state(run_id, token.token_id, source_id.clone(), 0, None, now)?;
        let error_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, error.as_bytes());
        recorder.complete_node_state(state_id, NodeStateStatus::Failed, None, Some(serde_json::json!({ "error": error })), now)?;

        let Some(edge) = graph.edge_by_label(&source_id, "__quarantine__") else {
            return Err(OrchestratorError::Invariant(format!(
                "source emitted a quarantined row but node {source_id} declares no quarantine route"
            )));
        };
        let edge_id = edge.edge_id;
        let sink_id = edge.to_node.clone();
        recorder.record_routing_event(
            state_id,
            edge_id,
            self.tokens.allocate_group(),
            0,
            RoutingMode::Divert,
            Some(error_hash.clone()),
            None,
            now,
        )?;

        let Some(sink) = sinks.get_mut(&destination) else {
            return Err(OrchestratorError::Invariant(format!("no sink plugin registered for quarantine destination {destination}")));
        };
        match deliver_sink(recorder, run_id, &sink_id, &mut **sink, &data, now) {
            Ok(_) => {
                recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Quarantined, Some(destination), Some(error_hash), now)?;
                Ok(())
            }
            Err(err) => {
                recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Failed, None, None, now)?;
                Err(err)
            }
        }
    }

    fn take_checkpoint(
        &mut self,
        recorder: &mut dyn AuditRecorder,
        graph: &ExecutionGraph,
        run_id: RunId,
        token_id: TokenId,
        node_id: &NodeId,
        now: Timestamp,
    ) {
        let state = build_aggregation_state(graph, &self.row_processor);
        let checkpoint = self.checkpoint_manager.build_checkpoint(run_id, token_id, node_id.clone(), graph, state, now);
        recorder.record_checkpoint(checkpoint);
    }

    #[allow(clippy::too_many_arguments, reason = "draining every held buffer needs the full run context")]
    fn flush_all_buffers(
        &mut self,
        graph: &ExecutionGraph,
        plugins_set: &PluginSet<'_>,
        sinks: &mut BTreeMap<String, &mut dyn Sink>,
        processor_config: &ProcessorConfig,
        recorder: &mut dyn AuditRecorder,
        run_id: RunId,
        now: Timestamp,
        stats: &mut RunStats,
    ) -> Result<(), OrchestratorError> {
        let coalesced = self.row_processor.flush_all_coalesces(graph, plugins_set, processor_config, recorder, &mut self.tokens, run_id, now)?;
        settle_outcome(recorder, graph, sinks, run_id, coalesced, now, TokenOutcomeKind::Skipped, stats)?;

        let aggregation_nodes: Vec<NodeId> =
            graph.nodes().iter().filter(|(_, node)| node.node_type == NodeType::Aggregation).map(|(id, _)| id.clone()).collect();
        for node_id in aggregation_nodes {
            let flushed =
                self.row_processor.force_flush_aggregation(graph, plugins_set, processor_config, recorder, &mut self.tokens, run_id, &node_id, now)?;
            settle_outcome(recorder, graph, sinks, run_id, flushed, now, TokenOutcomeKind::Skipped, stats)?;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Helper Functions
// ============================================================================

#[derive(Serialize)]
struct SpecSummary<'a> {
    plugin_name: &'a str,
    plugin_version: &'a str,
    config: &'a Value,
}

fn build_config_hash(specs: &[NodeSpec]) -> HashDigest {
    let parts: Vec<SpecSummary<'_>> =
        specs.iter().map(|spec| SpecSummary { plugin_name: &spec.plugin_name, plugin_version: &spec.plugin_version, config: &spec.config }).collect();
    hash_canonical_json(DEFAULT_HASH_ALGORITHM, &parts).unwrap_or_else(|_| hash_bytes(DEFAULT_HASH_ALGORITHM, b"config"))
}

fn install_graph(recorder: &mut dyn AuditRecorder, run_id: RunId, graph: &ExecutionGraph) -> Result<(), OrchestratorError> {
    for node in graph.nodes().values() {
        recorder.register_node(run_id, node.clone())?;
    }
    for edge in graph.edges() {
        recorder.register_edge(run_id, edge.edge_id, edge.from_node.clone(), edge.to_node.clone(), edge.label.clone())?;
    }
    for (sink_name, node_id) in graph.get_sink_id_map() {
        recorder.register_sink(run_id, sink_name.clone(), node_id.clone())?;
    }
    Ok(())
}

fn negotiate_schema_contract(recorder: &mut dyn AuditRecorder, run_id: RunId, graph: &ExecutionGraph, source: &dyn Source) -> Result<(), OrchestratorError> {
    let contract = source_output_contract(graph);
    let hash = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &contract).unwrap_or_else(|_| hash_bytes(DEFAULT_HASH_ALGORITHM, b"schema"));
    let raw = source.get_schema_contract().and_then(|c| serde_json::to_value(c).ok());
    recorder.set_schema_contract(run_id, contract, hash, raw)?;
    Ok(())
}

fn entry_point(graph: &ExecutionGraph) -> NodeId {
    graph.edge_by_label(&graph.source(), "continue").map(|edge| edge.to_node.clone()).unwrap_or_else(|| graph.source())
}

fn source_output_contract(graph: &ExecutionGraph) -> SchemaContract {
    graph.nodes().get(&graph.source()).and_then(|node| node.output_schema_contract.clone()).unwrap_or(SchemaContract::Observed)
}

fn external(node_id: NodeId, err: PluginError) -> OrchestratorError {
    OrchestratorError::External { node_id, message: err.message, retryable: err.retryable }
}

fn start_plugins(source: &mut dyn Source, sinks: &mut BTreeMap<String, &mut dyn Sink>, graph: &ExecutionGraph, run_id: RunId) -> Result<(), OrchestratorError> {
    source.on_start(&PluginContext { run_id, node_id: graph.source() }).map_err(|err| external(graph.source(), err))?;
    for (name, sink) in sinks.iter_mut() {
        let sink_id = graph.get_sink_id_map().get(name).cloned().unwrap_or_else(|| NodeId::new(name.clone()));
        sink.on_start(&PluginContext { run_id, node_id: sink_id.clone() }).map_err(|err| external(sink_id, err))?;
    }
    Ok(())
}

fn stop_plugins(source: &mut dyn Source, sinks: &mut BTreeMap<String, &mut dyn Sink>, graph: &ExecutionGraph, run_id: RunId) -> Result<(), OrchestratorError> {
    let source_ctx = PluginContext { run_id, node_id: graph.source() };
    source.on_complete(&source_ctx).map_err(|err| external(graph.source(), err))?;
    source.close().map_err(|err| external(graph.source(), err))?;
    for (name, sink) in sinks.iter_mut() {
        let sink_id = graph.get_sink_id_map().get(name).cloned().unwrap_or_else(|| NodeId::new(name.clone()));
        let ctx = PluginContext { run_id, node_id: sink_id.clone() };
        sink.on_complete(&ctx).map_err(|err| external(sink_id.clone(), err))?;
        sink.close().map_err(|err| external(sink_id, err))?;
    }
    Ok(())
}

fn record_export(recorder: &mut dyn AuditRecorder, run_id: RunId, exporter: &mut dyn Exporter) {
    match exporter.export(run_id, recorder) {
        Ok(()) => {
            let _ = recorder.set_export_status(run_id, ExportStatus::Completed, None);
        }
        Err(message) => {
            let _ = recorder.set_export_status(run_id, ExportStatus::Failed, Some(message));
        }
    }
}

fn record_new_row(
    recorder: &mut dyn AuditRecorder,
    payload_store: &dyn PayloadStore,
    run_id: RunId,
    source_id: NodeId,
    row_index: u64,
    data: &Value,
    now: Timestamp,
) -> Result<RowId, OrchestratorError> {
    let bytes = canonical_json_bytes(data).unwrap_or_else(|_| data.to_string().into_bytes());
    let source_data_hash = hash_bytes(DEFAULT_HASH_ALGORITHM, &bytes);
    let source_data_ref = payload_store.put(DEFAULT_HASH_ALGORITHM, &bytes)?;
    let row_id = recorder.create_row(run_id, source_id, row_index, source_data_hash, Some(source_data_ref), now)?;
    Ok(row_id)
}

fn deliver_sink(
    recorder: &mut dyn AuditRecorder,
    run_id: RunId,
    node_id: &NodeId,
    sink: &mut dyn Sink,
    row: &Value,
    now: Timestamp,
) -> Result<ArtifactDescriptor, OrchestratorError> {
    let ctx = PluginContext { run_id, node_id: node_id.clone() };
    let input_hash = hash_canonical_json(DEFAULT_HASH_ALGORITHM, row).ok();
    let operation_id = recorder.begin_operation(run_id, node_id.clone(), "sink_write".to_string(), input_hash, now);
    match sink.write(std::slice::from_ref(row), &ctx) {
        Ok(descriptor) => {
            recorder.complete_operation(operation_id, crate::model::OperationStatus::Completed, Some(descriptor.content_hash.clone()), None, now)?;
            Ok(descriptor)
        }
        Err(err) => {
            recorder.complete_operation(operation_id, crate::model::OperationStatus::Failed, None, Some(err.message.clone()), now)?;
            Err(external(node_id.clone(), err))
        }
    }
}

fn finish_sink_delivery(
    recorder: &mut dyn AuditRecorder,
    graph: &ExecutionGraph,
    sinks: &mut BTreeMap<String, &mut dyn Sink>,
    run_id: RunId,
    delivery: SinkDelivery,
    now: Timestamp,
    stats: &mut RunStats,
) -> Result<(), OrchestratorError> {
    let SinkDelivery { sink_name, token, row } = delivery;
    let Some(sink_id) = graph.get_sink_id_map().get(&sink_name).cloned() else {
        return Err(OrchestratorError::RouteValidation(format!("delivery names unknown sink {sink_name:?}")));
    };
    let step_index = graph.step_index(&sink_id).unwrap_or(u32::MAX);
    let state_id = recorder.begin_node_state(run_id, token.token_id, sink_id.clone(), step_index, None, now)?;
    let Some(sink) = sinks.get_mut(&sink_name) else {
        return Err(OrchestratorError::Invariant(format!("no sink plugin registered for {sink_name:?}")));
    };
    match deliver_sink(recorder, run_id, &sink_id, &mut **sink, &row, now) {
        Ok(descriptor) => {
            recorder.complete_node_state(state_id, NodeStateStatus::Completed, Some(descriptor.content_hash), None, now)?;
            recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Completed, Some(sink_name), None, now)?;
            stats.rows_completed += 1;
            Ok(())
        }
        Err(err) => {
            recorder.complete_node_state(state_id, NodeStateStatus::Failed, None, None, now)?;
            recorder.record_token_outcome(run_id, token.token_id, TokenOutcomeKind::Failed, None, None, now)?;
            stats.rows_failed += 1;
            Err(err)
        }
    }
}

fn settle_outcome(
    recorder: &mut dyn AuditRecorder,
    graph: &ExecutionGraph,
    sinks: &mut BTreeMap<String, &mut dyn Sink>,
    run_id: RunId,
    outcome: RowOutcome,
    now: Timestamp,
    discard_kind: TokenOutcomeKind,
    stats: &mut RunStats,
) -> Result<(), OrchestratorError> {
    for delivery in outcome.sink_deliveries {
        finish_sink_delivery(recorder, graph, sinks, run_id, delivery, now, stats)?;
    }
    for token in outcome.discarded {
        recorder.record_token_outcome(run_id, token.token_id, discard_kind, None, None, now)?;
        stats.rows_failed += 1;
    }
    Ok(())
}

fn build_aggregation_state(graph: &ExecutionGraph, row_processor: &RowProcessor) -> Value {
    let mut map = serde_json::Map::new();
    for (node_id, node) in graph.nodes() {
        if node.node_type != NodeType::Aggregation {
            continue;
        }
        if let Some(snapshot) = row_processor.aggregation_snapshot(node_id) {
            if let Ok(value) = serde_json::to_value(snapshot) {
                map.insert(node_id.to_string(), value);
            }
        }
    }
    Value::Object(map)
}

fn restore_aggregation_state(graph: &ExecutionGraph, row_processor: &mut RowProcessor, state: &Value) {
    let Some(map) = state.as_object() else { return };
    for (node_id_str, value) in map {
        if !graph.nodes().contains_key(&NodeId::new(node_id_str.clone())) {
            continue;
        }
        if let Ok(snapshot) = serde_json::from_value::<AggregationSnapshot>(value.clone()) {
            row_processor.restore_aggregation(&NodeId::new(node_id_str.clone()), snapshot);
        }
    }
}

fn buffered_row_ids(state: &Value) -> BTreeSet<RowId> {
    let mut rows = BTreeSet::new();
    let Some(map) = state.as_object() else { return rows };
    for value in map.values() {
        if let Ok(snapshot) = serde_json::from_value::<AggregationSnapshot>(value.clone()) {
            rows.extend(snapshot.tokens.iter().map(|token| token.row_id));
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ErrorRoute;
    use crate::graph::NodeKind;
    use crate::model::Determinism;
    use crate::plugins::GateAction;
    use crate::plugins::GateResult;
    use crate::plugins::TransformResult;
    use crate::recorder::InMemoryRecorder;
    use crate::payload::InMemoryPayloadStore;

    struct CountingSource {
        rows: Vec<Value>,
    }

    impl Source for CountingSource {
        fn load(&mut self, _ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow> + '_>, PluginError> {
            let rows = std::mem::take(&mut self.rows);
            Ok(Box::new(rows.into_iter().map(|data| SourceRow::Valid { data, contract: SchemaContract::Observed })))
        }
    }

    #[derive(Default)]
    struct CapturingSink {
        written: Vec<Value>,
    }

    impl Sink for CapturingSink {
        fn write(&mut self, rows: &[Value], _ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError> {
            self.written.extend(rows.iter().cloned());
            Ok(ArtifactDescriptor { path: "memory".to_string(), size: rows.len() as u64, content_hash: hash_bytes(DEFAULT_HASH_ALGORITHM, b"sink") })
        }
    }

    #[test]
    #[allow(clippy::redundant_clone, reason = "exercise clone paths used throughout the run loop")]
    fn run_drives_every_row_to_a_sink() {
        let specs = vec![
            NodeSpec {
                plugin_name: "source".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: serde_json::json!({}),
                kind: NodeKind::Source { on_success: "clean".to_string(), quarantine_sink: None, output_schema: SchemaContract::Observed },
            },
            NodeSpec {
                plugin_name: "sink".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoWrite,
                config: serde_json::json!({}),
                kind: NodeKind::Sink { name: "clean".to_string() },
            },
        ];

        let mut source = CountingSource { rows: vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})] };
        let mut sink = CapturingSink::default();
        let mut sinks: BTreeMap<String, &mut dyn Sink> = BTreeMap::new();
        sinks.insert("clean".to_string(), &mut sink);
        let mut plugins = RunPlugins { source: &mut source, sinks, transforms: BTreeMap::new(), gates: BTreeMap::new(), aggregations: BTreeMap::new() };

        let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let mut recorder = InMemoryRecorder::new();
        let payload_store = InMemoryPayloadStore::new();
        let processor_config = ProcessorConfig::default();

        let summary = orchestrator.run(specs, &mut plugins, &processor_config, &mut recorder, &payload_store, None).unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.rows_seen, 2);
        assert_eq!(summary.rows_completed, 2);
        assert_eq!(sink.written.len(), 2);
    }

    #[test]
    fn run_routes_a_transform_on_error_diversion_to_a_sink() {
        struct AlwaysErrors;
        impl Transform for AlwaysErrors {
            fn process(&self, _row: &Value, _ctx: &PluginContext) -> TransformResult {
                TransformResult::Error { reason: "bad".to_string(), retryable: false }
            }
        }

        let specs = vec![
            NodeSpec {
                plugin_name: "source".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: serde_json::json!({}),
                kind: NodeKind::Source { on_success: "raw".to_string(), quarantine_sink: None, output_schema: SchemaContract::Observed },
            },
            NodeSpec {
                plugin_name: "fails".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::Deterministic,
                config: serde_json::json!({}),
                kind: NodeKind::Transform {
                    input: "raw".to_string(),
                    on_success: "clean".to_string(),
                    on_error: ErrorRoute::Sink("errors".to_string()),
                    input_schema: SchemaContract::Observed,
                    output_schema: SchemaContract::Observed,
                },
            },
            NodeSpec {
                plugin_name: "sink".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoWrite,
                config: serde_json::json!({}),
                kind: NodeKind::Sink { name: "clean".to_string() },
            },
            NodeSpec {
                plugin_name: "errors".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoWrite,
                config: serde_json::json!({}),
                kind: NodeKind::Sink { name: "errors".to_string() },
            },
        ];

        let graph = ExecutionGraph::from_plugin_specs(RunId::from_raw(1).unwrap(), specs.clone()).unwrap();
        let transform_node = graph.get_transform_id_map().get("raw").cloned().unwrap();
        let transform = AlwaysErrors;

        let mut source = CountingSource { rows: vec![serde_json::json!({"n": 1})] };
        let mut clean_sink = CapturingSink::default();
        let mut error_sink = CapturingSink::default();
        let mut sinks: BTreeMap<String, &mut dyn Sink> = BTreeMap::new();
        sinks.insert("clean".to_string(), &mut clean_sink);
        sinks.insert("errors".to_string(), &mut error_sink);
        let mut transforms: BTreeMap<NodeId, &dyn Transform> = BTreeMap::new();
        transforms.insert(transform_node, &transform);
        let mut plugins = RunPlugins { source: &mut source, sinks, transforms, gates: BTreeMap::new(), aggregations: BTreeMap::new() };

        let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let mut recorder = InMemoryRecorder::new();
        let payload_store = InMemoryPayloadStore::new();
        let processor_config = ProcessorConfig::default();

        let summary = orchestrator.run(specs, &mut plugins, &processor_config, &mut recorder, &payload_store, None).unwrap();
        assert_eq!(summary.rows_completed, 1);
        assert_eq!(error_sink.written.len(), 1);
        assert!(clean_sink.written.is_empty());
    }

    #[test]
    fn quarantined_row_reaches_the_quarantine_sink() {
        let specs = vec![
            NodeSpec {
                plugin_name: "source".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: serde_json::json!({}),
                kind: NodeKind::Source { on_success: "clean".to_string(), quarantine_sink: Some("quarantine".to_string()), output_schema: SchemaContract::Observed },
            },
            NodeSpec {
                plugin_name: "sink".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoWrite,
                config: serde_json::json!({}),
                kind: NodeKind::Sink { name: "clean".to_string() },
            },
            NodeSpec {
                plugin_name: "quarantine_sink".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoWrite,
                config: serde_json::json!({}),
                kind: NodeKind::Sink { name: "quarantine".to_string() },
            },
        ];

        struct QuarantiningSource {
            emitted: bool,
        }
        impl Source for QuarantiningSource {
            fn load(&mut self, _ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow> + '_>, PluginError> {
                self.emitted = true;
                Ok(Box::new(std::iter::once(SourceRow::Quarantined {
                    data: serde_json::json!({"bad": true}),
                    error: "invalid".to_string(),
                    destination: "quarantine".to_string(),
                })))
            }
        }

        let mut source = QuarantiningSource { emitted: false };
        let mut clean_sink = CapturingSink::default();
        let mut quarantine_sink = CapturingSink::default();
        let mut sinks: BTreeMap<String, &mut dyn Sink> = BTreeMap::new();
        sinks.insert("clean".to_string(), &mut clean_sink);
        sinks.insert("quarantine".to_string(), &mut quarantine_sink);
        let mut plugins = RunPlugins { source: &mut source, sinks, transforms: BTreeMap::new(), gates: BTreeMap::new(), aggregations: BTreeMap::new() };

        let mut orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let mut recorder = InMemoryRecorder::new();
        let payload_store = InMemoryPayloadStore::new();
        let processor_config = ProcessorConfig::default();

        let summary = orchestrator.run(specs, &mut plugins, &processor_config, &mut recorder, &payload_store, None).unwrap();
        assert_eq!(summary.rows_quarantined, 1);
        assert_eq!(quarantine_sink.written.len(), 1);
        assert!(clean_sink.written.is_empty());
    }

    #[test]
    fn new_threads_concurrency_config_max_workers_into_the_row_processor() {
        let mut config = OrchestratorConfig::default();
        config.concurrency.max_workers = 8;
        let orchestrator = Orchestrator::new(config);
        assert_eq!(orchestrator.row_processor.max_workers(), 8);
    }

    #[test]
    fn new_clamps_a_zero_max_workers_to_one() {
        let mut config = OrchestratorConfig::default();
        config.concurrency.max_workers = 0;
        let orchestrator = Orchestrator::new(config);
        assert_eq!(orchestrator.row_processor.max_workers(), 1);
    }

    #[allow(dead_code)]
    fn unused_imports_guard(_: GateAction, _: GateResult) {}
}
