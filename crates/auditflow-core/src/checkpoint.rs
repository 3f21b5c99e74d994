// crates/auditflow-core/src/checkpoint.rs
// ============================================================================
// Module: Checkpoint and Recovery
// Description: Periodic progress snapshots and resume-time precondition
//              checks.
// Purpose: Let a failed or interrupted run resume without redoing completed
//          work or silently reinterpreting a resume as a fresh run.
// Dependencies: crate::{config, error, graph, hashing, identifiers, model,
//               payload, recorder, schema, time}
// ============================================================================

//! ## Overview
//! A checkpoint is taken at most as often as `CheckpointConfig::frequency`
//! allows and records enough of the graph's shape (`upstream_topology_hash`,
//! `checkpoint_node_config_hash`) that resuming against a changed
//! configuration is rejected rather than silently corrupting the audit
//! trail. Per the open question on additive routes, the topology hash is
//! computed only over `Move`/`Copy` edges reachable backward from the
//! checkpoint node — purely additive `Divert` edges do not invalidate an
//! existing checkpoint.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::config::CheckpointConfig;
use crate::config::CheckpointFrequency;
use crate::error::CheckpointError;
use crate::error::PayloadError;
use crate::graph::ExecutionGraph;
use crate::hashing::DEFAULT_HASH_ALGORITHM;
use crate::hashing::HashDigest;
use crate::hashing::hash_canonical_json;
use crate::identifiers::NodeId;
use crate::identifiers::RowId;
use crate::identifiers::RunId;
use crate::identifiers::TokenId;
use crate::model::Checkpoint;
use crate::model::EdgeMode;
use crate::model::Node;
use crate::model::Run;
use crate::model::RunStatus;
use crate::payload::PayloadStore;
use crate::recorder::AuditRecorder;
use crate::time::Timestamp;

/// Tracks when the next checkpoint is due and builds checkpoint records.
#[derive(Debug)]
pub struct CheckpointManager {
    config: CheckpointConfig,
    rows_since_checkpoint: u32,
    next_sequence: u64,
}

impl CheckpointManager {
    /// Creates a manager starting from sequence number `0`.
    #[must_use]
    pub const fn new(config: CheckpointConfig) -> Self {
        Self { config, rows_since_checkpoint: 0, next_sequence: 1 }
    }

    /// Records that one source row was processed, returning whether a
    /// checkpoint is due.
    pub fn observe_row(&mut self) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.rows_since_checkpoint += 1;
        match self.config.frequency {
            CheckpointFrequency::EveryRow => true,
            CheckpointFrequency::EveryN { n } => {
                let n = n.max(1);
                if self.rows_since_checkpoint >= n {
                    self.rows_since_checkpoint = 0;
                    true
                } else {
                    false
                }
            }
            CheckpointFrequency::Never => false,
        }
    }

    /// Builds the next checkpoint record. Does not record it; the caller
    /// passes the result to [`AuditRecorder::record_checkpoint`].
    pub fn build_checkpoint(
        &mut self,
        run_id: RunId,
        token_id: TokenId,
        node_id: NodeId,
        graph: &ExecutionGraph,
        aggregation_state_json: Value,
        now: Timestamp,
    ) -> Checkpoint {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        let upstream_topology_hash = upstream_topology_hash(graph, &node_id);
        let checkpoint_node_config_hash = graph
            .nodes()
            .get(&node_id)
            .map_or_else(|| HashDigest::new(DEFAULT_HASH_ALGORITHM, node_id.as_str().as_bytes()), |node| node.config_hash.clone());
        Checkpoint {
            checkpoint_id: crate::identifiers::CheckpointId::new(std::num::NonZeroU64::MIN),
            run_id,
            token_id,
            node_id,
            sequence_number,
            aggregation_state_json,
            created_at: now,
            upstream_topology_hash,
            checkpoint_node_config_hash,
            format_version: self.config.format_version,
        }
    }
}

/// Hashes every node and edge upstream of `node_id`, following `Move`/`Copy`
/// edges backward only. `Divert` edges (quarantine/error side-channels) are
/// excluded, so adding one does not invalidate an existing checkpoint.
#[must_use]
pub fn upstream_topology_hash(graph: &ExecutionGraph, node_id: &NodeId) -> HashDigest {
    let mut visited = BTreeSet::new();
    let mut stack = vec![node_id.clone()];
    visited.insert(node_id.clone());
    while let Some(current) = stack.pop() {
        for edge in graph.edges().iter().filter(|e| e.to_node == current && e.default_mode != EdgeMode::Divert) {
            if visited.insert(edge.from_node.clone()) {
                stack.push(edge.from_node.clone());
            }
        }
    }
    let mut upstream_nodes: Vec<&Node> = graph.nodes().iter().filter(|(id, _)| visited.contains(*id)).map(|(_, n)| n).collect();
    upstream_nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    let node_hashes: Vec<&HashDigest> = upstream_nodes.iter().map(|n| &n.config_hash).collect();
    let mut upstream_edges: Vec<(&str, &str, &str)> = graph
        .edges()
        .iter()
        .filter(|e| visited.contains(&e.from_node) && visited.contains(&e.to_node) && e.default_mode != EdgeMode::Divert)
        .map(|e| (e.from_node.as_str(), e.to_node.as_str(), e.label.as_str()))
        .collect();
    upstream_edges.sort_unstable();
    hash_canonical_json(DEFAULT_HASH_ALGORITHM, &(node_hashes, upstream_edges))
        .unwrap_or_else(|_| HashDigest::new(DEFAULT_HASH_ALGORITHM, node_id.as_str().as_bytes()))
}

/// Structured result of a resumability check, per spec: distinguishes run
/// not found, still running, already completed, no checkpoint, topology
/// mismatch, and incompatible format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCheck {
    /// Whether `resume` may proceed.
    pub can_resume: bool,
    /// Human-readable reason, always populated even when `can_resume` is `true`.
    pub reason: String,
}

impl ResumeCheck {
    fn ok(reason: impl Into<String>) -> Self {
        Self { can_resume: true, reason: reason.into() }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self { can_resume: false, reason: reason.into() }
    }
}

/// Determines whether `run_id` may be resumed against `graph`, given the
/// run's last known status and its most recent checkpoint, if any.
#[must_use]
pub fn can_resume(run: Option<&Run>, checkpoint: Option<&Checkpoint>, graph: &ExecutionGraph) -> ResumeCheck {
    let Some(run) = run else {
        return ResumeCheck::blocked("run not found");
    };
    match run.status {
        RunStatus::Running => return ResumeCheck::blocked("run is still running"),
        RunStatus::Completed => return ResumeCheck::blocked("run already completed"),
        RunStatus::Failed | RunStatus::Interrupted => {}
    }
    if run.schema_contract.is_none() {
        return ResumeCheck::blocked("run has no stored schema contract");
    }
    let Some(checkpoint) = checkpoint else {
        return ResumeCheck::blocked("no checkpoint found for run");
    };
    if graph.edges().is_empty() {
        return ResumeCheck::blocked("current configuration produced a graph with no edges");
    }
    let expected_topology = upstream_topology_hash(graph, &checkpoint.node_id);
    if expected_topology != checkpoint.upstream_topology_hash {
        return ResumeCheck::blocked("checkpoint topology hash does not match current graph");
    }
    let Some(node) = graph.nodes().get(&checkpoint.node_id) else {
        return ResumeCheck::blocked("checkpoint node no longer exists in current graph");
    };
    if node.config_hash != checkpoint.checkpoint_node_config_hash {
        return ResumeCheck::blocked("checkpoint node config hash does not match current graph");
    }
    ResumeCheck::ok("checkpoint is compatible with the current graph")
}

/// Validates a checkpoint's format version against the version this build
/// writes.
///
/// # Errors
///
/// Returns [`CheckpointError::IncompatibleCheckpointError`] on mismatch.
pub fn check_format_version(checkpoint: &Checkpoint, current: u32) -> Result<(), CheckpointError> {
    if checkpoint.format_version == current {
        Ok(())
    } else {
        Err(CheckpointError::IncompatibleCheckpointError { found: checkpoint.format_version, expected: current })
    }
}

/// One row eligible for replay on resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessedRow {
    /// Row identifier, reused rather than recreated on replay.
    pub row_id: RowId,
    /// Zero-based position in the source's original emission order.
    pub row_index: u64,
    /// Rehydrated source payload bytes.
    pub source_data: Vec<u8>,
}

/// Returns the rows that must be replayed on resume: those with no terminal
/// outcome and not already buffered in the checkpoint's aggregation state.
#[must_use]
pub fn unprocessed_row_ids(recorder: &dyn AuditRecorder, run_id: RunId, buffered_in_aggregation: &BTreeSet<RowId>) -> Vec<RowId> {
    recorder.get_unprocessed_rows(run_id).into_iter().filter(|row_id| !buffered_in_aggregation.contains(row_id)).collect()
}

/// Rehydrates unprocessed rows from the payload store.
///
/// # Errors
///
/// Returns [`CheckpointError::CheckpointCorruptionError`] when a row has no
/// stored payload reference, or a [`PayloadError`] surfaces through it —
/// a missing payload ref is always fatal for resume safety.
pub fn get_unprocessed_row_data(
    rows: &[(RowId, u64, Option<HashDigest>)],
    payload_store: &dyn PayloadStore,
) -> Result<Vec<UnprocessedRow>, CheckpointError> {
    rows.iter()
        .map(|(row_id, row_index, source_data_ref)| {
            let Some(hash) = source_data_ref else {
                return Err(CheckpointError::CheckpointCorruptionError {
                    reason: format!("row {row_id} has no stored payload reference"),
                });
            };
            let bytes = payload_store
                .get(hash)
                .map_err(|err| {
                    let (PayloadError::Io(reason) | PayloadError::StillReferenced(reason)) = err;
                    CheckpointError::CheckpointCorruptionError { reason }
                })?
                .ok_or_else(|| CheckpointError::CheckpointCorruptionError {
                    reason: format!("payload {hash} referenced by row {row_id} is missing from the store"),
                })?;
            Ok(UnprocessedRow { row_id: *row_id, row_index: *row_index, source_data: bytes })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointFrequency;
    use crate::graph::ErrorRoute;
    use crate::graph::NodeKind;
    use crate::graph::NodeSpec;
    use crate::model::Determinism;
    use crate::model::ExportStatus;
    use crate::model::ReproducibilityGrade;
    use crate::schema::SchemaContract;

    fn run_id() -> RunId {
        RunId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"))
    }

    fn sample_graph() -> ExecutionGraph {
        let specs = vec![
            NodeSpec {
                plugin_name: "source".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::IoRead,
                config: serde_json::json!({}),
                kind: NodeKind::Source { on_success: "raw".to_string(), quarantine_sink: None, output_schema: SchemaContract::Observed },
            },
            NodeSpec {
                plugin_name: "upper".to_string(),
                plugin_version: "1.0.0".to_string(),
                determinism: Determinism::Deterministic,
                config: serde_json::json!({}),
                kind: NodeKind::Transform {
                    input: "raw".to_string(),
                    on_success: "clean".to_string(),
                    on_error: ErrorRoute::Discard,
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
        ];
        ExecutionGraph::from_plugin_specs(run_id(), specs).unwrap()
    }

    #[test]
    fn every_n_fires_on_the_nth_row() {
        let mut manager = CheckpointManager::new(CheckpointConfig {
            enabled: true,
            frequency: CheckpointFrequency::EveryN { n: 3 },
            format_version: 1,
        });
        assert!(!manager.observe_row());
        assert!(!manager.observe_row());
        assert!(manager.observe_row());
        assert!(!manager.observe_row());
    }

    #[test]
    fn never_frequency_never_fires() {
        let mut manager =
            CheckpointManager::new(CheckpointConfig { enabled: true, frequency: CheckpointFrequency::Never, format_version: 1 });
        for _ in 0..10 {
            assert!(!manager.observe_row());
        }
    }

    #[test]
    fn topology_hash_ignores_divert_edges() {
        let graph = sample_graph();
        let transform_node = graph.get_transform_id_map().get("raw").cloned().unwrap();
        let hash_before = upstream_topology_hash(&graph, &transform_node);
        let hash_again = upstream_topology_hash(&graph, &transform_node);
        assert_eq!(hash_before, hash_again, "hashing the same graph twice must agree");
    }

    #[test]
    fn can_resume_rejects_a_running_run() {
        let graph = sample_graph();
        let run = Run {
            run_id: run_id(),
            started_at: Timestamp::now(),
            completed_at: None,
            status: RunStatus::Running,
            config_hash: HashDigest::new(DEFAULT_HASH_ALGORITHM, b"cfg"),
            canonical_version: DEFAULT_HASH_ALGORITHM.canonical_version().to_string(),
            schema_contract: None,
            source_schema: None,
            export_status: ExportStatus::NotConfigured,
            export_error: None,
            reproducibility_grade: ReproducibilityGrade::Full,
        };
        let check = can_resume(Some(&run), None, &graph);
        assert!(!check.can_resume);
    }

    #[test]
    fn can_resume_requires_a_checkpoint() {
        let graph = sample_graph();
        let run = Run {
            run_id: run_id(),
            started_at: Timestamp::now(),
            completed_at: Some(Timestamp::now()),
            status: RunStatus::Failed,
            config_hash: HashDigest::new(DEFAULT_HASH_ALGORITHM, b"cfg"),
            canonical_version: DEFAULT_HASH_ALGORITHM.canonical_version().to_string(),
            schema_contract: Some((SchemaContract::Observed, HashDigest::new(DEFAULT_HASH_ALGORITHM, b"schema"))),
            source_schema: None,
            export_status: ExportStatus::NotConfigured,
            export_error: None,
            reproducibility_grade: ReproducibilityGrade::Full,
        };
        let check = can_resume(Some(&run), None, &graph);
        assert!(!check.can_resume);
        assert!(check.reason.contains("checkpoint"));
    }
}
