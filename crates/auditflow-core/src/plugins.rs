// crates/auditflow-core/src/plugins.rs
// ============================================================================
// Module: Plugin Contracts
// Description: Source, transform, gate, and sink capability traits.
// Purpose: Define the typed capabilities any concrete plugin must satisfy,
//          with no dynamic dispatch on plugin class names.
// Dependencies: crate::{hashing, identifiers, schema}
// ============================================================================

//! ## Overview
//! Individual plugin implementations (CSV/JSON readers and writers, database
//! sinks, LLM transforms) are external collaborators; this module defines
//! only the contracts they must satisfy. A duck-typed plugin that does not
//! implement the relevant trait is a compile-time rejection, not a runtime
//! error — there is no dynamic dispatch on plugin class names anywhere in
//! this crate.

use serde_json::Value;
use thiserror::Error;

use crate::hashing::HashDigest;
use crate::identifiers::NodeId;
use crate::identifiers::RunId;
use crate::schema::SchemaContract;

/// Context passed to every plugin call, identifying the run and node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginContext {
    /// Run this call belongs to.
    pub run_id: RunId,
    /// Node executing this call.
    pub node_id: NodeId,
}

/// A row-shaped plugin-level error, surfaced as an external or plugin error
/// per the error taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("plugin error at {node_id}: {message}")]
pub struct PluginError {
    /// Node the error originated at.
    pub node_id: NodeId,
    /// Human-readable error message.
    pub message: String,
    /// Whether the orchestrator may retry the call that raised this error.
    pub retryable: bool,
}

/// One row yielded by a source, classified at emission time.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A row that passed source-level validation.
    Valid {
        /// Row payload.
        data: Value,
        /// Effective schema contract for this row's shape.
        contract: SchemaContract,
    },
    /// A row that failed source-level validation and must be quarantined.
    Quarantined {
        /// Row payload, preserved for forensic review.
        data: Value,
        /// Validation error message.
        error: String,
        /// Configured quarantine sink name.
        destination: String,
    },
}

/// Source plugin capability: emits a finite, lazily evaluated row sequence.
pub trait Source {
    /// Called once before `load`, in dependency order with other plugins.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when startup fails.
    fn on_start(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Produces the row sequence for this run. The sequence must be finite;
    /// streaming/unbounded sources are out of scope.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the source cannot begin loading.
    fn load(&mut self, ctx: &PluginContext) -> Result<Box<dyn Iterator<Item = SourceRow> + '_>, PluginError>;

    /// Called once after the source has been fully drained.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when completion bookkeeping fails.
    fn on_complete(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Releases any resources held by the source.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when cleanup fails.
    fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Returns the source's declared schema contract, used to rehydrate rows
    /// from the payload store on resume.
    fn get_schema_contract(&self) -> Option<SchemaContract> {
        None
    }
}

/// Outcome of one transform evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResult {
    /// The transform succeeded, producing a new row.
    Success {
        /// Resulting row payload.
        row: Value,
        /// Optional human-readable note about the transformation applied.
        reason: Option<String>,
    },
    /// The transform failed.
    Error {
        /// Machine-readable failure reason.
        reason: String,
        /// Whether the orchestrator may retry this row.
        retryable: bool,
    },
}

/// Transform plugin capability: maps one row to at most one row.
///
/// # Invariants
/// - Must be pure with respect to the input row: it must not mutate the
///   caller's view of `row`.
pub trait Transform {
    /// Evaluates the transform against one row.
    fn process(&self, row: &Value, ctx: &PluginContext) -> TransformResult;

    /// Declared input schema contract.
    fn input_schema(&self) -> SchemaContract {
        SchemaContract::Observed
    }

    /// Declared output schema contract.
    fn output_schema(&self) -> SchemaContract {
        SchemaContract::Observed
    }
}

/// Outcome of one batch transform evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchTransformResult {
    /// The batch succeeded, producing zero or more result rows.
    Success {
        /// Resulting row payloads.
        rows: Vec<Value>,
    },
    /// The batch failed.
    Error {
        /// Machine-readable failure reason.
        reason: String,
        /// Whether the orchestrator may retry this batch.
        retryable: bool,
    },
}

/// Batch transform plugin capability, used by aggregation nodes.
pub trait BatchTransform {
    /// Evaluates the transform against a batch of rows.
    fn process(&self, rows: &[Value], ctx: &PluginContext) -> BatchTransformResult;

    /// Declared output schema contract.
    fn output_schema(&self) -> SchemaContract {
        SchemaContract::Observed
    }
}

/// The routing decision produced by a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAction {
    /// Continue traversal without changing destination (single implicit route).
    Continue,
    /// Route to the named sink.
    RouteToSink(String),
    /// Route to the named processing-node connection.
    RouteTo(String),
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateResult {
    /// Row payload, unchanged unless the gate enriches it.
    pub row: Value,
    /// Chosen routing action.
    pub action: GateAction,
}

/// Gate plugin capability: a pure routing decision over one row.
pub trait Gate {
    /// Evaluates the gate's condition and routing decision against one row.
    fn evaluate(&self, row: &Value, ctx: &PluginContext) -> GateResult;
}

/// Descriptor returned by a successful sink write, identifying the produced
/// artifact for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Sink-relative or external artifact path.
    pub path: String,
    /// Artifact size in bytes.
    pub size: u64,
    /// Content hash of the artifact.
    pub content_hash: HashDigest,
}

/// Sink plugin capability: a terminal write destination.
///
/// # Invariants
/// - `write` is at-least-once; non-idempotent sinks must tolerate duplicate
///   batches delivered on resume.
pub trait Sink {
    /// Called once before any `write`, in dependency order with other plugins.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when startup fails.
    fn on_start(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Writes a batch of rows, returning a descriptor of the resulting
    /// artifact. Only after this returns successfully may the orchestrator
    /// record `Completed` outcomes for the routed tokens.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when the write fails; no `Completed`
    /// outcomes are recorded when this returns an error.
    fn write(&mut self, rows: &[Value], ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError>;

    /// Called once after all writes for this run have completed.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when completion bookkeeping fails.
    fn on_complete(&mut self, ctx: &PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Releases any resources held by the sink.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] when cleanup fails.
    fn close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Declared input schema contract.
    fn input_schema(&self) -> SchemaContract {
        SchemaContract::Observed
    }

    /// Whether repeated delivery of the same logical row is safe. Resume
    /// replay assumes `false` unless the sink declares otherwise.
    fn idempotent(&self) -> bool {
        false
    }
}
