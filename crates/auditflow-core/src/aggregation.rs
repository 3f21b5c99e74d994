// crates/auditflow-core/src/aggregation.rs
// ============================================================================
// Module: Aggregation Executor
// Description: Per-node batch buffers with declarative triggers.
// Purpose: Hold rows until a trigger fires, invoke the batch plugin, and
//          translate its result into one or more output tokens.
// Dependencies: crate::{model, plugins, time, token_manager}
// ============================================================================

//! ## Overview
//! An aggregation node is topologically identical to a transform but buffers
//! rows instead of processing them one at a time. State is owned entirely by
//! this executor so that it can be serialized into a checkpoint's opaque
//! `aggregation_state_json` blob and rehydrated on resume.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::model::Token;
use crate::plugins::BatchTransform;
use crate::plugins::BatchTransformResult;
use crate::plugins::PluginContext;
use crate::time::Timestamp;
use crate::token_manager::TokenManager;

/// Declarative trigger condition for one aggregation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AggregationTrigger {
    /// Fires once the buffer reaches `count` rows.
    Count {
        /// Buffer size that fires the trigger.
        count: usize,
    },
    /// Fires every `n`th row, counting across the whole run.
    EveryN {
        /// Row interval between flushes.
        n: u64,
    },
    /// Fires once `seconds` have elapsed since the buffer's first row.
    Time {
        /// Wall-clock seconds before a non-empty buffer flushes.
        seconds: u64,
    },
    /// Fires only when the run ends (flush-on-end); no mid-run trigger.
    FlushOnEnd,
}

/// How the batch result is translated into output tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One merged token replaces the whole batch.
    Transform,
    /// Multiple output tokens, one per result row, via `token_manager.expand`.
    Expand,
}

/// Declarative configuration for one aggregation node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Trigger condition.
    pub trigger: AggregationTrigger,
    /// Batch result translation mode.
    pub output_mode: OutputMode,
}

/// Serializable snapshot of one aggregation node's buffer, embedded in a
/// checkpoint's `aggregation_state_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSnapshot {
    /// Buffered rows awaiting the trigger.
    pub rows: Vec<Value>,
    /// Tokens corresponding 1:1 with `rows`.
    pub tokens: Vec<Token>,
    /// Rows observed since the buffer was last flushed (for `every_n`).
    pub rows_seen: u64,
    /// Wall-clock time the current buffer's first row arrived.
    pub opened_at: Option<Timestamp>,
}

impl Default for AggregationSnapshot {
    fn default() -> Self {
        Self { rows: Vec::new(), tokens: Vec::new(), rows_seen: 0, opened_at: None }
    }
}

/// Outcome of submitting one row to an aggregation buffer.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The trigger has not fired; the row is buffered.
    Buffered,
    /// The trigger fired; `process` was invoked and these output tokens are
    /// ready to continue traversal from the aggregation's `on_success`.
    Emit {
        /// Output rows, paired 1:1 with `tokens`.
        rows: Vec<Value>,
        /// Output tokens.
        tokens: Vec<Token>,
    },
    /// The batch plugin rejected the buffer.
    Error {
        /// Machine-readable failure reason.
        reason: String,
        /// Whether the orchestrator may retry the batch.
        retryable: bool,
    },
}

/// Per-run state machine for every aggregation node's buffer.
#[derive(Debug, Default)]
pub struct AggregationExecutor {
    buffers: BTreeMap<String, AggregationSnapshot>,
}

impl AggregationExecutor {
    /// Creates an executor with empty buffers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores buffer state from a checkpoint snapshot.
    pub fn restore(&mut self, node_key: String, snapshot: AggregationSnapshot) {
        self.buffers.insert(node_key, snapshot);
    }

    /// Returns the current snapshot for `node_key`, for checkpointing.
    #[must_use]
    pub fn snapshot(&self, node_key: &str) -> Option<&AggregationSnapshot> {
        self.buffers.get(node_key)
    }

    /// Submits one row to the named aggregation node's buffer, flushing it
    /// through `plugin` if the trigger fires.
    pub fn submit(
        &mut self,
        node_key: &str,
        config: &AggregationConfig,
        plugin: &dyn BatchTransform,
        ctx: &PluginContext,
        token: Token,
        row: Value,
        now: Timestamp,
        tokens: &mut TokenManager,
    ) -> SubmitOutcome {
        let buffer = self.buffers.entry(node_key.to_string()).or_default();
        if buffer.rows.is_empty() {
            buffer.opened_at = Some(now);
        }
        buffer.rows.push(row);
        buffer.tokens.push(token);
        buffer.rows_seen += 1;

        if Self::trigger_fires(config.trigger, buffer, now) {
            return Self::flush(self.buffers.remove(node_key).unwrap_or_default(), config, plugin, ctx, tokens, now);
        }
        SubmitOutcome::Buffered
    }

    /// Forces a flush of `node_key`'s buffer regardless of its trigger,
    /// used at run end for flush-on-end aggregations and non-empty buffers.
    pub fn force_flush(
        &mut self,
        node_key: &str,
        config: &AggregationConfig,
        plugin: &dyn BatchTransform,
        ctx: &PluginContext,
        tokens: &mut TokenManager,
        now: Timestamp,
    ) -> Option<SubmitOutcome> {
        let buffer = self.buffers.remove(node_key)?;
        if buffer.rows.is_empty() {
            return None;
        }
        Some(Self::flush(buffer, config, plugin, ctx, tokens, now))
    }

    fn trigger_fires(trigger: AggregationTrigger, buffer: &AggregationSnapshot, now: Timestamp) -> bool {
        match trigger {
            AggregationTrigger::Count { count } => buffer.rows.len() >= count,
            AggregationTrigger::EveryN { n } => n > 0 && buffer.rows_seen % n == 0,
            AggregationTrigger::Time { seconds } => buffer
                .opened_at
                .is_some_and(|opened| elapsed_seconds(opened, now) >= seconds),
            AggregationTrigger::FlushOnEnd => false,
        }
    }

    fn flush(
        buffer: AggregationSnapshot,
        config: &AggregationConfig,
        plugin: &dyn BatchTransform,
        ctx: &PluginContext,
        tokens: &mut TokenManager,
        now: Timestamp,
    ) -> SubmitOutcome {
        match plugin.process(&buffer.rows, ctx) {
            BatchTransformResult::Error { reason, retryable } => SubmitOutcome::Error { reason, retryable },
            BatchTransformResult::Success { rows } => match config.output_mode {
                OutputMode::Transform => {
                    let merged_token = buffer
                        .tokens
                        .last()
                        .map(|last| tokens.expand(last, 1, now))
                        .and_then(|mut expanded| expanded.pop())
                        .unwrap_or_else(|| unreachable!("buffer is non-empty when flushed"));
                    SubmitOutcome::Emit {
                        rows: rows.into_iter().take(1).collect(),
                        tokens: vec![merged_token],
                    }
                }
                OutputMode::Expand => {
                    let Some(parent) = buffer.tokens.last() else {
                        return SubmitOutcome::Emit { rows: Vec::new(), tokens: Vec::new() };
                    };
                    let expanded = tokens.expand(parent, rows.len(), now);
                    SubmitOutcome::Emit { rows, tokens: expanded }
                }
            },
        }
    }
}

fn elapsed_seconds(start: Timestamp, now: Timestamp) -> u64 {
    let delta = now.as_offset_date_time() - start.as_offset_date_time();
    delta.whole_seconds().max(0).unsigned_abs()
}
