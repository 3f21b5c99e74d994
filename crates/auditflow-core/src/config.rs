// crates/auditflow-core/src/config.rs
// ============================================================================
// Module: Orchestrator Configuration
// Description: Typed tunables for checkpointing, retention, and concurrency.
// Purpose: Give the orchestrator a minimal constructible configuration
//          surface without implementing the excluded layered config loader.
// Dependencies: serde
// ============================================================================

//! Typed tunables for checkpointing, retention, and concurrency, covering
//! the minimal constructible configuration surface the orchestrator needs.

use serde::Deserialize;
use serde::Serialize;

/// How often the orchestrator takes a checkpoint while driving the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CheckpointFrequency {
    /// Checkpoint after every source row.
    EveryRow,
    /// Checkpoint after every `n`th source row.
    EveryN {
        /// Row interval between checkpoints.
        n: u32,
    },
    /// Never checkpoint; the run is not resumable.
    Never,
}

impl Default for CheckpointFrequency {
    fn default() -> Self {
        Self::EveryN { n: 100 }
    }
}

/// Checkpoint subsystem configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Whether checkpointing is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often a checkpoint is taken.
    #[serde(default)]
    pub frequency: CheckpointFrequency,
    /// Aggregation-state schema version this build writes.
    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { enabled: true, frequency: CheckpointFrequency::default(), format_version: default_format_version() }
    }
}

const fn default_format_version() -> u32 {
    1
}

/// Retention purge subsystem configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Age, in days, beyond which a completed run's payloads become
    /// eligible for purge. Sourced from `RETENTION_DAYS` at the CLI edge;
    /// the core only consumes the resolved integer.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { retention_days: default_retention_days() }
    }
}

const fn default_retention_days() -> u32 {
    90
}

/// Concurrency tunables for row processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum number of worker threads used to parallelize independent-row
    /// transform evaluation. `1` disables the worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: default_max_workers() }
    }
}

const fn default_max_workers() -> u32 {
    1
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Checkpoint tunables.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Retention purge tunables.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Concurrency tunables.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Name of the sink that quarantined and error-diverted rows are routed
    /// to, when the graph declares one.
    #[serde(default)]
    pub quarantine_sink: Option<String>,
}

const fn default_true() -> bool {
    true
}
