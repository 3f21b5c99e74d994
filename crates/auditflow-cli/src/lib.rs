// crates/auditflow-cli/src/lib.rs
// ============================================================================
// Module: CLI Wiring
// Description: Argument-to-runtime wiring shared between the binary and its
//              tests: config loading, store construction, plugin loading
//              extension point, and exit-code classification.
// Purpose: Keep `main.rs` a thin dispatcher over testable functions.
// Dependencies: auditflow-core, auditflow-payload-fs, auditflow-store-sqlite
// ============================================================================

//! ## Overview
//! Concrete plugin implementations (source readers, transforms, sinks) are
//! external collaborators this workspace does not provide; [`PluginLoader`]
//! is the seam a deployment-specific binary implements to supply them. This
//! crate ships the seam, the store wiring on either side of it, and the
//! exit-code contract named for the CLI surface, but no concrete loader
//! beyond [`UnconfiguredPluginLoader`].

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use auditflow_core::error::OrchestratorError;
use auditflow_core::error::RecorderError;
use auditflow_core::graph::NodeSpec;
use auditflow_core::identifiers::NodeId;
use auditflow_core::model::ExportStatus;
use auditflow_core::model::RunStatus;
use auditflow_core::orchestrator::RunPlugins;
use auditflow_core::orchestrator::RunSummary;
use auditflow_core::plugins::BatchTransform;
use auditflow_core::plugins::Gate;
use auditflow_core::plugins::Sink;
use auditflow_core::plugins::Source;
use auditflow_core::plugins::Transform;
use auditflow_payload_fs::FilesystemPayloadStore;
use auditflow_store_sqlite::SqliteRecorder;
use auditflow_store_sqlite::SqliteStoreConfig;
use auditflow_store_sqlite::SqliteStoreMode;
use auditflow_store_sqlite::SqliteSyncMode;
use thiserror::Error;

/// Exit code for a successful run whose export failed.
pub const EXIT_PARTIAL: u8 = 1;
/// Exit code for any error path short of a clean completion, PARTIAL
/// export, or cooperative shutdown.
pub const EXIT_FAILED: u8 = 2;
/// Exit code for a cooperative shutdown.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Errors surfaced at the CLI boundary, distinct from [`OrchestratorError`]
/// so that argument and wiring failures are reported without requiring a
/// run to have been attempted at all.
#[derive(Debug, Error)]
pub enum CliError {
    /// The config file at the given path could not be read or parsed.
    #[error("failed to load config from {path}: {source}")]
    Config {
        /// Config path that failed to load.
        path: PathBuf,
        /// Underlying I/O or parse failure.
        #[source]
        source: std::io::Error,
    },
    /// The config file's contents were not valid JSON for
    /// [`auditflow_core::config::OrchestratorConfig`].
    #[error("config at {path} is not valid: {source}")]
    ConfigParse {
        /// Config path that failed to parse.
        path: PathBuf,
        /// Underlying deserialization failure.
        #[source]
        source: serde_json::Error,
    },
    /// The audit database could not be opened.
    #[error("failed to open audit database: {0}")]
    Store(#[from] auditflow_store_sqlite::SqliteStoreError),
    /// The payload store directory could not be created.
    #[error("failed to open payload store: {0}")]
    Payload(#[from] auditflow_payload_fs::FilesystemPayloadStoreError),
    /// `--resume` was given a run id of `0`, which is never valid.
    #[error("--resume requires a non-zero run id")]
    InvalidResumeId,
    /// No [`PluginLoader`] has been wired into this binary.
    ///
    /// Concrete source/transform/gate/sink implementations are external
    /// collaborators; a deployment links its own binary against this
    /// library with a real [`PluginLoader`] in place of
    /// [`UnconfiguredPluginLoader`].
    #[error("no plugin loader is configured for this binary")]
    PluginsNotConfigured,
    /// The orchestrator reported a run-level failure.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    /// The audit recorder reported a failure while updating run state.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

/// Loads [`auditflow_core::config::OrchestratorConfig`] from a JSON file.
///
/// # Errors
///
/// Returns [`CliError::Config`] if the file cannot be read, or
/// [`CliError::ConfigParse`] if its contents are not valid JSON for the
/// config shape.
pub fn load_orchestrator_config(path: &Path) -> Result<auditflow_core::config::OrchestratorConfig, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::Config { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| CliError::ConfigParse { path: path.to_path_buf(), source })
}

/// Opens the audit database at `path` under WAL journaling with full sync,
/// creating it if it does not already exist.
///
/// # Errors
///
/// Returns [`CliError::Store`] if the database cannot be opened or its
/// schema cannot be migrated.
pub fn open_audit_store(path: &Path) -> Result<SqliteRecorder, CliError> {
    let config = SqliteStoreConfig {
        path: path.to_path_buf(),
        busy_timeout_ms: 5_000,
        journal_mode: SqliteStoreMode::Wal,
        sync_mode: SqliteSyncMode::Full,
    };
    SqliteRecorder::open(&config).map_err(CliError::Store)
}

/// Opens the content-addressed payload store rooted at `dir`, creating it
/// if it does not already exist.
///
/// # Errors
///
/// Returns [`CliError::Payload`] if `dir` cannot be created.
pub fn open_payload_store(dir: &Path) -> Result<FilesystemPayloadStore, CliError> {
    FilesystemPayloadStore::open(dir).map_err(CliError::Payload)
}

/// Owned plugin instances and their graph wiring for one run, built by a
/// [`PluginLoader`].
pub struct PluginBundle {
    /// Node specifications describing how the plugins below wire together.
    pub specs: Vec<NodeSpec>,
    /// The run's single source.
    pub source: Box<dyn Source>,
    /// Sink plugin by sink name.
    pub sinks: BTreeMap<String, Box<dyn Sink>>,
    /// Transform plugin by transform node.
    pub transforms: BTreeMap<NodeId, Box<dyn Transform>>,
    /// Gate plugin by gate node.
    pub gates: BTreeMap<NodeId, Box<dyn Gate>>,
    /// Batch transform plugin by aggregation node.
    pub aggregations: BTreeMap<NodeId, Box<dyn BatchTransform>>,
}

impl PluginBundle {
    /// Borrows this bundle as the [`RunPlugins`] shape the orchestrator
    /// consumes.
    pub fn as_run_plugins(&mut self) -> RunPlugins<'_> {
        RunPlugins {
            source: &mut *self.source,
            sinks: self.sinks.iter_mut().map(|(name, sink)| (name.clone(), &mut **sink as &mut dyn Sink)).collect(),
            transforms: self.transforms.iter().map(|(id, t)| (id.clone(), &**t as &dyn Transform)).collect(),
            gates: self.gates.iter().map(|(id, g)| (id.clone(), &**g as &dyn Gate)).collect(),
            aggregations: self.aggregations.iter().map(|(id, a)| (id.clone(), &**a as &dyn BatchTransform)).collect(),
        }
    }
}

/// Resolves the concrete plugin set for a run described by the config at
/// `config_path`. Implementations are deployment-specific; this crate
/// provides the seam, not an implementation.
pub trait PluginLoader {
    /// Builds the plugin bundle for one run.
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] if the plugins named in the config cannot be
    /// constructed.
    fn load(&self, config_path: &Path) -> Result<PluginBundle, CliError>;
}

/// The only [`PluginLoader`] this crate ships: always reports
/// [`CliError::PluginsNotConfigured`]. A deployment substitutes a real
/// loader when it links this library into its own binary.
#[derive(Debug, Default)]
pub struct UnconfiguredPluginLoader;

impl PluginLoader for UnconfiguredPluginLoader {
    fn load(&self, _config_path: &Path) -> Result<PluginBundle, CliError> {
        Err(CliError::PluginsNotConfigured)
    }
}

/// Maps a completed run's [`RunSummary`] and the run's persisted export
/// status to the process exit code named in spec §6: 0 on a clean
/// completion, 1 on a successful run whose export failed (PARTIAL), 130 on
/// a cooperative shutdown.
#[must_use]
pub fn exit_code_for_summary(summary: &RunSummary, export_status: ExportStatus) -> ExitCode {
    match summary.status {
        RunStatus::Completed if export_status == ExportStatus::Failed => ExitCode::from(EXIT_PARTIAL),
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        RunStatus::Failed | RunStatus::Running => ExitCode::from(EXIT_FAILED),
    }
}

/// Maps any [`CliError`] reaching `main` to the FAILED exit code (2), per
/// spec §6: every error path short of a clean completion, PARTIAL export,
/// or cooperative shutdown is a FAILED run.
#[must_use]
pub fn exit_code_for_error() -> ExitCode {
    ExitCode::from(EXIT_FAILED)
}
