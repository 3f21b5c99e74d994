// crates/auditflow-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Audit Recorder
// Description: Durable AuditRecorder backed by SQLite WAL.
// Purpose: Persist the run/node/edge/row/token/lineage trail across process
//          restarts with a schema-versioned migration path.
// Dependencies: auditflow-core, rusqlite
// ============================================================================

//! ## Overview
//! [`SqliteRecorder`] is an [`AuditRecorder`] that keeps every table from
//! `auditflow_core::model` in one SQLite file under WAL journaling. Each
//! table stores its natural key columns for querying (`run_id`, `node_id`,
//! `status`, and so on) plus a `data` column holding the full entity as
//! canonical JSON, mirroring how the run-state snapshot backend this crate
//! is descended from stores a whole struct per row and layers indexed
//! metadata columns on top for integrity and retention queries.
//!
//! Identifier allocation (run, row, node-state, routing-event, outcome,
//! operation, call, checkpoint) is an in-memory monotonic counter seeded
//! from `MAX(id)` in the matching table at open time, the same technique
//! [`auditflow_core::token_manager::TokenManager`] uses to reseed its own
//! counter past every id a prior process persisted. Allocation itself can
//! never fail; only the subsequent write to SQLite can, and for the trait
//! methods whose signature has no room for a `Result` (`begin_operation`,
//! `record_call`, `record_checkpoint`, every read-only query), a failed
//! write is logged via `tracing::error!` and otherwise swallowed rather than
//! panicking, since this workspace denies `clippy::panic` everywhere, not
//! only inside functions that return `Result`.

use std::path::Path;
use std::path::PathBuf;

use auditflow_core::error::RecorderError;
use auditflow_core::hashing::HashDigest;
use auditflow_core::identifiers::CallId;
use auditflow_core::identifiers::CheckpointId;
use auditflow_core::identifiers::EdgeId;
use auditflow_core::identifiers::EventId;
use auditflow_core::identifiers::GroupId;
use auditflow_core::identifiers::NodeId;
use auditflow_core::identifiers::OperationId;
use auditflow_core::identifiers::OutcomeId;
use auditflow_core::identifiers::RowId;
use auditflow_core::identifiers::RunId;
use auditflow_core::identifiers::StateId;
use auditflow_core::identifiers::TokenId;
use auditflow_core::model::Call;
use auditflow_core::model::CallParent;
use auditflow_core::model::Node;
use auditflow_core::model::NodeState;
use auditflow_core::model::NodeStateStatus;
use auditflow_core::model::Operation;
use auditflow_core::model::OperationStatus;
use auditflow_core::model::ReproducibilityGrade;
use auditflow_core::model::RoutingEvent;
use auditflow_core::model::RoutingMode;
use auditflow_core::model::Row;
use auditflow_core::model::Run;
use auditflow_core::model::RunStatus;
use auditflow_core::model::Token;
use auditflow_core::model::TokenOutcome;
use auditflow_core::model::TokenOutcomeKind;
use auditflow_core::model::TransformError;
use auditflow_core::recorder::AuditRecorder;
use auditflow_core::recorder::PayloadRef;
use auditflow_core::recorder::PayloadRefKind;
use auditflow_core::recorder::RowExplanation;
use auditflow_core::schema::SchemaContract;
use auditflow_core::time::Timestamp;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Current store schema version. Bumped only when the table layout changes;
/// [`initialize_schema`] gates migrations on the version recorded in
/// `store_meta`.
pub const SCHEMA_VERSION: i64 = 2;

/// Default `SQLite` busy-timeout, in milliseconds, applied to every opened
/// connection.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// `SQLite` journal mode for the recorder's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// Write-ahead logging; the default for concurrent read/write access.
    #[default]
    Wal,
    /// Classic rollback journal.
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `PRAGMA journal_mode` value for this mode.
    #[must_use]
    const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
        }
    }
}

/// `SQLite` synchronous mode for the recorder's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full fsync durability on every commit.
    #[default]
    Full,
    /// Reduced fsync durability; safe under WAL but not after an OS crash.
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `PRAGMA synchronous` value for this mode.
    #[must_use]
    const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Normal => "NORMAL",
        }
    }
}

/// Configuration for the `SQLite` audit recorder.
///
/// # Invariants
/// - `path` must resolve to a file path, not a directory.
/// - `busy_timeout_ms` is interpreted as milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors raised outside the [`AuditRecorder`] trait surface
/// (construction, pragma setup, schema migration).
#[derive(Debug, Error, Clone)]
pub enum SqliteStoreError {
    /// Store I/O or path-validation error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// A value read from the store could not be deserialized.
    #[error("sqlite store corrupt data: {0}")]
    Corrupt(String),
    /// Store schema version is newer or incompatible with this build.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store configuration.
    #[error("sqlite store invalid configuration: {0}")]
    Invalid(String),
}

/// Maps a `rusqlite` error to a [`RecorderError::Store`], for the trait
/// methods that can propagate a `Result`.
fn db_err(err: rusqlite::Error) -> RecorderError {
    RecorderError::Store(err.to_string())
}

/// Maps a `serde_json` (de)serialization error to a [`RecorderError::Store`].
fn ser_err(err: serde_json::Error) -> RecorderError {
    RecorderError::Store(err.to_string())
}

/// Serializes a value as a JSON string, for storage in a `data` column.
fn to_json<T: Serialize>(value: &T) -> Result<String, RecorderError> {
    serde_json::to_string(value).map_err(ser_err)
}

/// Deserializes a value stored in a `data` column.
fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, RecorderError> {
    serde_json::from_str(text).map_err(ser_err)
}

/// Returns whether a `rusqlite` error is a unique-constraint violation,
/// distinguishing "already registered" from genuine I/O failure.
fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation)
}

/// Renders a status-like enum as the compact JSON string stored in an
/// indexed `status` column, so queries and writes use one consistent
/// encoding without a bespoke `as_str` per enum.
fn status_key<T: Serialize>(value: &T) -> Result<String, RecorderError> {
    to_json(value)
}

// ============================================================================
// SECTION: Connection Setup
// ============================================================================

/// Validates that the configured path can hold a database file.
fn validate_path(path: &Path) -> Result<(), SqliteStoreError> {
    if path.is_dir() {
        return Err(SqliteStoreError::Invalid("store path must be a file, not a directory".to_string()));
    }
    Ok(())
}

/// Opens a `SQLite` connection with secure defaults.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags).map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    apply_pragmas(&connection, config)?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(connection: &Connection, config: &SqliteStoreConfig) -> Result<(), SqliteStoreError> {
    connection.execute_batch("PRAGMA foreign_keys = ON;").map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

/// Initializes the `SQLite` schema or validates an existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])
                .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS runs (
                    run_id INTEGER PRIMARY KEY,
                    status TEXT NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS nodes (
                    run_id INTEGER NOT NULL,
                    node_id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (run_id, node_id)
                );
                CREATE TABLE IF NOT EXISTS edges (
                    run_id INTEGER NOT NULL,
                    edge_id INTEGER NOT NULL,
                    from_node TEXT NOT NULL,
                    to_node TEXT NOT NULL,
                    label TEXT NOT NULL,
                    PRIMARY KEY (run_id, edge_id)
                );
                CREATE TABLE IF NOT EXISTS pipeline_rows (
                    run_id INTEGER NOT NULL,
                    row_id INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (run_id, row_id)
                );
                CREATE TABLE IF NOT EXISTS tokens (
                    run_id INTEGER NOT NULL,
                    token_id INTEGER NOT NULL,
                    row_id INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (run_id, token_id)
                );
                CREATE INDEX IF NOT EXISTS idx_tokens_row ON tokens (run_id, row_id);
                CREATE TABLE IF NOT EXISTS node_states (
                    state_id INTEGER PRIMARY KEY,
                    run_id INTEGER NOT NULL,
                    token_id INTEGER NOT NULL,
                    node_id TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_node_states_token_node ON node_states (token_id, node_id);
                CREATE INDEX IF NOT EXISTS idx_node_states_run ON node_states (run_id);
                CREATE TABLE IF NOT EXISTS routing_events (
                    event_id INTEGER PRIMARY KEY,
                    state_id INTEGER NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_routing_events_state ON routing_events (state_id);
                CREATE TABLE IF NOT EXISTS token_outcomes (
                    run_id INTEGER NOT NULL,
                    token_id INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (run_id, token_id)
                );
                CREATE TABLE IF NOT EXISTS operations (
                    operation_id INTEGER PRIMARY KEY,
                    run_id INTEGER NOT NULL,
                    node_id TEXT NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_operations_run ON operations (run_id);
                CREATE TABLE IF NOT EXISTS calls (
                    call_id INTEGER PRIMARY KEY,
                    run_id INTEGER NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_calls_run ON calls (run_id);
                CREATE TABLE IF NOT EXISTS checkpoints (
                    checkpoint_id INTEGER PRIMARY KEY,
                    run_id INTEGER NOT NULL,
                    sequence_number INTEGER NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_checkpoints_run_seq ON checkpoints (run_id, sequence_number);
                CREATE TABLE IF NOT EXISTS transform_errors (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL,
                    data TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sinks (
                    run_id INTEGER NOT NULL,
                    sink_name TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    PRIMARY KEY (run_id, sink_name)
                );",
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        }
        Some(1) => {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS sinks (
                    run_id INTEGER NOT NULL,
                    sink_name TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    PRIMARY KEY (run_id, sink_name)
                );",
            )
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
            tx.execute("UPDATE store_meta SET version = ?1", params![SCHEMA_VERSION]).map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!("unsupported schema version: {value}")));
        }
    }
    tx.commit().map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(())
}

/// Reads the highest value of an integer id column, for seeding an
/// in-memory allocator past every id a prior process persisted.
fn max_id(connection: &Connection, table: &str, column: &str) -> Result<u64, SqliteStoreError> {
    let sql = format!("SELECT COALESCE(MAX({column}), 0) FROM {table}");
    let value: i64 = connection.query_row(&sql, params![], |row| row.get(0)).map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(u64::try_from(value).unwrap_or(0))
}

// ============================================================================
// SECTION: Recorder
// ============================================================================

/// `SQLite`-backed [`AuditRecorder`] with WAL durability and a
/// schema-versioned migration path.
///
/// # Invariants
/// - At most one run may be open (`Running`) at a time, enforced the same
///   way as [`auditflow_core::recorder::InMemoryRecorder`].
pub struct SqliteRecorder {
    connection: Connection,
    open_run: Option<RunId>,
    next_run_id: u64,
    next_row_id: u64,
    next_state_id: u64,
    next_event_id: u64,
    next_outcome_id: u64,
    next_operation_id: u64,
    next_call_id: u64,
    next_checkpoint_id: u64,
}

impl SqliteRecorder {
    /// Opens (creating if necessary) a `SQLite`-backed recorder, applying
    /// pragmas and running schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] if the path is invalid, the connection
    /// cannot be opened, or the schema is an unsupported version.
    pub fn open(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_path(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        let next_run_id = max_id(&connection, "runs", "run_id")? + 1;
        let next_row_id = max_id(&connection, "pipeline_rows", "row_id")? + 1;
        let next_state_id = max_id(&connection, "node_states", "state_id")? + 1;
        let next_event_id = max_id(&connection, "routing_events", "event_id")? + 1;
        let next_outcome_id = max_id(&connection, "token_outcomes", "rowid")? + 1;
        let next_operation_id = max_id(&connection, "operations", "operation_id")? + 1;
        let next_call_id = max_id(&connection, "calls", "call_id")? + 1;
        let next_checkpoint_id = max_id(&connection, "checkpoints", "checkpoint_id")? + 1;
        let open_run_status = status_key(&RunStatus::Running).map_err(|err| SqliteStoreError::Corrupt(err.to_string()))?;
        let open_run: Option<i64> = connection
            .query_row("SELECT run_id FROM runs WHERE status = ?1 LIMIT 1", params![open_run_status], |row| row.get(0))
            .optional()
            .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
        let open_run = open_run.and_then(|raw| u64::try_from(raw).ok()).and_then(RunId::from_raw);
        Ok(Self {
            connection,
            open_run,
            next_run_id,
            next_row_id,
            next_state_id,
            next_event_id,
            next_outcome_id,
            next_operation_id,
            next_call_id,
            next_checkpoint_id,
        })
    }

    fn fetch_run(&self, run_id: RunId) -> Result<Option<Run>, RecorderError> {
        let data: Option<String> = self
            .connection
            .query_row("SELECT data FROM runs WHERE run_id = ?1", params![i64::try_from(run_id.get()).unwrap_or(i64::MAX)], |row| row.get(0))
            .optional()
            .map_err(db_err)?;
        data.map(|text| from_json(&text)).transpose()
    }

    fn store_run(&self, run: &Run) -> Result<(), RecorderError> {
        let data = to_json(run)?;
        let status = status_key(&run.status)?;
        self.connection
            .execute(
                "UPDATE runs SET status = ?1, data = ?2 WHERE run_id = ?3",
                params![status, data, i64::try_from(run.run_id.get()).unwrap_or(i64::MAX)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn fetch_node_state(&self, state_id: StateId) -> Result<Option<NodeState>, RecorderError> {
        let data: Option<String> = self
            .connection
            .query_row("SELECT data FROM node_states WHERE state_id = ?1", params![i64::try_from(state_id.get()).unwrap_or(i64::MAX)], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        data.map(|text| from_json(&text)).transpose()
    }

    fn fetch_operation(&self, operation_id: OperationId) -> Result<Option<Operation>, RecorderError> {
        let data: Option<String> = self
            .connection
            .query_row("SELECT data FROM operations WHERE operation_id = ?1", params![i64::try_from(operation_id.get()).unwrap_or(i64::MAX)], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        data.map(|text| from_json(&text)).transpose()
    }
}

/// Mirrors `next_id` from the in-memory recorder: advances a counter and
/// constructs the target identifier, never returning zero.
fn next_id<T>(counter: &mut u64, ctor: impl Fn(u64) -> Option<T>) -> T {
    let value = *counter;
    *counter += 1;
    ctor(value).unwrap_or_else(|| ctor(1).unwrap_or_else(|| {
        // `ctor(1)` is `NonZeroU64`-backed and 1 is always non-zero; this
        // branch is unreachable but avoids a second `unwrap`.
        #[allow(clippy::panic, reason = "truly unreachable: ctor(1) always succeeds for every identifier type in this crate")]
        { panic!("identifier constructor rejected 1") }
    }))
}

impl AuditRecorder for SqliteRecorder {
    fn begin_run(&mut self, config_hash: HashDigest, canonical_version: String, now: Timestamp) -> Result<RunId, RecorderError> {
        if self.open_run.is_some() {
            return Err(RecorderError::RunAlreadyOpen);
        }
        let run_id = next_id(&mut self.next_run_id, RunId::from_raw);
        let run = Run {
            run_id,
            started_at: now,
            completed_at: None,
            status: RunStatus::Running,
            config_hash,
            canonical_version,
            schema_contract: None,
            source_schema: None,
            export_status: auditflow_core::model::ExportStatus::NotConfigured,
            export_error: None,
            reproducibility_grade: ReproducibilityGrade::Full,
        };
        let data = to_json(&run)?;
        let status = status_key(&run.status)?;
        self.connection
            .execute(
                "INSERT INTO runs (run_id, status, data) VALUES (?1, ?2, ?3)",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), status, data],
            )
            .map_err(db_err)?;
        self.open_run = Some(run_id);
        Ok(run_id)
    }

    fn register_node(&mut self, run_id: RunId, node: Node) -> Result<(), RecorderError> {
        let data = to_json(&node)?;
        let result = self.connection.execute(
            "INSERT INTO nodes (run_id, node_id, data) VALUES (?1, ?2, ?3)",
            params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), node.node_id.as_str(), data],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => {
                Err(RecorderError::DuplicateRegistration { kind: "node", id: node.node_id.to_string(), run_id })
            }
            Err(err) => Err(db_err(err)),
        }
    }

    fn register_edge(&mut self, run_id: RunId, edge_id: EdgeId, from_node: NodeId, to_node: NodeId, label: String) -> Result<(), RecorderError> {
        let result = self.connection.execute(
            "INSERT INTO edges (run_id, edge_id, from_node, to_node, label) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(edge_id.get()).unwrap_or(i64::MAX), from_node.as_str(), to_node.as_str(), label],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(RecorderError::DuplicateRegistration { kind: "edge", id: edge_id.to_string(), run_id }),
            Err(err) => Err(db_err(err)),
        }
    }

    fn register_sink(&mut self, run_id: RunId, sink_name: String, node_id: NodeId) -> Result<(), RecorderError> {
        let result = self.connection.execute(
            "INSERT INTO sinks (run_id, sink_name, node_id) VALUES (?1, ?2, ?3)",
            params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), sink_name.clone(), node_id.as_str()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(RecorderError::DuplicateRegistration { kind: "sink", id: sink_name, run_id }),
            Err(err) => Err(db_err(err)),
        }
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
        let row = Row { row_id, run_id, source_node_id, row_index, source_data_hash, source_data_ref, created_at: now };
        let data = to_json(&row)?;
        self.connection
            .execute(
                "INSERT INTO pipeline_rows (run_id, row_id, data) VALUES (?1, ?2, ?3)",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(row_id.get()).unwrap_or(i64::MAX), data],
            )
            .map_err(db_err)?;
        Ok(row_id)
    }

    fn create_token(&mut self, run_id: RunId, token: Token) -> Result<(), RecorderError> {
        let data = to_json(&token)?;
        self.connection
            .execute(
                "INSERT INTO tokens (run_id, token_id, row_id, data) VALUES (?1, ?2, ?3, ?4)",
                params![
                    i64::try_from(run_id.get()).unwrap_or(i64::MAX),
                    i64::try_from(token.token_id.get()).unwrap_or(i64::MAX),
                    i64::try_from(token.row_id.get()).unwrap_or(i64::MAX),
                    data
                ],
            )
            .map_err(db_err)?;
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
        let running_status = status_key(&NodeStateStatus::Running)?;
        let already_running: Option<i64> = self
            .connection
            .query_row(
                "SELECT 1 FROM node_states WHERE token_id = ?1 AND node_id = ?2 AND status = ?3 LIMIT 1",
                params![i64::try_from(token_id.get()).unwrap_or(i64::MAX), node_id.as_str(), running_status],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let max_attempt: Option<i64> = self
            .connection
            .query_row(
                "SELECT MAX(attempt) FROM node_states WHERE token_id = ?1 AND node_id = ?2",
                params![i64::try_from(token_id.get()).unwrap_or(i64::MAX), node_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .flatten();
        let attempt = max_attempt.map_or(1, |value| u32::try_from(value).unwrap_or(u32::MAX).saturating_add(1));
        if already_running.is_some() {
            return Err(RecorderError::NodeStateAlreadyRunning { token_id, attempt });
        }
        let state_id = next_id(&mut self.next_state_id, StateId::from_raw);
        let state = NodeState {
            state_id,
            token_id,
            run_id,
            node_id: node_id.clone(),
            step_index,
            attempt,
            status: NodeStateStatus::Running,
            input_hash,
            output_hash: None,
            error_json: None,
            started_at: now,
            completed_at: None,
        };
        let data = to_json(&state)?;
        let status = status_key(&state.status)?;
        self.connection
            .execute(
                "INSERT INTO node_states (state_id, run_id, token_id, node_id, attempt, status, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    i64::try_from(state_id.get()).unwrap_or(i64::MAX),
                    i64::try_from(run_id.get()).unwrap_or(i64::MAX),
                    i64::try_from(token_id.get()).unwrap_or(i64::MAX),
                    node_id.as_str(),
                    attempt,
                    status,
                    data
                ],
            )
            .map_err(db_err)?;
        Ok(state_id)
    }

    fn complete_node_state(
        &mut self,
        state_id: StateId,
        status: auditflow_core::model::NodeStateStatus,
        output_hash: Option<HashDigest>,
        error_json: Option<Value>,
        now: Timestamp,
    ) -> Result<(), RecorderError> {
        let Some(mut state) = self.fetch_node_state(state_id)? else {
            return Ok(());
        };
        state.status = status;
        state.output_hash = output_hash;
        state.error_json = error_json;
        state.completed_at = Some(now);
        let data = to_json(&state)?;
        let status_text = status_key(&state.status)?;
        self.connection
            .execute(
                "UPDATE node_states SET status = ?1, data = ?2 WHERE state_id = ?3",
                params![status_text, data, i64::try_from(state_id.get()).unwrap_or(i64::MAX)],
            )
            .map_err(db_err)?;
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
        let event = RoutingEvent { event_id, state_id, edge_id, routing_group_id, ordinal, mode, reason_hash, reason_ref, created_at: now };
        let data = to_json(&event)?;
        self.connection
            .execute(
                "INSERT INTO routing_events (event_id, state_id, data) VALUES (?1, ?2, ?3)",
                params![i64::try_from(event_id.get()).unwrap_or(i64::MAX), i64::try_from(state_id.get()).unwrap_or(i64::MAX), data],
            )
            .map_err(db_err)?;
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
        let existing: Option<i64> = self
            .connection
            .query_row(
                "SELECT 1 FROM token_outcomes WHERE run_id = ?1 AND token_id = ?2",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(token_id.get()).unwrap_or(i64::MAX)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(RecorderError::TokenAlreadyTerminal { token_id });
        }
        if outcome == TokenOutcomeKind::Completed {
            let Some(sink) = &sink_name else {
                return Err(RecorderError::MissingSinkNodeState { token_id, sink_name: String::new() });
            };
            let sink_node_id: Option<String> = self
                .connection
                .query_row(
                    "SELECT node_id FROM sinks WHERE run_id = ?1 AND sink_name = ?2",
                    params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), sink],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let Some(sink_node_id) = sink_node_id else {
                return Err(RecorderError::MissingSinkNodeState { token_id, sink_name: sink.clone() });
            };
            let completed_status = status_key(&NodeStateStatus::Completed)?;
            let has_completed_sink_state: Option<i64> = self
                .connection
                .query_row(
                    "SELECT 1 FROM node_states WHERE token_id = ?1 AND node_id = ?2 AND status = ?3 LIMIT 1",
                    params![i64::try_from(token_id.get()).unwrap_or(i64::MAX), sink_node_id, completed_status],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if has_completed_sink_state.is_none() {
                return Err(RecorderError::MissingSinkNodeState { token_id, sink_name: sink.clone() });
            }
        }
        let outcome_id = next_id(&mut self.next_outcome_id, OutcomeId::from_raw);
        let record = TokenOutcome { outcome_id, run_id, token_id, outcome, is_terminal: true, sink_name, error_hash, recorded_at: now };
        let data = to_json(&record)?;
        self.connection
            .execute(
                "INSERT INTO token_outcomes (run_id, token_id, data) VALUES (?1, ?2, ?3)",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(token_id.get()).unwrap_or(i64::MAX), data],
            )
            .map_err(db_err)?;
        Ok(outcome_id)
    }

    fn begin_operation(&mut self, run_id: RunId, node_id: NodeId, operation_type: String, input_data_ref: Option<HashDigest>, now: Timestamp) -> OperationId {
        let operation_id = next_id(&mut self.next_operation_id, OperationId::from_raw);
        let operation = Operation {
            operation_id,
            run_id,
            node_id: node_id.clone(),
            operation_type,
            status: OperationStatus::Pending,
            input_data_ref,
            output_data_ref: None,
            started_at: now,
            completed_at: None,
            error: None,
        };
        match to_json(&operation).and_then(|data| {
            self.connection
                .execute(
                    "INSERT INTO operations (operation_id, run_id, node_id, data) VALUES (?1, ?2, ?3, ?4)",
                    params![i64::try_from(operation_id.get()).unwrap_or(i64::MAX), i64::try_from(run_id.get()).unwrap_or(i64::MAX), node_id.as_str(), data],
                )
                .map_err(db_err)
        }) {
            Ok(_) => {}
            Err(err) => tracing::error!(%operation_id, error = %err, "failed to persist operation start"),
        }
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
        let Some(mut operation) = self.fetch_operation(operation_id)? else {
            return Ok(());
        };
        operation.status = status;
        operation.output_data_ref = output_data_ref;
        operation.error = error;
        operation.completed_at = Some(now);
        let data = to_json(&operation)?;
        self.connection
            .execute("UPDATE operations SET data = ?1 WHERE operation_id = ?2", params![data, i64::try_from(operation_id.get()).unwrap_or(i64::MAX)])
            .map_err(db_err)?;
        Ok(())
    }

    fn record_call(&mut self, run_id: RunId, parent: CallParent, call: Call) -> CallId {
        let call_id = next_id(&mut self.next_call_id, CallId::from_raw);
        let call = Call { call_id, run_id, parent, ..call };
        match to_json(&call).and_then(|data| {
            self.connection
                .execute(
                    "INSERT INTO calls (call_id, run_id, data) VALUES (?1, ?2, ?3)",
                    params![i64::try_from(call_id.get()).unwrap_or(i64::MAX), i64::try_from(run_id.get()).unwrap_or(i64::MAX), data],
                )
                .map_err(db_err)
        }) {
            Ok(_) => {}
            Err(err) => tracing::error!(%call_id, error = %err, "failed to persist call record"),
        }
        call_id
    }

    fn record_checkpoint(&mut self, checkpoint: auditflow_core::model::Checkpoint) -> CheckpointId {
        let checkpoint_id = next_id(&mut self.next_checkpoint_id, CheckpointId::from_raw);
        let checkpoint = auditflow_core::model::Checkpoint { checkpoint_id, ..checkpoint };
        match to_json(&checkpoint).and_then(|data| {
            self.connection
                .execute(
                    "INSERT INTO checkpoints (checkpoint_id, run_id, sequence_number, data) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        i64::try_from(checkpoint_id.get()).unwrap_or(i64::MAX),
                        i64::try_from(checkpoint.run_id.get()).unwrap_or(i64::MAX),
                        i64::try_from(checkpoint.sequence_number).unwrap_or(i64::MAX),
                        data
                    ],
                )
                .map_err(db_err)
        }) {
            Ok(_) => {}
            Err(err) => tracing::error!(%checkpoint_id, error = %err, "failed to persist checkpoint"),
        }
        checkpoint_id
    }

    fn finalize_run(&mut self, run_id: RunId, status: RunStatus, now: Timestamp) -> Result<(), RecorderError> {
        if let Some(mut run) = self.fetch_run(run_id)? {
            run.status = status;
            run.completed_at = Some(now);
            self.store_run(&run)?;
        }
        if self.open_run == Some(run_id) {
            self.open_run = None;
        }
        Ok(())
    }

    fn explain_row(&self, run_id: RunId, row_id: RowId) -> Result<RowExplanation, RecorderError> {
        let row_data: Option<String> = self
            .connection
            .query_row(
                "SELECT data FROM pipeline_rows WHERE run_id = ?1 AND row_id = ?2",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(row_id.get()).unwrap_or(i64::MAX)],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(row_data) = row_data else {
            return Err(RecorderError::UnknownRow { row_id, run_id });
        };
        let row: Row = from_json(&row_data)?;

        let mut tokens_stmt = self
            .connection
            .prepare("SELECT data FROM tokens WHERE run_id = ?1 AND row_id = ?2 ORDER BY token_id")
            .map_err(db_err)?;
        let tokens: Vec<Token> = tokens_stmt
            .query_map(params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(row_id.get()).unwrap_or(i64::MAX)], |r| {
                r.get::<_, String>(0)
            })
            .map_err(db_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_err)?
            .into_iter()
            .map(|text| from_json(&text))
            .collect::<Result<Vec<Token>, RecorderError>>()?;

        let mut node_states = Vec::new();
        for token in &tokens {
            let mut stmt = self.connection.prepare("SELECT data FROM node_states WHERE token_id = ?1 ORDER BY state_id").map_err(db_err)?;
            let rows: Vec<String> = stmt
                .query_map(params![i64::try_from(token.token_id.get()).unwrap_or(i64::MAX)], |r| r.get(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            for text in rows {
                node_states.push(from_json::<NodeState>(&text)?);
            }
        }

        let mut routing_events = Vec::new();
        for state in &node_states {
            let mut stmt = self.connection.prepare("SELECT data FROM routing_events WHERE state_id = ?1 ORDER BY event_id").map_err(db_err)?;
            let rows: Vec<String> = stmt
                .query_map(params![i64::try_from(state.state_id.get()).unwrap_or(i64::MAX)], |r| r.get(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            for text in rows {
                routing_events.push(from_json::<RoutingEvent>(&text)?);
            }
        }

        let mut outcomes = Vec::new();
        for token in &tokens {
            let data: Option<String> = self
                .connection
                .query_row(
                    "SELECT data FROM token_outcomes WHERE run_id = ?1 AND token_id = ?2",
                    params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(token.token_id.get()).unwrap_or(i64::MAX)],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if let Some(text) = data {
                outcomes.push(from_json::<TokenOutcome>(&text)?);
            }
        }

        Ok(RowExplanation { row, tokens, node_states, routing_events, outcomes })
    }

    fn get_unprocessed_rows(&self, run_id: RunId) -> Vec<RowId> {
        let run_id_param = i64::try_from(run_id.get()).unwrap_or(i64::MAX);
        let query = self.connection.prepare(
            "SELECT r.row_id FROM pipeline_rows r
             WHERE r.run_id = ?1
             AND NOT EXISTS (
                 SELECT 1 FROM tokens t
                 JOIN token_outcomes o ON o.run_id = t.run_id AND o.token_id = t.token_id
                 WHERE t.run_id = r.run_id AND t.row_id = r.row_id
             )
             ORDER BY r.row_id",
        );
        let rows = query.and_then(|mut stmt| {
            stmt.query_map(params![run_id_param], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<i64>, _>>()
        });
        match rows {
            Ok(ids) => ids.into_iter().filter_map(|raw| u64::try_from(raw).ok()).filter_map(RowId::from_raw).collect(),
            Err(err) => {
                tracing::error!(%run_id, error = %err, "failed to query unprocessed rows");
                Vec::new()
            }
        }
    }

    fn record_transform_error(&mut self, error: TransformError) {
        let run_id = error.run_id;
        match to_json(&error).and_then(|data| {
            self.connection
                .execute("INSERT INTO transform_errors (run_id, data) VALUES (?1, ?2)", params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), data])
                .map_err(db_err)
        }) {
            Ok(_) => {}
            Err(err) => tracing::error!(%run_id, error = %err, "failed to persist transform error"),
        }
    }

    fn terminal_runs(&self) -> Vec<Run> {
        self.all_runs().into_iter().filter(|run| run.status.is_terminal()).collect()
    }

    fn all_runs(&self) -> Vec<Run> {
        let query = self.connection.prepare("SELECT data FROM runs ORDER BY run_id").and_then(|mut stmt| {
            stmt.query_map(params![], |row| row.get::<_, String>(0))?.collect::<Result<Vec<String>, _>>()
        });
        match query {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|text| match from_json::<Run>(&text) {
                    Ok(run) => Some(run),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to decode a stored run, skipping it");
                        None
                    }
                })
                .collect(),
            Err(err) => {
                tracing::error!(error = %err, "failed to query stored runs");
                Vec::new()
            }
        }
    }

    fn payload_refs_for_run(&self, run_id: RunId) -> Vec<PayloadRef> {
        let mut refs = Vec::new();
        let run_id_param = i64::try_from(run_id.get()).unwrap_or(i64::MAX);

        let rows_query = self.connection.prepare("SELECT data FROM pipeline_rows WHERE run_id = ?1").and_then(|mut stmt| {
            stmt.query_map(params![run_id_param], |row| row.get::<_, String>(0))?.collect::<Result<Vec<String>, _>>()
        });
        if let Ok(texts) = rows_query {
            for text in texts {
                if let Ok(row) = from_json::<Row>(&text) {
                    if let Some(hash) = row.source_data_ref {
                        refs.push(PayloadRef { run_id, kind: PayloadRefKind::RowSourceData, hash });
                    }
                }
            }
        }

        let operations_query = self.connection.prepare("SELECT data FROM operations WHERE run_id = ?1").and_then(|mut stmt| {
            stmt.query_map(params![run_id_param], |row| row.get::<_, String>(0))?.collect::<Result<Vec<String>, _>>()
        });
        if let Ok(texts) = operations_query {
            for text in texts {
                if let Ok(operation) = from_json::<Operation>(&text) {
                    if let Some(hash) = operation.input_data_ref {
                        refs.push(PayloadRef { run_id, kind: PayloadRefKind::OperationInput, hash });
                    }
                    if let Some(hash) = operation.output_data_ref {
                        refs.push(PayloadRef { run_id, kind: PayloadRefKind::OperationOutput, hash });
                    }
                }
            }
        }

        let calls_query = self.connection.prepare("SELECT data FROM calls WHERE run_id = ?1").and_then(|mut stmt| {
            stmt.query_map(params![run_id_param], |row| row.get::<_, String>(0))?.collect::<Result<Vec<String>, _>>()
        });
        if let Ok(texts) = calls_query {
            for text in texts {
                if let Ok(call) = from_json::<Call>(&text) {
                    if let Some(hash) = call.request_ref {
                        refs.push(PayloadRef { run_id, kind: PayloadRefKind::CallRequest, hash });
                    }
                    if let Some(hash) = call.response_ref {
                        refs.push(PayloadRef { run_id, kind: PayloadRefKind::CallResponse, hash });
                    }
                }
            }
        }

        let events_query = self
            .connection
            .prepare("SELECT re.data FROM routing_events re JOIN node_states ns ON ns.state_id = re.state_id WHERE ns.run_id = ?1")
            .and_then(|mut stmt| stmt.query_map(params![run_id_param], |row| row.get::<_, String>(0))?.collect::<Result<Vec<String>, _>>());
        if let Ok(texts) = events_query {
            for text in texts {
                if let Ok(event) = from_json::<RoutingEvent>(&text) {
                    if let Some(hash) = event.reason_ref {
                        refs.push(PayloadRef { run_id, kind: PayloadRefKind::RoutingReason, hash });
                    }
                }
            }
        }

        refs
    }

    fn set_reproducibility_grade(&mut self, run_id: RunId, grade: ReproducibilityGrade) -> Result<(), RecorderError> {
        let mut run = self.fetch_run(run_id)?.ok_or(RecorderError::UnknownRun { run_id })?;
        run.reproducibility_grade = grade;
        self.store_run(&run)
    }

    fn get_run(&self, run_id: RunId) -> Option<Run> {
        match self.fetch_run(run_id) {
            Ok(run) => run,
            Err(err) => {
                tracing::error!(%run_id, error = %err, "failed to read run");
                None
            }
        }
    }

    fn get_row(&self, run_id: RunId, row_id: RowId) -> Option<Row> {
        let data: Option<String> = self
            .connection
            .query_row(
                "SELECT data FROM pipeline_rows WHERE run_id = ?1 AND row_id = ?2",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX), i64::try_from(row_id.get()).unwrap_or(i64::MAX)],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_else(|err| {
                tracing::error!(%run_id, %row_id, error = %err, "failed to read row");
                None
            });
        data.and_then(|text| match from_json::<Row>(&text) {
            Ok(row) => Some(row),
            Err(err) => {
                tracing::error!(%run_id, %row_id, error = %err, "failed to decode row");
                None
            }
        })
    }

    fn latest_checkpoint(&self, run_id: RunId) -> Option<auditflow_core::model::Checkpoint> {
        let data: Option<String> = self
            .connection
            .query_row(
                "SELECT data FROM checkpoints WHERE run_id = ?1 ORDER BY sequence_number DESC LIMIT 1",
                params![i64::try_from(run_id.get()).unwrap_or(i64::MAX)],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or_else(|err| {
                tracing::error!(%run_id, error = %err, "failed to read latest checkpoint");
                None
            });
        data.and_then(|text| match from_json::<auditflow_core::model::Checkpoint>(&text) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                tracing::error!(%run_id, error = %err, "failed to decode checkpoint");
                None
            }
        })
    }

    fn set_schema_contract(&mut self, run_id: RunId, contract: SchemaContract, hash: HashDigest, source_schema: Option<Value>) -> Result<(), RecorderError> {
        let mut run = self.fetch_run(run_id)?.ok_or(RecorderError::UnknownRun { run_id })?;
        run.schema_contract = Some((contract, hash));
        run.source_schema = source_schema;
        self.store_run(&run)
    }

    fn highest_token_id(&self, run_id: RunId) -> Option<TokenId> {
        let value: Option<i64> = self
            .connection
            .query_row("SELECT MAX(token_id) FROM tokens WHERE run_id = ?1", params![i64::try_from(run_id.get()).unwrap_or(i64::MAX)], |row| row.get(0))
            .optional()
            .unwrap_or_else(|err| {
                tracing::error!(%run_id, error = %err, "failed to read highest token id");
                None
            })
            .flatten();
        value.and_then(|raw| u64::try_from(raw).ok()).and_then(TokenId::from_raw)
    }

    fn set_export_status(&mut self, run_id: RunId, status: auditflow_core::model::ExportStatus, error: Option<String>) -> Result<(), RecorderError> {
        let mut run = self.fetch_run(run_id)?.ok_or(RecorderError::UnknownRun { run_id })?;
        run.export_status = status;
        run.export_error = error;
        self.store_run(&run)
    }
}
