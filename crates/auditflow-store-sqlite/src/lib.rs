// crates/auditflow-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Audit Store
// Description: Durable AuditRecorder backend using SQLite WAL.
// Purpose: Provide production-grade persistence for an auditflow run's trail.
// Dependencies: auditflow-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`AuditRecorder`](auditflow_core::recorder::AuditRecorder)
//! implementation that persists the run/node/edge/row/token/lineage trail
//! across process restarts, with a schema-versioned migration path and WAL
//! durability.

pub mod store;

pub use store::SCHEMA_VERSION;
pub use store::SqliteRecorder;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
