// crates/auditflow-core/src/retention.rs
// ============================================================================
// Module: Retention Purge Manager
// Description: Age-based deletion of content-addressed payloads.
// Purpose: Reclaim payload-store space for completed runs past their
//          retention window without corrupting the hashed audit trail.
// Dependencies: crate::{hashing, identifiers, model, payload, recorder, time}
// ============================================================================

//! ## Overview
//! Purging a payload never touches the hash recorded on the owning row,
//! operation, call, or routing event — only the blob the hash points at.
//! A run's `reproducibility_grade` downgrades from `Full` to `Degraded`
//! exactly when one of its own payloads is actually deleted; a payload
//! merely shared with (and retained by) a newer run is skipped, not purged.

use std::collections::BTreeSet;

use crate::hashing::HashDigest;
use crate::identifiers::RunId;
use crate::model::ReproducibilityGrade;
use crate::payload::PayloadStore;
use crate::recorder::AuditRecorder;
use crate::recorder::PayloadRef;
use crate::time::Timestamp;

const SECONDS_PER_DAY: u64 = 86_400;

/// Structured result of one `purge_payloads` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PurgeResult {
    /// Refs whose blob was actually deleted.
    pub deleted_count: u64,
    /// Refs already absent from the store.
    pub skipped_count: u64,
    /// Refs the store refused or failed to delete, by hash.
    pub failed_refs: Vec<HashDigest>,
    /// Sum of deleted blob sizes, in bytes.
    pub bytes_freed: u64,
    /// Wall-clock seconds the purge took.
    pub duration_seconds: u64,
}

/// Finds and deletes expired content-addressed payloads.
#[derive(Debug, Default)]
pub struct RetentionPurgeManager;

impl RetentionPurgeManager {
    /// Creates a purge manager.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns the distinct `source_data_ref` hashes of rows belonging to
    /// runs whose `completed_at` is older than `retention_days` before
    /// `as_of`, excluding any hash still referenced by a `Running` run or a
    /// `Completed` run younger than the cutoff.
    #[must_use]
    pub fn find_expired_row_payloads(&self, recorder: &dyn AuditRecorder, retention_days: u32, as_of: Timestamp) -> Vec<HashDigest> {
        self.find_expired_payload_refs(recorder, retention_days, as_of)
            .into_iter()
            .filter(|r| r.kind == crate::recorder::PayloadRefKind::RowSourceData)
            .map(|r| r.hash)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns the union of every expired payload reference across rows,
    /// operation inputs/outputs, call requests/responses, and routing-event
    /// reasons.
    #[must_use]
    pub fn find_expired_payload_refs(&self, recorder: &dyn AuditRecorder, retention_days: u32, as_of: Timestamp) -> Vec<PayloadRef> {
        let cutoff_seconds = u64::from(retention_days) * SECONDS_PER_DAY;
        let expired_run_ids: BTreeSet<RunId> = recorder
            .terminal_runs()
            .into_iter()
            .filter(|run| run.completed_at.is_some_and(|completed| elapsed_seconds(completed, as_of) >= cutoff_seconds))
            .map(|run| run.run_id)
            .collect();

        let still_referenced: BTreeSet<HashDigest> = recorder
            .all_runs()
            .into_iter()
            .filter(|run| !expired_run_ids.contains(&run.run_id))
            .flat_map(|run| recorder.payload_refs_for_run(run.run_id))
            .map(|r| r.hash)
            .collect();

        expired_run_ids
            .into_iter()
            .flat_map(|run_id| recorder.payload_refs_for_run(run_id))
            .filter(|r| !still_referenced.contains(&r.hash))
            .collect()
    }

    /// Deletes every ref via `payload_store`, classifying each as deleted,
    /// skipped, or failed. Does not downgrade any run's reproducibility
    /// grade; call [`Self::update_grade_after_purge`] for each run that owns
    /// a deleted ref.
    #[must_use]
    pub fn purge_payloads(&self, payload_store: &dyn PayloadStore, refs: &[HashDigest], started_at: Timestamp, now: Timestamp) -> PurgeResult {
        let mut result = PurgeResult::default();
        for hash in refs {
            match payload_store.exists(hash) {
                Ok(false) => {
                    result.skipped_count += 1;
                    continue;
                }
                Err(_) => {
                    result.failed_refs.push(hash.clone());
                    continue;
                }
                Ok(true) => {}
            }
            let size_before = payload_store.get(hash).ok().flatten().map_or(0, |bytes| bytes.len() as u64);
            match payload_store.delete(hash) {
                Ok(true) => {
                    result.deleted_count += 1;
                    result.bytes_freed += size_before;
                }
                Ok(false) | Err(_) => result.failed_refs.push(hash.clone()),
            }
        }
        result.duration_seconds = elapsed_seconds(started_at, now);
        result
    }

    /// Downgrades `run_id`'s reproducibility grade to [`ReproducibilityGrade::Degraded`].
    /// Call only for runs that own at least one actually-deleted ref.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::RecorderError`] if the run does not exist.
    pub fn update_grade_after_purge(&self, recorder: &mut dyn AuditRecorder, run_id: RunId) -> Result<(), crate::error::RecorderError> {
        recorder.set_reproducibility_grade(run_id, ReproducibilityGrade::Degraded)
    }
}

fn elapsed_seconds(start: Timestamp, now: Timestamp) -> u64 {
    (now.as_offset_date_time() - start.as_offset_date_time()).whole_seconds().max(0).unsigned_abs()
}
