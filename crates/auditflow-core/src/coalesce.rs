// crates/auditflow-core/src/coalesce.rs
// ============================================================================
// Module: Coalesce Executor
// Description: Join-point state machine for fork branches rejoining a row.
// Purpose: Accumulate per-branch arrivals, apply the configured policy and
//          merge strategy, and hand the row processor a merged token.
// Dependencies: crate::{identifiers, model, schema, time, token_manager}
// ============================================================================

//! ## Overview
//! One [`CoalesceExecutor`] instance is owned per run. State is keyed by
//! `(fork_group_id, coalesce_name)` so that two unrelated forks joining at
//! the same coalesce node never interfere with each other's arrivals.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::identifiers::GroupId;
use crate::model::Token;
use crate::schema::SchemaContract;
use crate::schema::merge_nested;
use crate::schema::merge_union;
use crate::time::Timestamp;
use crate::token_manager::TokenManager;

/// When a held group's policy is satisfied and the merged token may be
/// produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Every declared branch must arrive.
    RequireAll,
    /// At least `k` of the declared branches must arrive.
    Quorum {
        /// Minimum number of arrivals required.
        k: usize,
    },
    /// Emit whatever arrived by the time the group times out.
    BestEffort,
    /// Emit on the first arrival; later arrivals for the group are discarded.
    First,
}

/// How arrived branch rows are combined into the merged token's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Flatten into one dict; later branches override earlier fields.
    Union,
    /// Nest as `{branch_name: branch_row}`.
    Nested,
    /// Keep exactly one branch's row (paired with [`CoalescePolicy::First`]).
    Select,
}

/// Declarative configuration for one coalesce node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Branch names this coalesce expects, in declared order.
    pub declared_branches: Vec<String>,
    /// Join policy.
    pub policy: CoalescePolicy,
    /// Row merge strategy.
    pub merge: MergeStrategy,
    /// Wall-clock seconds a held group may wait before timing out.
    pub timeout_seconds: u64,
}

/// One arrived branch row, held until the policy fires.
#[derive(Debug, Clone)]
struct Arrival {
    token: Token,
    branch_name: String,
    row: Value,
    contract: SchemaContract,
}

/// Lifecycle state of one `(fork_group_id, coalesce_name)` hold.
#[derive(Debug, Clone)]
enum GroupState {
    Holding { started_at: Timestamp, arrivals: Vec<Arrival> },
}

/// Outcome of submitting one arrival to the executor.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The policy has not yet fired; the token is held.
    Held,
    /// The policy fired; the merged token and row are ready to continue
    /// traversal from the coalesce's `on_success`.
    Emit {
        /// The merged token.
        token: Token,
        /// The merged row data.
        row: Value,
        /// The merged schema contract.
        contract: SchemaContract,
    },
}

/// Outcome of a group timing out.
#[derive(Debug, Clone)]
pub enum TimeoutOutcome {
    /// `best_effort` emitted whatever had arrived.
    Emit {
        /// The merged token.
        token: Token,
        /// The merged row data.
        row: Value,
        /// The merged schema contract.
        contract: SchemaContract,
    },
    /// `require_all`/`quorum` never satisfied; every arrived token fails.
    Failed {
        /// Tokens that arrived but never reached a merged outcome.
        tokens: Vec<Token>,
    },
}

/// Error produced when arrived branch contracts cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("coalesce `{coalesce_name}` branch contracts cannot be merged: {source}")]
pub struct ContractMergeError {
    /// Coalesce this failure occurred at.
    pub coalesce_name: String,
    /// Underlying schema merge failure.
    #[source]
    pub source: crate::schema::SchemaError,
}

/// Per-run state machine for every coalesce node's held groups.
#[derive(Debug, Default)]
pub struct CoalesceExecutor {
    groups: BTreeMap<(GroupId, String), GroupState>,
}

impl CoalesceExecutor {
    /// Creates an executor with no held groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits one branch arrival for `coalesce_name`, returning whether the
    /// group is still held or ready to emit.
    ///
    /// # Errors
    ///
    /// Returns [`ContractMergeError`] when a `union` merge finds
    /// incompatible branch contracts.
    #[allow(clippy::too_many_arguments, reason = "join-point bookkeeping needs the full arrival context")]
    pub fn submit(
        &mut self,
        coalesce_name: &str,
        config: &CoalesceConfig,
        fork_group_id: GroupId,
        token: Token,
        branch_name: String,
        row: Value,
        contract: SchemaContract,
        now: Timestamp,
        tokens: &mut TokenManager,
    ) -> Result<SubmitOutcome, ContractMergeError> {
        let key = (fork_group_id, coalesce_name.to_string());
        let arrival = Arrival { token, branch_name, row, contract };

        let state = self.groups.entry(key.clone()).or_insert_with(|| GroupState::Holding {
            started_at: now,
            arrivals: Vec::new(),
        });
        let GroupState::Holding { arrivals, .. } = state;
        arrivals.push(arrival);

        let satisfied = Self::policy_satisfied(config, arrivals.len());
        if !satisfied {
            return Ok(SubmitOutcome::Held);
        }

        let merged = Self::merge(coalesce_name, config, arrivals, tokens, now)?;
        self.groups.remove(&key);
        Ok(SubmitOutcome::Emit { token: merged.0, row: merged.1, contract: merged.2 })
    }

    fn policy_satisfied(config: &CoalesceConfig, arrived: usize) -> bool {
        match config.policy {
            CoalescePolicy::RequireAll => arrived >= config.declared_branches.len(),
            CoalescePolicy::Quorum { k } => arrived >= k,
            CoalescePolicy::First => arrived >= 1,
            CoalescePolicy::BestEffort => false,
        }
    }

    /// Forces every held group past its wall-clock `timeout_seconds`,
    /// returning one outcome per timed-out group.
    ///
    /// # Errors
    ///
    /// Returns [`ContractMergeError`] when a `best_effort` union merge finds
    /// incompatible branch contracts.
    pub fn flush_expired(
        &mut self,
        configs: &BTreeMap<String, CoalesceConfig>,
        now: Timestamp,
        tokens: &mut TokenManager,
    ) -> Result<Vec<((GroupId, String), TimeoutOutcome)>, ContractMergeError> {
        let mut expired_keys = Vec::new();
        for (key, state) in &self.groups {
            let GroupState::Holding { started_at, .. } = state;
            let Some(config) = configs.get(&key.1) else { continue };
            if elapsed_seconds(*started_at, now) >= config.timeout_seconds {
                expired_keys.push(key.clone());
            }
        }
        self.resolve_keys(expired_keys, configs, now, tokens)
    }

    /// Forces every held group regardless of elapsed time, used at run end so
    /// no token is silently left buffered. Behaves like [`Self::flush_expired`]
    /// with every group treated as already timed out.
    ///
    /// # Errors
    ///
    /// Returns [`ContractMergeError`] when a `best_effort` union merge finds
    /// incompatible branch contracts.
    pub fn force_flush_all(
        &mut self,
        configs: &BTreeMap<String, CoalesceConfig>,
        now: Timestamp,
        tokens: &mut TokenManager,
    ) -> Result<Vec<((GroupId, String), TimeoutOutcome)>, ContractMergeError> {
        let keys: Vec<_> = self.groups.keys().cloned().collect();
        self.resolve_keys(keys, configs, now, tokens)
    }

    fn resolve_keys(
        &mut self,
        keys: Vec<(GroupId, String)>,
        configs: &BTreeMap<String, CoalesceConfig>,
        now: Timestamp,
        tokens: &mut TokenManager,
    ) -> Result<Vec<((GroupId, String), TimeoutOutcome)>, ContractMergeError> {
        let mut outcomes = Vec::new();
        for key in keys {
            let Some(GroupState::Holding { arrivals, .. }) = self.groups.remove(&key) else { continue };
            let Some(config) = configs.get(&key.1) else { continue };
            let outcome = match config.policy {
                CoalescePolicy::BestEffort if !arrivals.is_empty() => {
                    let (token, row, contract) = Self::merge(&key.1, config, &arrivals, tokens, now)?;
                    TimeoutOutcome::Emit { token, row, contract }
                }
                _ => TimeoutOutcome::Failed { tokens: arrivals.into_iter().map(|a| a.token).collect() },
            };
            outcomes.push((key, outcome));
        }
        Ok(outcomes)
    }

    fn merge(
        coalesce_name: &str,
        config: &CoalesceConfig,
        arrivals: &[Arrival],
        tokens: &mut TokenManager,
        now: Timestamp,
    ) -> Result<(Token, Value, SchemaContract), ContractMergeError> {
        let parent_tokens: Vec<Token> = arrivals.iter().map(|a| a.token.clone()).collect();
        let merged_token = tokens.coalesce_tokens(&parent_tokens, now).unwrap_or_else(|| {
            tokens.create_original(arrivals[0].token.row_id, now)
        });

        let (row, contract) = match config.merge {
            MergeStrategy::Select => {
                let first = &arrivals[0];
                (first.row.clone(), first.contract.clone())
            }
            MergeStrategy::Union => {
                let mut merged_row = serde_json::Map::new();
                let mut merged_contract = SchemaContract::Observed;
                for arrival in arrivals {
                    if let Value::Object(fields) = &arrival.row {
                        merged_row.extend(fields.clone());
                    }
                    merged_contract = merge_union(&merged_contract, &arrival.contract).map_err(|source| {
                        ContractMergeError { coalesce_name: coalesce_name.to_string(), source }
                    })?;
                }
                (Value::Object(merged_row), merged_contract)
            }
            MergeStrategy::Nested => {
                let mut merged_row = serde_json::Map::new();
                for branch in &config.declared_branches {
                    if let Some(arrival) = arrivals.iter().find(|a| &a.branch_name == branch) {
                        merged_row.insert(branch.clone(), arrival.row.clone());
                    }
                }
                let arrived: Vec<(&str, bool)> = config
                    .declared_branches
                    .iter()
                    .map(|branch| (branch.as_str(), arrivals.iter().any(|a| &a.branch_name == branch)))
                    .collect();
                (Value::Object(merged_row), merge_nested(&arrived))
            }
        };
        Ok((merged_token, row, contract))
    }
}

fn elapsed_seconds(start: Timestamp, now: Timestamp) -> u64 {
    let start = start.as_offset_date_time();
    let now = now.as_offset_date_time();
    (now - start).whole_seconds().max(0).unsigned_abs()
}
