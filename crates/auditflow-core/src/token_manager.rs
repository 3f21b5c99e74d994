// crates/auditflow-core/src/token_manager.rs
// ============================================================================
// Module: Token Lineage
// Description: Creates original, forked, coalesced, and expanded tokens.
// Purpose: Centralize the bookkeeping that keeps a row's token lineage
//          reconstructible after the fact.
// Dependencies: crate::{identifiers, model, time}
// ============================================================================

//! ## Overview
//! A row has exactly one original token. Every other token descends from it
//! through a fork, a coalesce (join), or an expansion, each of which shares
//! a [`GroupId`] across its siblings so that `explain_row` can reconstruct
//! the full tree without walking every intermediate step.

use crate::identifiers::GroupId;
use crate::identifiers::GroupIdAllocator;
use crate::identifiers::RowId;
use crate::identifiers::TokenId;
use crate::model::Token;
use crate::time::Timestamp;

/// Issues monotonically increasing [`TokenId`]s and [`GroupId`]s for one run.
#[derive(Debug, Default)]
pub struct TokenManager {
    next_token_id: u64,
    groups: GroupIdAllocator,
}

impl TokenManager {
    /// Creates a token manager with empty counters.
    #[must_use]
    pub const fn new() -> Self {
        Self { next_token_id: 0, groups: GroupIdAllocator::new() }
    }

    /// Advances the token counter so every subsequently issued [`TokenId`] is
    /// strictly greater than `minimum`. Used when resuming a run in a fresh
    /// process, where the in-memory counter otherwise starts back at zero
    /// and would reissue ids the recorder already persisted.
    pub fn seed_token_counter(&mut self, minimum: u64) {
        self.next_token_id = self.next_token_id.max(minimum);
    }

    /// Allocates a bare group identifier with no associated token, for
    /// callers that need a shared [`GroupId`] before the tokens sharing it
    /// exist yet.
    pub fn allocate_group(&mut self) -> GroupId {
        self.groups.allocate()
    }

    fn allocate_token_id(&mut self) -> TokenId {
        self.next_token_id += 1;
        TokenId::from_raw(self.next_token_id).unwrap_or_else(|| {
            // Exhausting a `u64` counter within one run is not reachable in
            // practice; fall back to the first id rather than panic.
            TokenId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"))
        })
    }

    /// Creates the original token for a newly emitted row.
    #[must_use]
    pub fn create_original(&mut self, row_id: RowId, now: Timestamp) -> Token {
        Token {
            token_id: self.allocate_token_id(),
            row_id,
            parent_token_id: None,
            branch_name: None,
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            created_at: now,
        }
    }

    /// Duplicates `parent` into one sibling token per branch name, sharing a
    /// fresh `fork_group_id`.
    #[must_use]
    pub fn fork(&mut self, parent: &Token, branch_names: &[String], now: Timestamp) -> Vec<Token> {
        let group = self.groups.allocate();
        branch_names
            .iter()
            .map(|branch_name| Token {
                token_id: self.allocate_token_id(),
                row_id: parent.row_id,
                parent_token_id: Some(parent.token_id),
                branch_name: Some(branch_name.clone()),
                fork_group_id: Some(group),
                join_group_id: None,
                expand_group_id: None,
                created_at: now,
            })
            .collect()
    }

    /// Merges `parents` into one successor token at a coalesce, sharing a
    /// fresh `join_group_id`. All parents must belong to the same row.
    #[must_use]
    pub fn coalesce_tokens(&mut self, parents: &[Token], now: Timestamp) -> Option<Token> {
        let row_id = parents.first()?.row_id;
        if parents.iter().any(|t| t.row_id != row_id) {
            return None;
        }
        let group = self.groups.allocate();
        Some(Token {
            token_id: self.allocate_token_id(),
            row_id,
            parent_token_id: parents.first().map(|t| t.token_id),
            branch_name: None,
            fork_group_id: None,
            join_group_id: Some(group),
            expand_group_id: None,
            created_at: now,
        })
    }

    /// Expands `parent` into `count` sibling tokens sharing a fresh
    /// `expand_group_id`, used by aggregation nodes configured to emit one
    /// token per output row.
    #[must_use]
    pub fn expand(&mut self, parent: &Token, count: usize, now: Timestamp) -> Vec<Token> {
        let group = self.groups.allocate();
        (0..count)
            .map(|_| Token {
                token_id: self.allocate_token_id(),
                row_id: parent.row_id,
                parent_token_id: Some(parent.token_id),
                branch_name: None,
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: Some(group),
                created_at: now,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> RowId {
        RowId::from_raw(1).unwrap_or_else(|| unreachable!("1 is non-zero"))
    }

    #[test]
    fn fork_produces_siblings_sharing_a_group() {
        let mut manager = TokenManager::new();
        let now = Timestamp::now();
        let original = manager.create_original(row(), now);
        let branches = manager.fork(&original, &["left".to_string(), "right".to_string()], now);
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].fork_group_id, branches[1].fork_group_id);
        assert_ne!(branches[0].token_id, branches[1].token_id);
        assert!(branches.iter().all(|t| t.parent_token_id == Some(original.token_id)));
    }

    #[test]
    fn coalesce_rejects_parents_from_different_rows() {
        let mut manager = TokenManager::new();
        let now = Timestamp::now();
        let a = manager.create_original(row(), now);
        let other_row = RowId::from_raw(2).unwrap_or_else(|| unreachable!("2 is non-zero"));
        let b = manager.create_original(other_row, now);
        assert!(manager.coalesce_tokens(&[a, b], now).is_none());
    }

    #[test]
    fn coalesce_merges_same_row_parents() {
        let mut manager = TokenManager::new();
        let now = Timestamp::now();
        let original = manager.create_original(row(), now);
        let branches = manager.fork(&original, &["left".to_string(), "right".to_string()], now);
        let merged = manager.coalesce_tokens(&branches, now).unwrap();
        assert_eq!(merged.row_id, row());
        assert!(merged.join_group_id.is_some());
    }
}
