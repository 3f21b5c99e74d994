// crates/auditflow-core/src/schema.rs
// ============================================================================
// Module: Schema Contracts
// Description: Producer/consumer schema compatibility for graph edges.
// Purpose: Decide whether one node's output shape satisfies another's input.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A node's effective schema is either **observed** (no declared fields,
//! compatible with anything) or **explicit** (a fixed field set with value
//! types, requiring strict structural compatibility). Two schemas with the
//! same shape may be distinct object identities — compatibility here is
//! always structural, never by identity.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Coarse value type for an explicit schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 string.
    String,
    /// Signed integer.
    Integer,
    /// Floating-point number.
    Float,
    /// Boolean.
    Boolean,
    /// JSON object (nested fields are not further validated).
    Object,
    /// JSON array (element type is not further validated).
    Array,
    /// Accepts any JSON value.
    Any,
}

impl FieldType {
    /// Returns whether a producer field of this type satisfies a consumer
    /// field expecting `other`.
    #[must_use]
    pub const fn satisfies(self, other: Self) -> bool {
        matches!(other, Self::Any) || matches!(self, Self::Any) || self.same_kind(other)
    }

    const fn same_kind(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::String, Self::String)
                | (Self::Integer, Self::Integer)
                | (Self::Float, Self::Float)
                | (Self::Boolean, Self::Boolean)
                | (Self::Object, Self::Object)
                | (Self::Array, Self::Array)
        )
    }
}

/// One field declared in an explicit schema contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared value type.
    pub field_type: FieldType,
    /// Whether the field must be present on every row.
    pub required: bool,
}

impl FieldSpec {
    /// Creates a required field specification.
    #[must_use]
    pub const fn required(field_type: FieldType) -> Self {
        Self { field_type, required: true }
    }

    /// Creates an optional field specification.
    #[must_use]
    pub const fn optional(field_type: FieldType) -> Self {
        Self { field_type, required: false }
    }
}

/// A node's effective input or output schema contract.
///
/// # Invariants
/// - [`SchemaContract::Observed`] is always compatible with any consumer.
/// - [`SchemaContract::Explicit`] requires strict structural compatibility.
/// - Observed and explicit contracts must never be mixed at a coalesce or at
///   a node with multiple inbound edges (enforced by the graph builder, not
///   by this type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaContract {
    /// No fields declared; any row shape is accepted.
    Observed,
    /// A fixed field set with declared types.
    Explicit {
        /// Field name to specification.
        fields: BTreeMap<String, FieldSpec>,
    },
}

impl SchemaContract {
    /// Returns whether this contract is [`SchemaContract::Observed`].
    #[must_use]
    pub const fn is_observed(&self) -> bool {
        matches!(self, Self::Observed)
    }

    /// Returns whether this contract is [`SchemaContract::Explicit`].
    #[must_use]
    pub const fn is_explicit(&self) -> bool {
        matches!(self, Self::Explicit { .. })
    }
}

/// Errors raised when checking or merging schema contracts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// A producer's output does not satisfy a consumer's declared input.
    #[error(
        "schema incompatible: field {field:?} producer type {producer:?} \
         does not satisfy consumer type {consumer:?}"
    )]
    FieldTypeMismatch {
        /// Offending field name.
        field: String,
        /// Producer-declared type.
        producer: FieldType,
        /// Consumer-required type.
        consumer: FieldType,
    },
    /// A consumer requires a field the producer never declares.
    #[error("schema incompatible: required field {field:?} is not produced")]
    MissingRequiredField {
        /// Missing field name.
        field: String,
    },
    /// An observed branch was combined with an explicit branch.
    #[error("schema incompatible: observed and explicit contracts cannot be mixed at {at}")]
    MixedObservedAndExplicit {
        /// Description of the offending node or coalesce.
        at: String,
    },
    /// Two branches declare the same field with incompatible types during a
    /// union merge.
    #[error(
        "contract merge failed for field {field:?}: {left:?} is incompatible with {right:?}"
    )]
    ContractMergeConflict {
        /// Offending field name.
        field: String,
        /// First branch's declared type.
        left: FieldType,
        /// Second branch's declared type.
        right: FieldType,
    },
}

/// Checks whether `producer`'s effective output schema satisfies `consumer`'s
/// declared input schema.
///
/// # Errors
///
/// Returns [`SchemaError`] describing the first incompatibility found.
pub fn check_compatible(producer: &SchemaContract, consumer: &SchemaContract) -> Result<(), SchemaError> {
    match (producer, consumer) {
        (_, SchemaContract::Observed) => Ok(()),
        (SchemaContract::Observed, SchemaContract::Explicit { .. }) => {
            // An observed producer may emit any row, including one that
            // violates the explicit consumer's contract. This is only safe
            // to accept at build time if the consumer treats its contract as
            // advisory; the spec treats this combination as an error when it
            // occurs at a coalesce or multi-inbound node (see
            // `MixedObservedAndExplicit`). At a plain two-node edge an
            // observed producer feeding an explicit consumer is permitted
            // optimistically; runtime row validation is the consumer's
            // responsibility.
            Ok(())
        }
        (SchemaContract::Explicit { fields: producer_fields }, SchemaContract::Explicit { fields: consumer_fields }) => {
            for (name, consumer_spec) in consumer_fields {
                match producer_fields.get(name) {
                    Some(producer_spec) => {
                        if !producer_spec.field_type.satisfies(consumer_spec.field_type) {
                            return Err(SchemaError::FieldTypeMismatch {
                                field: name.clone(),
                                producer: producer_spec.field_type,
                                consumer: consumer_spec.field_type,
                            });
                        }
                    }
                    None if consumer_spec.required => {
                        return Err(SchemaError::MissingRequiredField { field: name.clone() });
                    }
                    None => {}
                }
            }
            Ok(())
        }
    }
}

/// Checks that a set of inbound branch contracts (for a coalesce or any node
/// with multiple inbound edges) does not mix observed and explicit schemas.
///
/// # Errors
///
/// Returns [`SchemaError::MixedObservedAndExplicit`] when at least one
/// observed and one explicit branch are both present.
pub fn check_not_mixed<'a>(
    at: &str,
    branches: impl IntoIterator<Item = &'a SchemaContract>,
) -> Result<(), SchemaError> {
    let mut saw_observed = false;
    let mut saw_explicit = false;
    for branch in branches {
        match branch {
            SchemaContract::Observed => saw_observed = true,
            SchemaContract::Explicit { .. } => saw_explicit = true,
        }
        if saw_observed && saw_explicit {
            return Err(SchemaError::MixedObservedAndExplicit { at: at.to_string() });
        }
    }
    Ok(())
}

/// Merges two explicit branch contracts for a `union` coalesce merge, where
/// later branches override earlier fields of the same type.
///
/// # Errors
///
/// Returns [`SchemaError::ContractMergeConflict`] when the same field is
/// declared with incompatible types on both branches.
pub fn merge_union(base: &SchemaContract, incoming: &SchemaContract) -> Result<SchemaContract, SchemaError> {
    match (base, incoming) {
        (SchemaContract::Observed, _) | (_, SchemaContract::Observed) => Ok(SchemaContract::Observed),
        (SchemaContract::Explicit { fields: base_fields }, SchemaContract::Explicit { fields: incoming_fields }) => {
            let mut merged = base_fields.clone();
            for (name, incoming_spec) in incoming_fields {
                match merged.get(name) {
                    Some(existing) if existing.field_type != incoming_spec.field_type => {
                        return Err(SchemaError::ContractMergeConflict {
                            field: name.clone(),
                            left: existing.field_type,
                            right: incoming_spec.field_type,
                        });
                    }
                    _ => {
                        merged.insert(name.clone(), incoming_spec.clone());
                    }
                }
            }
            Ok(SchemaContract::Explicit { fields: merged })
        }
    }
}

/// Builds the fixed contract for a `nested` coalesce merge: one `object`
/// field per declared branch name, required only for branches that are
/// guaranteed to arrive under the coalesce policy.
#[must_use]
pub fn merge_nested(branch_names: &[(&str, bool)]) -> SchemaContract {
    let fields = branch_names
        .iter()
        .map(|(name, required)| ((*name).to_string(), FieldSpec { field_type: FieldType::Object, required: *required }))
        .collect();
    SchemaContract::Explicit { fields }
}
