//! Error taxonomy.
//!
//! Three layers, each with its own type:
//! - [`StoreError`]: what a persistence backend reports.
//! - [`RecruitmentError`]: what the recruitment platform reports.
//! - [`EngineError`]: what callers of the engine see.
//!
//! Lost races (a concurrent consumer already landed the last slot, or a successor batch
//! already exists) are resolved inside the lifecycle and never reach callers. Duplicate
//! identity tokens are a [`Disposition`](crate::Disposition), not an error.

use thiserror::Error;

use crate::{ArmId, BatchId};

/// Errors reported by a [`Store`](crate::Store) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Timeout, lock contention, or a dropped connection. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// A uniqueness or optimistic-concurrency check rejected the write.
    #[error("store conflict: {0}")]
    Conflict(String),
    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The write was rejected as malformed.
    #[error("invalid store input: {0}")]
    Invalid(String),
    /// Persisted rows violate an invariant the store itself guarantees.
    #[error("store corruption: {0}")]
    Corrupt(String),
    /// Any other backend failure. Not retried.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors reported by a [`Recruitment`](crate::Recruitment) collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecruitmentError {
    /// Network failure or platform-side hiccup. Safe to retry.
    #[error("transient recruitment failure: {0}")]
    Transient(String),
    /// The platform refused the request. Retrying will not help.
    #[error("recruitment request rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by the allocation engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Malformed input (empty arm set, NaN or non-positive posterior parameters, a draw
    /// outside `[0, 1)`, an invalid configuration value). Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A store or recruitment call kept failing transiently until the retry budget ran out.
    #[error("engine unavailable: `{op}` failed after {attempts} attempt(s): {last}")]
    EngineUnavailable {
        op: &'static str,
        attempts: u32,
        last: String,
    },

    /// No arm satisfied the inverse-CDF lookup. The cumulative vector is unnormalized.
    #[error("assignment exhausted: draw {draw} exceeds final cumulative value {last}")]
    AssignmentExhausted { draw: f64, last: f64 },

    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("unknown arm {0}")]
    UnknownArm(ArmId),

    /// The experiment has no arms or first batch yet.
    #[error("experiment has not been initialized")]
    NotInitialized,

    /// No batch is active with remaining capacity and none could be advanced into place.
    #[error("no active batch with remaining capacity")]
    NoActiveBatch,

    /// Advance was requested for a batch that still has capacity.
    #[error("batch {0} still has capacity and cannot be advanced")]
    BatchNotExhausted(BatchId),

    /// Persisted state is inconsistent (e.g. a snapshot whose length disagrees with the arms).
    #[error("corrupt engine state: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Errors that may be retried with backoff.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl Transient for RecruitmentError {
    fn is_transient(&self) -> bool {
        matches!(self, RecruitmentError::Transient(_))
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(msg) => EngineError::InvalidArgument(msg),
            StoreError::Corrupt(msg) => EngineError::Corrupt(msg),
            other => EngineError::EngineUnavailable {
                op: "store",
                attempts: 1,
                last: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_variants_are_retryable() {
        assert!(StoreError::Transient("busy".into()).is_transient());
        assert!(!StoreError::Conflict("dup".into()).is_transient());
        assert!(!StoreError::Backend("boom".into()).is_transient());
        assert!(RecruitmentError::Transient("503".into()).is_transient());
        assert!(!RecruitmentError::Rejected("403".into()).is_transient());
    }

    #[test]
    fn store_invalid_maps_to_invalid_argument() {
        let e: EngineError = StoreError::Invalid("bad pi".into()).into();
        assert!(matches!(e, EngineError::InvalidArgument(_)));
    }
}
