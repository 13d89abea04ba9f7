//! Persistence collaborator.
//!
//! The engine does not care how rows are stored, only that a backend provides these atomic
//! units:
//!
//! - **Create**: a batch row, its posterior snapshot and its pi vector become visible together
//!   ([`Store::initialize`], [`Store::create_successor`]).
//! - **Successor uniqueness**: at most one batch per parent; a second
//!   [`Store::create_successor`] for the same parent fails with [`StoreError::Conflict`].
//! - **Consume**: decrement-and-maybe-deactivate is a single conditional update
//!   ([`Store::consume`]); when a response is attached ([`Store::record`]) the response row
//!   is written in the same unit, so a batch observed as exhausted already holds every
//!   response that consumed it.
//! - **Identity dedup**: [`Store::record`] checks and writes the identity token atomically.
//! - **Halt latch**: [`Store::mark_halt`] is insert-if-absent per [`HaltKind`].
//!
//! [`MemoryStore`] keeps everything behind one lock. `SqliteStore` (feature `sqlite`) maps
//! each unit onto an immediate transaction.

use crate::{
    Arm, Batch, BatchId, CumulativePi, NewResponse, PosteriorParams, Response, ResponseId,
    StoreError,
};

mod memory;
pub use memory::*;

#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::*;

/// A batch being provisioned. Nothing about it is visible until the store commits it.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDraft {
    pub parent: Option<BatchId>,
    pub capacity: u64,
    /// Seed posteriors, in arm order.
    pub posteriors: Vec<PosteriorParams>,
    pub pi: CumulativePi,
}

impl BatchDraft {
    /// Shape checks every backend applies before writing.
    pub fn check(&self, arm_count: usize) -> Result<(), StoreError> {
        if self.capacity == 0 {
            return Err(StoreError::Invalid("batch capacity must be >= 1".into()));
        }
        if self.posteriors.len() != arm_count || self.pi.len() != arm_count {
            return Err(StoreError::Invalid(format!(
                "draft has {} posteriors and {} pi entries for {} arms",
                self.posteriors.len(),
                self.pi.len(),
                arm_count
            )));
        }
        if let Some(p) = self.posteriors.iter().find(|p| !p.is_valid()) {
            return Err(StoreError::Invalid(format!(
                "posterior parameters must be finite and > 0, got alpha={} beta={}",
                p.alpha, p.beta
            )));
        }
        Ok(())
    }
}

/// A committed batch with its posterior snapshot and pi vector.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSnapshot {
    pub batch: Batch,
    pub posteriors: Vec<PosteriorParams>,
    pub pi: CumulativePi,
}

/// Result of a conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// This caller took a slot. `exhausted` is true for exactly one caller per batch: the one
    /// that took the last slot (and deactivated the batch).
    Landed { remaining: u64, exhausted: bool },
    /// The batch had no slot left (or was inactive). Nothing changed.
    AlreadyExhausted,
}

/// Whether a recorded response consumes capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// Append only.
    None,
    /// Consume a slot of this batch and tag the response with it.
    Consume(BatchId),
}

/// Result of [`Store::record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Appended without consuming capacity.
    Recorded(Response),
    /// Appended and charged to `response.batch`.
    Charged {
        response: Response,
        remaining: u64,
        exhausted: bool,
    },
    /// The identity token was already recorded; appended as a garbage duplicate, uncharged.
    Duplicate(Response),
    /// The charged batch had no slot left. Nothing was written.
    BatchExhausted,
}

/// Reasons recruitment is halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HaltKind {
    /// An arm's win probability crossed the stoppage threshold.
    Stoppage,
    /// The study reached its maximum number of responses.
    MaxN,
}

impl HaltKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaltKind::Stoppage => "stoppage",
            HaltKind::MaxN => "max_n",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stoppage" => Some(HaltKind::Stoppage),
            "max_n" => Some(HaltKind::MaxN),
            _ => None,
        }
    }
}

/// A latched halt and whether the recruitment platform has confirmed it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HaltSignal {
    pub kind: HaltKind,
    pub detail: String,
    pub batch: Option<BatchId>,
    pub acknowledged: bool,
}

/// Atomic persistence operations the engine relies on.
///
/// Lookups return `Ok(None)` / empty collections for missing rows; `StoreError::NotFound` is
/// reserved for writes that reference a missing row.
pub trait Store: Send + Sync {
    /// Arms in position order. Empty before initialization.
    fn arms(&self) -> Result<Vec<Arm>, StoreError>;

    /// Create the arms and the first batch as one unit. `Conflict` if already initialized.
    fn initialize(&self, labels: &[String], draft: &BatchDraft) -> Result<Batch, StoreError>;

    /// Create the successor of `draft.parent`. `Conflict` if that parent already has one.
    fn create_successor(&self, draft: &BatchDraft) -> Result<Batch, StoreError>;

    fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError>;

    /// All batches in id order.
    fn batches(&self) -> Result<Vec<Batch>, StoreError>;

    fn first_batch(&self) -> Result<Option<Batch>, StoreError>;

    fn latest_batch(&self) -> Result<Option<Batch>, StoreError>;

    fn successor_of(&self, parent: BatchId) -> Result<Option<Batch>, StoreError>;

    /// Batches with `active && remaining > 0`, in id order.
    fn eligible_batches(&self) -> Result<Vec<Batch>, StoreError>;

    /// Set `active = false`. Returns whether the flag changed. Idempotent.
    fn deactivate(&self, id: BatchId) -> Result<bool, StoreError>;

    /// Linearizable decrement-and-maybe-deactivate. `NotFound` for an unknown batch.
    fn consume(&self, id: BatchId) -> Result<ConsumeOutcome, StoreError>;

    fn snapshot(&self, id: BatchId) -> Result<Option<BatchSnapshot>, StoreError>;

    /// Dedup the identity token, optionally consume a slot, and append the response, as one
    /// unit. With `Charge::Consume(b)` the stored `batch` is `b`.
    fn record(&self, response: &NewResponse, charge: Charge) -> Result<RecordOutcome, StoreError>;

    fn responses_for_batch(&self, id: BatchId) -> Result<Vec<Response>, StoreError>;

    fn responses(&self) -> Result<Vec<Response>, StoreError>;

    /// Count responses; garbage (including duplicates) only when `include_garbage`.
    fn response_count(&self, include_garbage: bool) -> Result<u64, StoreError>;

    fn record_no_consent(&self, batch: BatchId) -> Result<ResponseId, StoreError>;

    fn no_consent_count(&self) -> Result<u64, StoreError>;

    /// Latch a halt. Returns `true` only for the call that created the latch.
    fn mark_halt(
        &self,
        kind: HaltKind,
        detail: &str,
        batch: Option<BatchId>,
    ) -> Result<bool, StoreError>;

    fn halts(&self) -> Result<Vec<HaltSignal>, StoreError>;

    fn acknowledge_halt(&self, kind: HaltKind) -> Result<(), StoreError>;
}
