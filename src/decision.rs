//! Audit envelopes for engine operations.
//!
//! Every assignment and every recorded response comes back with a small typed record of what
//! happened and why, suitable for logging and offline replay. Notes are typed and stable;
//! prefer adding variants over changing existing semantics.

use crate::gates::GateReport;
use crate::{ArmId, BatchId, EngineError, GarbageReason, Response};

/// Why an assignment came out the way it did.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AssignmentNote {
    /// The arm was drawn from the batch's cumulative win probabilities.
    SampledFromCumulative,
    /// Warm-up is active, so the first batch's snapshot was used instead of the requested one.
    Warmup {
        requested: Option<BatchId>,
        recorded: u64,
        target: u64,
    },
    /// The draw came from a seeded source and is reproducible.
    ReproducibleDraw,
}

/// Result of an `Assign` call. Nothing was consumed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Assignment {
    pub arm: ArmId,
    pub arm_label: String,
    /// Batch whose pi snapshot selected the arm. Pass it back as `context_batch` when
    /// recording the response.
    pub context_batch: BatchId,
    /// The uniform draw that was mapped through the cumulative vector.
    pub draw: f64,
    /// Per-arm win probabilities of `context_batch`, in arm order.
    pub probabilities: Vec<f64>,
    pub notes: Vec<AssignmentNote>,
}

/// How a recorded response was accounted for.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Disposition {
    /// Consumed one slot of `batch`. `redirected_from` is set when the requested batch was
    /// already exhausted and the slot was taken from the current batch instead.
    Charged {
        batch: BatchId,
        remaining: u64,
        redirected_from: Option<BatchId>,
    },
    /// Recorded during warm-up against the first batch; no capacity consumed.
    Warmup,
    /// Recorded as garbage; no capacity consumed and no posterior contribution.
    Garbage,
    /// The identity token had already responded. Stored as a garbage duplicate.
    Duplicate,
}

impl Disposition {
    pub fn charged_batch(&self) -> Option<BatchId> {
        match self {
            Disposition::Charged { batch, .. } => Some(*batch),
            _ => None,
        }
    }
}

/// Definitive outcome of `RecordResponse`.
///
/// Advance and gate evaluation run after the response is durable. Their failures land in
/// `follow_up_error` and never turn a recorded response into an error; the next
/// `GetCurrentBatch` or gate evaluation picks up where they stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordReceipt {
    pub response: Response,
    pub disposition: Disposition,
    pub garbage_reasons: Vec<GarbageReason>,
    /// Successor batch observed after this response exhausted its batch.
    pub advanced_to: Option<BatchId>,
    pub gates: GateReport,
    pub follow_up_error: Option<EngineError>,
}

impl RecordReceipt {
    pub fn is_duplicate(&self) -> bool {
        self.disposition == Disposition::Duplicate
    }
}
