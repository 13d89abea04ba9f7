//! Data model: arms, batches, posteriors, responses.

use std::fmt;

use crate::EngineError;

/// Stable identifier of an arm. Identifiers are assigned `1..=k` in arm order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmId(pub u32);

/// Monotonically increasing batch identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResponseId(pub u64);

impl fmt::Display for ArmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arm#{}", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch#{}", self.0)
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response#{}", self.0)
    }
}

/// A treatment variant. Created once at initialization; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Arm {
    pub id: ArmId,
    pub label: String,
    /// Zero-based position in every per-arm vector (posteriors, pi).
    pub position: usize,
}

/// Whether the "best" arm is the one with the largest or the smallest success rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    #[default]
    Max,
    Min,
}

impl std::str::FromStr for Direction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" | "maximize" => Ok(Direction::Max),
            "min" | "minimize" => Ok(Direction::Min),
            other => Err(EngineError::invalid(format!(
                "direction must be `max` or `min`, got `{other}`"
            ))),
        }
    }
}

/// Shape parameters of one arm's posterior.
///
/// For the default Beta–Bernoulli family these are Beta(`alpha`, `beta`). Other families
/// reuse the two positive shape parameters with their own meaning.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PosteriorParams {
    pub alpha: f64,
    pub beta: f64,
}

impl PosteriorParams {
    pub const UNINFORMATIVE: PosteriorParams = PosteriorParams {
        alpha: 1.0,
        beta: 1.0,
    };

    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    /// Both parameters finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.alpha.is_finite() && self.beta.is_finite() && self.alpha > 0.0 && self.beta > 0.0
    }

    /// Posterior mean under a Beta interpretation.
    pub fn mean(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }
}

/// Observable states of a batch.
///
/// A batch being provisioned is a [`BatchDraft`](crate::BatchDraft) and is never visible
/// through a store; it becomes `ActiveWithCapacity` when the draft is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BatchState {
    ActiveWithCapacity,
    ActiveExhausted,
    Inactive,
}

/// An allocation epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Batch {
    pub id: BatchId,
    /// The exhausted batch this one was advanced from (`None` for the first batch).
    pub parent: Option<BatchId>,
    pub capacity: u64,
    pub remaining: u64,
    pub active: bool,
}

impl Batch {
    pub fn state(&self) -> BatchState {
        match (self.active, self.remaining) {
            (true, r) if r > 0 => BatchState::ActiveWithCapacity,
            (true, _) => BatchState::ActiveExhausted,
            (false, _) => BatchState::Inactive,
        }
    }

    /// Usable for new assignments.
    pub fn is_eligible(&self) -> bool {
        self.state() == BatchState::ActiveWithCapacity
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

/// Observed outcome of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Outcome {
    Success,
    Failure,
    /// Recorded but uninformative for the posterior (e.g. the outcome question was skipped).
    Unknown,
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// A response about to be written.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewResponse {
    pub arm: ArmId,
    /// Capacity batch charged. Stores overwrite this with the batch actually consumed.
    pub batch: BatchId,
    /// Batch whose pi snapshot selected the arm.
    pub context_batch: BatchId,
    pub outcome: Outcome,
    pub garbage: bool,
    pub identity: Option<String>,
}

/// A recorded participant trial. Never mutated.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Response {
    pub id: ResponseId,
    pub arm: ArmId,
    pub batch: BatchId,
    pub context_batch: BatchId,
    pub outcome: Outcome,
    pub garbage: bool,
    /// Set when the identity token had already been recorded; implies `garbage`.
    pub duplicate: bool,
    pub identity: Option<String>,
}

impl Response {
    /// Whether this row may contribute to a posterior update.
    pub fn counts_toward_posterior(&self) -> bool {
        !self.garbage && !self.duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(remaining: u64, active: bool) -> Batch {
        Batch {
            id: BatchId(1),
            parent: None,
            capacity: 1,
            remaining,
            active,
        }
    }

    #[test]
    fn batch_states() {
        assert_eq!(batch(1, true).state(), BatchState::ActiveWithCapacity);
        assert_eq!(batch(0, true).state(), BatchState::ActiveExhausted);
        assert_eq!(batch(3, false).state(), BatchState::Inactive);
        assert!(!batch(3, false).is_eligible());
    }

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("MAX".parse::<Direction>().unwrap(), Direction::Max);
        assert_eq!(" min ".parse::<Direction>().unwrap(), Direction::Min);
        assert!("best".parse::<Direction>().is_err());
    }

    #[test]
    fn posterior_validity() {
        assert!(PosteriorParams::UNINFORMATIVE.is_valid());
        assert!(!PosteriorParams::new(f64::NAN, 1.0).is_valid());
        assert!(!PosteriorParams::new(1.0, 0.0).is_valid());
        assert!(!PosteriorParams::new(-1.0, 2.0).is_valid());
        assert!((PosteriorParams::new(3.0, 1.0).mean() - 0.75).abs() < 1e-12);
    }
}
