//! Cumulative allocation vectors.
//!
//! Win probabilities are stored cumulatively in fixed arm order so that assignment is a
//! single inverse-CDF lookup. The per-arm probability of arm `i` is the successive
//! difference `pi[i] - pi[i - 1]` (with `pi[-1] = 0`).

use crate::EngineError;

/// Slack allowed on the final entry and on monotonicity when validating a cumulative vector.
pub const CUMULATIVE_TOLERANCE: f64 = 1e-6;

/// Running sum of `probs` in order.
pub fn cumulative_sum(probs: &[f64]) -> Vec<f64> {
    let mut acc = 0.0;
    probs
        .iter()
        .map(|p| {
            acc += p;
            acc
        })
        .collect()
}

/// Successive differences of a cumulative vector (inverse of [`cumulative_sum`]).
pub fn successive_differences(cumulative: &[f64]) -> Vec<f64> {
    let mut prev = 0.0;
    cumulative
        .iter()
        .map(|&c| {
            let d = c - prev;
            prev = c;
            d
        })
        .collect()
}

/// A validated cumulative win-probability vector.
///
/// Invariants: non-empty, every entry finite and in `[0, 1]` (within tolerance),
/// non-decreasing, and the last entry equal to `1.0` within [`CUMULATIVE_TOLERANCE`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CumulativePi(Vec<f64>);

impl CumulativePi {
    pub fn new(values: Vec<f64>) -> Result<Self, EngineError> {
        let Some(&last) = values.last() else {
            return Err(EngineError::invalid("cumulative pi must not be empty"));
        };
        let mut prev = 0.0;
        for (i, &v) in values.iter().enumerate() {
            if !v.is_finite() || v < -CUMULATIVE_TOLERANCE || v > 1.0 + CUMULATIVE_TOLERANCE {
                return Err(EngineError::invalid(format!(
                    "cumulative pi[{i}] = {v} is outside [0, 1]"
                )));
            }
            if v + CUMULATIVE_TOLERANCE < prev {
                return Err(EngineError::invalid(format!(
                    "cumulative pi decreases at index {i} ({prev} -> {v})"
                )));
            }
            prev = v;
        }
        if (last - 1.0).abs() > CUMULATIVE_TOLERANCE {
            return Err(EngineError::invalid(format!(
                "cumulative pi must end at 1.0, got {last}"
            )));
        }
        Ok(Self(values))
    }

    /// Build from per-arm (non-cumulative) probabilities.
    pub fn from_probabilities(probs: &[f64]) -> Result<Self, EngineError> {
        if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(EngineError::invalid(
                "per-arm probabilities must be finite and non-negative",
            ));
        }
        Self::new(cumulative_sum(probs))
    }

    /// Equal weight on each of `k` arms: `[1/k, 2/k, ..., 1]`.
    pub fn uniform(k: usize) -> Result<Self, EngineError> {
        if k == 0 {
            return Err(EngineError::invalid("cumulative pi needs at least one arm"));
        }
        let kf = k as f64;
        let mut v: Vec<f64> = (1..=k).map(|i| i as f64 / kf).collect();
        // Exact terminal value regardless of rounding in the division.
        if let Some(last) = v.last_mut() {
            *last = 1.0;
        }
        Ok(Self(v))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    /// Per-arm win probabilities (successive differences).
    pub fn per_arm(&self) -> Vec<f64> {
        successive_differences(&self.0)
    }

    /// Arm position with the largest per-arm probability, and that probability.
    ///
    /// Ties resolve to the lowest position.
    pub fn leader(&self) -> (usize, f64) {
        let mut best = (0usize, f64::NEG_INFINITY);
        for (i, p) in self.per_arm().into_iter().enumerate() {
            if p > best.1 {
                best = (i, p);
            }
        }
        best
    }
}

impl AsRef<[f64]> for CumulativePi {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}
