//! Monte Carlo win-probability estimation.
//!
//! For each arm, draw `n_sim` samples from its posterior; stack them into an
//! `arms x n_sim` matrix; in every column the arm with the largest (or smallest, for
//! [`Direction::Min`]) sample scores a win. The per-arm win probability is the arm's share
//! of columns, and the output is the **cumulative** sum of those shares in arm order, which
//! is the form [`assign`](crate::assign) consumes.
//!
//! Ties within a column go to the lowest arm position.
//!
//! Monte Carlo error is roughly `sqrt(p (1 - p) / n_sim)`; at the default `n_sim = 100_000`
//! that is at most ~0.0016, small enough that a stoppage decision near its threshold is not
//! decided by simulation noise.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use crate::{derive_seed, CumulativePi, Direction, EngineError, PosteriorFamily, PosteriorParams};

/// Default number of simulated columns.
pub const DEFAULT_N_SIM: usize = 100_000;

/// Below this many columns, simulation noise can flip threshold comparisons.
pub const RECOMMENDED_MIN_N_SIM: usize = 100_000;

const SEED_STREAM: &str = "win-probability";

/// Estimate cumulative win probabilities for `posteriors` (in arm order).
///
/// Errors with [`EngineError::InvalidArgument`] for an empty posterior list, `n_sim == 0`,
/// or any parameter the family rejects (NaN, infinite, non-positive).
pub fn estimate_win_probabilities(
    family: &dyn PosteriorFamily,
    posteriors: &[PosteriorParams],
    direction: Direction,
    n_sim: usize,
    rng: &mut dyn RngCore,
) -> Result<CumulativePi, EngineError> {
    if posteriors.is_empty() {
        return Err(EngineError::invalid("posterior list must not be empty"));
    }
    if n_sim == 0 {
        return Err(EngineError::invalid("n_sim must be at least 1"));
    }
    for p in posteriors {
        family.validate(*p)?;
    }

    let matrix: Vec<Vec<f64>> = posteriors
        .iter()
        .map(|p| family.sample_n(*p, n_sim, rng))
        .collect::<Result<_, _>>()?;

    let mut wins = vec![0u64; posteriors.len()];
    for col in 0..n_sim {
        let mut best = 0usize;
        let mut best_x = matrix[0][col];
        for (arm, row) in matrix.iter().enumerate().skip(1) {
            let x = row[col];
            let better = match direction {
                Direction::Max => x > best_x,
                Direction::Min => x < best_x,
            };
            if better {
                best = arm;
                best_x = x;
            }
        }
        wins[best] += 1;
    }

    // Accumulate integer tallies before dividing so the last entry is exactly 1.0.
    let n = n_sim as f64;
    let mut acc = 0u64;
    let cumulative: Vec<f64> = wins
        .iter()
        .map(|w| {
            acc += w;
            acc as f64 / n
        })
        .collect();

    debug!(
        family = family.name(),
        arms = posteriors.len(),
        n_sim,
        ?direction,
        "estimated win probabilities"
    );
    CumulativePi::new(cumulative)
}

/// Configured estimator: a posterior family, a direction, a simulation size, and an optional
/// base seed.
#[derive(Debug, Clone)]
pub struct WinProbabilityEstimator {
    family: Arc<dyn PosteriorFamily>,
    direction: Direction,
    n_sim: usize,
    seed: Option<u64>,
}

impl WinProbabilityEstimator {
    pub fn new(family: Arc<dyn PosteriorFamily>, direction: Direction, n_sim: usize) -> Self {
        if n_sim < RECOMMENDED_MIN_N_SIM {
            warn!(
                n_sim,
                recommended = RECOMMENDED_MIN_N_SIM,
                "n_sim below recommended minimum; stoppage decisions may be noisy"
            );
        }
        Self {
            family,
            direction,
            n_sim,
            seed: None,
        }
    }

    /// Reproducible estimates: each call derives its RNG from `seed` and the stream index.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn family(&self) -> &Arc<dyn PosteriorFamily> {
        &self.family
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn n_sim(&self) -> usize {
        self.n_sim
    }

    /// Estimate with a fresh RNG for stream `index` (the lifecycle passes the parent batch id).
    pub fn estimate(
        &self,
        posteriors: &[PosteriorParams],
        index: u64,
    ) -> Result<CumulativePi, EngineError> {
        let mut rng = match self.seed {
            Some(base) => StdRng::seed_from_u64(derive_seed(base, SEED_STREAM, index)),
            None => StdRng::from_os_rng(),
        };
        estimate_win_probabilities(
            self.family.as_ref(),
            posteriors,
            self.direction,
            self.n_sim,
            &mut rng,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BetaBernoulli;

    fn run(posteriors: &[PosteriorParams], direction: Direction, n_sim: usize) -> CumulativePi {
        let mut rng = StdRng::seed_from_u64(2024);
        estimate_win_probabilities(&BetaBernoulli, posteriors, direction, n_sim, &mut rng)
            .unwrap()
    }

    #[test]
    fn output_length_matches_input_and_ends_at_one() {
        let p = vec![PosteriorParams::UNINFORMATIVE; 5];
        let pi = run(&p, Direction::Max, 10_000);
        assert_eq!(pi.len(), 5);
        assert_eq!(pi.as_slice()[4], 1.0);
    }

    #[test]
    fn single_arm_always_wins() {
        let pi = run(&[PosteriorParams::new(2.0, 9.0)], Direction::Min, 100);
        assert_eq!(pi.as_slice(), &[1.0]);
    }

    #[test]
    fn min_direction_prefers_low_rate_arm() {
        let p = [PosteriorParams::new(2.0, 20.0), PosteriorParams::new(20.0, 2.0)];
        let per_arm = run(&p, Direction::Min, 20_000).per_arm();
        assert!(per_arm[0] > 0.99, "{per_arm:?}");
    }

    #[test]
    fn rejects_empty_zero_and_invalid() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = estimate_win_probabilities(&BetaBernoulli, &[], Direction::Max, 10, &mut rng);
        assert!(matches!(err, Err(EngineError::InvalidArgument(_))));

        let one = [PosteriorParams::UNINFORMATIVE];
        let err = estimate_win_probabilities(&BetaBernoulli, &one, Direction::Max, 0, &mut rng);
        assert!(matches!(err, Err(EngineError::InvalidArgument(_))));

        let bad = [PosteriorParams::UNINFORMATIVE, PosteriorParams::new(f64::NAN, 1.0)];
        let err = estimate_win_probabilities(&BetaBernoulli, &bad, Direction::Max, 10, &mut rng);
        assert!(matches!(err, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn seeded_estimator_is_reproducible_per_index() {
        let est = WinProbabilityEstimator::new(Arc::new(BetaBernoulli), Direction::Max, 5_000)
            .with_seed(Some(9));
        let p = [PosteriorParams::new(3.0, 4.0), PosteriorParams::new(4.0, 3.0)];
        assert_eq!(est.estimate(&p, 1).unwrap(), est.estimate(&p, 1).unwrap());
    }
}
