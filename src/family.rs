//! Conjugate posterior families.
//!
//! The lifecycle only needs two capabilities from a posterior: draw samples from it, and
//! fold in a batch of successes/failures. [`PosteriorFamily`] makes that seam explicit so
//! the batch machinery never mentions Beta distributions directly.
//!
//! [`BetaBernoulli`] is the family used throughout: a Beta(alpha, beta) posterior over a
//! Bernoulli success rate, updated by `alpha += successes`, `beta += failures`.

use std::fmt;

use rand::RngCore;
use rand_distr::{Beta, Distribution};

use crate::{EngineError, PosteriorParams};

/// Sampling and conjugate-update capability of a posterior family.
pub trait PosteriorFamily: fmt::Debug + Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Reject parameters the family cannot sample from.
    fn validate(&self, params: PosteriorParams) -> Result<(), EngineError> {
        if params.is_valid() {
            Ok(())
        } else {
            Err(EngineError::invalid(format!(
                "posterior parameters must be finite and > 0, got alpha={} beta={}",
                params.alpha, params.beta
            )))
        }
    }

    /// Draw `n` independent samples from the posterior.
    fn sample_n(
        &self,
        params: PosteriorParams,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<f64>, EngineError>;

    /// Posterior after observing `successes` and `failures`.
    fn update(&self, params: PosteriorParams, successes: u64, failures: u64) -> PosteriorParams;
}

/// Beta posterior over a Bernoulli success probability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BetaBernoulli;

impl PosteriorFamily for BetaBernoulli {
    fn name(&self) -> &'static str {
        "beta-bernoulli"
    }

    fn sample_n(
        &self,
        params: PosteriorParams,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<f64>, EngineError> {
        self.validate(params)?;
        let dist = Beta::new(params.alpha, params.beta)
            .map_err(|e| EngineError::invalid(format!("beta({}, {}): {e}", params.alpha, params.beta)))?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(dist.sample(rng));
        }
        Ok(out)
    }

    fn update(&self, params: PosteriorParams, successes: u64, failures: u64) -> PosteriorParams {
        PosteriorParams {
            alpha: params.alpha + successes as f64,
            beta: params.beta + failures as f64,
        }
    }
}

/// Per-arm success/failure tallies collected from one batch's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutcomeCounts {
    pub successes: u64,
    pub failures: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.successes.saturating_add(self.failures)
    }
}

/// Apply `counts` to `posteriors` element-wise (both in arm order).
pub fn update_all(
    family: &dyn PosteriorFamily,
    posteriors: &[PosteriorParams],
    counts: &[OutcomeCounts],
) -> Result<Vec<PosteriorParams>, EngineError> {
    if posteriors.len() != counts.len() {
        return Err(EngineError::invalid(format!(
            "{} posteriors but {} count rows",
            posteriors.len(),
            counts.len()
        )));
    }
    posteriors
        .iter()
        .zip(counts)
        .map(|(&p, c)| {
            family.validate(p)?;
            Ok(family.update(p, c.successes, c.failures))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn beta_samples_are_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        let xs = BetaBernoulli
            .sample_n(PosteriorParams::new(2.0, 5.0), 1_000, &mut rng)
            .unwrap();
        assert_eq!(xs.len(), 1_000);
        assert!(xs.iter().all(|x| (0.0..=1.0).contains(x)));
    }

    #[test]
    fn beta_sample_mean_tracks_posterior_mean() {
        let mut rng = StdRng::seed_from_u64(11);
        let p = PosteriorParams::new(7.0, 3.0);
        let xs = BetaBernoulli.sample_n(p, 50_000, &mut rng).unwrap();
        let m = xs.iter().sum::<f64>() / xs.len() as f64;
        assert!((m - p.mean()).abs() < 0.01, "mean={m}");
    }

    #[test]
    fn invalid_params_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        for p in [
            PosteriorParams::new(f64::NAN, 1.0),
            PosteriorParams::new(1.0, -2.0),
            PosteriorParams::new(0.0, 1.0),
            PosteriorParams::new(f64::INFINITY, 1.0),
        ] {
            let err = BetaBernoulli.sample_n(p, 10, &mut rng).unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)), "{p:?}");
        }
    }

    #[test]
    fn update_all_rejects_length_mismatch() {
        let err = update_all(
            &BetaBernoulli,
            &[PosteriorParams::UNINFORMATIVE],
            &[OutcomeCounts::default(), OutcomeCounts::default()],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    proptest! {
        #[test]
        fn conjugate_update_adds_counts(
            alpha in 0.01f64..100.0,
            beta in 0.01f64..100.0,
            s in 0u64..10_000,
            f in 0u64..10_000,
        ) {
            let p = BetaBernoulli.update(PosteriorParams::new(alpha, beta), s, f);
            prop_assert!((p.alpha - (alpha + s as f64)).abs() < 1e-9);
            prop_assert!((p.beta - (beta + f as f64)).abs() < 1e-9);
            prop_assert!(p.is_valid());
        }
    }
}
