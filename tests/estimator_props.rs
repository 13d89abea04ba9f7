//! Property and statistical tests for win-probability estimation and assignment.

use allotment::{
    assign, estimate_win_probabilities, successive_differences, BetaBernoulli, Direction,
    EngineError, PosteriorParams, CUMULATIVE_TOLERANCE,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn beta(alpha: f64, beta: f64) -> PosteriorParams {
    PosteriorParams::new(alpha, beta)
}

fn estimate(posteriors: &[PosteriorParams], direction: Direction, n_sim: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    estimate_win_probabilities(&BetaBernoulli, posteriors, direction, n_sim, &mut rng)
        .unwrap()
        .into_inner()
}

// ---------------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------------

fn posterior() -> impl Strategy<Value = PosteriorParams> {
    (0.1f64..50.0, 0.1f64..50.0).prop_map(|(a, b)| beta(a, b))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The estimate is a non-decreasing cumulative vector ending at 1.
    #[test]
    fn estimate_is_a_cumulative_distribution(
        posteriors in prop::collection::vec(posterior(), 1..6),
        min in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let direction = if min { Direction::Min } else { Direction::Max };
        let pi = estimate(&posteriors, direction, 2_000, seed);
        prop_assert_eq!(pi.len(), posteriors.len());
        prop_assert!(pi.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!((pi[pi.len() - 1] - 1.0).abs() <= CUMULATIVE_TOLERANCE);
        prop_assert!(successive_differences(&pi).iter().all(|p| (0.0..=1.0).contains(p)));
    }

    /// Same seed, same estimate.
    #[test]
    fn seeded_estimates_repeat(
        posteriors in prop::collection::vec(posterior(), 1..5),
        seed in any::<u64>(),
    ) {
        let a = estimate(&posteriors, Direction::Max, 500, seed);
        let b = estimate(&posteriors, Direction::Max, 500, seed);
        prop_assert_eq!(a, b);
    }

    /// Assignment is a pure function of (cumulative, draw) and lands on the first entry >= draw.
    #[test]
    fn assignment_is_first_entry_reaching_the_draw(
        weights in prop::collection::vec(0.0f64..1.0, 1..8),
        draw in 0.0f64..1.0,
    ) {
        let total: f64 = weights.iter().sum();
        prop_assume!(total > 0.0);
        let mut acc = 0.0;
        let mut cumulative: Vec<f64> = weights.iter().map(|w| { acc += w / total; acc }).collect();
        let last = cumulative.len() - 1;
        cumulative[last] = 1.0;

        let pos = assign(&cumulative, draw).unwrap();
        prop_assert_eq!(assign(&cumulative, draw).unwrap(), pos);
        prop_assert!(cumulative[pos] >= draw);
        prop_assert!(cumulative[..pos].iter().all(|&c| c < draw));
    }

    /// Draws outside [0, 1) are rejected, never clamped.
    #[test]
    fn out_of_range_draws_are_invalid(draw in prop_oneof![-10.0f64..0.0, 1.0f64..10.0]) {
        let res = assign(&[0.5, 1.0], draw);
        prop_assert!(matches!(res, Err(EngineError::InvalidArgument(_))));
    }
}

// ---------------------------------------------------------------------------
// Statistical checks at production simulation size
// ---------------------------------------------------------------------------

#[test]
fn final_entry_is_one_at_full_size() {
    let pi = estimate(&[beta(3.0, 5.0), beta(4.0, 4.0), beta(1.0, 1.0)], Direction::Max, 100_000, 1);
    assert!((pi[2] - 1.0).abs() < 1e-3);
}

#[test]
fn identical_arms_split_evenly() {
    let pi = estimate(&[beta(1.0, 1.0), beta(1.0, 1.0)], Direction::Max, 100_000, 2);
    let per_arm = successive_differences(&pi);
    assert_eq!(per_arm.len(), 2);
    for p in per_arm {
        assert!((p - 0.5).abs() <= 0.02, "{pi:?}");
    }
}

#[test]
fn identical_informative_arms_split_evenly() {
    let pi = estimate(&[beta(5.0, 5.0), beta(5.0, 5.0)], Direction::Max, 100_000, 12);
    for p in successive_differences(&pi) {
        assert!((p - 0.5).abs() <= 0.02, "{pi:?}");
    }
}

#[test]
fn clearly_better_arm_has_highest_probability() {
    let posteriors = [beta(1.0, 1.0), beta(3.0, 7.0), beta(7.0, 3.0), beta(1.0, 1.0)];
    let per_arm = successive_differences(&estimate(&posteriors, Direction::Max, 100_000, 3));
    assert_eq!(per_arm.len(), 4);
    for (i, &p) in per_arm.iter().enumerate() {
        if i != 2 {
            assert!(per_arm[2] > p, "arm {i}: {per_arm:?}");
        }
    }
    // Beta(3, 7) sits below both flat arms.
    assert!(per_arm[1] < per_arm[0] && per_arm[1] < per_arm[3], "{per_arm:?}");
}

#[test]
fn minimizing_flips_the_leader() {
    let posteriors = [beta(2.0, 8.0), beta(8.0, 2.0)];
    let max = successive_differences(&estimate(&posteriors, Direction::Max, 20_000, 4));
    let min = successive_differences(&estimate(&posteriors, Direction::Min, 20_000, 4));
    assert!(max[1] > 0.95);
    assert!(min[0] > 0.95);
}

#[test]
fn single_arm_always_wins() {
    assert_eq!(estimate(&[beta(2.0, 9.0)], Direction::Max, 1_000, 5), vec![1.0]);
}

#[test]
fn invalid_parameters_are_rejected() {
    let mut rng = StdRng::seed_from_u64(0);
    for bad in [beta(f64::NAN, 1.0), beta(0.0, 1.0), beta(1.0, -2.0), beta(f64::INFINITY, 1.0)] {
        let res = estimate_win_probabilities(&BetaBernoulli, &[beta(1.0, 1.0), bad], Direction::Max, 100, &mut rng);
        assert!(matches!(res, Err(EngineError::InvalidArgument(_))), "{bad:?}");
    }
    let res = estimate_win_probabilities(&BetaBernoulli, &[], Direction::Max, 100, &mut rng);
    assert!(matches!(res, Err(EngineError::InvalidArgument(_))));
    let res = estimate_win_probabilities(&BetaBernoulli, &[beta(1.0, 1.0)], Direction::Max, 0, &mut rng);
    assert!(matches!(res, Err(EngineError::InvalidArgument(_))));
}

#[test]
fn unnormalized_vector_exhausts_assignment() {
    assert_eq!(
        assign(&[0.2, 0.5], 0.9).unwrap_err(),
        EngineError::AssignmentExhausted { draw: 0.9, last: 0.5 }
    );
}
