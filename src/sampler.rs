//! Inverse-CDF arm assignment.
//!
//! Given a cumulative win-probability vector and a uniform draw in `[0, 1)`, the assigned arm
//! is the first position whose cumulative value is `>= draw`. The lookup is a pure function
//! of its inputs; randomness lives in [`UniformDraws`].

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{derive_seed, EngineError};

const SEED_STREAM: &str = "assignment-draws";

/// Map `draw` to an arm position.
///
/// Errors:
/// - [`EngineError::InvalidArgument`] when `draw` is not in `[0, 1)` or `cumulative` is empty.
/// - [`EngineError::AssignmentExhausted`] when no entry reaches `draw`. This only happens for
///   an unnormalized vector and is never papered over by picking a default arm.
pub fn assign(cumulative: &[f64], draw: f64) -> Result<usize, EngineError> {
    if !(0.0..1.0).contains(&draw) {
        return Err(EngineError::invalid(format!(
            "draw must be in [0, 1), got {draw}"
        )));
    }
    let Some(&last) = cumulative.last() else {
        return Err(EngineError::invalid("cumulative pi must not be empty"));
    };
    cumulative
        .iter()
        .position(|&c| c >= draw)
        .ok_or(EngineError::AssignmentExhausted { draw, last })
}

/// Source of uniform draws in `[0, 1)`.
///
/// Unseeded by default (OS entropy): a fixed seed makes the randomized assignment predictable,
/// so seeding is reserved for tests and replays.
#[derive(Debug)]
pub struct UniformDraws {
    rng: Mutex<StdRng>,
    seeded: bool,
}

impl UniformDraws {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
            seeded: false,
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(derive_seed(seed, SEED_STREAM, 0))),
            seeded: true,
        }
    }

    pub fn from_config(seed: Option<u64>) -> Self {
        match seed {
            Some(s) => Self::seeded(s),
            None => Self::from_entropy(),
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn next_draw(&self) -> f64 {
        self.rng.lock().random::<f64>()
    }
}

impl Default for UniformDraws {
    fn default() -> Self {
        Self::from_entropy()
    }
}
