//! Synthetic study driver.
//!
//! Runs simulated participants through an [`Engine`] the way a survey front end would:
//! `assign_current`, observe a Bernoulli outcome from the arm's true success rate, then
//! `record_response` with the assignment's batch as both charge and context. Participants can
//! be processed one at a time or by several threads sharing the engine.
//!
//! Each participant draws from its own RNG stream derived from `(seed, index)`, so a
//! sequential run is reproducible when the engine is seeded too.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::store::HaltSignal;
use crate::{derive_seed, Disposition, Engine, EngineError, Outcome, ResponseSubmission};

/// An arm with a known true success rate.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimulatedArm {
    pub label: String,
    pub success_rate: f64,
}

impl SimulatedArm {
    pub fn new(label: impl Into<String>, success_rate: f64) -> Self {
        Self {
            label: label.into(),
            success_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Simulation {
    pub arms: Vec<SimulatedArm>,
    pub participants: u64,
    /// Worker threads. `1` runs sequentially on the calling thread.
    pub threads: usize,
    /// Probability that a participant fails a quality check.
    pub garbage_rate: f64,
    /// Probability that a participant resubmits under the previous participant's identity.
    pub duplicate_rate: f64,
    /// Stop handing out new participants once any halt is latched.
    pub stop_on_halt: bool,
    pub seed: u64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            arms: Vec::new(),
            participants: 100,
            threads: 1,
            garbage_rate: 0.0,
            duplicate_rate: 0.0,
            stop_on_halt: true,
            seed: 0,
        }
    }
}

impl Simulation {
    pub fn new(arms: Vec<SimulatedArm>, participants: u64) -> Self {
        Self {
            arms,
            participants,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.arms.is_empty() {
            return Err(EngineError::invalid("simulation needs at least one arm"));
        }
        if self.threads == 0 {
            return Err(EngineError::invalid("simulation needs at least one thread"));
        }
        let unit = |p: f64| p.is_finite() && (0.0..=1.0).contains(&p);
        if let Some(a) = self.arms.iter().find(|a| !unit(a.success_rate)) {
            return Err(EngineError::invalid(format!(
                "success rate of `{}` must be in [0, 1], got {}",
                a.label, a.success_rate
            )));
        }
        if !unit(self.garbage_rate) || !unit(self.duplicate_rate) {
            return Err(EngineError::invalid("garbage and duplicate rates must be in [0, 1]"));
        }
        Ok(())
    }
}

/// What happened during a simulated study.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StudyReport {
    /// Participants that completed assign + record.
    pub participants: u64,
    /// Assignments per arm label.
    pub assignments: BTreeMap<String, u64>,
    /// Successes per arm label (non-garbage only).
    pub successes: BTreeMap<String, u64>,
    pub charged: u64,
    pub warmup: u64,
    pub garbage: u64,
    pub duplicates: u64,
    /// Responses whose charged batch differed from the batch that picked the arm.
    pub redirected: u64,
    pub batches: u64,
    pub halts: Vec<HaltSignal>,
    /// Per-arm win probabilities of the current batch at the end of the run.
    pub final_win_probabilities: Vec<f64>,
    pub stopped_early: bool,
}

impl StudyReport {
    /// Share of assignments that went to `label`.
    pub fn allocation_share(&self, label: &str) -> f64 {
        let total: u64 = self.assignments.values().sum();
        if total == 0 {
            return 0.0;
        }
        self.assignments.get(label).copied().unwrap_or(0) as f64 / total as f64
    }
}

/// Run `sim` against `engine`, initializing the experiment if needed.
pub fn run_study(engine: &Engine, sim: &Simulation) -> Result<StudyReport, EngineError> {
    sim.validate()?;
    let labels: Vec<String> = sim.arms.iter().map(|a| a.label.clone()).collect();
    engine.initialize(&labels)?;

    let report = Mutex::new(StudyReport::default());
    let next = AtomicU64::new(0);
    let halted = AtomicBool::new(false);
    let failure: Mutex<Option<EngineError>> = Mutex::new(None);

    let worker = || {
        while let Some(i) = claim(&next, sim.participants, &halted) {
            if let Err(e) = participant(engine, sim, i, &report) {
                failure.lock().get_or_insert(e);
                halted.store(true, Ordering::SeqCst);
                return;
            }
            if sim.stop_on_halt {
                match engine.halts() {
                    Ok(h) if !h.is_empty() => halted.store(true, Ordering::SeqCst),
                    Ok(_) => {}
                    Err(e) => {
                        failure.lock().get_or_insert(e);
                        halted.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
    };

    if sim.threads == 1 {
        worker();
    } else {
        std::thread::scope(|s| {
            for _ in 0..sim.threads {
                s.spawn(worker);
            }
        });
    }

    if let Some(e) = failure.into_inner() {
        return Err(e);
    }

    let mut report = report.into_inner();
    report.stopped_early = report.participants < sim.participants;
    report.batches = engine.batches()?.len() as u64;
    report.halts = engine.halts()?;
    let current = engine.get_current_batch(true)?;
    report.final_win_probabilities = engine.get_win_probabilities(current.id)?;
    info!(
        participants = report.participants,
        batches = report.batches,
        halts = report.halts.len(),
        "simulated study finished"
    );
    Ok(report)
}

fn claim(next: &AtomicU64, total: u64, halted: &AtomicBool) -> Option<u64> {
    if halted.load(Ordering::SeqCst) {
        return None;
    }
    let i = next.fetch_add(1, Ordering::SeqCst);
    (i < total).then_some(i)
}

fn participant(
    engine: &Engine,
    sim: &Simulation,
    index: u64,
    report: &Mutex<StudyReport>,
) -> Result<(), EngineError> {
    let mut rng = StdRng::seed_from_u64(derive_seed(sim.seed, "participant", index));
    let assignment = engine.assign_current()?;
    let pos = sim
        .arms
        .iter()
        .position(|a| a.label == assignment.arm_label)
        .ok_or_else(|| EngineError::Corrupt(format!("unknown arm `{}`", assignment.arm_label)))?;

    let success = rng.random::<f64>() < sim.arms[pos].success_rate;
    let garbage = rng.random::<f64>() < sim.garbage_rate;
    let identity = if index > 0 && rng.random::<f64>() < sim.duplicate_rate {
        format!("participant-{}", index - 1)
    } else {
        format!("participant-{index}")
    };

    let sub = ResponseSubmission::for_assignment(&assignment, Outcome::from(success))
        .with_identity(identity)
        .with_garbage(garbage);
    let receipt = engine.record_response(sub)?;
    debug!(participant = index, arm = %assignment.arm_label, disposition = ?receipt.disposition, "participant done");

    let mut r = report.lock();
    r.participants += 1;
    *r.assignments.entry(assignment.arm_label.clone()).or_insert(0) += 1;
    match receipt.disposition {
        Disposition::Charged {
            redirected_from, ..
        } => {
            r.charged += 1;
            if redirected_from.is_some() {
                r.redirected += 1;
            }
        }
        Disposition::Warmup => r.warmup += 1,
        Disposition::Garbage => r.garbage += 1,
        Disposition::Duplicate => r.duplicates += 1,
    }
    if success && receipt.response.counts_toward_posterior() {
        *r.successes.entry(assignment.arm_label).or_insert(0) += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, RetryPolicies};

    fn engine(config: EngineConfig) -> Engine {
        Engine::in_memory(EngineConfig {
            n_sim: 5_000,
            assignment_seed: Some(11),
            retry: RetryPolicies::immediate(3),
            ..config
        })
        .unwrap()
    }

    #[test]
    fn sequential_study_accounts_for_every_participant() {
        let e = engine(EngineConfig::default());
        let sim = Simulation {
            garbage_rate: 0.1,
            duplicate_rate: 0.05,
            seed: 4,
            ..Simulation::new(
                vec![SimulatedArm::new("a", 0.2), SimulatedArm::new("b", 0.6)],
                60,
            )
        };
        let r = run_study(&e, &sim).unwrap();
        assert_eq!(r.participants, 60);
        assert_eq!(r.charged + r.warmup + r.garbage + r.duplicates, 60);
        // Capacity 1: every charged response exhausted one batch.
        assert_eq!(r.batches, r.charged + 1);
        assert_eq!(e.response_count(true).unwrap(), 60);
    }

    #[test]
    fn adaptive_allocation_favours_the_better_arm() {
        let e = engine(EngineConfig::default());
        let sim = Simulation {
            seed: 9,
            ..Simulation::new(
                vec![SimulatedArm::new("weak", 0.1), SimulatedArm::new("strong", 0.8)],
                200,
            )
        };
        let r = run_study(&e, &sim).unwrap();
        assert!(r.allocation_share("strong") > 0.6, "{r:?}");
        assert!(r.final_win_probabilities[1] > 0.9);
    }

    #[test]
    fn rejects_bad_simulations() {
        let e = engine(EngineConfig::default());
        assert!(run_study(&e, &Simulation::default()).is_err());
        let bad = Simulation::new(vec![SimulatedArm::new("a", 1.5)], 1);
        assert!(run_study(&e, &bad).is_err());
    }
}
