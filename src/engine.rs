//! The allocation engine: the five external operations plus read access.
//!
//! ```text
//! CreateInitialBatch(arms, priors, capacity)
//! Assign(batch)              -> arm          (reads a pi snapshot, consumes nothing)
//! RecordResponse(...)        -> receipt      (dedup + consume + append, then Advance + gates)
//! GetCurrentBatch(repair)    -> batch
//! GetWinProbabilities(batch) -> per-arm vector
//! ```
//!
//! An `Engine` holds no "current batch" of its own; every call resolves state from the store,
//! so several engines over one store stay consistent.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::gates::{GateReport, Gates, WarmupStatus};
use crate::lifecycle::{Advanced, BatchLifecycle, Current};
use crate::retry::{retry, store_call, RetryError};
use crate::store::{Charge, HaltSignal, MemoryStore, RecordOutcome, Store};
use crate::{
    assign, Arm, ArmId, Assignment, AssignmentNote, Batch, BatchId, BetaBernoulli, CumulativePi,
    Disposition, EngineConfig, EngineError, GarbageReason, InitialPi, NewResponse,
    NoopRecruitment, Outcome, PosteriorFamily, PosteriorParams, Priors, QualityChecks,
    RecordReceipt, Recruitment, Response, ResponseId, StoreError, UniformDraws,
    WinProbabilityEstimator,
};

/// Attempts at charging a fresh batch after losing the last slot of the requested one.
const MAX_REDIRECTS: usize = 16;

/// One participant submission.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResponseSubmission {
    pub arm: ArmId,
    /// Batch the caller intends to charge (usually the assignment's `context_batch`).
    pub batch: BatchId,
    /// Batch whose pi snapshot selected `arm`.
    pub context_batch: BatchId,
    pub outcome: Outcome,
    /// Caller-side garbage flag, merged with the screening result.
    pub garbage: bool,
    pub identity: Option<String>,
    pub checks: QualityChecks,
}

impl ResponseSubmission {
    pub fn new(arm: ArmId, batch: BatchId, context_batch: BatchId, outcome: Outcome) -> Self {
        Self {
            arm,
            batch,
            context_batch,
            outcome,
            garbage: false,
            identity: None,
            checks: QualityChecks::default(),
        }
    }

    /// Submission for an assignment, charging the batch that produced it.
    pub fn for_assignment(assignment: &Assignment, outcome: Outcome) -> Self {
        Self::new(
            assignment.arm,
            assignment.context_batch,
            assignment.context_batch,
            outcome,
        )
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_garbage(mut self, garbage: bool) -> Self {
        self.garbage = garbage;
        self
    }

    pub fn with_checks(mut self, checks: QualityChecks) -> Self {
        self.checks = checks;
        self
    }
}

/// Adaptive allocation engine over a [`Store`] and a [`Recruitment`] platform.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    lifecycle: BatchLifecycle,
    gates: Gates,
    draws: UniformDraws,
}

impl Engine {
    /// Beta-Bernoulli engine.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        recruitment: Arc<dyn Recruitment>,
    ) -> Result<Self, EngineError> {
        Self::with_family(config, Arc::new(BetaBernoulli), store, recruitment)
    }

    /// Engine with an in-memory store and a recruitment platform that ignores pauses.
    pub fn in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(NoopRecruitment),
        )
    }

    pub fn with_family(
        config: EngineConfig,
        family: Arc<dyn PosteriorFamily>,
        store: Arc<dyn Store>,
        recruitment: Arc<dyn Recruitment>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let estimator = WinProbabilityEstimator::new(family, config.direction, config.n_sim)
            .with_seed(config.assignment_seed);
        let lifecycle = BatchLifecycle::new(
            store.clone(),
            estimator,
            config.retry,
            config.batch_capacity,
        )?;
        let gates = Gates::new(config.gate_config(), store, recruitment, config.retry)?;
        let draws = UniformDraws::from_config(config.assignment_seed);
        Ok(Self {
            config,
            lifecycle,
            gates,
            draws,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &BatchLifecycle {
        &self.lifecycle
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.lifecycle.store()
    }

    /// Initialize the experiment with `labels` (in arm order).
    ///
    /// The first batch's pi follows [`EngineConfig::initial_pi`]. Calling this again with the
    /// same labels returns the existing first batch.
    pub fn create_initial_batch(
        &self,
        labels: &[String],
        priors: &Priors,
        capacity: u64,
    ) -> Result<Batch, EngineError> {
        if capacity == 0 {
            return Err(EngineError::invalid("batch capacity must be >= 1"));
        }
        let posteriors = priors.resolve(labels)?;
        let pi = match &self.config.initial_pi {
            InitialPi::Uniform => CumulativePi::uniform(labels.len())?,
            InitialPi::Explicit(pi) => {
                if pi.len() != labels.len() {
                    return Err(EngineError::invalid(format!(
                        "initial pi has {} entries for {} arms",
                        pi.len(),
                        labels.len()
                    )));
                }
                pi.clone()
            }
            InitialPi::FromPriors => self.lifecycle.estimator().estimate(&posteriors, 0)?,
        };
        self.lifecycle
            .create_initial(labels, posteriors, pi, capacity)
    }

    /// [`create_initial_batch`](Self::create_initial_batch) with the configured priors and
    /// batch capacity.
    pub fn initialize(&self, labels: &[String]) -> Result<Batch, EngineError> {
        self.create_initial_batch(labels, &self.config.priors, self.config.batch_capacity)
    }

    /// Draw an arm from `batch`'s pi snapshot. Consumes nothing.
    ///
    /// During warm-up the first batch's snapshot is used whatever `batch` says.
    pub fn assign(&self, batch: BatchId) -> Result<Assignment, EngineError> {
        let warmup = self.gates.warmup()?;
        if warmup.active() {
            return self.assign_warmup(Some(batch), warmup);
        }
        self.assign_from(batch, Vec::new())
    }

    /// Resolve the current batch (repairing stale state) and assign from it.
    pub fn assign_current(&self) -> Result<Assignment, EngineError> {
        let warmup = self.gates.warmup()?;
        if warmup.active() {
            return self.assign_warmup(None, warmup);
        }
        let batch = self.get_current_batch(true)?;
        self.assign_from(batch.id, Vec::new())
    }

    fn assign_warmup(
        &self,
        requested: Option<BatchId>,
        warmup: WarmupStatus,
    ) -> Result<Assignment, EngineError> {
        let first = self.first_batch()?;
        let note = AssignmentNote::Warmup {
            requested,
            recorded: warmup.recorded,
            target: warmup.target,
        };
        self.assign_from(first.id, vec![note])
    }

    fn assign_from(
        &self,
        batch: BatchId,
        mut notes: Vec<AssignmentNote>,
    ) -> Result<Assignment, EngineError> {
        let snap = self.lifecycle.snapshot(batch)?;
        let arms = self.lifecycle.arms()?;
        let draw = self.draws.next_draw();
        let pos = assign(snap.pi.as_slice(), draw)?;
        let arm = arms
            .get(pos)
            .ok_or_else(|| EngineError::Corrupt(format!("pi position {pos} has no arm")))?;
        notes.push(AssignmentNote::SampledFromCumulative);
        if self.draws.is_seeded() {
            notes.push(AssignmentNote::ReproducibleDraw);
        }
        debug!(batch = %batch, arm = %arm.id, draw, "assigned");
        Ok(Assignment {
            arm: arm.id,
            arm_label: arm.label.clone(),
            context_batch: batch,
            draw,
            probabilities: snap.pi.per_arm(),
            notes,
        })
    }

    /// Record one submission.
    ///
    /// Errors only when nothing was written (bad input or the store kept failing). Once the
    /// row is durable the call succeeds; Advance and gate failures are reported on the
    /// receipt.
    pub fn record_response(&self, sub: ResponseSubmission) -> Result<RecordReceipt, EngineError> {
        let arms = self.lifecycle.arms()?;
        if arms.is_empty() {
            return Err(EngineError::NotInitialized);
        }
        if !arms.iter().any(|a| a.id == sub.arm) {
            return Err(EngineError::UnknownArm(sub.arm));
        }
        self.lifecycle.batch(sub.batch)?;
        self.lifecycle.batch(sub.context_batch)?;

        let mut reasons = self.config.screener.screen(&sub.checks);
        if sub.garbage && reasons.is_empty() {
            reasons.push(GarbageReason::Flagged);
        }
        let garbage = !reasons.is_empty();

        let mut row = NewResponse {
            arm: sub.arm,
            batch: sub.batch,
            context_batch: sub.context_batch,
            outcome: sub.outcome,
            garbage,
            identity: sub.identity,
        };

        let mut charge = if garbage {
            Charge::None
        } else if self.gates.warmup()?.active() {
            // Read outside the write: racing submissions may overshoot `warmup_n`.
            row.batch = self.first_batch()?.id;
            Charge::None
        } else {
            Charge::Consume(sub.batch)
        };

        let mut follow_up = FollowUp::default();
        let mut redirected_from = None;
        let (response, disposition, exhausted) = 'write: {
            for _ in 0..MAX_REDIRECTS {
                match self.write(&row, charge)? {
                    RecordOutcome::Recorded(r) => {
                        let d = if garbage {
                            Disposition::Garbage
                        } else {
                            Disposition::Warmup
                        };
                        break 'write (r, d, false);
                    }
                    RecordOutcome::Duplicate(r) => {
                        reasons.push(GarbageReason::DuplicateIdentity);
                        break 'write (r, Disposition::Duplicate, false);
                    }
                    RecordOutcome::Charged {
                        response,
                        remaining,
                        exhausted,
                    } => {
                        let batch = response.batch;
                        break 'write (
                            response,
                            Disposition::Charged {
                                batch,
                                remaining,
                                redirected_from,
                            },
                            exhausted,
                        );
                    }
                    RecordOutcome::BatchExhausted => {
                        let Charge::Consume(lost) = charge else {
                            return Err(EngineError::Corrupt(
                                "uncharged write reported an exhausted batch".into(),
                            ));
                        };
                        let current = self.lifecycle.resolve_current(true)?;
                        follow_up.advanced.extend(current.advanced);
                        debug!(lost = %lost, charged = %current.batch.id, "batch exhausted; redirecting charge");
                        redirected_from.get_or_insert(lost);
                        row.batch = current.batch.id;
                        charge = Charge::Consume(current.batch.id);
                    }
                }
            }
            return Err(EngineError::NoActiveBatch);
        };

        if garbage || disposition == Disposition::Duplicate {
            info!(
                response = %response.id,
                reasons = ?reasons,
                "recorded garbage response"
            );
        }

        let mut advanced_to = None;
        if exhausted {
            match self.lifecycle.advance(response.batch) {
                Ok(adv) => {
                    advanced_to = Some(adv.batch.id);
                    follow_up.advanced.push(adv);
                }
                Err(e) => {
                    warn!(batch = %response.batch, error = %e, "advance after exhaustion failed");
                    follow_up.error.get_or_insert(e);
                }
            }
        }
        let done = self.follow_up(&arms, follow_up, Some(response.batch));

        Ok(RecordReceipt {
            response,
            disposition,
            garbage_reasons: reasons,
            advanced_to,
            gates: done.report,
            follow_up_error: done.error,
        })
    }

    fn write(&self, row: &NewResponse, charge: Charge) -> Result<RecordOutcome, EngineError> {
        retry(&self.config.retry.store, "record", |_| self.store().record(row, charge)).map_err(
            |e| match e {
                RetryError::Permanent {
                    error: StoreError::NotFound(_),
                    ..
                } => EngineError::UnknownBatch(row.batch),
                other => other.into_engine("record"),
            },
        )
    }

    /// Stoppage for every batch this call created, then max-N and pending halts.
    fn follow_up(&self, arms: &[Arm], mut f: FollowUp, batch: Option<BatchId>) -> FollowUp {
        for adv in f.advanced.iter().filter(|a| a.created) {
            match self.gates.after_advance(arms, adv.batch.id, &adv.pi) {
                Ok(r) => f.report.merge(r),
                Err(e) => {
                    warn!(batch = %adv.batch.id, error = %e, "stoppage gate evaluation failed");
                    f.error.get_or_insert(e);
                }
            }
        }
        match self.gates.after_record(batch) {
            Ok(r) => f.report.merge(r),
            Err(e) => {
                warn!(error = %e, "max-n gate evaluation failed");
                f.error.get_or_insert(e);
            }
        }
        f
    }

    /// Record a participant who declined consent against `batch`. Never charged.
    pub fn record_no_consent(&self, batch: BatchId) -> Result<ResponseId, EngineError> {
        self.lifecycle.batch(batch)?;
        store_call(&self.config.retry.store, "record_no_consent", |_| {
            self.store().record_no_consent(batch)
        })
    }

    /// The batch new participants should use.
    ///
    /// The highest-id eligible batch wins; with `deactivate_stale` the others are deactivated.
    /// When nothing is eligible the latest exhausted batch is advanced first.
    pub fn get_current_batch(&self, deactivate_stale: bool) -> Result<Batch, EngineError> {
        let Current { batch, advanced } = self.lifecycle.resolve_current(deactivate_stale)?;
        if advanced.iter().any(|a| a.created) {
            let arms = self.lifecycle.arms()?;
            let f = self.follow_up(
                &arms,
                FollowUp {
                    advanced,
                    ..FollowUp::default()
                },
                None,
            );
            if let Some(e) = f.error {
                warn!(error = %e, "gate evaluation after repair failed");
            }
        }
        Ok(batch)
    }

    /// Per-arm (non-cumulative) win probabilities of `batch`, in arm order.
    pub fn get_win_probabilities(&self, batch: BatchId) -> Result<Vec<f64>, EngineError> {
        self.lifecycle.win_probabilities(batch)
    }

    pub fn cumulative_pi(&self, batch: BatchId) -> Result<CumulativePi, EngineError> {
        Ok(self.lifecycle.snapshot(batch)?.pi)
    }

    pub fn posteriors(&self, batch: BatchId) -> Result<Vec<PosteriorParams>, EngineError> {
        Ok(self.lifecycle.snapshot(batch)?.posteriors)
    }

    pub fn arms(&self) -> Result<Vec<Arm>, EngineError> {
        self.lifecycle.arms()
    }

    pub fn batch(&self, id: BatchId) -> Result<Batch, EngineError> {
        self.lifecycle.batch(id)
    }

    pub fn batches(&self) -> Result<Vec<Batch>, EngineError> {
        store_call(&self.config.retry.store, "batches", |_| self.store().batches())
    }

    pub fn responses(&self) -> Result<Vec<Response>, EngineError> {
        store_call(&self.config.retry.store, "responses", |_| self.store().responses())
    }

    pub fn response_count(&self, include_garbage: bool) -> Result<u64, EngineError> {
        store_call(&self.config.retry.store, "response_count", |_| {
            self.store().response_count(include_garbage)
        })
    }

    pub fn no_consent_count(&self) -> Result<u64, EngineError> {
        store_call(&self.config.retry.store, "no_consent_count", |_| {
            self.store().no_consent_count()
        })
    }

    pub fn halts(&self) -> Result<Vec<HaltSignal>, EngineError> {
        self.gates.halts()
    }

    pub fn warmup_status(&self) -> Result<WarmupStatus, EngineError> {
        self.gates.warmup()
    }

    /// Re-send pause requests the platform has not confirmed.
    pub fn flush_pending_halts(&self) -> Result<GateReport, EngineError> {
        self.gates.flush_pending()
    }

    fn first_batch(&self) -> Result<Batch, EngineError> {
        store_call(&self.config.retry.store, "first_batch", |_| self.store().first_batch())?
            .ok_or(EngineError::NotInitialized)
    }
}

#[derive(Debug, Default)]
struct FollowUp {
    advanced: Vec<Advanced>,
    report: GateReport,
    error: Option<EngineError>,
}
