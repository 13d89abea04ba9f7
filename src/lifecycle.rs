//! Batch lifecycle: Create, Consume, Advance, GetCurrent.
//!
//! Only this module writes batch, posterior and pi rows. Every state change is a single
//! store unit (see [`crate::store`]); the lifecycle adds retries, race resolution and the
//! aggregation that seeds each successor.
//!
//! ```text
//! draft ──Create──▶ active(remaining>0) ──Consume*──▶ active(remaining=0) ──▶ inactive
//!                                                             │
//!                                                          Advance ──▶ successor draft
//! ```
//!
//! The last two arrows collapse into one store write: the consume that takes the last slot
//! also clears `active`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::retry::{retry, store_call, RetryError};
use crate::store::{BatchDraft, BatchSnapshot, ConsumeOutcome, Store};
use crate::{
    update_all, Arm, Batch, BatchId, CumulativePi, EngineError, OutcomeCounts, Outcome,
    PosteriorParams, Response, RetryPolicies, StoreError, WinProbabilityEstimator,
};

/// Successor hops GetCurrent will walk before giving up with `NoActiveBatch`.
const MAX_REPAIR_HOPS: usize = 16;

/// Result of [`BatchLifecycle::advance`].
#[derive(Debug, Clone, PartialEq)]
pub struct Advanced {
    /// The successor batch (created by this call or by a concurrent winner).
    pub batch: Batch,
    pub posteriors: Vec<PosteriorParams>,
    pub pi: CumulativePi,
    /// `false` when a concurrent Advance had already created the successor.
    pub created: bool,
}

/// Per-arm tallies for `responses`, in arm position order.
///
/// Rows that do not count toward the posterior (garbage, duplicates) and `Unknown` outcomes
/// are skipped.
pub fn aggregate_outcomes(
    arms: &[Arm],
    responses: &[Response],
) -> Result<Vec<OutcomeCounts>, EngineError> {
    let mut counts = vec![OutcomeCounts::default(); arms.len()];
    for r in responses.iter().filter(|r| r.counts_toward_posterior()) {
        let Some(arm) = arms.iter().find(|a| a.id == r.arm) else {
            return Err(EngineError::Corrupt(format!(
                "{} references unknown {}",
                r.id, r.arm
            )));
        };
        let slot = &mut counts[arm.position];
        match r.outcome {
            Outcome::Success => slot.successes += 1,
            Outcome::Failure => slot.failures += 1,
            Outcome::Unknown => {}
        }
    }
    Ok(counts)
}

/// State machine over persisted batches.
#[derive(Clone)]
pub struct BatchLifecycle {
    store: Arc<dyn Store>,
    estimator: WinProbabilityEstimator,
    retry: RetryPolicies,
    capacity: u64,
}

impl std::fmt::Debug for BatchLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLifecycle")
            .field("estimator", &self.estimator)
            .field("retry", &self.retry)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl BatchLifecycle {
    /// `capacity` is the slot count of every successor batch.
    pub fn new(
        store: Arc<dyn Store>,
        estimator: WinProbabilityEstimator,
        retry: RetryPolicies,
        capacity: u64,
    ) -> Result<Self, EngineError> {
        if capacity == 0 {
            return Err(EngineError::invalid("batch capacity must be >= 1"));
        }
        retry.validate()?;
        Ok(Self {
            store,
            estimator,
            retry,
            capacity,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn estimator(&self) -> &WinProbabilityEstimator {
        &self.estimator
    }

    pub fn retry_policies(&self) -> &RetryPolicies {
        &self.retry
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn arms(&self) -> Result<Vec<Arm>, EngineError> {
        store_call(&self.retry.store, "arms", |_| self.store.arms())
    }

    /// Create the arms and the first batch.
    ///
    /// If the experiment already exists with the same labels, the existing first batch is
    /// returned; different labels are `InvalidArgument`.
    pub fn create_initial(
        &self,
        labels: &[String],
        posteriors: Vec<PosteriorParams>,
        pi: CumulativePi,
        capacity: u64,
    ) -> Result<Batch, EngineError> {
        if labels.is_empty() {
            return Err(EngineError::invalid("arm set must not be empty"));
        }
        let family = self.estimator.family();
        for p in &posteriors {
            family.validate(*p)?;
        }
        let draft = BatchDraft {
            parent: None,
            capacity,
            posteriors,
            pi,
        };
        let created = store_call(&self.retry.advance, "initialize", |_| {
            match self.store.initialize(labels, &draft) {
                Err(StoreError::Conflict(_)) => Ok(None),
                other => other.map(Some),
            }
        })?;
        if let Some(batch) = created {
            info!(batch = %batch.id, arms = labels.len(), capacity, "experiment initialized");
            return Ok(batch);
        }

        let existing: Vec<String> = self.arms()?.into_iter().map(|a| a.label).collect();
        if existing != labels {
            return Err(EngineError::invalid(format!(
                "experiment already initialized with arms {existing:?}"
            )));
        }
        let first = store_call(&self.retry.store, "first_batch", |_| self.store.first_batch())?;
        let first = first.ok_or_else(|| EngineError::Corrupt("arms exist without a batch".into()))?;
        debug!(batch = %first.id, "experiment already initialized");
        Ok(first)
    }

    /// Take one slot of `batch`.
    pub fn consume(&self, batch: BatchId) -> Result<ConsumeOutcome, EngineError> {
        retry(&self.retry.store, "consume", |_| self.store.consume(batch)).map_err(|e| match e {
            RetryError::Permanent {
                error: StoreError::NotFound(_),
                ..
            } => EngineError::UnknownBatch(batch),
            other => other.into_engine("consume"),
        })
    }

    pub fn batch(&self, id: BatchId) -> Result<Batch, EngineError> {
        store_call(&self.retry.store, "batch", |_| self.store.batch(id))?
            .ok_or(EngineError::UnknownBatch(id))
    }

    pub fn snapshot(&self, id: BatchId) -> Result<BatchSnapshot, EngineError> {
        let snap = store_call(&self.retry.store, "snapshot", |_| self.store.snapshot(id))?
            .ok_or(EngineError::UnknownBatch(id))?;
        let arms = self.arms()?;
        if snap.posteriors.len() != arms.len() || snap.pi.len() != arms.len() {
            return Err(EngineError::Corrupt(format!(
                "{id} snapshot has {} posteriors and {} pi entries for {} arms",
                snap.posteriors.len(),
                snap.pi.len(),
                arms.len()
            )));
        }
        Ok(snap)
    }

    /// Non-cumulative win probabilities of `id`, in arm order.
    pub fn win_probabilities(&self, id: BatchId) -> Result<Vec<f64>, EngineError> {
        Ok(self.snapshot(id)?.pi.per_arm())
    }

    /// Create the successor of an exhausted batch.
    ///
    /// At most one successor exists per batch. A caller that loses the race gets the winner's
    /// batch back with `created == false`.
    pub fn advance(&self, exhausted: BatchId) -> Result<Advanced, EngineError> {
        if let Some(existing) = self.successor(exhausted)? {
            return self.already_advanced(exhausted, existing);
        }

        let snap = self.snapshot(exhausted)?;
        if !snap.batch.is_exhausted() {
            return Err(EngineError::BatchNotExhausted(exhausted));
        }

        let arms = self.arms()?;
        let responses = store_call(&self.retry.store, "responses_for_batch", |_| {
            self.store.responses_for_batch(exhausted)
        })?;
        let counts = aggregate_outcomes(&arms, &responses)?;
        let posteriors = update_all(self.estimator.family().as_ref(), &snap.posteriors, &counts)?;
        let pi = self.estimator.estimate(&posteriors, exhausted.0)?;

        let draft = BatchDraft {
            parent: Some(exhausted),
            capacity: self.capacity,
            posteriors: posteriors.clone(),
            pi: pi.clone(),
        };
        let created = store_call(&self.retry.advance, "create_successor", |_| {
            match self.store.create_successor(&draft) {
                Err(StoreError::Conflict(_)) => Ok(None),
                other => other.map(Some),
            }
        })?;

        match created {
            Some(batch) => {
                info!(
                    parent = %exhausted,
                    batch = %batch.id,
                    responses = responses.len(),
                    counted = counts.iter().map(OutcomeCounts::total).sum::<u64>(),
                    "advanced to successor batch"
                );
                Ok(Advanced {
                    batch,
                    posteriors,
                    pi,
                    created: true,
                })
            }
            None => {
                let winner = self.successor(exhausted)?.ok_or_else(|| {
                    EngineError::Corrupt(format!(
                        "successor of {exhausted} conflicted but does not exist"
                    ))
                })?;
                self.already_advanced(exhausted, winner)
            }
        }
    }

    fn successor(&self, parent: BatchId) -> Result<Option<Batch>, EngineError> {
        store_call(&self.retry.store, "successor_of", |_| self.store.successor_of(parent))
    }

    fn already_advanced(&self, parent: BatchId, batch: Batch) -> Result<Advanced, EngineError> {
        debug!(parent = %parent, batch = %batch.id, "advance race lost; using existing successor");
        let snap = self.snapshot(batch.id)?;
        Ok(Advanced {
            batch: snap.batch,
            posteriors: snap.posteriors,
            pi: snap.pi,
            created: false,
        })
    }

    /// The batch new assignments should use: the highest id among eligible batches.
    ///
    /// With `deactivate_stale`, every other eligible batch is deactivated. When nothing is
    /// eligible, the latest batch is advanced (walking the successor chain if a concurrent
    /// consumer already drained the successor).
    pub fn current(&self, deactivate_stale: bool) -> Result<Batch, EngineError> {
        Ok(self.resolve_current(deactivate_stale)?.batch)
    }

    /// [`current`](Self::current), also reporting any Advance the repair performed.
    pub fn resolve_current(&self, deactivate_stale: bool) -> Result<Current, EngineError> {
        let eligible = store_call(&self.retry.store, "eligible_batches", |_| {
            self.store.eligible_batches()
        })?;

        if let Some(canonical) = eligible.iter().max_by_key(|b| b.id).cloned() {
            if deactivate_stale {
                for stale in eligible.iter().filter(|b| b.id != canonical.id) {
                    let changed = store_call(&self.retry.store, "deactivate", |_| {
                        self.store.deactivate(stale.id)
                    })?;
                    if changed {
                        warn!(
                            stale = %stale.id,
                            canonical = %canonical.id,
                            remaining = stale.remaining,
                            "deactivated stale active batch"
                        );
                    }
                }
            }
            return Ok(Current {
                batch: canonical,
                advanced: Vec::new(),
            });
        }

        let latest = store_call(&self.retry.store, "latest_batch", |_| self.store.latest_batch())?;
        let mut cursor = latest.ok_or(EngineError::NotInitialized)?;
        let mut advanced = Vec::new();
        for _ in 0..MAX_REPAIR_HOPS {
            if cursor.is_eligible() {
                return Ok(Current {
                    batch: cursor,
                    advanced,
                });
            }
            if !cursor.is_exhausted() {
                // Deactivated with capacity left: nothing to advance from.
                break;
            }
            debug!(batch = %cursor.id, "no eligible batch; advancing latest");
            let next = self.advance(cursor.id)?;
            cursor = next.batch.clone();
            advanced.push(next);
        }
        Err(EngineError::NoActiveBatch)
    }
}

/// Result of [`BatchLifecycle::resolve_current`].
#[derive(Debug, Clone, PartialEq)]
pub struct Current {
    pub batch: Batch,
    /// Advances performed while resolving, oldest first.
    pub advanced: Vec<Advanced>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Charge, MemoryStore};
    use crate::{ArmId, BetaBernoulli, Direction, NewResponse, PosteriorFamily, RetryPolicy};
    use rand::RngCore;

    fn labels(k: usize) -> Vec<String> {
        (0..k).map(|i| format!("arm-{i}")).collect()
    }

    fn lifecycle(store: Arc<MemoryStore>, capacity: u64) -> BatchLifecycle {
        let est = WinProbabilityEstimator::new(Arc::new(BetaBernoulli), Direction::Max, 2_000)
            .with_seed(Some(1));
        BatchLifecycle::new(store, est, RetryPolicies::immediate(3), capacity).unwrap()
    }

    fn init(lc: &BatchLifecycle, k: usize, capacity: u64) -> Batch {
        lc.create_initial(
            &labels(k),
            vec![PosteriorParams::UNINFORMATIVE; k],
            CumulativePi::uniform(k).unwrap(),
            capacity,
        )
        .unwrap()
    }

    fn respond(store: &MemoryStore, arm: u32, batch: BatchId, outcome: Outcome, garbage: bool) {
        let r = NewResponse {
            arm: ArmId(arm),
            batch,
            context_batch: batch,
            outcome,
            garbage,
            identity: None,
        };
        store.record(&r, Charge::None).unwrap();
    }

    #[test]
    fn create_initial_is_idempotent_for_same_arms() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 1);
        let a = init(&lc, 3, 1);
        let b = init(&lc, 3, 1);
        assert_eq!(a.id, b.id);
        assert_eq!(store.batches().unwrap().len(), 1);

        let err = lc
            .create_initial(
                &labels(2),
                vec![PosteriorParams::UNINFORMATIVE; 2],
                CumulativePi::uniform(2).unwrap(),
                1,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn advance_adds_non_garbage_counts_to_parent_posteriors() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 1);
        let first = init(&lc, 2, 4);
        respond(&store, 1, first.id, Outcome::Success, false);
        respond(&store, 1, first.id, Outcome::Failure, false);
        respond(&store, 2, first.id, Outcome::Success, false);
        respond(&store, 2, first.id, Outcome::Success, true);
        respond(&store, 2, first.id, Outcome::Unknown, false);
        for _ in 0..4 {
            lc.consume(first.id).unwrap();
        }

        let adv = lc.advance(first.id).unwrap();
        assert!(adv.created);
        assert_eq!(adv.batch.parent, Some(first.id));
        assert_eq!(adv.batch.remaining, 1);
        assert_eq!(adv.posteriors[0], PosteriorParams::new(2.0, 2.0));
        assert_eq!(adv.posteriors[1], PosteriorParams::new(2.0, 1.0));

        // The parent's snapshot is untouched.
        let parent = lc.snapshot(first.id).unwrap();
        assert_eq!(parent.posteriors, vec![PosteriorParams::UNINFORMATIVE; 2]);
    }

    #[test]
    fn second_advance_returns_existing_successor() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 1);
        let first = init(&lc, 2, 1);
        lc.consume(first.id).unwrap();
        let a = lc.advance(first.id).unwrap();
        let b = lc.advance(first.id).unwrap();
        assert!(a.created && !b.created);
        assert_eq!(a.batch.id, b.batch.id);
        assert_eq!(store.batches().unwrap().len(), 2);
    }

    #[test]
    fn advance_refuses_batch_with_capacity() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store, 1);
        let first = init(&lc, 2, 2);
        lc.consume(first.id).unwrap();
        assert_eq!(
            lc.advance(first.id).unwrap_err(),
            EngineError::BatchNotExhausted(first.id)
        );
    }

    #[test]
    fn current_prefers_highest_id_and_repairs_others() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 3);
        let first = init(&lc, 2, 1);
        lc.consume(first.id).unwrap();
        let second = lc.advance(first.id).unwrap().batch;
        // Two eligible batches at once, as left behind by an interrupted repair.
        let third = store
            .create_successor(&BatchDraft {
                parent: Some(second.id),
                capacity: 2,
                posteriors: vec![PosteriorParams::UNINFORMATIVE; 2],
                pi: CumulativePi::uniform(2).unwrap(),
            })
            .unwrap();
        assert_eq!(store.eligible_batches().unwrap().len(), 2);

        assert_eq!(lc.current(false).unwrap().id, third.id);
        assert_eq!(store.eligible_batches().unwrap().len(), 2);

        assert_eq!(lc.current(true).unwrap().id, third.id);
        let eligible = store.eligible_batches().unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, third.id);
        // Repair is idempotent.
        assert_eq!(lc.current(true).unwrap().id, third.id);
    }

    #[test]
    fn current_advances_when_nothing_is_eligible() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 1);
        let first = init(&lc, 2, 1);
        lc.consume(first.id).unwrap();
        let cur = lc.current(true).unwrap();
        assert_eq!(cur.parent, Some(first.id));
        assert!(cur.is_eligible());
    }

    #[test]
    fn current_before_initialization() {
        let lc = lifecycle(Arc::new(MemoryStore::new()), 1);
        assert_eq!(lc.current(true).unwrap_err(), EngineError::NotInitialized);
    }

    #[test]
    fn transient_create_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 1);
        let first = init(&lc, 2, 1);
        lc.consume(first.id).unwrap();
        store.fail_next("create_successor", 2);
        assert!(lc.advance(first.id).unwrap().created);
        assert_eq!(store.call_count("create_successor"), 3);
    }

    #[test]
    fn exhausted_retries_surface_engine_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store.clone(), 1);
        let first = init(&lc, 2, 1);
        store.fail_next("consume", 10);
        let err = lc.consume(first.id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::EngineUnavailable { op: "consume", attempts: 3, .. }
        ));
        assert_eq!(store.batch(first.id).unwrap().unwrap().remaining, 1);
    }

    #[test]
    fn consume_unknown_batch() {
        let store = Arc::new(MemoryStore::new());
        let lc = lifecycle(store, 1);
        init(&lc, 2, 1);
        assert_eq!(
            lc.consume(BatchId(99)).unwrap_err(),
            EngineError::UnknownBatch(BatchId(99))
        );
    }

    /// Deterministic family: every sample is the posterior mean.
    #[derive(Debug)]
    struct PointMass;

    impl PosteriorFamily for PointMass {
        fn name(&self) -> &'static str {
            "point-mass"
        }

        fn sample_n(
            &self,
            params: PosteriorParams,
            n: usize,
            _rng: &mut dyn RngCore,
        ) -> Result<Vec<f64>, EngineError> {
            Ok(vec![params.mean(); n])
        }

        fn update(&self, p: PosteriorParams, s: u64, f: u64) -> PosteriorParams {
            PosteriorParams::new(p.alpha + 2.0 * s as f64, p.beta + 2.0 * f as f64)
        }
    }

    #[test]
    fn lifecycle_works_with_any_family() {
        let store = Arc::new(MemoryStore::new());
        let est = WinProbabilityEstimator::new(Arc::new(PointMass), Direction::Max, 10);
        let lc = BatchLifecycle::new(
            store.clone(),
            est,
            RetryPolicies {
                store: RetryPolicy::no_retry(),
                ..RetryPolicies::immediate(1)
            },
            1,
        )
        .unwrap();
        let first = init(&lc, 2, 1);
        respond(&store, 2, first.id, Outcome::Success, false);
        lc.consume(first.id).unwrap();
        let adv = lc.advance(first.id).unwrap();
        assert_eq!(adv.posteriors[1], PosteriorParams::new(3.0, 1.0));
        assert_eq!(adv.pi.as_slice(), &[0.0, 1.0]);
    }
}
