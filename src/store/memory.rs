//! In-process store.
//!
//! All state sits behind a single `parking_lot::Mutex`, so every trait method is one atomic
//! unit. Tests can inject transient failures per operation with [`MemoryStore::fail_next`];
//! an injected failure fires before any state is touched, which models a timeout that did
//! not commit.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{
    BatchDraft, BatchSnapshot, Charge, ConsumeOutcome, HaltKind, HaltSignal, RecordOutcome, Store,
};
use crate::{
    Arm, ArmId, Batch, BatchId, CumulativePi, NewResponse, PosteriorParams, Response, ResponseId,
    StoreError,
};

#[derive(Debug, Default)]
struct State {
    arms: Vec<Arm>,
    batches: BTreeMap<BatchId, Batch>,
    posteriors: BTreeMap<BatchId, Vec<PosteriorParams>>,
    pi: BTreeMap<BatchId, CumulativePi>,
    successors: BTreeMap<BatchId, BatchId>,
    responses: Vec<Response>,
    no_consent: Vec<(ResponseId, BatchId)>,
    halts: BTreeMap<HaltKind, HaltSignal>,
    next_batch: u64,
    next_response: u64,
}

impl State {
    fn commit_batch(&mut self, draft: &BatchDraft) -> Batch {
        self.next_batch += 1;
        let id = BatchId(self.next_batch);
        let batch = Batch {
            id,
            parent: draft.parent,
            capacity: draft.capacity,
            remaining: draft.capacity,
            active: true,
        };
        self.batches.insert(id, batch.clone());
        self.posteriors.insert(id, draft.posteriors.clone());
        self.pi.insert(id, draft.pi.clone());
        if let Some(parent) = draft.parent {
            self.successors.insert(parent, id);
        }
        batch
    }

    fn consume(&mut self, id: BatchId) -> Result<ConsumeOutcome, StoreError> {
        let batch = self
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{id}")))?;
        if !batch.active || batch.remaining == 0 {
            return Ok(ConsumeOutcome::AlreadyExhausted);
        }
        batch.remaining -= 1;
        let exhausted = batch.remaining == 0;
        if exhausted {
            batch.active = false;
        }
        Ok(ConsumeOutcome::Landed {
            remaining: batch.remaining,
            exhausted,
        })
    }

    fn identity_seen(&self, identity: Option<&str>) -> bool {
        match identity {
            Some(token) => self
                .responses
                .iter()
                .any(|r| !r.duplicate && r.identity.as_deref() == Some(token)),
            None => false,
        }
    }

    fn append(&mut self, r: &NewResponse, batch: BatchId, duplicate: bool) -> Response {
        self.next_response += 1;
        let row = Response {
            id: ResponseId(self.next_response),
            arm: r.arm,
            batch,
            context_batch: r.context_batch,
            outcome: r.outcome,
            garbage: r.garbage || duplicate,
            duplicate,
            identity: r.identity.clone(),
        };
        self.responses.push(row.clone());
        row
    }

    fn check_arm(&self, arm: ArmId) -> Result<(), StoreError> {
        if self.arms.iter().any(|a| a.id == arm) {
            Ok(())
        } else {
            Err(StoreError::Invalid(format!("unknown {arm}")))
        }
    }
}

/// Single-lock in-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<BTreeMap<&'static str, u32>>,
    calls: Mutex<BTreeMap<&'static str, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of operation `op` (the trait method name, e.g. `"record"`)
    /// fail with [`StoreError::Transient`] without touching state.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        *self.faults.lock().entry(op).or_insert(0) += times;
    }

    /// How many times operation `op` has been invoked (including injected failures).
    pub fn call_count(&self, op: &'static str) -> u64 {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let mut faults = self.faults.lock();
        if let Some(n) = faults.get_mut(op) {
            if *n > 0 {
                *n -= 1;
                return Err(StoreError::Transient(format!("injected fault in `{op}`")));
            }
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn arms(&self) -> Result<Vec<Arm>, StoreError> {
        self.enter("arms")?;
        Ok(self.state.lock().arms.clone())
    }

    fn initialize(&self, labels: &[String], draft: &BatchDraft) -> Result<Batch, StoreError> {
        self.enter("initialize")?;
        if draft.parent.is_some() {
            return Err(StoreError::Invalid("first batch cannot have a parent".into()));
        }
        draft.check(labels.len())?;
        let mut s = self.state.lock();
        if !s.arms.is_empty() {
            return Err(StoreError::Conflict("experiment already initialized".into()));
        }
        s.arms = labels
            .iter()
            .enumerate()
            .map(|(i, l)| Arm {
                id: ArmId(i as u32 + 1),
                label: l.clone(),
                position: i,
            })
            .collect();
        Ok(s.commit_batch(draft))
    }

    fn create_successor(&self, draft: &BatchDraft) -> Result<Batch, StoreError> {
        self.enter("create_successor")?;
        let Some(parent) = draft.parent else {
            return Err(StoreError::Invalid("successor draft needs a parent".into()));
        };
        let mut s = self.state.lock();
        draft.check(s.arms.len())?;
        if !s.batches.contains_key(&parent) {
            return Err(StoreError::NotFound(format!("{parent}")));
        }
        if let Some(existing) = s.successors.get(&parent) {
            return Err(StoreError::Conflict(format!(
                "{parent} already has successor {existing}"
            )));
        }
        Ok(s.commit_batch(draft))
    }

    fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        self.enter("batch")?;
        Ok(self.state.lock().batches.get(&id).cloned())
    }

    fn batches(&self) -> Result<Vec<Batch>, StoreError> {
        self.enter("batches")?;
        Ok(self.state.lock().batches.values().cloned().collect())
    }

    fn first_batch(&self) -> Result<Option<Batch>, StoreError> {
        self.enter("first_batch")?;
        Ok(self.state.lock().batches.values().next().cloned())
    }

    fn latest_batch(&self) -> Result<Option<Batch>, StoreError> {
        self.enter("latest_batch")?;
        Ok(self.state.lock().batches.values().next_back().cloned())
    }

    fn successor_of(&self, parent: BatchId) -> Result<Option<Batch>, StoreError> {
        self.enter("successor_of")?;
        let s = self.state.lock();
        Ok(s
            .successors
            .get(&parent)
            .and_then(|id| s.batches.get(id))
            .cloned())
    }

    fn eligible_batches(&self) -> Result<Vec<Batch>, StoreError> {
        self.enter("eligible_batches")?;
        Ok(self
            .state
            .lock()
            .batches
            .values()
            .filter(|b| b.is_eligible())
            .cloned()
            .collect())
    }

    fn deactivate(&self, id: BatchId) -> Result<bool, StoreError> {
        self.enter("deactivate")?;
        let mut s = self.state.lock();
        let batch = s
            .batches
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{id}")))?;
        let changed = batch.active;
        batch.active = false;
        Ok(changed)
    }

    fn consume(&self, id: BatchId) -> Result<ConsumeOutcome, StoreError> {
        self.enter("consume")?;
        self.state.lock().consume(id)
    }

    fn snapshot(&self, id: BatchId) -> Result<Option<BatchSnapshot>, StoreError> {
        self.enter("snapshot")?;
        let s = self.state.lock();
        let Some(batch) = s.batches.get(&id).cloned() else {
            return Ok(None);
        };
        let (Some(posteriors), Some(pi)) = (s.posteriors.get(&id), s.pi.get(&id)) else {
            return Err(StoreError::Corrupt(format!("{id} has no snapshot rows")));
        };
        Ok(Some(BatchSnapshot {
            batch,
            posteriors: posteriors.clone(),
            pi: pi.clone(),
        }))
    }

    fn record(&self, response: &NewResponse, charge: Charge) -> Result<RecordOutcome, StoreError> {
        self.enter("record")?;
        let mut s = self.state.lock();
        s.check_arm(response.arm)?;
        if !s.batches.contains_key(&response.context_batch) {
            return Err(StoreError::Invalid(format!(
                "unknown context {}",
                response.context_batch
            )));
        }
        if !s.batches.contains_key(&response.batch) {
            return Err(StoreError::Invalid(format!("unknown {}", response.batch)));
        }

        if s.identity_seen(response.identity.as_deref()) {
            let row = s.append(response, response.batch, true);
            return Ok(RecordOutcome::Duplicate(row));
        }

        match charge {
            Charge::None => {
                let row = s.append(response, response.batch, false);
                Ok(RecordOutcome::Recorded(row))
            }
            Charge::Consume(batch) => match s.consume(batch)? {
                ConsumeOutcome::AlreadyExhausted => Ok(RecordOutcome::BatchExhausted),
                ConsumeOutcome::Landed {
                    remaining,
                    exhausted,
                } => {
                    let row = s.append(response, batch, false);
                    Ok(RecordOutcome::Charged {
                        response: row,
                        remaining,
                        exhausted,
                    })
                }
            },
        }
    }

    fn responses_for_batch(&self, id: BatchId) -> Result<Vec<Response>, StoreError> {
        self.enter("responses_for_batch")?;
        Ok(self
            .state
            .lock()
            .responses
            .iter()
            .filter(|r| r.batch == id)
            .cloned()
            .collect())
    }

    fn responses(&self) -> Result<Vec<Response>, StoreError> {
        self.enter("responses")?;
        Ok(self.state.lock().responses.clone())
    }

    fn response_count(&self, include_garbage: bool) -> Result<u64, StoreError> {
        self.enter("response_count")?;
        let s = self.state.lock();
        let n = if include_garbage {
            s.responses.len()
        } else {
            s.responses.iter().filter(|r| !r.garbage).count()
        };
        Ok(n as u64)
    }

    fn record_no_consent(&self, batch: BatchId) -> Result<ResponseId, StoreError> {
        self.enter("record_no_consent")?;
        let mut s = self.state.lock();
        if !s.batches.contains_key(&batch) {
            return Err(StoreError::Invalid(format!("unknown {batch}")));
        }
        let id = ResponseId(s.no_consent.len() as u64 + 1);
        s.no_consent.push((id, batch));
        Ok(id)
    }

    fn no_consent_count(&self) -> Result<u64, StoreError> {
        self.enter("no_consent_count")?;
        Ok(self.state.lock().no_consent.len() as u64)
    }

    fn mark_halt(
        &self,
        kind: HaltKind,
        detail: &str,
        batch: Option<BatchId>,
    ) -> Result<bool, StoreError> {
        self.enter("mark_halt")?;
        let mut s = self.state.lock();
        if s.halts.contains_key(&kind) {
            return Ok(false);
        }
        s.halts.insert(
            kind,
            HaltSignal {
                kind,
                detail: detail.to_string(),
                batch,
                acknowledged: false,
            },
        );
        Ok(true)
    }

    fn halts(&self) -> Result<Vec<HaltSignal>, StoreError> {
        self.enter("halts")?;
        Ok(self.state.lock().halts.values().cloned().collect())
    }

    fn acknowledge_halt(&self, kind: HaltKind) -> Result<(), StoreError> {
        self.enter("acknowledge_halt")?;
        let mut s = self.state.lock();
        let signal = s
            .halts
            .get_mut(&kind)
            .ok_or_else(|| StoreError::NotFound(format!("halt `{}`", kind.as_str())))?;
        signal.acknowledged = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;

    fn labels() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn draft(parent: Option<BatchId>, capacity: u64) -> BatchDraft {
        BatchDraft {
            parent,
            capacity,
            posteriors: vec![PosteriorParams::UNINFORMATIVE; 2],
            pi: CumulativePi::uniform(2).unwrap(),
        }
    }

    fn response(batch: BatchId, identity: Option<&str>) -> NewResponse {
        NewResponse {
            arm: ArmId(1),
            batch,
            context_batch: batch,
            outcome: Outcome::Success,
            garbage: false,
            identity: identity.map(str::to_string),
        }
    }

    #[test]
    fn initialize_is_single_shot() {
        let s = MemoryStore::new();
        let b = s.initialize(&labels(), &draft(None, 1)).unwrap();
        assert_eq!(b.id, BatchId(1));
        assert_eq!(s.arms().unwrap().len(), 2);
        let again = s.initialize(&labels(), &draft(None, 1));
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn consume_deactivates_on_last_slot() {
        let s = MemoryStore::new();
        let b = s.initialize(&labels(), &draft(None, 2)).unwrap();
        assert_eq!(
            s.consume(b.id).unwrap(),
            ConsumeOutcome::Landed { remaining: 1, exhausted: false }
        );
        assert_eq!(
            s.consume(b.id).unwrap(),
            ConsumeOutcome::Landed { remaining: 0, exhausted: true }
        );
        assert_eq!(s.consume(b.id).unwrap(), ConsumeOutcome::AlreadyExhausted);
        assert!(!s.batch(b.id).unwrap().unwrap().active);
    }

    #[test]
    fn successor_is_unique_per_parent() {
        let s = MemoryStore::new();
        let b = s.initialize(&labels(), &draft(None, 1)).unwrap();
        let next = s.create_successor(&draft(Some(b.id), 1)).unwrap();
        assert_eq!(next.parent, Some(b.id));
        let dup = s.create_successor(&draft(Some(b.id), 1));
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
        assert_eq!(s.successor_of(b.id).unwrap().unwrap().id, next.id);
    }

    #[test]
    fn record_dedups_identity_without_charging() {
        let s = MemoryStore::new();
        let b = s.initialize(&labels(), &draft(None, 5)).unwrap();
        let first = s.record(&response(b.id, Some("p1")), Charge::Consume(b.id)).unwrap();
        assert!(matches!(first, RecordOutcome::Charged { remaining: 4, .. }));
        let second = s.record(&response(b.id, Some("p1")), Charge::Consume(b.id)).unwrap();
        let RecordOutcome::Duplicate(row) = second else {
            panic!("expected duplicate, got {second:?}");
        };
        assert!(row.garbage && row.duplicate);
        assert_eq!(s.batch(b.id).unwrap().unwrap().remaining, 4);
        assert_eq!(s.response_count(false).unwrap(), 1);
        assert_eq!(s.response_count(true).unwrap(), 2);
    }

    #[test]
    fn injected_fault_leaves_state_untouched() {
        let s = MemoryStore::new();
        let b = s.initialize(&labels(), &draft(None, 1)).unwrap();
        s.fail_next("record", 1);
        let err = s.record(&response(b.id, None), Charge::Consume(b.id));
        assert!(matches!(err, Err(StoreError::Transient(_))));
        assert_eq!(s.batch(b.id).unwrap().unwrap().remaining, 1);
        assert!(s.responses().unwrap().is_empty());
        assert_eq!(s.call_count("record"), 1);
    }

    #[test]
    fn duplicate_against_unknown_batch_is_rejected() {
        let s = MemoryStore::new();
        let b = s.initialize(&labels(), &draft(None, 2)).unwrap();
        s.record(&response(b.id, Some("p1")), Charge::Consume(b.id)).unwrap();

        let stray = NewResponse {
            batch: BatchId(77),
            ..response(b.id, Some("p1"))
        };
        for charge in [Charge::None, Charge::Consume(b.id)] {
            let err = s.record(&stray, charge).unwrap_err();
            assert!(matches!(err, StoreError::Invalid(_)), "{err:?}");
        }
        assert_eq!(s.responses().unwrap().len(), 1);
        assert_eq!(s.batch(b.id).unwrap().unwrap().remaining, 1);
    }

    #[test]
    fn halt_latch_is_insert_if_absent() {
        let s = MemoryStore::new();
        assert!(s.mark_halt(HaltKind::MaxN, "n=10", None).unwrap());
        assert!(!s.mark_halt(HaltKind::MaxN, "n=11", None).unwrap());
        s.acknowledge_halt(HaltKind::MaxN).unwrap();
        let halts = s.halts().unwrap();
        assert_eq!(halts.len(), 1);
        assert!(halts[0].acknowledged);
        assert_eq!(halts[0].detail, "n=10");
    }
}
