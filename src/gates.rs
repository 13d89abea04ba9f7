//! Warm-up, stoppage and max-N gates.
//!
//! - **Warm-up**: while fewer than `warmup_n` non-garbage responses exist, assignment uses the
//!   first batch and the lifecycle never advances.
//! - **Stoppage**: after an Advance creates a batch, any arm whose per-arm win probability is
//!   at least `stoppage_threshold` halts recruitment.
//! - **Max-N**: once the response count reaches `study_max_n`, recruitment halts.
//!
//! Halts are latched in the store first ([`Store::mark_halt`] is insert-if-absent), then the
//! recruitment platform is told to pause under a bounded retry. A latch whose pause did not
//! go through stays unacknowledged. Response writes re-dispatch it at most once per
//! `redispatch_cooldown`, and never wait on a dispatch already running elsewhere;
//! [`Gates::flush_pending`] retries unconditionally. Nothing here ever fails the response
//! write that triggered it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::retry::{retry, store_call};
use crate::store::{HaltKind, HaltSignal, Store};
use crate::{Arm, BatchId, CumulativePi, EngineError, Recruitment, RetryPolicies};

/// Minimum gap between re-dispatches of unacknowledged halts from the response path.
pub const DEFAULT_REDISPATCH_COOLDOWN: Duration = Duration::from_secs(30);

/// Gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GateConfig {
    /// Non-garbage responses collected before adaptive allocation starts. `0` disables warm-up.
    pub warmup_n: u64,
    /// Per-arm win probability at which recruitment halts. `None` disables the gate.
    pub stoppage_threshold: Option<f64>,
    /// Total responses at which recruitment halts. `None` disables the gate.
    pub study_max_n: Option<u64>,
    /// Whether garbage rows count toward `study_max_n`.
    pub max_n_counts_garbage: bool,
    /// How long response writes wait before retrying a pause the platform has not confirmed.
    pub redispatch_cooldown: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            warmup_n: 0,
            stoppage_threshold: None,
            study_max_n: None,
            max_n_counts_garbage: false,
            redispatch_cooldown: DEFAULT_REDISPATCH_COOLDOWN,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(t) = self.stoppage_threshold {
            if !(t.is_finite() && t > 0.0 && t <= 1.0) {
                return Err(EngineError::invalid(format!(
                    "stoppage threshold must be in (0, 1], got {t}"
                )));
            }
        }
        if self.study_max_n == Some(0) {
            return Err(EngineError::invalid("study max N must be >= 1"));
        }
        Ok(())
    }
}

/// Warm-up progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WarmupStatus {
    /// Non-garbage responses recorded so far.
    pub recorded: u64,
    pub target: u64,
}

impl WarmupStatus {
    pub fn active(&self) -> bool {
        self.recorded < self.target
    }
}

/// First arm (lowest position) whose per-arm win probability meets `threshold`.
pub fn stoppage_crossing(pi: &CumulativePi, threshold: f64) -> Option<(usize, f64)> {
    pi.per_arm()
        .into_iter()
        .enumerate()
        .find(|&(_, p)| p >= threshold)
}

pub fn max_n_reached(count: u64, study_max_n: Option<u64>) -> bool {
    study_max_n.is_some_and(|max| count >= max)
}

/// What a gate evaluation did.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GateReport {
    /// Halts latched by this evaluation.
    pub raised: Vec<HaltKind>,
    /// Halts whose pause request went through in this evaluation.
    pub dispatched: Vec<HaltKind>,
    /// Halts still waiting for the platform to confirm.
    pub pending: Vec<HaltKind>,
}

impl GateReport {
    pub(crate) fn merge(&mut self, other: GateReport) {
        self.raised.extend(other.raised);
        self.dispatched.extend(other.dispatched);
        self.pending.extend(other.pending);
    }
}

/// Gate evaluation against a store and a recruitment platform.
#[derive(Clone)]
pub struct Gates {
    config: GateConfig,
    store: Arc<dyn Store>,
    recruitment: Arc<dyn Recruitment>,
    retry: RetryPolicies,
    // Serializes pause dispatch; holds the time of the last attempt.
    dispatch: Arc<Mutex<Option<Instant>>>,
}

impl std::fmt::Debug for Gates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gates")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Gates {
    pub fn new(
        config: GateConfig,
        store: Arc<dyn Store>,
        recruitment: Arc<dyn Recruitment>,
        retry: RetryPolicies,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        retry.validate()?;
        Ok(Self {
            config,
            store,
            recruitment,
            retry,
            dispatch: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn warmup(&self) -> Result<WarmupStatus, EngineError> {
        if self.config.warmup_n == 0 {
            return Ok(WarmupStatus {
                recorded: 0,
                target: 0,
            });
        }
        let recorded = store_call(&self.retry.store, "response_count", |_| {
            self.store.response_count(false)
        })?;
        Ok(WarmupStatus {
            recorded,
            target: self.config.warmup_n,
        })
    }

    /// Stoppage check for a batch just created by Advance.
    pub fn after_advance(
        &self,
        arms: &[Arm],
        batch: BatchId,
        pi: &CumulativePi,
    ) -> Result<GateReport, EngineError> {
        let Some(threshold) = self.config.stoppage_threshold else {
            return Ok(GateReport::default());
        };
        let Some((pos, p)) = stoppage_crossing(pi, threshold) else {
            return Ok(GateReport::default());
        };
        let label = arms.get(pos).map(|a| a.label.as_str()).unwrap_or("?");
        let detail = format!("arm `{label}` win probability {p:.4} >= {threshold}");
        self.latch(HaltKind::Stoppage, &detail, Some(batch))
    }

    /// Max-N check plus a rate-limited re-dispatch of unacknowledged halts. Runs after every
    /// response write.
    pub fn after_record(&self, batch: Option<BatchId>) -> Result<GateReport, EngineError> {
        let mut report = GateReport::default();
        if let Some(max) = self.config.study_max_n {
            let counts_garbage = self.config.max_n_counts_garbage;
            let count = store_call(&self.retry.store, "response_count", |_| {
                self.store.response_count(counts_garbage)
            })?;
            if max_n_reached(count, Some(max)) {
                let detail = format!("{count} responses >= study max {max}");
                report.merge(self.latch(HaltKind::MaxN, &detail, batch)?);
            }
        }
        report.merge(self.flush_due()?);
        Ok(report)
    }

    /// Dispatch every latched halt the platform has not confirmed yet, waiting for any
    /// dispatch in progress and ignoring the cooldown.
    pub fn flush_pending(&self) -> Result<GateReport, EngineError> {
        let mut last = self.dispatch.lock();
        self.flush_locked(&mut last)
    }

    // Skips when another caller is dispatching or the last attempt is too recent.
    fn flush_due(&self) -> Result<GateReport, EngineError> {
        let Some(mut last) = self.dispatch.try_lock() else {
            return Ok(GateReport::default());
        };
        if matches!(*last, Some(t) if t.elapsed() < self.config.redispatch_cooldown) {
            return Ok(GateReport::default());
        }
        self.flush_locked(&mut last)
    }

    fn flush_locked(&self, last: &mut Option<Instant>) -> Result<GateReport, EngineError> {
        let mut report = GateReport::default();
        for signal in self.halts()?.into_iter().filter(|h| !h.acknowledged) {
            *last = Some(Instant::now());
            self.dispatch_locked(&signal, &mut report)?;
        }
        Ok(report)
    }

    pub fn halts(&self) -> Result<Vec<HaltSignal>, EngineError> {
        store_call(&self.retry.store, "halts", |_| self.store.halts())
    }

    fn latch(
        &self,
        kind: HaltKind,
        detail: &str,
        batch: Option<BatchId>,
    ) -> Result<GateReport, EngineError> {
        let created = store_call(&self.retry.store, "mark_halt", |_| {
            self.store.mark_halt(kind, detail, batch)
        })?;
        let mut report = GateReport::default();
        if !created {
            return Ok(report);
        }
        info!(kind = kind.as_str(), detail, batch = ?batch, "recruitment halt latched");
        report.raised.push(kind);
        // A dispatch running elsewhere may have read the halts before this latch; the
        // next flush picks it up.
        let Some(mut last) = self.dispatch.try_lock() else {
            report.pending.push(kind);
            return Ok(report);
        };
        *last = Some(Instant::now());
        let signal = HaltSignal {
            kind,
            detail: detail.to_string(),
            batch,
            acknowledged: false,
        };
        self.dispatch_locked(&signal, &mut report)?;
        Ok(report)
    }

    fn dispatch_locked(
        &self,
        signal: &HaltSignal,
        report: &mut GateReport,
    ) -> Result<(), EngineError> {
        let kind = signal.kind;
        match retry(&self.retry.recruitment, "pause_recruitment", |_| {
            self.recruitment.pause_recruitment()
        }) {
            Ok(()) => {
                store_call(&self.retry.store, "acknowledge_halt", |_| {
                    self.store.acknowledge_halt(kind)
                })?;
                info!(kind = kind.as_str(), detail = %signal.detail, "recruitment paused");
                report.dispatched.push(kind);
            }
            Err(e) => {
                if e.attempts() > 1 {
                    warn!(kind = kind.as_str(), attempts = e.attempts(), "pause request still failing");
                }
                error!(kind = kind.as_str(), error = %e, "could not pause recruitment; will retry");
                report.pending.push(kind);
            }
        }
        Ok(())
    }
}
