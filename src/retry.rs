//! Bounded retry with exponential backoff and jitter.
//!
//! Every round-trip to a collaborator (store or recruitment platform) runs under a
//! [`RetryPolicy`]. Transient failures sleep and retry; anything else returns immediately.
//! When the budget runs out the caller gets a typed error carrying the attempt count and the
//! last failure, never a swallowed-and-reraised generic one.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::{EngineError, StoreError, Transient};

/// Retry budget and backoff schedule for one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Fraction of each delay randomized away, in `[0, 1]`. `0.25` sleeps 75–100% of the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `max_attempts` attempts with no sleeping between them (tests, in-process stores).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts == 0 {
            return Err(EngineError::invalid("retry max_attempts must be >= 1"));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(EngineError::invalid("retry multiplier must be finite and >= 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(EngineError::invalid("retry jitter must be in [0, 1]"));
        }
        Ok(())
    }

    /// Un-jittered delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let j = self.jitter.clamp(0.0, 1.0);
        if j == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 - j * rand::rng().random::<f64>();
        base.mul_f64(factor)
    }
}

/// Per-operation retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicies {
    /// Create, Consume, response writes and snapshot reads.
    pub store: RetryPolicy,
    /// The aggregate-estimate-create sequence of Advance.
    pub advance: RetryPolicy,
    /// Calls to the recruitment platform.
    pub recruitment: RetryPolicy,
}

impl RetryPolicies {
    pub fn immediate(max_attempts: u32) -> Self {
        let p = RetryPolicy::immediate(max_attempts);
        Self {
            store: p,
            advance: p,
            recruitment: p,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.store.validate()?;
        self.advance.validate()?;
        self.recruitment.validate()
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// A non-transient failure; returned on the attempt that produced it.
    Permanent { attempts: u32, error: E },
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Permanent { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Permanent { attempts, error } => {
                write!(f, "permanent failure on attempt {attempts}: {error}")
            }
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempt(s): {last}")
            }
        }
    }
}

impl RetryError<StoreError> {
    /// Map a failed store operation onto the engine taxonomy.
    pub fn into_engine(self, op: &'static str) -> EngineError {
        match self {
            RetryError::Permanent { error, attempts } => match error {
                StoreError::Invalid(msg) => EngineError::InvalidArgument(msg),
                StoreError::Corrupt(msg) => EngineError::Corrupt(msg),
                other => EngineError::EngineUnavailable {
                    op,
                    attempts,
                    last: other.to_string(),
                },
            },
            RetryError::Exhausted { attempts, last } => EngineError::EngineUnavailable {
                op,
                attempts,
                last: last.to_string(),
            },
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or exhausts `policy`.
///
/// `f` receives the 1-based attempt number.
pub fn retry<T, E, F>(policy: &RetryPolicy, op: &'static str, mut f: F) -> Result<T, RetryError<E>>
where
    E: Transient + fmt::Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match f(attempt) {
            Ok(v) => {
                if attempt > 1 {
                    debug!(op, attempt, "operation succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) if !e.is_transient() => {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) if attempt >= max => {
                warn!(op, attempts = attempt, error = %e, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.jittered(policy.backoff(attempt));
                debug!(
                    op,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}

/// [`retry`] specialised to store calls, mapped onto [`EngineError`].
pub(crate) fn store_call<T, F>(policy: &RetryPolicy, op: &'static str, f: F) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Result<T, StoreError>,
{
    retry(policy, op, f).map_err(|e| e.into_engine(op))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let out: Result<u32, RetryError<StoreError>> =
            retry(&RetryPolicy::immediate(3), "op", |attempt| {
                calls += 1;
                if attempt < 3 {
                    Err(StoreError::Transient("busy".into()))
                } else {
                    Ok(attempt)
                }
            });
        assert_eq!(out.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausts_with_attempt_count() {
        let out: Result<(), _> = retry(&RetryPolicy::immediate(4), "op", |_| {
            Err(StoreError::Transient("busy".into()))
        });
        let err = out.unwrap_err();
        assert_eq!(err.attempts(), 4);
        let engine = err.into_engine("consume");
        assert!(matches!(
            engine,
            EngineError::EngineUnavailable { op: "consume", attempts: 4, .. }
        ));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut calls = 0;
        let out: Result<(), _> = retry(&RetryPolicy::immediate(5), "op", |_| {
            calls += 1;
            Err(StoreError::Invalid("nope".into()))
        });
        assert_eq!(calls, 1);
        assert!(matches!(
            out.unwrap_err().into_engine("op"),
            EngineError::InvalidArgument(_)
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(10));
        assert_eq!(p.backoff(2), Duration::from_millis(20));
        assert_eq!(p.backoff(3), Duration::from_millis(40));
        assert_eq!(p.backoff(4), Duration::from_millis(50));
        assert_eq!(p.backoff(30), Duration::from_millis(50));
    }

    #[test]
    fn jitter_never_exceeds_base_delay() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = p.jittered(base);
            assert!(d <= base && d >= base / 2, "{d:?}");
        }
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { jitter: 1.5, ..RetryPolicy::default() }.validate().is_err());
        assert!(RetryPolicy { multiplier: 0.5, ..RetryPolicy::default() }.validate().is_err());
    }
}
