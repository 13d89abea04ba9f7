//! Recruitment-platform collaborator.
//!
//! The engine only ever asks the platform to stop sending participants. Resuming is an
//! operational decision made elsewhere.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::RecruitmentError;

/// A panel-recruitment platform.
pub trait Recruitment: Send + Sync {
    /// Stop recruiting new participants. Must be safe to call more than once.
    fn pause_recruitment(&self) -> Result<(), RecruitmentError>;
}

/// Accepts every pause and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecruitment;

impl Recruitment for NoopRecruitment {
    fn pause_recruitment(&self) -> Result<(), RecruitmentError> {
        Ok(())
    }
}

/// Counts pause requests; optionally fails the first few transiently.
#[derive(Debug, Default)]
pub struct RecordingRecruitment {
    failures_left: AtomicU32,
    attempts: AtomicU64,
    pauses: AtomicU64,
    rejected: bool,
}

impl RecordingRecruitment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with [`RecruitmentError::Transient`].
    pub fn failing_first(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Reject every call with [`RecruitmentError::Rejected`].
    pub fn rejecting() -> Self {
        Self {
            rejected: true,
            ..Self::default()
        }
    }

    /// Successful pauses.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::SeqCst)
    }

    /// All calls, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Recruitment for RecordingRecruitment {
    fn pause_recruitment(&self) -> Result<(), RecruitmentError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.rejected {
            return Err(RecruitmentError::Rejected("study is not pausable".into()));
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RecruitmentError::Transient("platform returned 503".into()));
        }
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_first_recovers() {
        let r = RecordingRecruitment::failing_first(2);
        assert!(r.pause_recruitment().is_err());
        assert!(r.pause_recruitment().is_err());
        assert!(r.pause_recruitment().is_ok());
        assert_eq!(r.pauses(), 1);
        assert_eq!(r.attempts(), 3);
    }

    #[test]
    fn rejecting_never_pauses() {
        let r = RecordingRecruitment::rejecting();
        assert!(matches!(
            r.pause_recruitment(),
            Err(RecruitmentError::Rejected(_))
        ));
        assert_eq!(r.pauses(), 0);
    }
}
