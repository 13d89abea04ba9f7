//! Response quality screening.
//!
//! A submission is garbage when any administered check fails. Garbage rows are still
//! recorded (they count toward max-N when so configured) but never touch a posterior and
//! never consume batch capacity. Checks that were not administered (`None`) are skipped.
//!
//! Duplicate identities are detected by the store at write time, not here; the engine adds
//! [`GarbageReason::DuplicateIdentity`] to the receipt when that happens.

use std::fmt;

/// Why a submission was excluded from posterior updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GarbageReason {
    /// The identity token already has a recorded response.
    DuplicateIdentity,
    /// The participant chose a different option than the attention item asked for.
    AttentionCheckFailed,
    /// The participant is outside the study population (e.g. wrong region).
    Ineligible,
    /// The participant declined, or was unsure about, committing to thoughtful answers.
    NoCommitment,
    /// The human-verification answer did not match.
    CaptchaFailed,
    /// The caller flagged the row without giving a reason.
    Flagged,
}

impl fmt::Display for GarbageReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GarbageReason::DuplicateIdentity => "duplicate identity",
            GarbageReason::AttentionCheckFailed => "attention check failed",
            GarbageReason::Ineligible => "ineligible",
            GarbageReason::NoCommitment => "no commitment",
            GarbageReason::CaptchaFailed => "captcha failed",
            GarbageReason::Flagged => "flagged by caller",
        };
        f.write_str(s)
    }
}

/// Answer to the commitment question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Commitment {
    Yes,
    No,
    Unsure,
}

impl std::str::FromStr for Commitment {
    type Err = crate::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Commitment::Yes),
            "no" => Ok(Commitment::No),
            "unsure" => Ok(Commitment::Unsure),
            other => Err(crate::EngineError::invalid(format!(
                "commitment must be yes, no or unsure, got `{other}`"
            ))),
        }
    }
}

/// Quality-check answers collected alongside a response.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QualityChecks {
    /// Whether the participant belongs to the study population.
    pub eligible: Option<bool>,
    pub commitment: Option<Commitment>,
    /// Free-text captcha answer.
    pub captcha: Option<String>,
    /// `(chosen, expected)` option indices of the attention item.
    pub attention: Option<(u32, u32)>,
}

/// Screening rules.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Screener {
    /// Expected captcha answer, compared case-insensitively after trimming.
    pub captcha_answer: String,
}

impl Default for Screener {
    fn default() -> Self {
        Self {
            captcha_answer: "purple".to_string(),
        }
    }
}

impl Screener {
    pub fn new(captcha_answer: impl Into<String>) -> Self {
        Self {
            captcha_answer: captcha_answer.into(),
        }
    }

    /// Every failing check, in a fixed order.
    pub fn screen(&self, checks: &QualityChecks) -> Vec<GarbageReason> {
        let mut reasons = Vec::new();
        if checks.eligible == Some(false) {
            reasons.push(GarbageReason::Ineligible);
        }
        if matches!(checks.commitment, Some(Commitment::No | Commitment::Unsure)) {
            reasons.push(GarbageReason::NoCommitment);
        }
        if let Some(answer) = &checks.captcha {
            if !answer.trim().eq_ignore_ascii_case(self.captcha_answer.trim()) {
                reasons.push(GarbageReason::CaptchaFailed);
            }
        }
        if let Some((chosen, expected)) = checks.attention {
            if chosen != expected {
                reasons.push(GarbageReason::AttentionCheckFailed);
            }
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_submission_has_no_reasons() {
        let checks = QualityChecks {
            eligible: Some(true),
            commitment: Some(Commitment::Yes),
            captcha: Some(" Purple ".into()),
            attention: Some((2, 2)),
        };
        assert!(Screener::default().screen(&checks).is_empty());
        assert!(Screener::default().screen(&QualityChecks::default()).is_empty());
    }

    #[test]
    fn every_failure_is_reported() {
        let checks = QualityChecks {
            eligible: Some(false),
            commitment: Some(Commitment::Unsure),
            captcha: Some("green".into()),
            attention: Some((1, 3)),
        };
        assert_eq!(
            Screener::default().screen(&checks),
            vec![
                GarbageReason::Ineligible,
                GarbageReason::NoCommitment,
                GarbageReason::CaptchaFailed,
                GarbageReason::AttentionCheckFailed,
            ]
        );
    }

    #[test]
    fn commitment_parses() {
        assert_eq!("YES".parse::<Commitment>().unwrap(), Commitment::Yes);
        assert!("maybe".parse::<Commitment>().is_err());
    }
}
