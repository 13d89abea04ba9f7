//! Engine configuration.
//!
//! Plain data with defaults and a `validate()` pass. Deployments usually fill it from the
//! environment:
//!
//! | key | field | default |
//! |---|---|---|
//! | `DIRECTION` | `direction` (`max` / `min`) | `max` |
//! | `N_SIM` | `n_sim` | `100000` |
//! | `BATCH_SIZE` | `batch_capacity` | `1` |
//! | `WARMUP_N` | `warmup_n` | `0` |
//! | `STOPPAGE_THRESHOLD` | `stoppage_threshold` | unset |
//! | `STUDY_MAX_N` | `study_max_n` | unset |
//! | `MAX_N_COUNTS_GARBAGE` | `max_n_counts_garbage` | `false` |
//! | `ASSIGNMENT_SEED` | `assignment_seed` | unset |
//! | `HALT_REDISPATCH_SECS` | `halt_redispatch_cooldown` | `30` |

use std::str::FromStr;
use std::time::Duration;

use crate::gates::{GateConfig, DEFAULT_REDISPATCH_COOLDOWN};
use crate::{
    CumulativePi, Direction, EngineError, Priors, RetryPolicies, Screener, DEFAULT_N_SIM,
};

/// Where the first batch's pi comes from.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InitialPi {
    /// `[1/k, 2/k, ..., 1]`.
    #[default]
    Uniform,
    /// A caller-supplied cumulative vector, validated against the arm count.
    Explicit(CumulativePi),
    /// Monte Carlo estimate from the priors.
    FromPriors,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    pub direction: Direction,
    /// Monte Carlo columns per win-probability estimate.
    pub n_sim: usize,
    /// Slots per batch.
    pub batch_capacity: u64,
    /// Non-garbage responses collected before adaptive allocation starts.
    ///
    /// The count is read before each write, not inside it, so submissions racing across the
    /// threshold may all be tagged warm-up. The phase can overshoot by up to the number of
    /// concurrent submissions; those rows still fold into the first Advance.
    pub warmup_n: u64,
    pub stoppage_threshold: Option<f64>,
    pub study_max_n: Option<u64>,
    pub max_n_counts_garbage: bool,
    /// Minimum gap between pause retries made from the response path.
    pub halt_redispatch_cooldown: Duration,
    /// Seeds both assignment draws and estimator streams. Unset means OS entropy.
    pub assignment_seed: Option<u64>,
    pub priors: Priors,
    pub initial_pi: InitialPi,
    pub retry: RetryPolicies,
    pub screener: Screener,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Max,
            n_sim: DEFAULT_N_SIM,
            batch_capacity: 1,
            warmup_n: 0,
            stoppage_threshold: None,
            study_max_n: None,
            max_n_counts_garbage: false,
            halt_redispatch_cooldown: DEFAULT_REDISPATCH_COOLDOWN,
            assignment_seed: None,
            priors: Priors::default(),
            initial_pi: InitialPi::Uniform,
            retry: RetryPolicies::default(),
            screener: Screener::default(),
        }
    }
}

impl EngineConfig {
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            warmup_n: self.warmup_n,
            stoppage_threshold: self.stoppage_threshold,
            study_max_n: self.study_max_n,
            max_n_counts_garbage: self.max_n_counts_garbage,
            redispatch_cooldown: self.halt_redispatch_cooldown,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.n_sim == 0 {
            return Err(EngineError::invalid("n_sim must be at least 1"));
        }
        if self.batch_capacity == 0 {
            return Err(EngineError::invalid("batch capacity must be >= 1"));
        }
        if !self.priors.default.is_valid() {
            return Err(EngineError::invalid("default prior must be finite and > 0"));
        }
        self.gate_config().validate()?;
        self.retry.validate()
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Unset keys keep their defaults; blank values count as
    /// unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();
        if let Some(v) = get("DIRECTION") {
            cfg.direction = v.parse()?;
        }
        if let Some(v) = get("N_SIM") {
            cfg.n_sim = parse("N_SIM", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            cfg.batch_capacity = parse("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("WARMUP_N") {
            cfg.warmup_n = parse("WARMUP_N", &v)?;
        }
        if let Some(v) = get("STOPPAGE_THRESHOLD") {
            cfg.stoppage_threshold = Some(parse("STOPPAGE_THRESHOLD", &v)?);
        }
        if let Some(v) = get("STUDY_MAX_N") {
            cfg.study_max_n = Some(parse("STUDY_MAX_N", &v)?);
        }
        if let Some(v) = get("MAX_N_COUNTS_GARBAGE") {
            cfg.max_n_counts_garbage = parse_bool("MAX_N_COUNTS_GARBAGE", &v)?;
        }
        if let Some(v) = get("ASSIGNMENT_SEED") {
            cfg.assignment_seed = Some(parse("ASSIGNMENT_SEED", &v)?);
        }
        if let Some(v) = get("HALT_REDISPATCH_SECS") {
            cfg.halt_redispatch_cooldown = Duration::from_secs(parse("HALT_REDISPATCH_SECS", &v)?);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, EngineError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EngineError::invalid(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, EngineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::invalid(format!("{key}={value:?}: expected a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.n_sim, 100_000);
        assert_eq!(cfg.batch_capacity, 1);
        assert_eq!(cfg.assignment_seed, None);
        assert_eq!(EngineConfig::from_lookup(|_| None).unwrap(), cfg);
    }

    #[test]
    fn reads_every_key() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("DIRECTION", "min"),
            ("N_SIM", "200000"),
            ("BATCH_SIZE", "5"),
            ("WARMUP_N", "40"),
            ("STOPPAGE_THRESHOLD", "0.95"),
            ("STUDY_MAX_N", "600"),
            ("MAX_N_COUNTS_GARBAGE", "true"),
            ("ASSIGNMENT_SEED", "7"),
            ("HALT_REDISPATCH_SECS", "120"),
        ]))
        .unwrap();
        assert_eq!(cfg.direction, Direction::Min);
        assert_eq!(cfg.n_sim, 200_000);
        assert_eq!(cfg.batch_capacity, 5);
        assert_eq!(cfg.warmup_n, 40);
        assert_eq!(cfg.stoppage_threshold, Some(0.95));
        assert_eq!(cfg.study_max_n, Some(600));
        assert!(cfg.max_n_counts_garbage);
        assert_eq!(cfg.assignment_seed, Some(7));
        assert_eq!(cfg.halt_redispatch_cooldown, Duration::from_secs(120));
        assert_eq!(cfg.gate_config().redispatch_cooldown, Duration::from_secs(120));
    }

    #[test]
    fn malformed_values_are_invalid_arguments() {
        for (k, v) in [
            ("N_SIM", "lots"),
            ("BATCH_SIZE", "0"),
            ("STOPPAGE_THRESHOLD", "1.2"),
            ("MAX_N_COUNTS_GARBAGE", "sometimes"),
            ("DIRECTION", "sideways"),
        ] {
            let err = EngineConfig::from_lookup(lookup(&[(k, v)])).unwrap_err();
            assert!(matches!(err, EngineError::InvalidArgument(_)), "{k}={v}: {err:?}");
        }
    }

    #[test]
    fn blank_values_keep_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[("WARMUP_N", "  ")])).unwrap();
        assert_eq!(cfg.warmup_n, 0);
    }
}
