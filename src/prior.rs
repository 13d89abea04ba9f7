//! Seed posteriors for the first batch.

use std::collections::BTreeMap;

use crate::{EngineError, PosteriorParams};

/// Prior configuration: one default plus optional per-arm overrides keyed by label.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Priors {
    /// Prior for every arm without an override. Conventionally Beta(1, 1).
    pub default: PosteriorParams,
    /// Per-arm priors (alpha, beta). Overrides `default` for the named arm.
    #[cfg_attr(feature = "serde", serde(default))]
    pub per_arm: BTreeMap<String, PosteriorParams>,
}

impl Default for Priors {
    fn default() -> Self {
        Self::uninformative()
    }
}

impl Priors {
    /// Beta(1, 1) for every arm.
    pub fn uninformative() -> Self {
        Self {
            default: PosteriorParams::UNINFORMATIVE,
            per_arm: BTreeMap::new(),
        }
    }

    pub fn with_default(default: PosteriorParams) -> Self {
        Self {
            default,
            per_arm: BTreeMap::new(),
        }
    }

    pub fn with_arm(mut self, label: impl Into<String>, params: PosteriorParams) -> Self {
        self.per_arm.insert(label.into(), params);
        self
    }

    /// Resolve the prior for each label, in label order.
    ///
    /// Fails on an empty label list, duplicate labels, overrides naming an unknown arm, or any
    /// non-finite / non-positive parameter.
    pub fn resolve(&self, labels: &[String]) -> Result<Vec<PosteriorParams>, EngineError> {
        if labels.is_empty() {
            return Err(EngineError::invalid("arm set must not be empty"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for l in labels {
            if l.trim().is_empty() {
                return Err(EngineError::invalid("arm labels must not be blank"));
            }
            if !seen.insert(l.as_str()) {
                return Err(EngineError::invalid(format!("duplicate arm label `{l}`")));
            }
        }
        if let Some(unknown) = self.per_arm.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(EngineError::invalid(format!(
                "prior override for unknown arm `{unknown}`"
            )));
        }

        labels
            .iter()
            .map(|l| {
                let p = self.per_arm.get(l).copied().unwrap_or(self.default);
                if p.is_valid() {
                    Ok(p)
                } else {
                    Err(EngineError::invalid(format!(
                        "prior for `{l}` must be finite and > 0, got alpha={} beta={}",
                        p.alpha, p.beta
                    )))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_applies_to_every_arm() {
        let p = Priors::uninformative()
            .resolve(&labels(&["a", "b", "c"]))
            .unwrap();
        assert_eq!(p, vec![PosteriorParams::UNINFORMATIVE; 3]);
    }

    #[test]
    fn override_replaces_default_for_named_arm() {
        let priors = Priors::uninformative().with_arm("b", PosteriorParams::new(3.0, 7.0));
        let p = priors.resolve(&labels(&["a", "b"])).unwrap();
        assert_eq!(p[0], PosteriorParams::UNINFORMATIVE);
        assert_eq!(p[1], PosteriorParams::new(3.0, 7.0));
    }

    #[test]
    fn rejects_empty_duplicate_and_unknown() {
        let priors = Priors::uninformative();
        assert!(priors.resolve(&[]).is_err());
        assert!(priors.resolve(&labels(&["a", "a"])).is_err());
        assert!(priors.resolve(&labels(&["a", " "])).is_err());
        let stray = Priors::uninformative().with_arm("z", PosteriorParams::UNINFORMATIVE);
        assert!(stray.resolve(&labels(&["a"])).is_err());
    }

    #[test]
    fn rejects_bad_parameters() {
        let bad = Priors::with_default(PosteriorParams::new(0.0, 1.0));
        assert!(matches!(
            bad.resolve(&labels(&["a"])),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
