//! Structured model specifications and the complexity ladder.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::{ModelError, Result};
use crate::formula::{FixedEffects, ParsedFormula, RandomTerm, render_formula};
use crate::ids::ModelSpecId;

/// Response distribution passed to the fitting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Gaussian,
    Gamma,
    Poisson,
    NegativeBinomial,
    Binomial,
}

impl Family {
    pub fn default_link(self) -> Link {
        match self {
            Self::Gaussian => Link::Identity,
            Self::Gamma => Link::Inverse,
            Self::Poisson | Self::NegativeBinomial => Link::Log,
            Self::Binomial => Link::Logit,
        }
    }

    pub fn supports(self, link: Link) -> bool {
        match self {
            Self::Gaussian | Self::Gamma => {
                matches!(link, Link::Identity | Link::Log | Link::Inverse)
            }
            Self::Poisson => matches!(link, Link::Log | Link::Identity),
            Self::NegativeBinomial => link == Link::Log,
            Self::Binomial => link == Link::Logit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gaussian => "gaussian",
            Self::Gamma => "gamma",
            Self::Poisson => "poisson",
            Self::NegativeBinomial => "negative_binomial",
            Self::Binomial => "binomial",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Identity,
    Log,
    Inverse,
    Logit,
}

impl Link {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Log => "log",
            Self::Inverse => "inverse",
            Self::Logit => "logit",
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position on the fallback ladder, richest first.
///
/// The derived ordering runs from richest to terminal, so
/// `FullRandomSlope < RandomInterceptOnly < FixedEffectsOnly < Abandoned`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LadderState {
    FullRandomSlope,
    RandomInterceptOnly,
    FixedEffectsOnly,
    Abandoned,
}

impl LadderState {
    /// The next simpler state; `Abandoned` is terminal.
    pub fn next(self) -> Option<LadderState> {
        match self {
            Self::FullRandomSlope => Some(Self::RandomInterceptOnly),
            Self::RandomInterceptOnly => Some(Self::FixedEffectsOnly),
            Self::FixedEffectsOnly => Some(Self::Abandoned),
            Self::Abandoned => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Abandoned
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullRandomSlope => "full_random_slope",
            Self::RandomInterceptOnly => "random_intercept_only",
            Self::FixedEffectsOnly => "fixed_effects_only",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for LadderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, validated model specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    outcome: String,
    fixed: FixedEffects,
    random: Vec<RandomTerm>,
    family: Family,
    link: Link,
}

impl ModelSpec {
    /// Parses formula text and validates the family/link pairing.
    pub fn parse(formula: &str, family: Family, link: Option<Link>) -> Result<Self> {
        let parsed = ParsedFormula::parse(formula)?;
        Self::new(
            parsed.response,
            parsed.fixed,
            parsed.random,
            family,
            link.unwrap_or_else(|| family.default_link()),
        )
    }

    pub fn new(
        outcome: impl Into<String>,
        fixed: FixedEffects,
        random: Vec<RandomTerm>,
        family: Family,
        link: Link,
    ) -> Result<Self> {
        let outcome = outcome.into();
        if outcome.trim().is_empty() {
            return Err(ModelError::InvalidOutcome(outcome));
        }
        if !family.supports(link) {
            return Err(ModelError::UnsupportedLink {
                family: family.to_string(),
                link: link.to_string(),
            });
        }
        Ok(Self {
            outcome,
            fixed,
            random,
            family,
            link,
        })
    }

    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    pub fn fixed(&self) -> &FixedEffects {
        &self.fixed
    }

    pub fn random(&self) -> &[RandomTerm] {
        &self.random
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn formula(&self) -> String {
        render_formula(&self.outcome, &self.fixed, &self.random)
    }

    pub fn ladder_state(&self) -> LadderState {
        if self.random.is_empty() {
            LadderState::FixedEffectsOnly
        } else if self.random.iter().any(|r| !r.slopes.is_empty()) {
            LadderState::FullRandomSlope
        } else {
            LadderState::RandomInterceptOnly
        }
    }

    /// Grouping columns referenced by random blocks, deduplicated.
    pub fn grouping_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for term in &self.random {
            for factor in &term.grouping.factors {
                if !out.contains(factor) {
                    out.push(factor.clone());
                }
            }
        }
        out
    }

    /// Predictor columns referenced by fixed terms or random slopes.
    pub fn predictor_columns(&self) -> Vec<String> {
        let mut out = self.fixed.variables();
        for term in &self.random {
            for slope in &term.slopes {
                if !out.contains(slope) {
                    out.push(slope.clone());
                }
            }
        }
        out
    }

    /// Derives the spec for a simpler ladder state without touching `self`.
    ///
    /// Returns `None` for `Abandoned` or for a state richer than the current one.
    pub fn simplified(&self, state: LadderState) -> Option<ModelSpec> {
        if state.is_terminal() || state < self.ladder_state() {
            return None;
        }
        let random = match state {
            LadderState::FullRandomSlope => self.random.clone(),
            LadderState::RandomInterceptOnly => {
                let mut out: Vec<RandomTerm> = Vec::new();
                for term in self.random.iter().map(RandomTerm::intercept_only) {
                    if !out.contains(&term) {
                        out.push(term);
                    }
                }
                out
            }
            LadderState::FixedEffectsOnly | LadderState::Abandoned => Vec::new(),
        };
        Some(Self {
            random,
            ..self.clone()
        })
    }

    /// Returns a copy with a different random-effects structure.
    pub fn with_random(&self, random: Vec<RandomTerm>) -> ModelSpec {
        Self {
            random,
            ..self.clone()
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}|{}|{}", self.formula(), self.family, self.link)
    }

    pub fn id(&self) -> ModelSpecId {
        let digest = sha2::Sha256::digest(self.canonical().as_bytes());
        ModelSpecId::from_digest(&digest)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}/{}]", self.formula(), self.family, self.link)
    }
}

/// The primary spec of one outcome plus any explicit fallback candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSpec {
    primary: ModelSpec,
    fallbacks: Vec<ModelSpec>,
}

impl OutcomeSpec {
    pub fn new(primary: ModelSpec) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
        }
    }

    /// Adds explicit fallback candidates in priority order.
    ///
    /// Each candidate must target the same outcome and sit strictly lower on
    /// the ladder than its predecessor.
    pub fn with_fallbacks(primary: ModelSpec, fallbacks: Vec<ModelSpec>) -> Result<Self> {
        let mut previous = primary.ladder_state();
        for candidate in &fallbacks {
            if candidate.outcome() != primary.outcome() {
                return Err(ModelError::FallbackOutcomeMismatch {
                    expected: primary.outcome().to_string(),
                    found: candidate.outcome().to_string(),
                });
            }
            let state = candidate.ladder_state();
            if state <= previous {
                return Err(ModelError::NonMonotoneFallback {
                    outcome: primary.outcome().to_string(),
                    previous: previous.to_string(),
                    next: state.to_string(),
                });
            }
            previous = state;
        }
        Ok(Self { primary, fallbacks })
    }

    pub fn outcome(&self) -> &str {
        self.primary.outcome()
    }

    pub fn primary(&self) -> &ModelSpec {
        &self.primary
    }

    pub fn fallbacks(&self) -> &[ModelSpec] {
        &self.fallbacks
    }

    pub fn id(&self) -> ModelSpecId {
        self.primary.id()
    }

    pub fn initial_state(&self) -> LadderState {
        self.primary.ladder_state()
    }

    /// Spec to fit at `state`: an explicit fallback if one targets it,
    /// otherwise the primary simplified to that state.
    pub fn spec_for(&self, state: LadderState) -> Option<ModelSpec> {
        if state == self.primary.ladder_state() {
            return Some(self.primary.clone());
        }
        self.fallbacks
            .iter()
            .find(|candidate| candidate.ladder_state() == state)
            .cloned()
            .or_else(|| self.primary.simplified(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slope_spec() -> ModelSpec {
        ModelSpec::parse(
            "value ~ treatment * time + (1 + time | replicate_id/participant_id)",
            Family::Gaussian,
            None,
        )
        .unwrap()
    }

    #[test]
    fn ladder_is_strictly_ordered() {
        let mut state = LadderState::FullRandomSlope;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(next > state);
            seen.push(next);
            state = next;
        }
        assert_eq!(seen.len(), 4);
        assert!(state.is_terminal());
    }

    #[test]
    fn simplification_drops_slopes_then_random_effects() {
        let spec = slope_spec();
        assert_eq!(spec.ladder_state(), LadderState::FullRandomSlope);

        let intercept = spec.simplified(LadderState::RandomInterceptOnly).unwrap();
        assert_eq!(intercept.ladder_state(), LadderState::RandomInterceptOnly);
        assert_eq!(
            intercept.formula(),
            "value ~ treatment + time + treatment:time + (1 | replicate_id/participant_id)"
        );

        let fixed = spec.simplified(LadderState::FixedEffectsOnly).unwrap();
        assert!(fixed.random().is_empty());
        assert_eq!(fixed.fixed(), spec.fixed());

        assert!(spec.simplified(LadderState::Abandoned).is_none());
        assert!(fixed.simplified(LadderState::FullRandomSlope).is_none());
        // the original is untouched
        assert_eq!(spec.ladder_state(), LadderState::FullRandomSlope);
    }

    #[test]
    fn id_is_stable_and_content_addressed() {
        let a = slope_spec();
        let b = slope_spec();
        assert_eq!(a.id(), b.id());
        let c = a.simplified(LadderState::RandomInterceptOnly).unwrap();
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().as_str().len(), 16);
    }

    #[test]
    fn rejects_incompatible_link() {
        let err = ModelSpec::parse("count ~ time", Family::Poisson, Some(Link::Logit));
        assert!(matches!(err, Err(ModelError::UnsupportedLink { .. })));
    }

    #[test]
    fn fallbacks_must_simplify() {
        let primary = slope_spec();
        let same_level = ModelSpec::parse(
            "value ~ treatment * time + (1 + time | participant_id)",
            Family::Gaussian,
            None,
        )
        .unwrap();
        assert!(matches!(
            OutcomeSpec::with_fallbacks(primary.clone(), vec![same_level]),
            Err(ModelError::NonMonotoneFallback { .. })
        ));

        let intercept = ModelSpec::parse(
            "value ~ treatment * time + (1 | participant_id)",
            Family::Gaussian,
            None,
        )
        .unwrap();
        let outcome = OutcomeSpec::with_fallbacks(primary, vec![intercept.clone()]).unwrap();
        assert_eq!(
            outcome.spec_for(LadderState::RandomInterceptOnly),
            Some(intercept)
        );
        assert_eq!(
            outcome
                .spec_for(LadderState::FixedEffectsOnly)
                .map(|s| s.ladder_state()),
            Some(LadderState::FixedEffectsOnly)
        );
    }
}
