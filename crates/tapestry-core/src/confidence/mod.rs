//! Confidence engine — the scoring rules for the belief lifecycle.
//!
//! Pure functions over a tunable parameter set. Every confidence change
//! in the system (initial scoring, reinforcement, decay, revision,
//! archival) goes through this module so the rules live in exactly one
//! place.
//!
//! ## Core formulas
//! - Initial: `base(mechanism) * hedge_multiplier(hedge) * sentiment_factor`
//! - Reinforce: `new = old + boost * (1 - old)` (asymptotic toward C_max)
//! - Decay: `new = old * (1 - rate * months_beyond_grace)`, floored at 0
//! - Supersede: a new fact replaces an old one only when it is more
//!   confident by at least the contradiction margin

use serde::{Deserialize, Serialize};

use crate::graph::{Provenance, TemporalType};

// ============================================================================
// HEDGE LEVELS
// ============================================================================

/// How strongly the speaker hedged the statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HedgeLevel {
    /// No hedging ("Lena loves Malbec")
    #[default]
    None,
    /// Mild ("I think Lena loves Malbec")
    Mild,
    /// Moderate ("Lena probably likes Malbec")
    Moderate,
    /// Strong ("Lena might possibly like Malbec, not sure")
    Strong,
}

impl HedgeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HedgeLevel::None => "none",
            HedgeLevel::Mild => "mild",
            HedgeLevel::Moderate => "moderate",
            HedgeLevel::Strong => "strong",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "none" => HedgeLevel::None,
            "mild" => HedgeLevel::Mild,
            "moderate" => HedgeLevel::Moderate,
            "strong" => HedgeLevel::Strong,
            _ => HedgeLevel::Moderate,
        }
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Tunable confidence parameters with spec defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfidenceParams {
    /// Base confidence for explicitly stated facts
    pub base_explicit: f64,
    /// Base confidence for behaviorally observed facts
    pub base_observational: f64,
    /// Base confidence for inferred facts
    pub base_inferential: f64,
    /// Base confidence for reflectively derived facts
    pub base_reflective: f64,

    /// Hedge multipliers
    pub hedge_none: f64,
    pub hedge_mild: f64,
    pub hedge_moderate: f64,
    pub hedge_strong: f64,

    /// Reinforcement boost factor
    pub reinforcement_boost: f64,
    /// Hard ceiling on confidence (C_max)
    pub max_confidence: f64,
    /// Below this, edges are archived by the decay cycle
    pub archive_threshold: f64,
    /// Below this, proposed facts are skipped entirely
    pub min_storage: f64,
    /// A contradicting fact must beat the old one by this much to revise
    pub contradiction_margin: f64,

    /// Days since last reinforcement before decay starts
    pub grace_days: i64,
    /// Per-month decay rates by temporal type
    pub decay_trait: f64,
    pub decay_state: f64,
    pub decay_wish: f64,
    pub decay_episode: f64,
    /// Extra protection multiplier for trait decay (0 = none, 1 = frozen)
    pub trait_decay_protection: f64,
}

impl Default for ConfidenceParams {
    fn default() -> Self {
        Self {
            base_explicit: 0.90,
            base_observational: 0.65,
            base_inferential: 0.45,
            base_reflective: 0.50,
            hedge_none: 1.00,
            hedge_mild: 0.90,
            hedge_moderate: 0.65,
            hedge_strong: 0.50,
            reinforcement_boost: 0.08,
            max_confidence: 0.98,
            archive_threshold: 0.15,
            min_storage: 0.25,
            contradiction_margin: 0.10,
            grace_days: 30,
            decay_trait: 0.02,
            decay_state: 0.08,
            decay_wish: 0.12,
            decay_episode: 0.25,
            trait_decay_protection: 0.5,
        }
    }
}

impl ConfidenceParams {
    /// Base confidence for a provenance mechanism
    pub fn base(&self, mechanism: Provenance) -> f64 {
        match mechanism {
            Provenance::Explicit => self.base_explicit,
            Provenance::Observational => self.base_observational,
            Provenance::Inferential => self.base_inferential,
            Provenance::Reflective => self.base_reflective,
            // Corrections are authoritative: user said so.
            Provenance::UserCorrection => self.base_explicit,
        }
    }

    /// Multiplier for a hedge level
    pub fn hedge_multiplier(&self, hedge: HedgeLevel) -> f64 {
        match hedge {
            HedgeLevel::None => self.hedge_none,
            HedgeLevel::Mild => self.hedge_mild,
            HedgeLevel::Moderate => self.hedge_moderate,
            HedgeLevel::Strong => self.hedge_strong,
        }
    }

    /// Default per-month decay rate for a temporal type
    pub fn decay_rate(&self, temporal: TemporalType) -> f64 {
        match temporal {
            TemporalType::Trait => self.decay_trait * (1.0 - self.trait_decay_protection),
            TemporalType::State => self.decay_state,
            TemporalType::Wish => self.decay_wish,
            TemporalType::Episode => self.decay_episode,
        }
    }
}

// ============================================================================
// CORE FUNCTIONS
// ============================================================================

/// Days per month used for decay arithmetic
const DAYS_PER_MONTH: f64 = 30.0;

/// Clamp a confidence value to [0, C_max]
pub fn clamp(params: &ConfidenceParams, value: f64) -> f64 {
    value.clamp(0.0, params.max_confidence)
}

/// Initial confidence for a newly extracted fact.
///
/// `sentiment_magnitude` nudges the score up slightly for emotionally
/// charged statements; a neutral utterance scores exactly base * hedge.
pub fn initial(
    params: &ConfidenceParams,
    mechanism: Provenance,
    hedge: HedgeLevel,
    sentiment_magnitude: f64,
) -> f64 {
    let base = params.base(mechanism);
    let factor = sentiment_factor(sentiment_magnitude);
    clamp(params, base * params.hedge_multiplier(hedge) * factor)
}

/// Sentiment strength factor: 1.0 for neutral statements, up to a 5%
/// boost for maximally charged ones.
pub fn sentiment_factor(magnitude: f64) -> f64 {
    1.0 + magnitude.clamp(0.0, 1.0) * 0.05
}

/// Reinforce an existing confidence: asymptotic approach toward C_max.
pub fn reinforce(params: &ConfidenceParams, current: f64) -> f64 {
    clamp(params, current + params.reinforcement_boost * (1.0 - current))
}

/// Decay a confidence given elapsed time since last reinforcement.
///
/// No decay is applied within the grace period; beyond it, confidence
/// shrinks multiplicatively per month at the edge's rate (traits are
/// additionally protected via `decay_rate`).
pub fn decay(params: &ConfidenceParams, current: f64, rate_per_month: f64, elapsed_days: i64) -> f64 {
    let beyond_grace = (elapsed_days - params.grace_days).max(0) as f64;
    if beyond_grace <= 0.0 {
        return current;
    }
    let months = beyond_grace / DAYS_PER_MONTH;
    clamp(params, current * (1.0 - rate_per_month * months))
}

/// Whether a new contradicting fact is confident enough to supersede the
/// old one. The epsilon keeps exact-margin cases (0.80 vs 0.90) from
/// flapping on float rounding.
pub fn supersedes(params: &ConfidenceParams, old: f64, new: f64) -> bool {
    new + 1e-9 >= old + params.contradiction_margin
}

/// Whether a decayed confidence should archive the edge.
pub fn should_archive(params: &ConfidenceParams, current: f64) -> bool {
    current < params.archive_threshold
}

/// Whether a proposed fact is worth storing at all.
pub fn meets_storage_floor(params: &ConfidenceParams, confidence: f64) -> bool {
    confidence >= params.min_storage
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConfidenceParams {
        ConfidenceParams::default()
    }

    #[test]
    fn test_initial_explicit_unhedged_neutral() {
        let c = initial(&params(), Provenance::Explicit, HedgeLevel::None, 0.0);
        assert!((c - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_initial_hedge_multipliers() {
        let p = params();
        let mild = initial(&p, Provenance::Explicit, HedgeLevel::Mild, 0.0);
        let strong = initial(&p, Provenance::Explicit, HedgeLevel::Strong, 0.0);
        assert!((mild - 0.81).abs() < 1e-9);
        assert!((strong - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_initial_observational_base() {
        let c = initial(&params(), Provenance::Observational, HedgeLevel::None, 0.0);
        assert!((c - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_reinforce_formula() {
        // 0.90 + 0.08 * (1 - 0.90) = 0.908
        let c = reinforce(&params(), 0.90);
        assert!((c - 0.908).abs() < 1e-9);
    }

    #[test]
    fn test_reinforce_caps_at_max() {
        let p = params();
        let mut c = 0.95;
        for _ in 0..100 {
            c = reinforce(&p, c);
        }
        assert!(c <= p.max_confidence);
        assert!(c > 0.97);
    }

    #[test]
    fn test_decay_within_grace_is_noop() {
        let c = decay(&params(), 0.80, 0.08, 20);
        assert!((c - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_decay_shrinks_beyond_grace() {
        let p = params();
        // 6 months elapsed, 30-day grace leaves 5 months of decay at 0.15/mo:
        // 0.30 * (1 - 0.75) = 0.075, below the archive threshold
        let c = decay(&p, 0.30, 0.15, 6 * 30);
        assert!((c - 0.075).abs() < 1e-9);
        assert!(should_archive(&p, c));
    }

    #[test]
    fn test_decay_never_goes_negative() {
        let c = decay(&params(), 0.30, 0.5, 365 * 3);
        assert_eq!(c, 0.0);
    }

    #[test]
    fn test_trait_decay_is_protected() {
        let p = params();
        assert!(p.decay_rate(TemporalType::Trait) < p.decay_rate(TemporalType::State));
        assert!(p.decay_rate(TemporalType::Episode) > p.decay_rate(TemporalType::Wish));
    }

    #[test]
    fn test_supersedes_requires_margin() {
        let p = params();
        assert!(supersedes(&p, 0.80, 0.90));
        assert!(supersedes(&p, 0.80, 0.95));
        assert!(!supersedes(&p, 0.80, 0.85));
        assert!(!supersedes(&p, 0.80, 0.89));
    }

    #[test]
    fn test_storage_floor() {
        let p = params();
        assert!(!meets_storage_floor(&p, 0.20));
        assert!(meets_storage_floor(&p, 0.25));
    }

    #[test]
    fn test_clamp_respects_c_max() {
        let p = params();
        assert_eq!(clamp(&p, 1.5), p.max_confidence);
        assert_eq!(clamp(&p, -0.5), 0.0);
    }

    #[test]
    fn test_hedge_parse_defaults_to_moderate() {
        assert_eq!(HedgeLevel::parse_name("kinda"), HedgeLevel::Moderate);
        assert_eq!(HedgeLevel::parse_name("strong"), HedgeLevel::Strong);
    }
}
