//! Edge types — typed, directed, confidence-weighted relations.
//!
//! Edges carry the full confidence lifecycle state: temporal scope, decay
//! rate, reinforcement timestamps, provenance, and the retracted/archived
//! flags that remove them from query results while preserving audit
//! history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// TEMPORAL TYPES
// ============================================================================

/// Temporal scope of a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemporalType {
    /// Near-permanent fact ("is married to")
    Trait,
    /// Time-bounded fact ("works at")
    #[default]
    State,
    /// Desire with an expiry ("wants to visit Tokyo")
    Wish,
    /// One-time event ("visited the doctor")
    Episode,
}

impl TemporalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalType::Trait => "trait",
            TemporalType::State => "state",
            TemporalType::Wish => "wish",
            TemporalType::Episode => "episode",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trait" => TemporalType::Trait,
            "state" => TemporalType::State,
            "wish" => TemporalType::Wish,
            "episode" => TemporalType::Episode,
            _ => TemporalType::State,
        }
    }
}

impl std::fmt::Display for TemporalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// PROVENANCE
// ============================================================================

/// How a fact entered the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Directly stated by the user
    #[default]
    Explicit,
    /// Observed from behavior rather than stated
    Observational,
    /// Hypothesized by the inference cycle
    Inferential,
    /// Derived by episode clustering
    Reflective,
    /// Authored by an explicit user correction
    UserCorrection,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Explicit => "explicit",
            Provenance::Observational => "observational",
            Provenance::Inferential => "inferential",
            Provenance::Reflective => "reflective",
            Provenance::UserCorrection => "user_correction",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "explicit" => Provenance::Explicit,
            "observational" => Provenance::Observational,
            "inferential" => Provenance::Inferential,
            "reflective" => Provenance::Reflective,
            "user_correction" => Provenance::UserCorrection,
            _ => Provenance::Explicit,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EDGE
// ============================================================================

/// A directed, typed, confidence-weighted edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Source node id
    pub source_id: String,
    /// Target node id
    pub target_id: String,
    /// Relation type (open string from a curated vocabulary)
    pub relation: String,
    /// Belief that this edge is currently true, in [0, C_max]
    pub confidence: f64,
    /// Temporal scope
    pub temporal_type: TemporalType,
    /// When the fact was first observed
    pub first_observed: DateTime<Utc>,
    /// When the fact was last reinforced
    pub last_reinforced: DateTime<Utc>,
    /// Confidence decay per month while unreinforced
    pub decay_rate: f64,
    /// Context tags scoping relevance
    pub context_tags: Vec<String>,
    /// Episodes that contributed this edge
    pub episode_ids: Vec<String>,
    /// How the fact entered the graph
    pub provenance: Provenance,
    /// Optional expiry for bounded facts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// Whether the edge was retracted (superseded or by user)
    #[serde(default)]
    pub retracted: bool,
    /// Why the edge was retracted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retraction_reason: Option<String>,
    /// Whether decay pushed the edge below the archival threshold
    #[serde(default)]
    pub archived: bool,
    /// Edge id this edge refines (MERGE linkage)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refines: Option<String>,
    /// Attributed to someone other than the speaker ("John thinks …")
    #[serde(default)]
    pub secondhand: bool,
    /// Came from a hypothetical or counterfactual statement
    #[serde(default)]
    pub hypothetical: bool,
    /// Subject binding was uncertain during extraction
    #[serde(default)]
    pub attribution_uncertain: bool,
}

impl Edge {
    /// An edge is active when it is neither retracted, archived, nor expired.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.retracted || self.archived {
            return false;
        }
        self.expiry.map(|e| now <= e).unwrap_or(true)
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

/// Input for creating a new edge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeInput {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub confidence: f64,
    #[serde(default)]
    pub temporal_type: TemporalType,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub context_tags: Vec<String>,
    /// Episode the edge came from. Absent only for user corrections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refines: Option<String>,
    #[serde(default)]
    pub secondhand: bool,
    #[serde(default)]
    pub hypothetical: bool,
    #[serde(default)]
    pub attribution_uncertain: bool,
}

impl EdgeInput {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation: relation.into(),
            confidence,
            temporal_type: TemporalType::default(),
            provenance: Provenance::default(),
            context_tags: vec![],
            episode_id: None,
            expiry: None,
            refines: None,
            secondhand: false,
            hypothetical: false,
            attribution_uncertain: false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_edge() -> Edge {
        let now = Utc::now();
        Edge {
            id: "e1".to_string(),
            source_id: "a".to_string(),
            target_id: "b".to_string(),
            relation: "likes".to_string(),
            confidence: 0.9,
            temporal_type: TemporalType::Trait,
            first_observed: now,
            last_reinforced: now,
            decay_rate: 0.02,
            context_tags: vec![],
            episode_ids: vec!["ep1".to_string()],
            provenance: Provenance::Explicit,
            expiry: None,
            retracted: false,
            retraction_reason: None,
            archived: false,
            refines: None,
            secondhand: false,
            hypothetical: false,
            attribution_uncertain: false,
        }
    }

    #[test]
    fn test_temporal_type_roundtrip() {
        for t in [
            TemporalType::Trait,
            TemporalType::State,
            TemporalType::Wish,
            TemporalType::Episode,
        ] {
            assert_eq!(TemporalType::parse_name(t.as_str()), t);
        }
        assert_eq!(TemporalType::parse_name("whatever"), TemporalType::State);
    }

    #[test]
    fn test_provenance_roundtrip() {
        for p in [
            Provenance::Explicit,
            Provenance::Observational,
            Provenance::Inferential,
            Provenance::Reflective,
            Provenance::UserCorrection,
        ] {
            assert_eq!(Provenance::parse_name(p.as_str()), p);
        }
    }

    #[test]
    fn test_edge_active_flags() {
        let now = Utc::now();
        let mut edge = sample_edge();
        assert!(edge.is_active_at(now));

        edge.retracted = true;
        assert!(!edge.is_active_at(now));

        edge.retracted = false;
        edge.archived = true;
        assert!(!edge.is_active_at(now));
    }

    #[test]
    fn test_edge_expiry() {
        let now = Utc::now();
        let mut edge = sample_edge();
        edge.expiry = Some(now + Duration::days(1));
        assert!(edge.is_active_at(now));

        edge.expiry = Some(now - Duration::hours(1));
        assert!(!edge.is_active_at(now));
    }
}
