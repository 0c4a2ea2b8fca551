//! Graph diff engine — classifies each prepared fact before it touches
//! the store.
//!
//! The extraction pipeline produces a `PreparedDelta` of proposed
//! operations; the store applies it atomically, consulting `classify`
//! for every proposed edge. Classification is deterministic and pure so
//! that reprocessing the same delta yields the same decisions.

use serde::{Deserialize, Serialize};

use crate::confidence::{self, ConfidenceParams};
use crate::graph::{Edge, EdgeInput, NodeInput, Provenance, TemporalType};

// ============================================================================
// PROPOSED OPERATIONS
// ============================================================================

/// A node the pipeline wants to exist (upserted by alias equivalence)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedNode {
    pub input: NodeInput,
}

/// An edge the pipeline wants to assert, endpoints by name. Name
/// resolution to node ids happens inside the store transaction so the
/// decision sees a consistent graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedEdge {
    pub source_name: String,
    pub target_name: String,
    pub relation: String,
    pub confidence: f64,
    #[serde(default)]
    pub temporal_type: TemporalType,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default)]
    pub context_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<chrono::DateTime<chrono::Utc>>,
    /// Set when this fact refines a more general one
    /// ("prefers Malbec" refining "likes wine")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refines: Option<RefinesHint>,
    #[serde(default)]
    pub secondhand: bool,
    #[serde(default)]
    pub hypothetical: bool,
    #[serde(default)]
    pub attribution_uncertain: bool,
}

/// Pointer to the general fact a refinement extends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefinesHint {
    pub relation: String,
    pub target_name: String,
}

/// A retraction request ("forget what I said about …")
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedRetraction {
    pub source_name: String,
    /// Restrict to a specific relation when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    /// Restrict to a specific target when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub reason: String,
}

/// Everything the pipeline extracted from one interaction, ready for the
/// store to apply atomically.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDelta {
    /// Correlation id threading the interaction through audit records
    pub correlation_id: String,
    pub session_id: String,
    pub turn_number: u32,
    pub channel: String,
    /// Pre-assigned episode id (stable across reprocessing)
    pub episode_id: String,
    /// Utterance-level sentiment for the episode record
    pub sentiment: f64,
    pub nodes: Vec<ProposedNode>,
    pub edges: Vec<ProposedEdge>,
    pub retractions: Vec<ProposedRetraction>,
    /// Diagnostic tags accumulated by pipeline stages
    pub tags: Vec<String>,
    /// True when the pipeline decided there is nothing to store
    pub skipped: bool,
    /// Why the pipeline skipped, when it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl PreparedDelta {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.retractions.is_empty()
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Relations where a subject can only hold one value at a time. A new
/// object for the same (source, relation) contradicts the old one.
const SINGLE_VALUED_RELATIONS: &[&str] = &[
    "married_to",
    "age",
    "named",
    "lives_in",
    "works_at",
    "born_in",
    "birthday",
    "employed_by",
];

pub fn is_single_valued(relation: &str) -> bool {
    SINGLE_VALUED_RELATIONS.contains(&relation)
}

/// The decision for one proposed edge
#[derive(Debug, Clone, PartialEq)]
pub enum DiffAction {
    /// No matching edge: create it
    Insert,
    /// Matching consistent edge: boost its confidence
    Reinforce { edge_id: String, new_confidence: f64 },
    /// Conflicting value, new fact is confident enough: retract + replace
    Revise { old_edge_id: String },
    /// Conflicting value, margin not met: keep the old fact, ask the user
    ContradictBelowMargin { old_edge_id: String },
    /// Nothing to do
    Skip { reason: SkipReason },
    /// Refinement of a general fact: insert linked to it
    Merge { general_edge_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BelowStorageFloor,
    AlreadyLinkedToEpisode,
    SelfLoop,
}

/// Classify one proposed edge against the current graph state.
///
/// - `exact_match`: the active edge with the same (source, target,
///   relation), if any.
/// - `relation_siblings`: active edges with the same (source, relation)
///   but a *different* target — contradiction candidates.
/// - `general_edge`: the active edge matching the refinement hint, if
///   the proposal carries one.
pub fn classify(
    params: &ConfidenceParams,
    proposed: &ProposedEdge,
    episode_id: &str,
    exact_match: Option<&Edge>,
    relation_siblings: &[Edge],
    general_edge: Option<&Edge>,
) -> DiffAction {
    if proposed.source_name.trim().is_empty()
        || crate::graph::fold_name(&proposed.source_name)
            == crate::graph::fold_name(&proposed.target_name)
    {
        return DiffAction::Skip { reason: SkipReason::SelfLoop };
    }

    if !confidence::meets_storage_floor(params, proposed.confidence) {
        return DiffAction::Skip { reason: SkipReason::BelowStorageFloor };
    }

    if let Some(existing) = exact_match {
        // Reprocessing guard: a second application of the same episode
        // must not double-reinforce.
        if existing.episode_ids.iter().any(|e| e == episode_id) {
            return DiffAction::Skip { reason: SkipReason::AlreadyLinkedToEpisode };
        }
        return DiffAction::Reinforce {
            edge_id: existing.id.clone(),
            new_confidence: confidence::reinforce(params, existing.confidence),
        };
    }

    if is_single_valued(&proposed.relation) {
        if let Some(conflicting) = relation_siblings
            .iter()
            .filter(|e| e.relation == proposed.relation)
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        {
            if confidence::supersedes(params, conflicting.confidence, proposed.confidence) {
                return DiffAction::Revise { old_edge_id: conflicting.id.clone() };
            }
            return DiffAction::ContradictBelowMargin { old_edge_id: conflicting.id.clone() };
        }
    }

    if proposed.refines.is_some() {
        if let Some(general) = general_edge {
            return DiffAction::Merge { general_edge_id: general.id.clone() };
        }
        // Hint pointed at a fact we don't have: a plain insert is fine.
    }

    DiffAction::Insert
}

/// Build the `EdgeInput` a classified proposal turns into.
pub fn to_edge_input(
    proposed: &ProposedEdge,
    source_id: String,
    target_id: String,
    episode_id: &str,
    refines_edge_id: Option<String>,
) -> EdgeInput {
    EdgeInput {
        source_id,
        target_id,
        relation: proposed.relation.clone(),
        confidence: proposed.confidence,
        temporal_type: proposed.temporal_type,
        provenance: proposed.provenance,
        context_tags: proposed.context_tags.clone(),
        episode_id: Some(episode_id.to_string()),
        expiry: proposed.expiry,
        refines: refines_edge_id,
        secondhand: proposed.secondhand,
        hypothetical: proposed.hypothetical,
        attribution_uncertain: proposed.attribution_uncertain,
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// A probe the diff engine wants the proactive layer to enqueue
/// (contradiction below margin → "has this changed?")
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub edge_id: String,
    pub source_name: String,
    pub relation: String,
    pub old_value: String,
    pub new_value: String,
    pub context_tags: Vec<String>,
}

/// Counts and follow-ups from applying one delta
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOutcome {
    pub episode_id: String,
    pub nodes_created: usize,
    pub nodes_merged: usize,
    pub inserted: usize,
    pub reinforced: usize,
    pub revised: usize,
    pub merged: usize,
    pub skipped: usize,
    pub retracted: usize,
    /// True when the idempotency key had already been committed
    pub already_processed: bool,
    /// Contradictions below the revision margin, for probe generation
    #[serde(skip)]
    pub verification_requests: Vec<VerificationRequest>,
}

impl DeltaOutcome {
    pub fn mutation_count(&self) -> usize {
        self.inserted + self.reinforced + self.revised + self.merged + self.retracted
    }
}

// ============================================================================
// TESTS
// ============================================================================
