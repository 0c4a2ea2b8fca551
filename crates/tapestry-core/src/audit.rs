//! Audit log types — append-only record of every mutation and decision.
//!
//! Records are written by the store inside the same transaction as the
//! mutation they describe, keyed by a monotonic sequence number. Deletion
//! records carry metadata only, never the deleted payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// OPERATIONS
// ============================================================================

/// The mutation class an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Insert,
    Reinforce,
    Contradict,
    Revise,
    Delete,
    Archive,
    Retract,
    Skip,
    Deliver,
    Generate,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Reinforce => "REINFORCE",
            Operation::Contradict => "CONTRADICT",
            Operation::Revise => "REVISE",
            Operation::Delete => "DELETE",
            Operation::Archive => "ARCHIVE",
            Operation::Retract => "RETRACT",
            Operation::Skip => "SKIP",
            Operation::Deliver => "DELIVER",
            Operation::Generate => "GENERATE",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Operation::Insert),
            "REINFORCE" => Some(Operation::Reinforce),
            "CONTRADICT" => Some(Operation::Contradict),
            "REVISE" => Some(Operation::Revise),
            "DELETE" => Some(Operation::Delete),
            "ARCHIVE" => Some(Operation::Archive),
            "RETRACT" => Some(Operation::Retract),
            "SKIP" => Some(Operation::Skip),
            "DELIVER" => Some(Operation::Deliver),
            "GENERATE" => Some(Operation::Generate),
            _ => None,
        }
    }
}

// ============================================================================
// EVENT KINDS
// ============================================================================

/// What happened. Closed set; new kinds are additions, never renames,
/// because old audit rows must stay parseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    NodeCreated,
    NodeMerged,
    NodeUpdated,
    NodeDeleted,
    EdgeInserted,
    EdgeReinforced,
    EdgeContradicted,
    EdgeRevised,
    EdgeArchived,
    EdgeRetracted,
    EdgeDeleted,
    EdgeMerged,
    EdgeDecayed,
    EpisodeRecorded,
    ExtractionSkipped,
    HallucinationDetected,
    ExtractionFailed,
    CorrectionApplied,
    ProbeGenerated,
    ProbeDelivered,
    ProbeObsoleted,
    ProbeCooldown,
    StarterGenerated,
    StarterDelivered,
    InferenceProposed,
    RevisionVerified,
    ExperiencePromoted,
    EventDeadLettered,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::NodeCreated => "node_created",
            AuditKind::NodeMerged => "node_merged",
            AuditKind::NodeUpdated => "node_updated",
            AuditKind::NodeDeleted => "node_deleted",
            AuditKind::EdgeInserted => "edge_inserted",
            AuditKind::EdgeReinforced => "edge_reinforced",
            AuditKind::EdgeContradicted => "edge_contradicted",
            AuditKind::EdgeRevised => "edge_revised",
            AuditKind::EdgeArchived => "edge_archived",
            AuditKind::EdgeRetracted => "edge_retracted",
            AuditKind::EdgeDeleted => "edge_deleted",
            AuditKind::EdgeMerged => "edge_merged",
            AuditKind::EdgeDecayed => "edge_decayed",
            AuditKind::EpisodeRecorded => "episode_recorded",
            AuditKind::ExtractionSkipped => "extraction_skipped",
            AuditKind::HallucinationDetected => "hallucination_detected",
            AuditKind::ExtractionFailed => "extraction_failed",
            AuditKind::CorrectionApplied => "correction_applied",
            AuditKind::ProbeGenerated => "probe_generated",
            AuditKind::ProbeDelivered => "probe_delivered",
            AuditKind::ProbeObsoleted => "probe_obsoleted",
            AuditKind::ProbeCooldown => "probe_cooldown",
            AuditKind::StarterGenerated => "starter_generated",
            AuditKind::StarterDelivered => "starter_delivered",
            AuditKind::InferenceProposed => "inference_proposed",
            AuditKind::RevisionVerified => "revision_verified",
            AuditKind::ExperiencePromoted => "experience_promoted",
            AuditKind::EventDeadLettered => "event_dead_lettered",
        }
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One appended audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Monotonic sequence number (SQLite rowid)
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    /// Threads one interaction through every record it produces
    pub correlation_id: String,
    pub kind: String,
    pub component: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Decision reasoning, present on proactive records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Builder-style input for a new audit entry (seq/timestamp assigned on write)
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub kind: &'static str,
    pub component: &'static str,
    pub operation: &'static str,
    pub node_id: Option<String>,
    pub edge_id: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub confidence_before: Option<f64>,
    pub confidence_after: Option<f64>,
    pub mechanism: Option<String>,
    pub session_id: Option<String>,
    pub reasoning: Option<String>,
}

impl AuditEntry {
    pub fn new(
        correlation_id: impl Into<String>,
        kind: AuditKind,
        component: &'static str,
        operation: Operation,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: kind.as_str(),
            component,
            operation: operation.as_str(),
            ..Default::default()
        }
    }

    pub fn edge(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    pub fn confidence(mut self, before: Option<f64>, after: Option<f64>) -> Self {
        self.confidence_before = before;
        self.confidence_after = after;
        self
    }

    pub fn mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.mechanism = Some(mechanism.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
