//! Node types — entities in the knowledge graph.
//!
//! Each node carries a kind from a closed set, a canonical name, a set of
//! case-folded aliases, a small typed property bag, and a privacy level.
//! Two nodes of the same kind with overlapping aliases are the same
//! entity; the store keeps one representative per equivalence class.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// NODE KINDS
// ============================================================================

/// Kinds of graph nodes
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A person known to the user (or the user themselves)
    Person,
    /// A company, team, or institution
    Organization,
    /// A geographic place
    Place,
    /// A tool or technology
    Tool,
    /// An abstract concept
    #[default]
    Concept,
    /// A single interaction record
    Episode,
    /// A generalization derived from clustered episodes
    Experience,
    /// How-to knowledge
    Procedure,
    /// A standalone preference object
    Preference,
    /// A conversational context marker
    Context,
}

impl NodeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Person => "person",
            NodeKind::Organization => "organization",
            NodeKind::Place => "place",
            NodeKind::Tool => "tool",
            NodeKind::Concept => "concept",
            NodeKind::Episode => "episode",
            NodeKind::Experience => "experience",
            NodeKind::Procedure => "procedure",
            NodeKind::Preference => "preference",
            NodeKind::Context => "context",
        }
    }

    /// Parse from string name. Unknown kinds fall back to `Concept`,
    /// which is the safest bucket for LLM-labelled entities.
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" => NodeKind::Person,
            "organization" => NodeKind::Organization,
            "place" => NodeKind::Place,
            "tool" => NodeKind::Tool,
            "concept" => NodeKind::Concept,
            "episode" => NodeKind::Episode,
            "experience" => NodeKind::Experience,
            "procedure" => NodeKind::Procedure,
            "preference" => NodeKind::Preference,
            "context" => NodeKind::Context,
            _ => NodeKind::Concept,
        }
    }

    /// Whether nodes of this kind participate in the inference cycle.
    pub fn participates_in_inference(&self) -> bool {
        !matches!(self, NodeKind::Episode | NodeKind::Context)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// PRIVACY LEVELS
// ============================================================================

/// Privacy level of a node. Levels are ordered and monotonically sticky:
/// a derivation may raise a node's level, never lower it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    /// L0 — public knowledge
    Public,
    /// L1 — platform-visible
    Platform,
    /// L2 — personal
    #[default]
    Personal,
    /// L3 — private
    Private,
    /// L4 — sealed, never leaves the store through public query paths
    Sealed,
}

impl PrivacyLevel {
    pub fn as_level(&self) -> u8 {
        match self {
            PrivacyLevel::Public => 0,
            PrivacyLevel::Platform => 1,
            PrivacyLevel::Personal => 2,
            PrivacyLevel::Private => 3,
            PrivacyLevel::Sealed => 4,
        }
    }

    pub fn from_level(level: u8) -> Self {
        match level {
            0 => PrivacyLevel::Public,
            1 => PrivacyLevel::Platform,
            2 => PrivacyLevel::Personal,
            3 => PrivacyLevel::Private,
            _ => PrivacyLevel::Sealed,
        }
    }
}

// ============================================================================
// CASE FOLDING
// ============================================================================

/// Case-fold a name for alias comparison. Aliases are a function over the
/// folded form: one representative node per (kind, folded alias).
pub fn fold_name(name: &str) -> String {
    name.trim().to_lowercase()
}

// ============================================================================
// NODE
// ============================================================================

/// A node in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Node kind
    pub kind: NodeKind,
    /// Canonical display name
    pub name: String,
    /// Case-folded aliases (includes the folded canonical name)
    pub aliases: Vec<String>,
    /// Property bag, typed by kind
    pub properties: serde_json::Value,
    /// Privacy level
    pub privacy: PrivacyLevel,
    /// When the node was created
    pub created_at: DateTime<Utc>,
    /// When any edge touching this node was last reinforced
    pub last_reinforced: DateTime<Utc>,
}

impl Node {
    /// Whether the given name matches this node's canonical name or any alias.
    pub fn matches_name(&self, name: &str) -> bool {
        let folded = fold_name(name);
        fold_name(&self.name) == folded || self.aliases.iter().any(|a| *a == folded)
    }
}

/// Input for creating or merging a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeInput {
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_properties")]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub privacy: PrivacyLevel,
}

fn default_properties() -> serde_json::Value {
    serde_json::json!({})
}

impl NodeInput {
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            aliases: vec![],
            properties: serde_json::json!({}),
            privacy: PrivacyLevel::default(),
        }
    }

    /// All folded aliases for this input, canonical name included.
    pub fn folded_aliases(&self) -> Vec<String> {
        let mut folded: Vec<String> = std::iter::once(fold_name(&self.name))
            .chain(self.aliases.iter().map(|a| fold_name(a)))
            .filter(|a| !a.is_empty())
            .collect();
        folded.sort();
        folded.dedup();
        folded
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_roundtrip() {
        for kind in [
            NodeKind::Person,
            NodeKind::Organization,
            NodeKind::Place,
            NodeKind::Tool,
            NodeKind::Concept,
            NodeKind::Episode,
            NodeKind::Experience,
            NodeKind::Procedure,
            NodeKind::Preference,
            NodeKind::Context,
        ] {
            assert_eq!(NodeKind::parse_name(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_unknown_kind_falls_back_to_concept() {
        assert_eq!(NodeKind::parse_name("gadget"), NodeKind::Concept);
    }

    #[test]
    fn test_privacy_ordering() {
        assert!(PrivacyLevel::Public < PrivacyLevel::Sealed);
        assert!(PrivacyLevel::Personal < PrivacyLevel::Private);
        assert_eq!(PrivacyLevel::from_level(PrivacyLevel::Private.as_level()), PrivacyLevel::Private);
    }

    #[test]
    fn test_folded_aliases_dedup() {
        let input = NodeInput {
            kind: NodeKind::Person,
            name: "Lena".to_string(),
            aliases: vec!["lena".to_string(), "Lena K".to_string()],
            properties: serde_json::json!({}),
            privacy: PrivacyLevel::Personal,
        };
        let folded = input.folded_aliases();
        assert_eq!(folded, vec!["lena".to_string(), "lena k".to_string()]);
    }

    #[test]
    fn test_matches_name_is_case_insensitive() {
        let node = Node {
            id: "n1".to_string(),
            kind: NodeKind::Person,
            name: "Lena".to_string(),
            aliases: vec!["lena".to_string(), "lena k".to_string()],
            properties: serde_json::json!({}),
            privacy: PrivacyLevel::Personal,
            created_at: Utc::now(),
            last_reinforced: Utc::now(),
        };
        assert!(node.matches_name("LENA"));
        assert!(node.matches_name("Lena K"));
        assert!(!node.matches_name("Boris"));
    }
}
