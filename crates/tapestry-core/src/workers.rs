//! Background workers — scheduled maintenance cycles.
//!
//! Decay, public-fact revision, cross-context inference, and episode
//! clustering all mutate the graph through the same store operations as
//! the online path, so their changes show up on the event bus and in the
//! audit log identically. Worker failures never reach the agent; they
//! land in logs and metrics.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::confidence::{self, ConfidenceParams};
use crate::events::{EventBus, GraphEvent};
use crate::extraction::{repair_llm_json, LlmCapability};
use crate::graph::{EdgeInput, Episode, NodeInput, NodeKind, PrivacyLevel, Provenance};
use crate::store::{EdgeFilter, GraphStore, Result};

// ============================================================================
// SCHEDULES
// ============================================================================

/// Worker cycle schedules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSchedules {
    pub decay_enabled: bool,
    /// Weekly by default
    pub decay_interval_hours: u64,
    pub revision_enabled: bool,
    /// Nightly by default
    pub revision_interval_hours: u64,
    /// Edges verified per revision cycle
    pub revision_budget: usize,
    /// Days before a public fact is due for re-verification
    pub revision_ttl_days: i64,
    pub inference_enabled: bool,
    pub inference_interval_hours: u64,
    /// Candidate edges per inference cycle
    pub inference_cap: usize,
    pub clustering_enabled: bool,
    pub clustering_interval_hours: u64,
    /// Distinct episodes before an edge is promoted to an experience
    pub clustering_min_episodes: usize,
}

impl Default for WorkerSchedules {
    fn default() -> Self {
        Self {
            decay_enabled: true,
            decay_interval_hours: 24 * 7,
            revision_enabled: true,
            revision_interval_hours: 24,
            revision_budget: 20,
            revision_ttl_days: 30,
            inference_enabled: true,
            inference_interval_hours: 24,
            inference_cap: 5,
            clustering_enabled: true,
            clustering_interval_hours: 24 * 7,
            clustering_min_episodes: 3,
        }
    }
}

// ============================================================================
// FACT VERIFIER CAPABILITY
// ============================================================================

/// Verdict from the external verifier
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Unchanged,
    Changed { new_value: String },
    Unknown,
}

/// External verification capability for public facts
#[async_trait]
pub trait FactVerifier: Send + Sync {
    async fn verify(&self, statement: &str) -> std::result::Result<Verdict, String>;
}

/// Default verifier: knows nothing, so the revision cycle skips.
pub struct NoopVerifier;

#[async_trait]
impl FactVerifier for NoopVerifier {
    async fn verify(&self, _statement: &str) -> std::result::Result<Verdict, String> {
        Ok(Verdict::Unknown)
    }
}

// ============================================================================
// CYCLE REPORTS
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayReport {
    pub examined: usize,
    pub decayed: usize,
    pub archived: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionReport {
    pub sampled: usize,
    pub reinforced: usize,
    pub revised: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceReport {
    pub patterns_walked: usize,
    pub candidates: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringReport {
    pub edges_examined: usize,
    pub experiences_promoted: usize,
}

// ============================================================================
// DECAY CYCLE
// ============================================================================

/// Recompute every active edge's confidence from elapsed time; archive
/// those below the threshold.
pub fn decay_cycle(
    store: &GraphStore,
    bus: &EventBus,
    params: &ConfidenceParams,
) -> Result<DecayReport> {
    let correlation = format!("decay-{}", Uuid::new_v4());
    let now = Utc::now();
    let edges = store.edges(&EdgeFilter::default())?;
    let mut report = DecayReport { examined: edges.len(), ..Default::default() };

    for edge in edges {
        let elapsed_days = (now - edge.last_reinforced).num_days();
        let new_confidence =
            confidence::decay(params, edge.confidence, edge.decay_rate, elapsed_days);
        if (new_confidence - edge.confidence).abs() < 1e-9 {
            continue;
        }
        if confidence::should_archive(params, new_confidence) {
            store.archive_edge(&edge.id, &correlation)?;
            bus.emit(GraphEvent::EdgeArchived { edge_id: edge.id });
            report.archived += 1;
        } else {
            let updated = store.decay_edge(&edge.id, new_confidence, &correlation)?;
            bus.emit(GraphEvent::EdgeUpdated { edge: updated });
            report.decayed += 1;
        }
    }

    info!(
        examined = report.examined,
        decayed = report.decayed,
        archived = report.archived,
        "decay cycle complete"
    );
    Ok(report)
}

// ============================================================================
// REVISION CYCLE
// ============================================================================

/// Re-verify stale public facts against the external verifier,
/// budget-bounded per cycle.
pub async fn revision_cycle(
    store: &GraphStore,
    bus: &EventBus,
    verifier: &dyn FactVerifier,
    params: &ConfidenceParams,
    schedules: &WorkerSchedules,
) -> Result<RevisionReport> {
    let correlation = format!("revision-{}", Uuid::new_v4());
    let cutoff = Utc::now() - Duration::days(schedules.revision_ttl_days);
    let edges = store.edges(&EdgeFilter::default())?;
    let mut report = RevisionReport::default();

    let episode = Episode {
        id: Uuid::new_v4().to_string(),
        occurred_at: Utc::now(),
        session_id: "revision".to_string(),
        turn_number: 0,
        channel: "worker".to_string(),
        sentiment: 0.0,
        outcome: 0.0,
        edge_ids: vec![],
    };
    let mut episode_created = false;

    for edge in edges {
        if report.sampled >= schedules.revision_budget {
            break;
        }
        if edge.last_reinforced > cutoff {
            continue;
        }
        // Only public knowledge gets verified externally.
        let source = store.get_node(&edge.source_id)?;
        let target = store.get_node(&edge.target_id)?;
        let (Some(source), Some(target)) = (source, target) else { continue };
        if source.privacy > PrivacyLevel::Platform || target.privacy > PrivacyLevel::Platform {
            continue;
        }
        report.sampled += 1;

        let statement = format!("{} {} {}", source.name, edge.relation, target.name);
        match verifier.verify(&statement).await {
            Ok(Verdict::Unchanged) => {
                if !episode_created {
                    store.create_episode(&episode)?;
                    episode_created = true;
                }
                let new_confidence = confidence::reinforce(params, edge.confidence);
                let updated =
                    store.reinforce_edge(&edge.id, new_confidence, &episode.id, &correlation)?;
                bus.emit(GraphEvent::EdgeUpdated { edge: updated });
                report.reinforced += 1;
            }
            Ok(Verdict::Changed { new_value }) => {
                if !episode_created {
                    store.create_episode(&episode)?;
                    episode_created = true;
                }
                let (new_target, _) = store.upsert_node(
                    &NodeInput::new(NodeKind::Concept, new_value.as_str()),
                    &correlation,
                )?;
                let mut replacement =
                    EdgeInput::new(edge.source_id.clone(), new_target.id, edge.relation.clone(), edge.confidence);
                replacement.temporal_type = edge.temporal_type;
                replacement.provenance = Provenance::Observational;
                replacement.context_tags = edge.context_tags.clone();
                replacement.episode_id = Some(episode.id.clone());
                let (old, new) = store.revise_edge(&edge.id, &replacement, params, &correlation)?;
                bus.emit(GraphEvent::EdgeRetracted {
                    edge_id: old.id,
                    reason: "superseded".to_string(),
                });
                bus.emit(GraphEvent::EdgeAdded { edge: new });
                report.revised += 1;
            }
            Ok(Verdict::Unknown) => {
                report.skipped += 1;
            }
            Err(e) => {
                warn!(error = %e, "verifier unavailable, skipping remainder of cycle");
                break;
            }
        }
    }

    info!(
        sampled = report.sampled,
        reinforced = report.reinforced,
        revised = report.revised,
        "revision cycle complete"
    );
    Ok(report)
}

// ============================================================================
// INFERENCE CYCLE
// ============================================================================

const INFERENCE_SYSTEM_PROMPT: &str = "\
You are a cautious relation inference engine for a personal knowledge graph. \
Given two connected facts (A relates to B, B relates to C), propose at most \
one plausible new relation between A and C, or none.

Only propose relations that follow with high plausibility. Respond with ONLY \
valid JSON:

{\"relations\": [{\"source\": \"A\", \"target\": \"C\", \"relation\": \"relation_type\"}]}

Return an empty relations array when nothing follows.";

/// Walk 2-hop patterns and ask the large LLM for candidate relations,
/// inserted at inferential base confidence and capped per cycle.
pub async fn inference_cycle(
    store: &GraphStore,
    bus: &EventBus,
    llm_large: &LlmCapability,
    params: &ConfidenceParams,
    schedules: &WorkerSchedules,
) -> Result<InferenceReport> {
    let correlation = format!("inference-{}", Uuid::new_v4());
    let edges = store.edges(&EdgeFilter::default())?;
    let mut report = InferenceReport::default();

    let episode = Episode {
        id: Uuid::new_v4().to_string(),
        occurred_at: Utc::now(),
        session_id: "inference".to_string(),
        turn_number: 0,
        channel: "worker".to_string(),
        sentiment: 0.0,
        outcome: 0.0,
        edge_ids: vec![],
    };
    let mut episode_created = false;

    'outer: for first in &edges {
        for second in &edges {
            if report.inserted >= schedules.inference_cap {
                break 'outer;
            }
            if first.target_id != second.source_id || first.source_id == second.target_id {
                continue;
            }
            report.patterns_walked += 1;

            let a = store.get_node(&first.source_id)?;
            let b = store.get_node(&first.target_id)?;
            let c = store.get_node(&second.target_id)?;
            let (Some(a), Some(b), Some(c)) = (a, b, c) else { continue };
            if !a.kind.participates_in_inference() || !c.kind.participates_in_inference() {
                continue;
            }
            // Skip when any relation already links A and C.
            if !store
                .edges(&EdgeFilter {
                    source_id: Some(&a.id),
                    target_id: Some(&c.id),
                    ..Default::default()
                })?
                .is_empty()
            {
                continue;
            }

            let user = format!(
                "Fact 1: {} {} {}\nFact 2: {} {} {}",
                a.name, first.relation, b.name, b.name, second.relation, c.name
            );
            let raw = match llm_large.complete(INFERENCE_SYSTEM_PROMPT, &user).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(error = %e, "inference LLM unavailable, ending cycle");
                    break 'outer;
                }
            };
            let Some(parsed) = repair_llm_json(&raw) else { continue };
            let Some(relations) = parsed.get("relations").and_then(|v| v.as_array()) else {
                continue;
            };

            for relation in relations.iter().take(1) {
                let Some(relation_type) = relation.get("relation").and_then(|v| v.as_str()) else {
                    continue;
                };
                report.candidates += 1;
                if !episode_created {
                    store.create_episode(&episode)?;
                    episode_created = true;
                }
                let mut input =
                    EdgeInput::new(a.id.clone(), c.id.clone(), relation_type, params.base_inferential);
                input.provenance = Provenance::Inferential;
                input.episode_id = Some(episode.id.clone());
                input.context_tags = first.context_tags.clone();
                match store.create_edge(&input, params, &correlation) {
                    Ok(edge) => {
                        bus.emit(GraphEvent::EdgeAdded { edge });
                        report.inserted += 1;
                    }
                    Err(e) => warn!(error = %e, "inferred edge rejected"),
                }
            }
        }
    }

    info!(
        patterns = report.patterns_walked,
        inserted = report.inserted,
        "inference cycle complete"
    );
    Ok(report)
}

// ============================================================================
// CLUSTERING CYCLE
// ============================================================================

/// Promote repeatedly reinforced edges to experience nodes with
/// back-links to their contributing episodes.
pub fn clustering_cycle(
    store: &GraphStore,
    bus: &EventBus,
    params: &ConfidenceParams,
    schedules: &WorkerSchedules,
) -> Result<ClusteringReport> {
    let correlation = format!("clustering-{}", Uuid::new_v4());
    let edges = store.edges(&EdgeFilter::default())?;
    let mut report = ClusteringReport { edges_examined: edges.len(), ..Default::default() };

    for edge in edges {
        if edge.episode_ids.len() < schedules.clustering_min_episodes {
            continue;
        }
        let source = store.get_node(&edge.source_id)?;
        let target = store.get_node(&edge.target_id)?;
        let (Some(source), Some(target)) = (source, target) else { continue };

        let description =
            format!("{} consistently {} {}", source.name, edge.relation, target.name);
        // One experience per pattern: the folded description is the alias.
        if store.resolve_name(&description)?.is_some() {
            continue;
        }

        let input = NodeInput {
            kind: NodeKind::Experience,
            name: description.clone(),
            aliases: vec![],
            properties: json!({
                "condition": format!("when discussing {}", edge.context_tags.join(", ")),
                "confidence": 0.50_f64.min(params.max_confidence),
                "reinforcementCount": edge.episode_ids.len(),
                "episodeIds": edge.episode_ids,
                "sourceEdgeId": edge.id,
            }),
            privacy: source.privacy.max(target.privacy),
        };
        let (node, created) = store.upsert_node(&input, &correlation)?;
        if created {
            store.audit_append(
                &crate::audit::AuditEntry::new(
                    correlation.clone(),
                    crate::audit::AuditKind::ExperiencePromoted,
                    "clustering",
                    crate::audit::Operation::Generate,
                )
                .node(node.id.clone())
                .values(None, Some(description)),
            )?;
            bus.emit(GraphEvent::NodeAdded { node });
            report.experiences_promoted += 1;
        }
    }

    info!(
        examined = report.edges_examined,
        promoted = report.experiences_promoted,
        "clustering cycle complete"
    );
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::MockLanguageModel;
    use tempfile::TempDir;

    fn fixture() -> (Arc<GraphStore>, Arc<EventBus>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GraphStore::new(Some(dir.path().join("test.db"))).unwrap());
        (store, Arc::new(EventBus::default()), dir)
    }

    fn cfg() -> ConfidenceParams {
        ConfidenceParams::default()
    }

    fn seed_edge(
        store: &GraphStore,
        source: &str,
        target: &str,
        relation: &str,
        confidence: f64,
        episodes: &[&str],
    ) -> crate::graph::Edge {
        for ep in episodes {
            store
                .create_episode(&Episode {
                    id: ep.to_string(),
                    occurred_at: Utc::now(),
                    session_id: "s1".to_string(),
                    turn_number: 1,
                    channel: "chat".to_string(),
                    sentiment: 0.0,
                    outcome: 0.0,
                    edge_ids: vec![],
                })
                .unwrap();
        }
        let (s, _) = store.upsert_node(&NodeInput::new(NodeKind::Person, source), "t").unwrap();
        let (t, _) = store.upsert_node(&NodeInput::new(NodeKind::Concept, target), "t").unwrap();
        let mut input = EdgeInput::new(s.id, t.id, relation, confidence);
        input.episode_id = Some(episodes[0].to_string());
        let edge = store.create_edge(&input, &cfg(), "t").unwrap();
        for ep in &episodes[1..] {
            store.reinforce_edge(&edge.id, edge.confidence, ep, "t").unwrap();
        }
        store.get_edge(&edge.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_decay_cycle_archives_weak_old_edges() {
        let (store, bus, dir) = fixture();
        let edge = seed_edge(&store, "User", "Opera", "interested_in", 0.30, &["ep1"]);

        // Backdate through a direct connection to the same database.
        let conn = rusqlite::Connection::open(dir.path().join("test.db")).unwrap();
        let past = (Utc::now() - Duration::days(180)).to_rfc3339();
        conn.execute(
            "UPDATE edges SET last_reinforced = ?2, decay_rate = 0.15 WHERE id = ?1",
            rusqlite::params![edge.id, past],
        )
        .unwrap();

        let report = decay_cycle(&store, &bus, &cfg()).unwrap();
        assert_eq!(report.archived, 1);

        // Archived edges vanish from queries but stay for audit.
        assert!(store.edges(&EdgeFilter::default()).unwrap().is_empty());
        let all = store
            .edges(&EdgeFilter { include_inactive: true, ..Default::default() })
            .unwrap();
        assert!(all[0].archived);
        assert_eq!(
            store.audit_count_kind(crate::audit::AuditKind::EdgeArchived).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_decay_cycle_leaves_fresh_edges_alone() {
        let (store, bus, _dir) = fixture();
        seed_edge(&store, "User", "Jazz", "likes", 0.8, &["ep1"]);
        let report = decay_cycle(&store, &bus, &cfg()).unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.decayed, 0);
        assert_eq!(report.archived, 0);
    }

    struct ScriptedVerifier(Verdict);

    #[async_trait]
    impl FactVerifier for ScriptedVerifier {
        async fn verify(&self, _statement: &str) -> std::result::Result<Verdict, String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_revision_cycle_reinforces_unchanged_public_fact() {
        let (store, bus, dir) = fixture();
        // Public endpoints
        let mut org = NodeInput::new(NodeKind::Organization, "Acme");
        org.privacy = PrivacyLevel::Public;
        let mut city = NodeInput::new(NodeKind::Place, "Berlin");
        city.privacy = PrivacyLevel::Public;
        store
            .create_episode(&Episode {
                id: "ep1".to_string(),
                occurred_at: Utc::now(),
                session_id: "s1".to_string(),
                turn_number: 1,
                channel: "chat".to_string(),
                sentiment: 0.0,
                outcome: 0.0,
                edge_ids: vec![],
            })
            .unwrap();
        let (a, _) = store.upsert_node(&org, "t").unwrap();
        let (b, _) = store.upsert_node(&city, "t").unwrap();
        let mut input = EdgeInput::new(a.id, b.id, "headquartered_in", 0.8);
        input.episode_id = Some("ep1".to_string());
        let edge = store.create_edge(&input, &cfg(), "t").unwrap();

        let conn = rusqlite::Connection::open(dir.path().join("test.db")).unwrap();
        let past = (Utc::now() - Duration::days(60)).to_rfc3339();
        conn.execute(
            "UPDATE edges SET last_reinforced = ?2 WHERE id = ?1",
            rusqlite::params![edge.id, past],
        )
        .unwrap();

        let report = revision_cycle(
            &store,
            &bus,
            &ScriptedVerifier(Verdict::Unchanged),
            &cfg(),
            &WorkerSchedules::default(),
        )
        .await
        .unwrap();
        assert_eq!(report.reinforced, 1);

        let refreshed = store.get_edge(&edge.id).unwrap().unwrap();
        assert!(refreshed.confidence > 0.8);
    }

    #[tokio::test]
    async fn test_revision_cycle_skips_personal_facts() {
        let (store, bus, dir) = fixture();
        let edge = seed_edge(&store, "Lena", "Malbec", "loves", 0.9, &["ep1"]);
        let conn = rusqlite::Connection::open(dir.path().join("test.db")).unwrap();
        let past = (Utc::now() - Duration::days(60)).to_rfc3339();
        conn.execute(
            "UPDATE edges SET last_reinforced = ?2 WHERE id = ?1",
            rusqlite::params![edge.id, past],
        )
        .unwrap();

        let report = revision_cycle(
            &store,
            &bus,
            &ScriptedVerifier(Verdict::Unchanged),
            &cfg(),
            &WorkerSchedules::default(),
        )
        .await
        .unwrap();
        // Person nodes default to Personal privacy: never externally verified
        assert_eq!(report.sampled, 0);
    }

    #[tokio::test]
    async fn test_inference_cycle_inserts_capped_candidates() {
        let (store, bus, _dir) = fixture();
        seed_edge(&store, "Lena", "Malbec", "loves", 0.9, &["ep1"]);
        // Malbec -> Mendoza
        let (malbec, _) = store.upsert_node(&NodeInput::new(NodeKind::Concept, "Malbec"), "t").unwrap();
        let (mendoza, _) = store.upsert_node(&NodeInput::new(NodeKind::Place, "Mendoza"), "t").unwrap();
        let mut input = EdgeInput::new(malbec.id, mendoza.id, "produced_in", 0.8);
        input.episode_id = Some("ep1".to_string());
        store.create_edge(&input, &cfg(), "t").unwrap();

        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "relation inference",
            "mendoza",
            json!({"relations": [
                {"source": "Lena", "target": "Mendoza", "relation": "interested_in"}
            ]}),
        );
        let llm = LlmCapability::large(mock);

        let report =
            inference_cycle(&store, &bus, &llm, &cfg(), &WorkerSchedules::default()).await.unwrap();
        assert_eq!(report.inserted, 1);

        let inferred = store
            .edges(&EdgeFilter { relation: Some("interested_in"), ..Default::default() })
            .unwrap();
        assert_eq!(inferred.len(), 1);
        assert_eq!(inferred[0].provenance, Provenance::Inferential);
        assert!((inferred[0].confidence - cfg().base_inferential).abs() < 1e-9);
        // Inferred edges still trace back to an episode
        assert!(!inferred[0].episode_ids.is_empty());
    }

    #[tokio::test]
    async fn test_clustering_promotes_reinforced_pattern() {
        let (store, bus, _dir) = fixture();
        seed_edge(&store, "Lena", "Malbec", "loves", 0.9, &["ep1", "ep2", "ep3"]);

        let report =
            clustering_cycle(&store, &bus, &cfg(), &WorkerSchedules::default()).unwrap();
        assert_eq!(report.experiences_promoted, 1);

        let experiences = store.find_nodes(Some(NodeKind::Experience), None).unwrap();
        assert_eq!(experiences.len(), 1);
        assert_eq!(experiences[0].properties["reinforcementCount"], 3);

        // Second run does not duplicate
        let report =
            clustering_cycle(&store, &bus, &cfg(), &WorkerSchedules::default()).unwrap();
        assert_eq!(report.experiences_promoted, 0);
    }

    #[tokio::test]
    async fn test_clustering_ignores_thin_edges() {
        let (store, bus, _dir) = fixture();
        seed_edge(&store, "Lena", "Tea", "likes", 0.8, &["ep1"]);
        let report =
            clustering_cycle(&store, &bus, &cfg(), &WorkerSchedules::default()).unwrap();
        assert_eq!(report.experiences_promoted, 0);
    }
}
