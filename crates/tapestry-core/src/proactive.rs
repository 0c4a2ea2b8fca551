//! Proactive engine — probes, starters, and the risk model.
//!
//! Probes open when a graph mutation exposes a knowledge gap (a person
//! the user cares about with no preferences in a live category).
//! Starters open when an external event overlaps what the graph knows.
//! Both land in the outbound queue and wait for a contextually
//! appropriate delivery moment; nothing here talks to the user directly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::diff::VerificationRequest;
use crate::events::GraphEvent;
use crate::extraction::LlmCapability;
use crate::graph::NodeKind;
use crate::queues::outbound::{OutboundItem, OutboundKind, OutboundQueue};
use crate::store::{EdgeFilter, GraphStore, Result};

// ============================================================================
// RISK MODEL
// ============================================================================

/// Cost of acting on a piece of knowledge without asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostCategory {
    None,
    Low,
    Medium,
    High,
}

/// What the agent may do with a fact at a given confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    AutoExecute,
    Suggest,
    CasualMention,
    Defer,
}

/// Risk thresholds, configurable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RiskThresholds {
    pub auto_execute_min: f64,
    pub suggest_min: f64,
    pub casual_mention_min: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self { auto_execute_min: 0.90, suggest_min: 0.50, casual_mention_min: 0.30 }
    }
}

/// Map (confidence, cost) to the permitted action.
pub fn assess_risk(thresholds: &RiskThresholds, confidence: f64, cost: CostCategory) -> RiskAction {
    if confidence >= thresholds.auto_execute_min && cost == CostCategory::None {
        return RiskAction::AutoExecute;
    }
    if confidence >= thresholds.suggest_min && cost <= CostCategory::Medium {
        return RiskAction::Suggest;
    }
    if confidence >= thresholds.casual_mention_min && cost <= CostCategory::Low {
        return RiskAction::CasualMention;
    }
    RiskAction::Defer
}

impl PartialOrd for CostCategory {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.rank().cmp(&other.rank()))
    }
}

impl CostCategory {
    fn rank(&self) -> u8 {
        match self {
            CostCategory::None => 0,
            CostCategory::Low => 1,
            CostCategory::Medium => 2,
            CostCategory::High => 3,
        }
    }
}

// ============================================================================
// EXTERNAL EVENTS
// ============================================================================

/// A normalized event from a poller (weather, calendar, news)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEvent {
    /// weather | calendar | news
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    /// 0.0 (ambient) to 1.0 (urgent)
    #[serde(default)]
    pub severity: f64,
    pub occurred_at: DateTime<Utc>,
}

// ============================================================================
// CONFIG
// ============================================================================

/// Quiet hours in the user's local clock (UTC here; the session timezone
/// offset is applied by the caller when known)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuietHours {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self { enabled: true, start_hour: 22, end_hour: 8 }
    }
}

impl QuietHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let hour = at.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    /// The next moment outside quiet hours.
    pub fn next_open(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        if !self.contains(from) {
            return from;
        }
        let mut candidate = from;
        for _ in 0..25 {
            candidate += Duration::hours(1);
            let truncated = candidate
                .date_naive()
                .and_hms_opt(candidate.hour(), 0, 0)
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
                .unwrap_or(candidate);
            if !self.contains(truncated) {
                return truncated;
            }
        }
        from
    }
}

/// Proactive engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProactiveConfig {
    /// Relevance below this never becomes a starter
    pub starter_relevance_threshold: f64,
    /// Starter subtypes allowed to override quiet hours
    pub quiet_hours_override_subtypes: Vec<String>,
    pub quiet_hours: QuietHours,
    /// Probes generated from a single mutation event
    pub max_probes_per_event: usize,
    /// Delivery window length for starters, hours
    pub starter_window_hours: i64,
    pub risk: RiskThresholds,
    /// Disabled starter subtypes
    pub disabled_starter_subtypes: Vec<String>,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            starter_relevance_threshold: 0.50,
            quiet_hours_override_subtypes: vec!["alert".to_string()],
            quiet_hours: QuietHours::default(),
            max_probes_per_event: 1,
            starter_window_hours: 24,
            risk: RiskThresholds::default(),
            disabled_starter_subtypes: vec![],
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Relations that count as "knowing a preference"
const PREFERENCE_RELATIONS: &[&str] = &["likes", "loves", "prefers", "dislikes"];

/// Relations that signal live interest in a category; only these open
/// knowledge gaps.
const INTEREST_RELATIONS: &[&str] = &["interested_in", "likes", "loves", "prefers"];

pub struct ProactiveEngine {
    store: Arc<GraphStore>,
    outbound: Arc<OutboundQueue>,
    llm_large: Arc<LlmCapability>,
    config: ProactiveConfig,
}

impl ProactiveEngine {
    pub fn new(
        store: Arc<GraphStore>,
        outbound: Arc<OutboundQueue>,
        llm_large: Arc<LlmCapability>,
        config: ProactiveConfig,
    ) -> Self {
        Self { store, outbound, llm_large, config }
    }

    /// Evaluate a graph mutation for newly opened knowledge gaps.
    pub async fn on_graph_event(&self, event: &GraphEvent) -> Result<usize> {
        let GraphEvent::EdgeAdded { edge } = event else { return Ok(0) };
        if edge.context_tags.is_empty() || !INTEREST_RELATIONS.contains(&edge.relation.as_str()) {
            return Ok(0);
        }

        let mut generated = 0usize;
        let people = self.store.find_nodes(Some(NodeKind::Person), None)?;
        'tags: for tag in &edge.context_tags {
            if *tag == edge.relation {
                // The relation name rides along as a tag; it is not a
                // category.
                continue;
            }
            for person in &people {
                if generated >= self.config.max_probes_per_event {
                    break 'tags;
                }
                if person.id == edge.source_id || crate::graph::fold_name(&person.name) == "user" {
                    continue;
                }
                if self.has_preference_in_category(&person.id, tag)? {
                    continue;
                }
                if self
                    .outbound
                    .similar_pending(OutboundKind::Probe, "preference-discovery", &person.name)?
                {
                    continue;
                }

                let question = self.synthesize_probe_question(&person.name, tag).await;
                let mut probe = OutboundItem::probe(
                    "preference-discovery",
                    json!({"question": question, "entity": person.name, "category": tag}),
                );
                probe.context_tags = vec![tag.clone()];
                probe.entities = vec![person.name.clone()];
                probe.priority = 0.5;
                self.outbound.push(
                    &probe,
                    &format!("no {tag} preferences known for {}", person.name),
                )?;
                generated += 1;
            }
        }
        if generated > 0 {
            info!(count = generated, "probes generated from graph mutation");
        }
        Ok(generated)
    }

    /// Turn a below-margin contradiction into a fact-verification probe.
    pub fn on_verification_request(&self, request: &VerificationRequest) -> Result<()> {
        if self.outbound.similar_pending(
            OutboundKind::Probe,
            "fact-verification",
            &request.source_name,
        )? {
            return Ok(());
        }
        let question = format!(
            "Last time we discussed this you said {} {} {} — has that changed?",
            request.source_name, request.relation, request.old_value
        );
        let mut probe = OutboundItem::probe(
            "fact-verification",
            json!({
                "question": question,
                "entity": request.source_name,
                "edgeId": request.edge_id,
                "oldValue": request.old_value,
                "newValue": request.new_value,
            }),
        );
        probe.context_tags = request.context_tags.clone();
        probe.entities = vec![request.source_name.clone()];
        probe.priority = 0.7;
        self.outbound.push(&probe, "contradiction below revision margin")
    }

    /// Score an external event against the graph; above threshold, queue
    /// a starter with a delivery window that honors quiet hours.
    pub async fn on_external_event(&self, event: &ExternalEvent) -> Result<Option<String>> {
        let subtype = starter_subtype_for(&event.source, event.severity);
        if self.config.disabled_starter_subtypes.contains(&subtype.to_string()) {
            debug!(subtype, "starter subtype disabled");
            return Ok(None);
        }

        let relevance = self.score_event_relevance(event)?;
        if relevance < self.config.starter_relevance_threshold {
            debug!(title = %event.title, relevance, "external event below relevance threshold");
            return Ok(None);
        }

        let now = Utc::now();
        let can_override = self
            .config
            .quiet_hours_override_subtypes
            .iter()
            .any(|s| s == subtype);
        let earliest = if can_override { now } else { self.config.quiet_hours.next_open(now) };
        let latest = earliest + Duration::hours(self.config.starter_window_hours);

        // How forwardly the agent may act on this starter.
        let cost = if event.severity >= 0.7 { CostCategory::None } else { CostCategory::Low };
        let action = assess_risk(&self.config.risk, relevance, cost);

        let opening = self.synthesize_starter_text(event).await;
        let mut starter = OutboundItem::starter(
            subtype,
            json!({
                "opening": opening,
                "source": event.source,
                "title": event.title,
                "relevance": (relevance * 1000.0).round() / 1000.0,
                "suggestedAction": action,
            }),
        );
        starter.context_tags = event.topics.clone();
        starter.entities = event.entities.clone();
        starter.priority = (relevance + event.severity).min(1.0);
        starter.earliest = earliest;
        starter.latest = Some(latest);
        starter.min_turn = 0;

        let id = starter.id.clone();
        self.outbound.push(
            &starter,
            &format!("external {} event matched graph at relevance {relevance:.2}", event.source),
        )?;
        Ok(Some(id))
    }

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------

    fn has_preference_in_category(&self, person_id: &str, tag: &str) -> Result<bool> {
        let edges = self.store.edges(&EdgeFilter {
            source_id: Some(person_id),
            ..Default::default()
        })?;
        Ok(edges.iter().any(|e| {
            PREFERENCE_RELATIONS.contains(&e.relation.as_str())
                && e.context_tags.iter().any(|t| t == tag)
        }))
    }

    /// Fraction of the event's entities/topics the graph already knows.
    fn score_event_relevance(&self, event: &ExternalEvent) -> Result<f64> {
        let mut entity_hits = 0usize;
        for entity in &event.entities {
            if self.store.resolve_name(entity)?.is_some() {
                entity_hits += 1;
            }
        }
        let entity_score = if event.entities.is_empty() {
            0.0
        } else {
            entity_hits as f64 / event.entities.len() as f64
        };

        let edges = self.store.edges(&EdgeFilter::default())?;
        let mut topic_hits = 0usize;
        for topic in &event.topics {
            let folded = crate::graph::fold_name(topic);
            let known = edges.iter().any(|e| {
                e.context_tags.iter().any(|t| crate::graph::fold_name(t) == folded)
            });
            if known {
                topic_hits += 1;
            }
        }
        let topic_score = if event.topics.is_empty() {
            0.0
        } else {
            topic_hits as f64 / event.topics.len() as f64
        };

        Ok(0.6 * entity_score + 0.4 * topic_score)
    }

    async fn synthesize_probe_question(&self, entity: &str, category: &str) -> String {
        let system = "You write one short, natural question an assistant could ask \
                      a user to learn a missing preference. Respond with the question only.";
        let user = format!("Person: {entity}. Category: {category}.");
        match self.llm_large.complete(system, &user).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) | Err(_) => {
                warn!("probe synthesis unavailable, using template");
                format!("What does {entity} enjoy when it comes to {category}?")
            }
        }
    }

    async fn synthesize_starter_text(&self, event: &ExternalEvent) -> String {
        let system = "You write one short, natural conversation opener an assistant \
                      could use, grounded in the given event. Respond with the opener only.";
        let user = format!("Event from {}: {}", event.source, event.title);
        match self.llm_large.complete(system, &user).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) | Err(_) => {
                warn!("starter synthesis unavailable, using template");
                format!("Heads up: {}", event.title)
            }
        }
    }
}

fn starter_subtype_for(source: &str, severity: f64) -> &'static str {
    match source {
        "weather" if severity >= 0.7 => "alert",
        "weather" => "opportunity",
        "calendar" => "anticipation",
        "news" => "insight",
        _ if severity >= 0.7 => "alert",
        _ => "opportunity",
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::ConfidenceParams;
    use crate::extraction::MockLanguageModel;
    use crate::graph::{Edge, EdgeInput, Episode, NodeInput, Provenance, TemporalType};
    use crate::queues::outbound::ProbingLimits;
    use tempfile::TempDir;

    fn engine_fixture() -> (ProactiveEngine, Arc<GraphStore>, Arc<OutboundQueue>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(GraphStore::new(Some(dir.path().join("test.db"))).unwrap());
        let outbound = Arc::new(OutboundQueue::new(Arc::clone(&store), ProbingLimits::default()));
        let llm = Arc::new(LlmCapability::large(Arc::new(MockLanguageModel::new())));
        let engine = ProactiveEngine::new(
            Arc::clone(&store),
            Arc::clone(&outbound),
            llm,
            ProactiveConfig::default(),
        );
        (engine, store, outbound, dir)
    }

    fn seed_edge(store: &GraphStore, source: &str, target: &str, relation: &str, tags: &[&str]) -> Edge {
        store
            .create_episode(&Episode {
                id: format!("ep-{source}-{target}"),
                occurred_at: Utc::now(),
                session_id: "s1".to_string(),
                turn_number: 1,
                channel: "chat".to_string(),
                sentiment: 0.0,
                outcome: 0.0,
                edge_ids: vec![],
            })
            .unwrap();
        let (s, _) = store.upsert_node(&NodeInput::new(NodeKind::Person, source), "t").unwrap();
        let (t, _) =
            store.upsert_node(&NodeInput::new(NodeKind::Concept, target), "t").unwrap();
        let mut input = EdgeInput::new(s.id, t.id, relation, 0.9);
        input.episode_id = Some(format!("ep-{source}-{target}"));
        input.context_tags = tags.iter().map(|s| s.to_string()).collect();
        input.temporal_type = TemporalType::Trait;
        input.provenance = Provenance::Explicit;
        store.create_edge(&input, &ConfidenceParams::default(), "t").unwrap()
    }

    #[test]
    fn test_risk_model_thresholds() {
        let t = RiskThresholds::default();
        assert_eq!(assess_risk(&t, 0.95, CostCategory::None), RiskAction::AutoExecute);
        assert_eq!(assess_risk(&t, 0.95, CostCategory::Low), RiskAction::Suggest);
        assert_eq!(assess_risk(&t, 0.6, CostCategory::Medium), RiskAction::Suggest);
        assert_eq!(assess_risk(&t, 0.4, CostCategory::Low), RiskAction::CasualMention);
        assert_eq!(assess_risk(&t, 0.4, CostCategory::High), RiskAction::Defer);
        assert_eq!(assess_risk(&t, 0.1, CostCategory::None), RiskAction::Defer);
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let qh = QuietHours { enabled: true, start_hour: 22, end_hour: 8 };
        let at = |h: u32| {
            Utc::now()
                .date_naive()
                .and_hms_opt(h, 30, 0)
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
                .unwrap()
        };
        assert!(qh.contains(at(23)));
        assert!(qh.contains(at(3)));
        assert!(!qh.contains(at(12)));

        let open = qh.next_open(at(23));
        assert!(!qh.contains(open));
    }

    #[tokio::test]
    async fn test_knowledge_gap_generates_probe() {
        let (engine, store, outbound, _dir) = engine_fixture();
        // Known person with no wine preferences
        store.upsert_node(&NodeInput::new(NodeKind::Person, "Lena"), "t").unwrap();
        // A user utterance about wine just created this edge
        let edge = seed_edge(&store, "User", "Malbec", "interested_in", &["wine"]);

        let generated = engine
            .on_graph_event(&GraphEvent::EdgeAdded { edge })
            .await
            .unwrap();
        assert_eq!(generated, 1);
        assert_eq!(outbound.pending_count().unwrap(), 1);

        // Re-running the same event does not duplicate the probe
        let edge2 = seed_edge(&store, "User", "Merlot", "interested_in", &["wine"]);
        let generated = engine
            .on_graph_event(&GraphEvent::EdgeAdded { edge: edge2 })
            .await
            .unwrap();
        assert_eq!(generated, 0);
    }

    #[tokio::test]
    async fn test_no_gap_when_preference_known() {
        let (engine, store, outbound, _dir) = engine_fixture();
        seed_edge(&store, "Lena", "Malbec", "loves", &["wine"]);
        let edge = seed_edge(&store, "User", "Riesling", "interested_in", &["wine"]);

        let generated = engine
            .on_graph_event(&GraphEvent::EdgeAdded { edge })
            .await
            .unwrap();
        assert_eq!(generated, 0);
        assert_eq!(outbound.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verification_request_becomes_probe() {
        let (engine, _store, outbound, _dir) = engine_fixture();
        engine
            .on_verification_request(&VerificationRequest {
                edge_id: "e1".to_string(),
                source_name: "Lena".to_string(),
                relation: "age".to_string(),
                old_value: "47".to_string(),
                new_value: "46".to_string(),
                context_tags: vec![],
            })
            .unwrap();
        assert_eq!(outbound.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_external_event_below_threshold_ignored() {
        let (engine, _store, outbound, _dir) = engine_fixture();
        let result = engine
            .on_external_event(&ExternalEvent {
                source: "news".to_string(),
                title: "Something about nothing".to_string(),
                topics: vec!["cricket".to_string()],
                entities: vec!["Nobody".to_string()],
                severity: 0.1,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(outbound.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_external_event_with_overlap_becomes_starter() {
        let (engine, store, outbound, _dir) = engine_fixture();
        seed_edge(&store, "Lena", "Malbec", "loves", &["wine"]);

        let result = engine
            .on_external_event(&ExternalEvent {
                source: "news".to_string(),
                title: "Malbec harvest breaks records in Mendoza".to_string(),
                topics: vec!["wine".to_string()],
                entities: vec!["Malbec".to_string()],
                severity: 0.2,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(result.is_some());
        assert_eq!(outbound.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_starter_subtypes() {
        assert_eq!(starter_subtype_for("weather", 0.9), "alert");
        assert_eq!(starter_subtype_for("weather", 0.2), "opportunity");
        assert_eq!(starter_subtype_for("calendar", 0.0), "anticipation");
        assert_eq!(starter_subtype_for("news", 0.0), "insight");
    }
}
