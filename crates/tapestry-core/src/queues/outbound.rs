//! Outbound queue — pending probes and starters with delivery gating.
//!
//! Items wait here until the agent pulls them at a contextually
//! appropriate moment. Retrieval is gated by a context-fit score,
//! frequency counters (per conversation / day / week), a minimum
//! conversational turn, and cooldowns for ignored or deflected items.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{GraphStore, Result};

// ============================================================================
// ITEM TYPES
// ============================================================================

/// Probe (a question we want to ask) or starter (a system-initiated opening)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundKind {
    Probe,
    Starter,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Probe => "probe",
            OutboundKind::Starter => "starter",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "starter" => OutboundKind::Starter,
            _ => OutboundKind::Probe,
        }
    }
}

/// Probe lifecycle state. `Accepted` and `Obsoleted` are terminal;
/// ignored and deflected items re-enter `Queued` after their cooldown
/// with reduced priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    Queued,
    Delivered,
    Accepted,
    Ignored,
    Deflected,
    Obsoleted,
}

impl ProbeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeState::Queued => "queued",
            ProbeState::Delivered => "delivered",
            ProbeState::Accepted => "accepted",
            ProbeState::Ignored => "ignored",
            ProbeState::Deflected => "deflected",
            ProbeState::Obsoleted => "obsoleted",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s {
            "delivered" => ProbeState::Delivered,
            "accepted" => ProbeState::Accepted,
            "ignored" => ProbeState::Ignored,
            "deflected" => ProbeState::Deflected,
            "obsoleted" => ProbeState::Obsoleted,
            _ => ProbeState::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeState::Accepted | ProbeState::Obsoleted)
    }
}

/// A pending probe or starter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundItem {
    pub id: String,
    pub kind: OutboundKind,
    /// preference-discovery | fact-verification | preference-refinement
    /// (probes); alert | opportunity | revision | insight | anticipation
    /// (starters)
    pub subtype: String,
    pub priority: f64,
    pub context_tags: Vec<String>,
    /// Entity names this item is about
    pub entities: Vec<String>,
    /// Minimum conversational turn before delivery
    pub min_turn: u32,
    pub earliest: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub state: ProbeState,
    /// Rendered content: question text, suggested phrasing, etc.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub ignored_count: u32,
}

impl OutboundItem {
    pub fn probe(subtype: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OutboundKind::Probe, subtype, payload)
    }

    pub fn starter(subtype: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(OutboundKind::Starter, subtype, payload)
    }

    fn new(kind: OutboundKind, subtype: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            subtype: subtype.into(),
            priority: 0.5,
            context_tags: vec![],
            entities: vec![],
            min_turn: 3,
            earliest: now,
            latest: None,
            cooldown_until: None,
            state: ProbeState::Queued,
            payload,
            created_at: now,
            delivered_at: None,
            ignored_count: 0,
        }
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Jaccard similarity over two tag sets
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let sa: HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let sb: HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn overlap_fraction(item_entities: &[String], in_scope: &[String]) -> f64 {
    if item_entities.is_empty() {
        return 0.0;
    }
    let scope: HashSet<String> = in_scope.iter().map(|s| s.to_lowercase()).collect();
    let hits = item_entities
        .iter()
        .filter(|e| scope.contains(&e.to_lowercase()))
        .count() as f64;
    hits / item_entities.len() as f64
}

/// Freshly created items score full recency; the component halves every
/// two days of queue age.
fn recency_decay(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_hours = (now - created_at).num_minutes() as f64 / 60.0;
    0.5_f64.powf(age_hours.max(0.0) / 48.0)
}

/// Context-fit score:
/// `0.6 * Jaccard(topics, tags) + 0.3 * entity overlap + 0.1 * recency`
pub fn context_fit(
    item: &OutboundItem,
    active_topics: &[String],
    entities_in_scope: &[String],
    now: DateTime<Utc>,
) -> f64 {
    0.6 * jaccard(active_topics, &item.context_tags)
        + 0.3 * overlap_fraction(&item.entities, entities_in_scope)
        + 0.1 * recency_decay(item.created_at, now)
}

// ============================================================================
// GATING LIMITS
// ============================================================================

/// Frequency and fit limits for probe delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbingLimits {
    pub max_per_conversation: u32,
    pub max_per_day: u32,
    pub max_per_week: u32,
    pub min_turn: u32,
    pub min_context_fit: f64,
    pub ignore_cooldown_hours: i64,
    pub deflect_cooldown_hours: i64,
    /// Priority multiplier applied when an item re-enters after cooldown
    pub reentry_priority_factor: f64,
}

impl Default for ProbingLimits {
    fn default() -> Self {
        Self {
            max_per_conversation: 1,
            max_per_day: 3,
            max_per_week: 10,
            min_turn: 3,
            min_context_fit: 0.15,
            ignore_cooldown_hours: 24,
            deflect_cooldown_hours: 24 * 7,
            reentry_priority_factor: 0.7,
        }
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// The outbound queue over the graph store
pub struct OutboundQueue {
    store: Arc<GraphStore>,
    limits: ProbingLimits,
}

impl OutboundQueue {
    pub fn new(store: Arc<GraphStore>, limits: ProbingLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &ProbingLimits {
        &self.limits
    }

    /// Enqueue a new item; the reasoning lands in the audit log.
    pub fn push(&self, item: &OutboundItem, reasoning: &str) -> Result<()> {
        self.store.outbound_push(item, reasoning)?;
        info!(kind = item.kind.as_str(), subtype = %item.subtype, id = %item.id, "outbound item queued");
        Ok(())
    }

    /// Whether an equivalent item is already waiting (dedup for the
    /// proactive engine).
    pub fn similar_pending(&self, kind: OutboundKind, subtype: &str, entity: &str) -> Result<bool> {
        self.store.outbound_similar_pending(kind, subtype, entity)
    }

    /// Return the single best-fit probe for the moment, or None.
    ///
    /// Consumes the item (marks delivered), bumps the frequency counters,
    /// and audits the decision with its score.
    pub fn get_best_probe(
        &self,
        session_id: &str,
        active_topics: &[String],
        entities_in_scope: &[String],
        turn_number: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<(OutboundItem, f64)>> {
        if turn_number < self.limits.min_turn {
            debug!(turn_number, min_turn = self.limits.min_turn, "below minimum turn");
            return Ok(None);
        }
        if self.counters_exhausted(session_id, now)? {
            return Ok(None);
        }

        let candidates = self.store.outbound_candidates(OutboundKind::Probe, now, turn_number)?;
        let mut best: Option<(OutboundItem, f64)> = None;
        for item in candidates {
            let fit = context_fit(&item, active_topics, entities_in_scope, now);
            if fit < self.limits.min_context_fit {
                continue;
            }
            let score = fit * (0.5 + item.priority / 2.0);
            match &best {
                Some((_, existing)) if *existing >= score => {}
                _ => best = Some((item, score)),
            }
        }

        if let Some((item, score)) = &best {
            self.store.outbound_mark_delivered(&item.id, now, *score)?;
            self.bump_counters(session_id, now)?;
        }
        Ok(best)
    }

    /// Ranked starters for a channel, limited to `max_results`. Starters
    /// share the daily counter with probes but skip the conversation cap.
    pub fn get_starters(&self, max_results: usize, now: DateTime<Utc>) -> Result<Vec<OutboundItem>> {
        let mut candidates = self.store.outbound_candidates(OutboundKind::Starter, now, u32::MAX)?;
        candidates.sort_by(|a, b| {
            b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(max_results);
        for item in &candidates {
            self.store.outbound_mark_delivered(&item.id, now, item.priority)?;
        }
        Ok(candidates)
    }

    /// Pending probes matching the context, without consuming them or
    /// touching counters (context-block assembly).
    pub fn peek_matching(
        &self,
        active_topics: &[String],
        entities_in_scope: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(OutboundItem, f64)>> {
        let candidates = self.store.outbound_candidates(OutboundKind::Probe, now, u32::MAX)?;
        let mut scored: Vec<(OutboundItem, f64)> = candidates
            .into_iter()
            .map(|item| {
                let fit = context_fit(&item, active_topics, entities_in_scope, now);
                (item, fit)
            })
            .filter(|(_, fit)| *fit >= self.limits.min_context_fit)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// The user ignored a delivered item: cooldown, reduced priority.
    pub fn mark_ignored(&self, id: &str) -> Result<()> {
        let until = Utc::now() + chrono::Duration::hours(self.limits.ignore_cooldown_hours);
        self.store.outbound_requeue_after_cooldown(id, until, self.limits.reentry_priority_factor)
    }

    /// The user deflected: longer cooldown, same priority reduction.
    pub fn mark_deflected(&self, id: &str) -> Result<()> {
        let until = Utc::now() + chrono::Duration::hours(self.limits.deflect_cooldown_hours);
        self.store.outbound_requeue_after_cooldown(id, until, self.limits.reentry_priority_factor)
    }

    /// The user engaged: terminal success.
    pub fn mark_accepted(&self, id: &str) -> Result<()> {
        self.store.outbound_set_state(id, ProbeState::Accepted)
    }

    /// Obsolete items whose delivery window has passed.
    pub fn obsolete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.outbound_obsolete_expired(now)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.outbound_pending_count()
    }

    // -- internal ------------------------------------------------------------

    fn counters_exhausted(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conv = self.store.counter_get("probe", &conversation_key(session_id))?;
        if conv >= self.limits.max_per_conversation as i64 {
            debug!(session_id, "probe per-conversation limit reached");
            return Ok(true);
        }
        let day = self.store.counter_get("probe", &day_key(now))?;
        if day >= self.limits.max_per_day as i64 {
            debug!("probe per-day limit reached");
            return Ok(true);
        }
        let week = self.store.counter_get("probe", &week_key(now))?;
        if week >= self.limits.max_per_week as i64 {
            debug!("probe per-week limit reached");
            return Ok(true);
        }
        Ok(false)
    }

    fn bump_counters(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.store.counter_bump("probe", &conversation_key(session_id))?;
        self.store.counter_bump("probe", &day_key(now))?;
        self.store.counter_bump("probe", &week_key(now))?;
        Ok(())
    }
}

fn conversation_key(session_id: &str) -> String {
    format!("conversation:{session_id}")
}

fn day_key(now: DateTime<Utc>) -> String {
    format!("day:{}", now.format("%Y-%m-%d"))
}

fn week_key(now: DateTime<Utc>) -> String {
    let week = now.iso_week();
    format!("week:{}-W{:02}", week.year(), week.week())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jaccard() {
        let a = vec!["wine".to_string(), "food".to_string()];
        let b = vec!["wine".to_string(), "travel".to_string()];
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&[], &[]), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn test_context_fit_weights() {
        let now = Utc::now();
        let mut item = OutboundItem::probe("preference-discovery", serde_json::json!({}));
        item.context_tags = vec!["wine".to_string()];
        item.entities = vec!["Lena".to_string()];
        item.created_at = now;

        let fit = context_fit(
            &item,
            &["wine".to_string()],
            &["lena".to_string()],
            now,
        );
        // Full topic match, full entity match, full recency: 0.6 + 0.3 + 0.1
        assert!((fit - 1.0).abs() < 1e-6);

        let no_fit = context_fit(&item, &["sports".to_string()], &[], now);
        assert!(no_fit <= 0.1 + 1e-9);
    }

    #[test]
    fn test_recency_component_decays() {
        let now = Utc::now();
        let mut item = OutboundItem::probe("preference-discovery", serde_json::json!({}));
        item.context_tags = vec!["wine".to_string()];
        item.created_at = now - chrono::Duration::days(4);

        let fit = context_fit(&item, &["wine".to_string()], &[], now);
        // Topic component intact, recency halved twice
        assert!(fit < 0.6 + 0.1);
        assert!(fit > 0.6);
    }

    #[test]
    fn test_probe_state_terminality() {
        assert!(ProbeState::Accepted.is_terminal());
        assert!(ProbeState::Obsoleted.is_terminal());
        assert!(!ProbeState::Ignored.is_terminal());
        assert_eq!(ProbeState::parse_name("deflected"), ProbeState::Deflected);
    }

    #[test]
    fn test_week_key_format() {
        let now = Utc::now();
        let key = week_key(now);
        assert!(key.starts_with("week:"));
        assert!(key.contains("-W"));
    }

    #[test]
    fn test_default_limits_match_policy() {
        let limits = ProbingLimits::default();
        assert_eq!(limits.max_per_conversation, 1);
        assert_eq!(limits.max_per_day, 3);
        assert_eq!(limits.max_per_week, 10);
        assert_eq!(limits.min_turn, 3);
    }
}
