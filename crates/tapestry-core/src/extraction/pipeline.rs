//! Extraction pipeline — staged transformation from raw utterance to a
//! prepared graph delta.
//!
//! Stages: preprocess → entities → relations → sentiment/hedge →
//! temporal scope → confidence scoring → diff preparation. The pipeline
//! degrades gracefully: a stage failure never prevents later stages from
//! working with what was extracted earlier, and the pipeline never
//! returns an error to the caller — the worst case is an empty, tagged
//! delta.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::confidence::{self, ConfidenceParams, HedgeLevel};
use crate::diff::{PreparedDelta, ProposedEdge, ProposedNode, ProposedRetraction, RefinesHint};
use crate::graph::{fold_name, NodeInput, NodeKind, PrivacyLevel, Provenance, TemporalType};
use crate::queues::inbound::{ContextWindow, InteractionEvent};

use super::llm::{LlmCapability, LlmError};
use super::prompts;
use super::repair::repair_llm_json;

// ============================================================================
// CONFIG
// ============================================================================

/// Extraction toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionConfig {
    /// Below this STT confidence the utterance is not extracted at all
    pub stt_floor: f64,
    /// Above the floor, scale final confidences linearly by STT confidence
    pub stt_scaling: bool,
    /// Maximum plausible entities per word of utterance
    pub max_entities_per_word: f64,
    /// Hallucination warnings that discard the stage output
    pub max_hallucination_warnings: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            stt_floor: 0.40,
            stt_scaling: true,
            max_entities_per_word: 0.5,
            max_hallucination_warnings: 3,
        }
    }
}

// ============================================================================
// STAGE OUTPUT TYPES
// ============================================================================

#[derive(Debug, Clone)]
struct Preprocessed {
    cleaned: String,
    tags: Vec<String>,
    skip_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntity {
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    is_new: bool,
    #[serde(default)]
    properties: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawRelation {
    source: String,
    target: String,
    relation: String,
    mechanism: String,
    hypothetical: bool,
    sarcasm: bool,
    secondhand: bool,
    user_agrees: bool,
    attribution_uncertain: bool,
    retract: bool,
    refines: Option<RawRefines>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRefines {
    relation: String,
    target: String,
}

#[derive(Debug, Clone)]
struct SentimentReading {
    hedge: HedgeLevel,
    polarity: f64,
    magnitude: f64,
}

impl Default for SentimentReading {
    // Stage 4 fallback: moderate hedge, neutral sentiment.
    fn default() -> Self {
        Self { hedge: HedgeLevel::Moderate, polarity: 0.0, magnitude: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TemporalReading {
    temporal_type: TemporalType,
    expiry: Option<chrono::DateTime<Utc>>,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Sessions whose known-entity sets are cached
const SESSION_CACHE_SIZE: usize = 64;

pub struct ExtractionPipeline {
    llm: Arc<LlmCapability>,
    confidence: ConfidenceParams,
    config: ExtractionConfig,
    /// Per-session known entity names (folded), for "isNew" verification
    session_entities: Mutex<LruCache<String, HashSet<String>>>,
    hallucination_count: AtomicU64,
}

impl ExtractionPipeline {
    pub fn new(llm: Arc<LlmCapability>, confidence: ConfidenceParams, config: ExtractionConfig) -> Self {
        Self {
            llm,
            confidence,
            config,
            session_entities: Mutex::new(LruCache::new(
                NonZeroUsize::new(SESSION_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            hallucination_count: AtomicU64::new(0),
        }
    }

    pub fn hallucination_count(&self) -> u64 {
        self.hallucination_count.load(Ordering::Relaxed)
    }

    /// Run the full pipeline. Never fails; inspect `tags` and `skipped`
    /// on the returned delta for what happened.
    pub async fn extract(&self, event: &InteractionEvent, window: ContextWindow) -> PreparedDelta {
        let correlation_id = format!("{}:{}", event.session_id, event.turn_number);
        let mut delta = PreparedDelta {
            correlation_id,
            session_id: event.session_id.clone(),
            turn_number: event.turn_number,
            channel: event.channel.clone(),
            episode_id: episode_id_for(event),
            ..Default::default()
        };

        // STT gate: below the floor the transcript is noise.
        if let Some(stt) = event.stt_confidence {
            if stt < self.config.stt_floor {
                delta.skipped = true;
                delta.skip_reason = Some("stt_below_floor".to_string());
                return delta;
            }
        }

        // Stage 1 — preprocess.
        let pre = preprocess(&event.text);
        delta.tags.extend(pre.tags.iter().map(|t| t.to_string()));
        if let Some(reason) = pre.skip_reason {
            delta.skipped = true;
            delta.skip_reason = Some(reason.to_string());
            return delta;
        }
        let mut cleaned = pre.cleaned;
        if cleaned.len() > window.max_chars() {
            let mut cut = window.max_chars();
            while !cleaned.is_char_boundary(cut) {
                cut -= 1;
            }
            cleaned.truncate(cut);
            delta.tags.push("context_reduced".to_string());
        }

        // Stage 2 — entities.
        let known = self.known_entities(&event.session_id, &event.entities_hint);
        let (mut entities, warnings) = match self.extract_entities(&cleaned, &known).await {
            Ok(result) => result,
            Err(tag) => {
                delta.tags.push(tag);
                (vec![], 0)
            }
        };
        let mut suspects: HashSet<String> = HashSet::new();
        if warnings >= self.config.max_hallucination_warnings {
            self.hallucination_count.fetch_add(1, Ordering::Relaxed);
            warn!(session = %event.session_id, warnings, "entity stage discarded as hallucinated");
            delta.tags.push("hallucination_discarded".to_string());
            entities.clear();
        } else if warnings > 0 {
            delta.tags.push("hallucination_warnings".to_string());
            // Individual suspects were already folded into the warning
            // count; their relations get the 50% haircut below.
            for entity in &entities {
                let folded = fold_name(&entity.name);
                if folded != "user" && !fold_contains(&cleaned, &entity.name) {
                    suspects.insert(folded);
                }
            }
            entities.retain(|e| {
                fold_name(&e.name) == "user" || fold_contains(&cleaned, &e.name)
            });
        }

        // Stage 3 — relations.
        let relations = match self.extract_relations(&cleaned, &entities).await {
            Ok(relations) => relations,
            Err(tag) => {
                delta.tags.push(tag);
                vec![]
            }
        };

        // Stage 4 — sentiment and hedging.
        let sentiment = self.read_sentiment(&cleaned).await.unwrap_or_else(|tag| {
            delta.tags.push(tag);
            SentimentReading::default()
        });
        delta.sentiment = sentiment.polarity;

        // Stage 5 — temporal scope.
        let temporal = self
            .read_temporal(&cleaned, &relations)
            .await
            .unwrap_or_else(|tag| {
                delta.tags.push(tag);
                vec![TemporalReading::default(); relations.len()]
            });

        // Stages 6 + 7 — score and prepare.
        self.prepare(&mut delta, event, entities, relations, sentiment, temporal, &suspects);

        self.remember_entities(&event.session_id, &delta);
        info!(
            session = %event.session_id,
            turn = event.turn_number,
            nodes = delta.nodes.len(),
            edges = delta.edges.len(),
            retractions = delta.retractions.len(),
            "extraction complete"
        );
        delta
    }

    // ------------------------------------------------------------------
    // Stage 2
    // ------------------------------------------------------------------

    async fn extract_entities(
        &self,
        cleaned: &str,
        known: &HashSet<String>,
    ) -> std::result::Result<(Vec<RawEntity>, usize), String> {
        let raw = self.call_with_retry(prompts::ENTITY_SYSTEM_PROMPT, cleaned).await?;
        let Some(parsed) = repair_llm_json(&raw) else {
            warn!("entity stage: unparseable output discarded");
            return Err("entity_parse_failed".to_string());
        };

        let mut entities: Vec<RawEntity> = Vec::new();
        if let Some(items) = parsed.get("entities").and_then(|v| v.as_array()) {
            for item in items {
                match serde_json::from_value::<RawEntity>(item.clone()) {
                    Ok(entity) if !entity.name.trim().is_empty() => entities.push(entity),
                    _ => debug!("skipping malformed entity item"),
                }
            }
        }

        // Hallucination checks.
        let mut warnings = 0usize;
        let word_count = cleaned.split_whitespace().count().max(1);
        if entities.len() as f64 > word_count as f64 * self.config.max_entities_per_word {
            warn!(entities = entities.len(), word_count, "implausible entity count");
            warnings += 1;
        }
        for entity in &entities {
            // "User" names the speaker; it never appears in the utterance.
            if fold_name(&entity.name) == "user" {
                continue;
            }
            if !fold_contains(cleaned, &entity.name) {
                warn!(entity = %entity.name, "entity span not found in utterance");
                warnings += 1;
            }
            if entity.is_new && known.contains(&fold_name(&entity.name)) {
                warn!(entity = %entity.name, "entity marked new but already known");
                warnings += 1;
            }
        }
        Ok((entities, warnings))
    }

    // ------------------------------------------------------------------
    // Stage 3
    // ------------------------------------------------------------------

    async fn extract_relations(
        &self,
        cleaned: &str,
        entities: &[RawEntity],
    ) -> std::result::Result<Vec<RawRelation>, String> {
        let entity_names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let user_message =
            format!("Entities: {}\n\nMessage: {}", entity_names.join(", "), cleaned);
        let raw = self.call_with_retry(prompts::RELATION_SYSTEM_PROMPT, &user_message).await?;
        let Some(parsed) = repair_llm_json(&raw) else {
            warn!("relation stage: unparseable output discarded");
            return Err("relation_parse_failed".to_string());
        };

        let mut relations: Vec<RawRelation> = Vec::new();
        if let Some(items) = parsed.get("relations").and_then(|v| v.as_array()) {
            for item in items {
                match serde_json::from_value::<RawRelation>(item.clone()) {
                    Ok(rel)
                        if !rel.source.trim().is_empty()
                            && (rel.retract || !rel.target.trim().is_empty())
                            && (rel.retract || !rel.relation.trim().is_empty()) =>
                    {
                        relations.push(rel)
                    }
                    _ => debug!("skipping malformed relation item"),
                }
            }
        }
        Ok(relations)
    }

    // ------------------------------------------------------------------
    // Stage 4
    // ------------------------------------------------------------------

    async fn read_sentiment(&self, cleaned: &str) -> std::result::Result<SentimentReading, String> {
        let raw = self
            .call_with_retry(prompts::SENTIMENT_SYSTEM_PROMPT, cleaned)
            .await
            .map_err(|_| "sentiment_fallback".to_string())?;
        let parsed = repair_llm_json(&raw).ok_or_else(|| "sentiment_fallback".to_string())?;
        Ok(SentimentReading {
            hedge: HedgeLevel::parse_name(parsed.get("hedge").and_then(|v| v.as_str()).unwrap_or("moderate")),
            polarity: parsed.get("polarity").and_then(|v| v.as_f64()).unwrap_or(0.0).clamp(-1.0, 1.0),
            magnitude: parsed.get("magnitude").and_then(|v| v.as_f64()).unwrap_or(0.0).clamp(0.0, 1.0),
        })
    }

    // ------------------------------------------------------------------
    // Stage 5
    // ------------------------------------------------------------------

    async fn read_temporal(
        &self,
        cleaned: &str,
        relations: &[RawRelation],
    ) -> std::result::Result<Vec<TemporalReading>, String> {
        if relations.is_empty() {
            return Ok(vec![]);
        }
        let listing: Vec<String> = relations
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{i}. {} {} {}", r.source, r.relation, r.target))
            .collect();
        let user_message = format!(
            "Today is {}.\n\nMessage: {}\n\nRelations:\n{}",
            Utc::now().date_naive(),
            cleaned,
            listing.join("\n"),
        );
        let raw = self
            .call_with_retry(prompts::TEMPORAL_SYSTEM_PROMPT, &user_message)
            .await
            .map_err(|_| "temporal_fallback".to_string())?;
        let parsed = repair_llm_json(&raw).ok_or_else(|| "temporal_fallback".to_string())?;

        let mut readings = vec![TemporalReading::default(); relations.len()];
        if let Some(items) = parsed.get("relations").and_then(|v| v.as_array()) {
            for item in items {
                let Some(index) = item.get("index").and_then(|v| v.as_u64()) else { continue };
                let Some(slot) = readings.get_mut(index as usize) else { continue };
                if let Some(t) = item.get("temporalType").and_then(|v| v.as_str()) {
                    slot.temporal_type = TemporalType::parse_name(t);
                }
                if let Some(date) = item.get("expiry").and_then(|v| v.as_str()) {
                    if let Ok(parsed_date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                        slot.expiry = parsed_date
                            .and_hms_opt(23, 59, 59)
                            .map(|dt| chrono::DateTime::from_naive_utc_and_offset(dt, Utc));
                    }
                }
            }
        }
        Ok(readings)
    }

    // ------------------------------------------------------------------
    // Stages 6 + 7
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        delta: &mut PreparedDelta,
        event: &InteractionEvent,
        entities: Vec<RawEntity>,
        relations: Vec<RawRelation>,
        sentiment: SentimentReading,
        temporal: Vec<TemporalReading>,
        suspects: &HashSet<String>,
    ) {
        for entity in &entities {
            let kind = NodeKind::parse_name(&entity.kind);
            let privacy = match kind {
                NodeKind::Person => PrivacyLevel::Personal,
                _ => PrivacyLevel::default(),
            };
            delta.nodes.push(ProposedNode {
                input: NodeInput {
                    kind,
                    name: entity.name.clone(),
                    aliases: vec![],
                    properties: if entity.properties.is_object() {
                        entity.properties.clone()
                    } else {
                        serde_json::json!({})
                    },
                    privacy,
                },
            });
        }

        for (index, relation) in relations.into_iter().enumerate() {
            if relation.retract {
                delta.retractions.push(ProposedRetraction {
                    source_name: relation.source,
                    relation: if relation.relation.is_empty() { None } else { Some(relation.relation) },
                    target_name: if relation.target.is_empty() { None } else { Some(relation.target) },
                    reason: "user asked to forget".to_string(),
                });
                continue;
            }

            let mechanism = Provenance::parse_name(&relation.mechanism);
            let mut conf =
                confidence::initial(&self.confidence, mechanism, sentiment.hedge, sentiment.magnitude);

            if relation.sarcasm {
                conf *= 0.7;
            }
            if relation.secondhand {
                conf *= 0.8;
            }
            if relation.attribution_uncertain {
                conf = conf.min(0.50);
            }
            if relation.hypothetical {
                conf = conf.min(0.20);
            }
            if suspects.contains(&fold_name(&relation.source))
                || suspects.contains(&fold_name(&relation.target))
            {
                conf *= 0.5;
            }
            if self.config.stt_scaling {
                if let Some(stt) = event.stt_confidence {
                    conf *= stt.clamp(0.0, 1.0);
                }
            }
            conf = confidence::clamp(&self.confidence, conf);

            let reading = temporal.get(index).copied().unwrap_or_default();
            delta.edges.push(ProposedEdge {
                source_name: relation.source.clone(),
                target_name: relation.target.clone(),
                relation: relation.relation.clone(),
                confidence: conf,
                temporal_type: reading.temporal_type,
                provenance: mechanism,
                context_tags: context_tags_for(&relation.relation, &relation.target),
                expiry: reading.expiry,
                refines: relation.refines.as_ref().map(|r| RefinesHint {
                    relation: r.relation.clone(),
                    target_name: r.target.clone(),
                }),
                secondhand: relation.secondhand,
                hypothetical: relation.hypothetical,
                attribution_uncertain: relation.attribution_uncertain,
            });

            // "John thinks X and I agree" — a parallel first-person edge
            // at full explicit confidence.
            if relation.secondhand && relation.user_agrees {
                let user_conf = confidence::initial(
                    &self.confidence,
                    Provenance::Explicit,
                    sentiment.hedge,
                    sentiment.magnitude,
                );
                delta.edges.push(ProposedEdge {
                    source_name: "User".to_string(),
                    target_name: relation.target.clone(),
                    relation: relation.relation.clone(),
                    confidence: confidence::clamp(&self.confidence, user_conf),
                    temporal_type: reading.temporal_type,
                    provenance: Provenance::Explicit,
                    context_tags: context_tags_for(&relation.relation, &relation.target),
                    expiry: reading.expiry,
                    refines: None,
                    secondhand: false,
                    hypothetical: false,
                    attribution_uncertain: false,
                });
            }
        }

        if delta.is_empty() {
            delta.skipped = true;
            delta.skip_reason = Some("nothing_extracted".to_string());
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// One retry with reduced context on timeout; other errors map to a
    /// stage tag.
    async fn call_with_retry(&self, system: &str, user: &str) -> std::result::Result<String, String> {
        match self.llm.complete(system, user).await {
            Ok(text) => Ok(text),
            Err(LlmError::Timeout(_)) => {
                let reduced: String = user.chars().take(user.chars().count() / 2).collect();
                debug!("LLM timeout, retrying with reduced context");
                self.llm
                    .complete(system, &reduced)
                    .await
                    .map_err(|e| tag_for_error(&e))
            }
            Err(e) => Err(tag_for_error(&e)),
        }
    }

    fn known_entities(&self, session_id: &str, hint: &[String]) -> HashSet<String> {
        let mut cache = self.session_entities.lock().expect("session cache lock");
        let mut known: HashSet<String> =
            cache.get(session_id).cloned().unwrap_or_default();
        known.extend(hint.iter().map(|h| fold_name(h)));
        known
    }

    fn remember_entities(&self, session_id: &str, delta: &PreparedDelta) {
        let mut cache = self.session_entities.lock().expect("session cache lock");
        let entry = cache.get_or_insert_mut(session_id.to_string(), HashSet::new);
        for node in &delta.nodes {
            entry.insert(fold_name(&node.input.name));
        }
    }
}

/// Episode ids are derived from the idempotency key so reprocessing the
/// same event reuses the same episode.
fn episode_id_for(event: &InteractionEvent) -> String {
    let namespace = Uuid::NAMESPACE_OID;
    let name = format!("{}:{}", event.session_id, event.turn_number);
    Uuid::new_v5(&namespace, name.as_bytes()).to_string()
}

fn tag_for_error(error: &LlmError) -> String {
    match error {
        LlmError::BudgetExhausted => "llm_budget_exhausted".to_string(),
        LlmError::CircuitOpen(_) => "llm_circuit_open".to_string(),
        LlmError::Timeout(_) => "llm_timeout".to_string(),
        _ => "llm_error".to_string(),
    }
}

fn fold_contains(haystack: &str, needle: &str) -> bool {
    fold_name(haystack).contains(&fold_name(needle))
}

/// Coarse context tags so probes can be matched to topics later.
fn context_tags_for(relation: &str, target: &str) -> Vec<String> {
    let mut tags = vec![relation.to_string()];
    let folded = fold_name(target);
    if !folded.is_empty() {
        if let Some(first_word) = folded.split_whitespace().next() {
            tags.push(first_word.to_string());
        }
    }
    tags
}

// ============================================================================
// STAGE 1 — PREPROCESS
// ============================================================================

fn preprocess(text: &str) -> Preprocessed {
    let mut tags = Vec::new();

    // Drop fenced code blocks entirely; code is not conversational fact.
    let without_code = strip_fenced_blocks(text);
    if without_code.trim().is_empty() && !text.trim().is_empty() {
        return Preprocessed {
            cleaned: String::new(),
            tags: vec!["code_only".to_string()],
            skip_reason: Some("code_only"),
        };
    }

    // Normalize whitespace.
    let mut cleaned = without_code.split_whitespace().collect::<Vec<_>>().join(" ");

    // Sanitize extraction-directive injection.
    let folded = cleaned.to_lowercase();
    for prefix in prompts::DIRECTIVE_PREFIXES {
        if folded.starts_with(prefix) {
            cleaned = cleaned[prefix.len()..].to_string();
            tags.push("directive_stripped".to_string());
            break;
        }
    }

    if cleaned.trim().is_empty() {
        return Preprocessed { cleaned, tags, skip_reason: Some("empty_utterance") };
    }
    if cleaned.chars().all(|c| !c.is_alphanumeric()) {
        return Preprocessed { cleaned, tags, skip_reason: Some("punctuation_only") };
    }

    Preprocessed { cleaned, tags, skip_reason: None }
}

fn strip_fenced_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::llm::MockLanguageModel;
    use serde_json::json;

    fn pipeline_with(mock: Arc<MockLanguageModel>) -> ExtractionPipeline {
        ExtractionPipeline::new(
            Arc::new(LlmCapability::small(mock)),
            ConfidenceParams::default(),
            ExtractionConfig::default(),
        )
    }

    fn event(text: &str) -> InteractionEvent {
        InteractionEvent::new("s1", 1, text)
    }

    fn neutral_sentiment(mock: &MockLanguageModel, marker: &str) {
        mock.respond_when(
            "sentiment",
            marker,
            json!({"hedge": "none", "polarity": 0.0, "magnitude": 0.0}),
        );
    }

    // ------------------------------------------------------------------
    // Preprocess
    // ------------------------------------------------------------------

    #[test]
    fn test_preprocess_strips_directives() {
        let pre = preprocess("Remember that my wife loves Malbec");
        assert_eq!(pre.cleaned, "my wife loves Malbec");
        assert!(pre.tags.contains(&"directive_stripped".to_string()));
        assert!(pre.skip_reason.is_none());
    }

    #[test]
    fn test_preprocess_skips_empty_and_punctuation() {
        assert_eq!(preprocess("").skip_reason, Some("empty_utterance"));
        assert_eq!(preprocess("   \n ").skip_reason, Some("empty_utterance"));
        assert_eq!(preprocess("?!... !!").skip_reason, Some("punctuation_only"));
    }

    #[test]
    fn test_preprocess_skips_code_only() {
        let pre = preprocess("```rust\nfn main() {}\n```");
        assert_eq!(pre.skip_reason, Some("code_only"));
    }

    #[test]
    fn test_preprocess_removes_code_keeps_prose() {
        let pre = preprocess("I fixed it with\n```\nlet x = 1;\n```\nand Lena approved");
        assert!(pre.cleaned.contains("Lena approved"));
        assert!(!pre.cleaned.contains("let x"));
    }

    // ------------------------------------------------------------------
    // Full pipeline with mock LLM
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_extracts_entities_and_relations() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "lena loves malbec",
            json!({"entities": [
                {"name": "Lena", "kind": "person", "isNew": true, "properties": {}},
                {"name": "Malbec", "kind": "concept", "isNew": true, "properties": {}}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "lena loves malbec",
            json!({"relations": [
                {"source": "User", "target": "Lena", "relation": "married_to", "mechanism": "explicit"},
                {"source": "Lena", "target": "Malbec", "relation": "loves", "mechanism": "explicit"}
            ]}),
        );
        neutral_sentiment(&mock, "lena loves malbec");
        mock.respond_when(
            "temporal scope",
            "lena loves malbec",
            json!({"relations": [
                {"index": 0, "temporalType": "trait", "expiry": null},
                {"index": 1, "temporalType": "trait", "expiry": null}
            ]}),
        );

        let pipeline = pipeline_with(mock);
        let delta = pipeline
            .extract(&event("My wife Lena loves Malbec"), ContextWindow::Full)
            .await;

        assert!(!delta.skipped);
        assert_eq!(delta.nodes.len(), 2);
        assert_eq!(delta.edges.len(), 2);
        let loves = delta.edges.iter().find(|e| e.relation == "loves").unwrap();
        assert!((loves.confidence - 0.90).abs() < 1e-9);
        assert_eq!(loves.temporal_type, TemporalType::Trait);
    }

    #[tokio::test]
    async fn test_empty_utterance_skips_without_llm_calls() {
        let mock = Arc::new(MockLanguageModel::new());
        let pipeline = pipeline_with(Arc::clone(&mock));
        let delta = pipeline.extract(&event("!!!"), ContextWindow::Full).await;
        assert!(delta.skipped);
        assert_eq!(delta.skip_reason.as_deref(), Some("punctuation_only"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stt_below_floor_skips() {
        let mock = Arc::new(MockLanguageModel::new());
        let pipeline = pipeline_with(Arc::clone(&mock));
        let mut ev = event("barely audible mumbling");
        ev.stt_confidence = Some(0.2);
        let delta = pipeline.extract(&ev, ContextWindow::Full).await;
        assert!(delta.skipped);
        assert_eq!(delta.skip_reason.as_deref(), Some("stt_below_floor"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_stt_scales_confidence_linearly() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "jazz",
            json!({"entities": [{"name": "jazz", "kind": "concept", "isNew": true}]}),
        );
        mock.respond_when(
            "relation extraction",
            "jazz",
            json!({"relations": [
                {"source": "User", "target": "jazz", "relation": "likes", "mechanism": "explicit"}
            ]}),
        );
        neutral_sentiment(&mock, "jazz");

        let pipeline = pipeline_with(mock);
        let mut ev = event("I like jazz");
        ev.stt_confidence = Some(0.8);
        let delta = pipeline.extract(&ev, ContextWindow::Full).await;
        let edge = &delta.edges[0];
        assert!((edge.confidence - 0.9 * 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hallucinated_entity_is_dropped() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "the weather",
            json!({"entities": [
                {"name": "Boris", "kind": "person", "isNew": true},
                {"name": "weather", "kind": "concept", "isNew": true}
            ]}),
        );
        neutral_sentiment(&mock, "the weather");

        let pipeline = pipeline_with(mock);
        let delta = pipeline
            .extract(&event("Nice the weather today"), ContextWindow::Full)
            .await;

        assert!(delta.tags.contains(&"hallucination_warnings".to_string()));
        assert!(!delta.nodes.iter().any(|n| n.input.name == "Boris"));
        assert!(delta.nodes.iter().any(|n| n.input.name == "weather"));
    }

    #[tokio::test]
    async fn test_three_warnings_discard_stage() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "hello there",
            json!({"entities": [
                {"name": "Boris", "kind": "person", "isNew": true},
                {"name": "Natasha", "kind": "person", "isNew": true},
                {"name": "Moose", "kind": "person", "isNew": true},
                {"name": "Squirrel", "kind": "person", "isNew": true}
            ]}),
        );
        neutral_sentiment(&mock, "hello there");

        let pipeline = pipeline_with(mock);
        let delta = pipeline.extract(&event("hello there"), ContextWindow::Full).await;

        assert!(delta.tags.contains(&"hallucination_discarded".to_string()));
        assert!(delta.nodes.is_empty());
        assert_eq!(pipeline.hallucination_count(), 1);
        assert!(delta.skipped);
    }

    #[tokio::test]
    async fn test_hedged_statement_reduces_confidence() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "rust",
            json!({"entities": [{"name": "Rust", "kind": "tool", "isNew": true}]}),
        );
        mock.respond_when(
            "relation extraction",
            "rust",
            json!({"relations": [
                {"source": "User", "target": "Rust", "relation": "interested_in", "mechanism": "explicit"}
            ]}),
        );
        mock.respond_when(
            "sentiment",
            "rust",
            json!({"hedge": "strong", "polarity": 0.2, "magnitude": 0.0}),
        );

        let pipeline = pipeline_with(mock);
        let delta = pipeline
            .extract(&event("I might possibly try Rust"), ContextWindow::Full)
            .await;
        assert!((delta.edges[0].confidence - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_hypothetical_capped_at_weak_interest() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "sailboat",
            json!({"entities": [{"name": "sailboat", "kind": "concept", "isNew": true}]}),
        );
        mock.respond_when(
            "relation extraction",
            "sailboat",
            json!({"relations": [
                {"source": "User", "target": "sailboat", "relation": "interested_in",
                 "mechanism": "explicit", "hypothetical": true}
            ]}),
        );
        neutral_sentiment(&mock, "sailboat");

        let pipeline = pipeline_with(mock);
        let delta = pipeline
            .extract(&event("If I were rich I would buy a sailboat"), ContextWindow::Full)
            .await;
        assert!(delta.edges[0].confidence <= 0.20);
        assert!(delta.edges[0].hypothetical);
    }

    #[tokio::test]
    async fn test_secondhand_with_agreement_adds_user_edge() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "john",
            json!({"entities": [
                {"name": "John", "kind": "person", "isNew": true},
                {"name": "Rust", "kind": "tool", "isNew": true}
            ]}),
        );
        mock.respond_when(
            "relation extraction",
            "john",
            json!({"relations": [
                {"source": "John", "target": "Rust", "relation": "likes", "mechanism": "explicit",
                 "secondhand": true, "userAgrees": true}
            ]}),
        );
        neutral_sentiment(&mock, "john");

        let pipeline = pipeline_with(mock);
        let delta = pipeline
            .extract(&event("John thinks Rust is great and I agree"), ContextWindow::Full)
            .await;

        assert_eq!(delta.edges.len(), 2);
        let john_edge = delta.edges.iter().find(|e| e.source_name == "John").unwrap();
        assert!(john_edge.secondhand);
        assert!((john_edge.confidence - 0.9 * 0.8).abs() < 1e-9);
        let user_edge = delta.edges.iter().find(|e| e.source_name == "User").unwrap();
        assert!(!user_edge.secondhand);
        assert!((user_edge.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_retraction_becomes_retraction_op() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_when(
            "knowledge extraction",
            "forget",
            json!({"entities": []}),
        );
        mock.respond_when(
            "relation extraction",
            "forget",
            json!({"relations": [
                {"source": "User", "target": "Chardonnay", "relation": "likes", "retract": true}
            ]}),
        );
        neutral_sentiment(&mock, "forget");

        let pipeline = pipeline_with(mock);
        let delta = pipeline
            .extract(&event("Please forget what I said about Chardonnay"), ContextWindow::Full)
            .await;
        assert_eq!(delta.retractions.len(), 1);
        assert_eq!(delta.retractions[0].target_name.as_deref(), Some("Chardonnay"));
        assert!(delta.edges.is_empty());
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_tagged_empty_delta() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.fail_next(10);
        let pipeline = pipeline_with(mock);
        let delta = pipeline.extract(&event("My wife Lena loves Malbec"), ContextWindow::Full).await;
        assert!(delta.skipped);
        assert!(delta.tags.iter().any(|t| t.starts_with("llm_")));
    }

    #[tokio::test]
    async fn test_repairable_json_is_accepted() {
        let mock = Arc::new(MockLanguageModel::new());
        mock.respond_raw(
            "knowledge extraction",
            "tea",
            "```json\n{\"entities\": [{\"name\": \"tea\", \"kind\": \"concept\", \"isNew\": true},]}\n```",
        );
        mock.respond_when(
            "relation extraction",
            "tea",
            json!({"relations": [
                {"source": "User", "target": "tea", "relation": "likes", "mechanism": "explicit"}
            ]}),
        );
        neutral_sentiment(&mock, "tea");

        let pipeline = pipeline_with(mock);
        let delta = pipeline.extract(&event("I do like tea"), ContextWindow::Full).await;
        assert_eq!(delta.nodes.len(), 1);
        assert_eq!(delta.edges.len(), 1);
    }

    #[test]
    fn test_episode_id_is_stable_per_key() {
        let a = episode_id_for(&event("one"));
        let b = episode_id_for(&event("two"));
        assert_eq!(a, b); // same session and turn

        let other = episode_id_for(&InteractionEvent::new("s1", 2, "x"));
        assert_ne!(a, other);
    }
}
