//! Language-model capability — the only coupling the pipeline has to a
//! provider is "given a prompt, receive text".
//!
//! Two tiers: a small model for extraction and query planning, a large
//! one for probe synthesis and the inference cycle. Each tier is wrapped
//! in a timeout, a circuit breaker, and a daily token budget; JSON
//! repair and hallucination detection live in the pipeline, not here.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resilience::{BreakerState, CircuitBreaker, CircuitConfig, CircuitError};

// ============================================================================
// ERRORS
// ============================================================================

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM transport error: {0}")]
    Transport(String),
    #[error("LLM provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("daily token budget exhausted")]
    BudgetExhausted,
    #[error("circuit open, retry after {0:?}")]
    CircuitOpen(Duration),
}

pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// CAPABILITY TRAIT
// ============================================================================

/// The provider-facing contract. Implementations must be cheap to share.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send a system prompt and a user message, return the raw text
    /// response (expected but not guaranteed to be JSON).
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Provider label for logging and health reports.
    fn model_name(&self) -> &str;
}

// ============================================================================
// MOCK MODEL (tests and offline mode)
// ============================================================================

/// Deterministic mock. Responses are registered against a (system-prompt
/// marker, message substring) pair so each pipeline stage can be scripted
/// independently.
#[derive(Default)]
pub struct MockLanguageModel {
    responses: Mutex<Vec<(String, String, String)>>,
    call_count: AtomicU32,
    fail_next: AtomicU32,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canned response for calls whose system prompt contains
    /// `system_contains` and whose user message contains `message_contains`
    /// (both case-insensitive).
    pub fn respond_when(
        &self,
        system_contains: &str,
        message_contains: &str,
        response: serde_json::Value,
    ) {
        self.responses.lock().expect("mock lock").push((
            system_contains.to_lowercase(),
            message_contains.to_lowercase(),
            response.to_string(),
        ));
    }

    /// Register a raw (non-JSON) response, for repair-path tests.
    pub fn respond_raw(&self, system_contains: &str, message_contains: &str, raw: &str) {
        self.responses.lock().expect("mock lock").push((
            system_contains.to_lowercase(),
            message_contains.to_lowercase(),
            raw.to_string(),
        ));
    }

    /// Make the next N calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(LlmError::Transport("mock failure".to_string()));
        }

        let system_lower = system.to_lowercase();
        let user_lower = user.to_lowercase();
        let responses = self.responses.lock().expect("mock lock");
        for (system_marker, message_marker, response) in responses.iter() {
            if system_lower.contains(system_marker) && user_lower.contains(message_marker) {
                debug!(marker = %message_marker, "mock LLM matched");
                return Ok(response.clone());
            }
        }
        debug!("mock LLM: no match, returning empty extraction");
        Ok(json!({"entities": [], "relations": []}).to_string())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// ANTHROPIC MODEL
// ============================================================================

/// Messages-API client. Retries on 429/5xx are the caller's concern; the
/// capability wrapper already applies timeout + breaker.
pub struct AnthropicModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 1024,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": user}],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { status: status.as_u16(), message });
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| LlmError::Transport(e.to_string()))?;
        let text = payload["content"][0]["text"].as_str().unwrap_or_default().to_string();
        info!(
            model = %self.model,
            input_tokens = payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens = payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
            "completion received"
        );
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// TOKEN BUDGET
// ============================================================================

/// Rough per-day token accounting (4 chars ≈ 1 token). When exhausted,
/// callers degrade: extraction re-queues, inference skips its cycle.
pub struct TokenBudget {
    daily_limit: u64,
    spent: AtomicU64,
    day: Mutex<NaiveDate>,
}

impl TokenBudget {
    pub fn new(daily_limit: u64) -> Self {
        Self {
            daily_limit,
            spent: AtomicU64::new(0),
            day: Mutex::new(Utc::now().date_naive()),
        }
    }

    pub fn estimate_tokens(text: &str) -> u64 {
        (text.len() as u64).div_ceil(4)
    }

    /// Reserve an estimated spend; fails when the day's budget is gone.
    pub fn try_consume(&self, tokens: u64) -> bool {
        let today = Utc::now().date_naive();
        {
            let mut day = self.day.lock().expect("budget lock");
            if *day != today {
                *day = today;
                self.spent.store(0, Ordering::SeqCst);
            }
        }
        let spent = self.spent.fetch_add(tokens, Ordering::SeqCst) + tokens;
        if spent > self.daily_limit {
            self.spent.fetch_sub(tokens, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn spent_today(&self) -> u64 {
        self.spent.load(Ordering::SeqCst)
    }
}

// ============================================================================
// GUARDED CAPABILITY
// ============================================================================

/// An LLM tier with its timeout, breaker, and budget.
pub struct LlmCapability {
    model: std::sync::Arc<dyn LanguageModel>,
    breaker: CircuitBreaker,
    budget: TokenBudget,
    timeout: Duration,
}

impl LlmCapability {
    pub fn new(
        model: std::sync::Arc<dyn LanguageModel>,
        breaker_config: CircuitConfig,
        breaker_name: &'static str,
        timeout: Duration,
        daily_token_budget: u64,
    ) -> Self {
        Self {
            model,
            breaker: CircuitBreaker::new(breaker_name, breaker_config),
            budget: TokenBudget::new(daily_token_budget),
            timeout,
        }
    }

    /// Small-tier defaults (extraction, planning).
    pub fn small(model: std::sync::Arc<dyn LanguageModel>) -> Self {
        Self::new(model, CircuitConfig::llm_small(), "llm-small", Duration::from_secs(20), 500_000)
    }

    /// Large-tier defaults (synthesis, inference).
    pub fn large(model: std::sync::Arc<dyn LanguageModel>) -> Self {
        Self::new(model, CircuitConfig::llm_large(), "llm-large", Duration::from_secs(45), 200_000)
    }

    /// Complete through budget, breaker, and timeout.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let estimate = TokenBudget::estimate_tokens(system) + TokenBudget::estimate_tokens(user);
        if !self.budget.try_consume(estimate) {
            warn!(breaker = self.breaker.name(), "token budget exhausted");
            return Err(LlmError::BudgetExhausted);
        }

        let timeout = self.timeout;
        let model = std::sync::Arc::clone(&self.model);
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, model.complete(system, user)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout(timeout)),
                }
            })
            .await;

        match result {
            Ok(text) => Ok(text),
            Err(CircuitError::Open { retry_after, .. }) => Err(LlmError::CircuitOpen(retry_after)),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.state().await
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn tokens_spent_today(&self) -> u64 {
        self.budget.spent_today()
    }
}

// ============================================================================
// TESTS
// ============================================================================
