//! Resilience primitives — retry policy and circuit breaker.
//!
//! Every external capability (LLM tiers, fact verifier, store when
//! remote) is wrapped in a breaker: closed until N failures inside a
//! rolling window, then open for a cooldown, then half-open with a
//! single probe call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rand::random;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Delay before the given retry attempt (0-based), with jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = base * jitter_factor;
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failures inside the window before the circuit opens
    pub failure_threshold: u32,
    /// Rolling failure-counting window
    pub window: Duration,
    /// How long the circuit stays open before a half-open probe
    pub cooldown: Duration,
}

impl CircuitConfig {
    pub fn new(failure_threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self { failure_threshold, window, cooldown }
    }

    /// Small-LLM default: 3 failures / 60 s window / 15 s cooldown
    pub fn llm_small() -> Self {
        Self::new(3, Duration::from_secs(60), Duration::from_secs(15))
    }

    /// Large-LLM default: 2 failures / 60 s window / 60 s cooldown
    pub fn llm_large() -> Self {
        Self::new(2, Duration::from_secs(60), Duration::from_secs(60))
    }

    /// Store default: 5 failures / 60 s window / 30 s cooldown
    pub fn store() -> Self {
        Self::new(5, Duration::from_secs(60), Duration::from_secs(30))
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60), Duration::from_secs(30))
    }
}

/// Externally visible breaker state for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum InnerState {
    Closed { window_start: Instant },
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    name: &'static str,
    state: RwLock<InnerState>,
    config: CircuitConfig,
    failure_count: AtomicU32,
}

#[derive(Debug, Error)]
pub enum CircuitError<E: std::error::Error> {
    #[error("circuit '{name}' open, retry after {retry_after:?}")]
    Open { name: &'static str, retry_after: Duration },
    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        Self {
            name,
            state: RwLock::new(InnerState::Closed { window_start: Instant::now() }),
            config,
            failure_count: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run an operation through the breaker.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        match self.check_state().await {
            InnerState::Open { until } => {
                return Err(CircuitError::Open {
                    name: self.name,
                    retry_after: until.saturating_duration_since(Instant::now()),
                });
            }
            InnerState::Closed { .. } | InnerState::HalfOpen => {}
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(_) => self.record_failure().await,
        }
        result.map_err(CircuitError::Inner)
    }

    /// Current state for health reporting.
    pub async fn state(&self) -> BreakerState {
        match self.check_state().await {
            InnerState::Closed { .. } => BreakerState::Closed,
            InnerState::Open { .. } => BreakerState::Open,
            InnerState::HalfOpen => BreakerState::HalfOpen,
        }
    }

    async fn check_state(&self) -> InnerState {
        let mut state = self.state.write().await;
        match *state {
            InnerState::Open { until } if Instant::now() >= until => {
                *state = InnerState::HalfOpen;
                tracing::info!(circuit = self.name, "circuit half-open, probing");
            }
            InnerState::Closed { window_start }
                if window_start.elapsed() > self.config.window =>
            {
                // Rolling window elapsed: forget stale failures.
                *state = InnerState::Closed { window_start: Instant::now() };
                self.failure_count.store(0, Ordering::SeqCst);
            }
            _ => {}
        }
        *state
    }

    async fn record_success(&self) {
        let mut state = self.state.write().await;
        if matches!(*state, InnerState::HalfOpen) {
            tracing::info!(circuit = self.name, "circuit closed after successful probe");
        }
        *state = InnerState::Closed { window_start: Instant::now() };
        self.failure_count.store(0, Ordering::SeqCst);
    }

    async fn record_failure(&self) {
        let mut state = self.state.write().await;
        match *state {
            InnerState::Closed { .. } => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    let until = Instant::now() + self.config.cooldown;
                    *state = InnerState::Open { until };
                    tracing::warn!(circuit = self.name, failures, "circuit opened");
                }
            }
            InnerState::HalfOpen => {
                let until = Instant::now() + self.config.cooldown;
                *state = InnerState::Open { until };
                tracing::warn!(circuit = self.name, "probe failed, circuit re-opened");
            }
            InnerState::Open { .. } => {}
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("test failure")]
    struct TestError;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<TestError>> {
        breaker.call(|| async { Err::<(), _>(TestError) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<TestError>> {
        breaker.call(|| async { Ok::<(), TestError>(()) }).await
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitConfig::new(2, Duration::from_secs(60), Duration::from_secs(60)),
        );
        assert_eq!(breaker.state().await, BreakerState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        // Calls are rejected without running while open
        let err = succeed(&breaker).await.unwrap_err();
        assert!(matches!(err, CircuitError::Open { .. }));
    }

    #[tokio::test]
    async fn test_breaker_half_open_then_closes_on_success() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitConfig::new(1, Duration::from_secs(60), Duration::from_millis(10)),
        );
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_reopens_on_failed_probe() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitConfig::new(1, Duration::from_secs(60), Duration::from_millis(10)),
        );
        let _ = fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitConfig::new(2, Duration::from_secs(60), Duration::from_secs(60)),
        );
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        // One failure after the reset is below the threshold of two
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_default_configs_match_policy() {
        assert_eq!(CircuitConfig::llm_small().failure_threshold, 3);
        assert_eq!(CircuitConfig::llm_large().failure_threshold, 2);
        assert_eq!(CircuitConfig::store().failure_threshold, 5);
        assert_eq!(CircuitConfig::llm_small().cooldown, Duration::from_secs(15));
    }
}
