//! Circuit breaker for the provider endpoint.
//!
//! Tracks failures and successes, transitioning between states:
//! - Closed: normal operation, requests allowed
//! - Open: too many failures, requests fail fast at zero cost
//! - HalfOpen: cooldown elapsed, a limited number of trial calls probe
//!   whether the provider recovered
//!
//! The Open→HalfOpen transition is evaluated lazily on the next admission
//! check; there is no background timer.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are blocked until the cooldown elapses
    Open,
    /// Trial calls are probing for recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker thresholds and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit
    pub failure_threshold: u32,
    /// Successes in HalfOpen required to close again
    pub success_threshold: u32,
    /// How long the circuit stays Open before admitting trial calls
    pub cooldown: Duration,
    /// Trial calls admitted while HalfOpen
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker guarding one provider endpoint.
///
/// Shared mutable state: all transitions happen under one mutex so
/// concurrent callers never observe torn state.
pub struct CircuitBreaker {
    endpoint: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                opened_at: None,
                last_transition: Utc::now(),
            }),
        }
    }

    /// Current state, after applying any due cooldown transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.check_cooldown(&mut inner);
        inner.state
    }

    /// Whether a request may go out right now.
    ///
    /// In HalfOpen this consumes one of the trial slots.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.check_cooldown(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful provider call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(
                        endpoint = %self.endpoint,
                        successes = inner.success_count,
                        "Circuit breaker closing after successful recovery"
                    );
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                // A success can land here when a call admitted before the
                // circuit opened completes late; it carries no signal.
            }
        }
    }

    /// Record a failed provider call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        endpoint = %self.endpoint,
                        failures = inner.failure_count,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // No partial credit: one trial failure re-opens the circuit
                warn!(
                    endpoint = %self.endpoint,
                    "Circuit breaker re-opening after half-open failure"
                );
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Snapshot for observability
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock().unwrap();
        self.check_cooldown(&mut inner);
        CircuitBreakerStats {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_transition: inner.last_transition,
        }
    }

    fn check_cooldown(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(opened_at) = inner.opened_at else {
            return;
        };

        if opened_at.elapsed() >= self.config.cooldown {
            info!(
                endpoint = %self.endpoint,
                "Circuit breaker transitioning to half-open after cooldown"
            );
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        inner.state = new_state;
        inner.last_transition = Utc::now();

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.success_count = 0;
                inner.half_open_calls = 0;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_calls = 0;
            }
        }
    }
}

/// Statistics for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }

    #[tokio::test]
    async fn closed_to_open_at_threshold() {
        let breaker = CircuitBreaker::new("provider", test_config());

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test]
    async fn success_resets_closed_failure_count() {
        let breaker = CircuitBreaker::new("provider", test_config());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_admits_exactly_one_trial_call() {
        let breaker = CircuitBreaker::new("provider", test_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // t+10s: still open, fail fast
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!breaker.allow_request());

        // t+31s: half-open, exactly one trial admitted
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_request());

        // trial success closes the circuit
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("provider", test_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }
}
