//! Quota enforcement for the provider endpoint.
//!
//! Four rolling-window buckets: requests/minute, tokens/minute, cost/hour,
//! cost/day. Windows reset lazily: usage is pruned on every check, never by
//! a background timer, so there is no drift between a timer and the clock
//! the checks read.
//!
//! Admission is checked with the caller's estimates before the provider is
//! called; the request slot is consumed at admission, while token and cost
//! usage are recorded from response actuals after a successful call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

/// Which bucket rejected an admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBucketKind {
    RequestsPerMinute,
    TokensPerMinute,
    CostPerHour,
    CostPerDay,
}

impl std::fmt::Display for QuotaBucketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QuotaBucketKind::RequestsPerMinute => "requests_per_minute",
            QuotaBucketKind::TokensPerMinute => "tokens_per_minute",
            QuotaBucketKind::CostPerHour => "cost_per_hour",
            QuotaBucketKind::CostPerDay => "cost_per_day",
        };
        write!(f, "{}", name)
    }
}

/// Externally supplied limits with conservative defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub cost_cents_per_hour: u64,
    pub cost_cents_per_day: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            tokens_per_minute: 60_000,
            cost_cents_per_hour: 500,
            cost_cents_per_day: 2_000,
        }
    }
}

/// One rolling window of usage events
struct Window {
    limit: u64,
    span: Duration,
    events: VecDeque<(Instant, u64)>,
    used: u64,
}

impl Window {
    fn new(limit: u64, span: Duration) -> Self {
        Self {
            limit,
            span,
            events: VecDeque::new(),
            used: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(stamp, amount)) = self.events.front() {
            if now.duration_since(stamp) < self.span {
                break;
            }
            self.events.pop_front();
            self.used -= amount;
        }
    }

    fn would_exceed(&self, amount: u64) -> bool {
        self.used + amount > self.limit
    }

    fn record(&mut self, now: Instant, amount: u64) {
        if amount == 0 {
            return;
        }
        self.events.push_back((now, amount));
        self.used += amount;
    }
}

struct Buckets {
    requests: Window,
    tokens: Window,
    cost_hour: Window,
    cost_day: Window,
}

/// Point-in-time usage snapshot for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub requests_in_window: u64,
    pub tokens_in_window: u64,
    pub cost_cents_this_hour: u64,
    pub cost_cents_this_day: u64,
}

/// Per-endpoint quota state.
///
/// Shared mutable state: one mutex guards all four windows so an admission
/// check sees a consistent picture.
pub struct QuotaManager {
    inner: Mutex<Buckets>,
}

impl QuotaManager {
    pub fn new(config: &QuotaConfig) -> Self {
        Self {
            inner: Mutex::new(Buckets {
                requests: Window::new(config.requests_per_minute, Duration::from_secs(60)),
                tokens: Window::new(config.tokens_per_minute, Duration::from_secs(60)),
                cost_hour: Window::new(config.cost_cents_per_hour, Duration::from_secs(3_600)),
                cost_day: Window::new(config.cost_cents_per_day, Duration::from_secs(86_400)),
            }),
        }
    }

    /// Admit one request with the given estimates, consuming a request slot.
    ///
    /// Rejection leaves every bucket untouched; the provider is never called
    /// for a rejected request.
    pub fn admit(
        &self,
        estimated_tokens: u64,
        estimated_cost_cents: u64,
    ) -> Result<(), QuotaBucketKind> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        inner.requests.prune(now);
        inner.tokens.prune(now);
        inner.cost_hour.prune(now);
        inner.cost_day.prune(now);

        let exceeded = if inner.requests.would_exceed(1) {
            Some(QuotaBucketKind::RequestsPerMinute)
        } else if inner.tokens.would_exceed(estimated_tokens) {
            Some(QuotaBucketKind::TokensPerMinute)
        } else if inner.cost_hour.would_exceed(estimated_cost_cents) {
            Some(QuotaBucketKind::CostPerHour)
        } else if inner.cost_day.would_exceed(estimated_cost_cents) {
            Some(QuotaBucketKind::CostPerDay)
        } else {
            None
        };

        if let Some(bucket) = exceeded {
            warn!(%bucket, "Quota admission rejected");
            return Err(bucket);
        }

        inner.requests.record(now, 1);
        Ok(())
    }

    /// Record actual usage from a successful provider response
    pub fn record_usage(&self, tokens: u64, cost_cents: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.record(now, tokens);
        inner.cost_hour.record(now, cost_cents);
        inner.cost_day.record(now, cost_cents);
    }

    /// Current usage after pruning expired events
    pub fn usage(&self) -> QuotaUsage {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.requests.prune(now);
        inner.tokens.prune(now);
        inner.cost_hour.prune(now);
        inner.cost_day.prune(now);

        QuotaUsage {
            requests_in_window: inner.requests.used,
            tokens_in_window: inner.tokens.used,
            cost_cents_this_hour: inner.cost_hour.used,
            cost_cents_this_day: inner.cost_day.used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_rpm(rpm: u64) -> QuotaConfig {
        QuotaConfig {
            requests_per_minute: rpm,
            ..QuotaConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_window_rejects_the_eleventh_call() {
        let quota = QuotaManager::new(&config_with_rpm(10));

        for _ in 0..10 {
            assert!(quota.admit(0, 0).is_ok());
        }
        assert_eq!(quota.admit(0, 0), Err(QuotaBucketKind::RequestsPerMinute));

        // after the window rolls, calls succeed again
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(quota.admit(0, 0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn token_budget_gates_on_estimates() {
        let quota = QuotaManager::new(&QuotaConfig {
            tokens_per_minute: 1_000,
            ..QuotaConfig::default()
        });

        assert!(quota.admit(600, 0).is_ok());
        quota.record_usage(600, 0);

        assert_eq!(quota.admit(500, 0), Err(QuotaBucketKind::TokensPerMinute));
        assert!(quota.admit(300, 0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cost_budgets_span_hour_and_day() {
        let quota = QuotaManager::new(&QuotaConfig {
            requests_per_minute: 1_000,
            tokens_per_minute: 1_000_000,
            cost_cents_per_hour: 100,
            cost_cents_per_day: 150,
        });

        assert!(quota.admit(0, 90).is_ok());
        quota.record_usage(0, 90);
        assert_eq!(quota.admit(0, 20), Err(QuotaBucketKind::CostPerHour));

        // hour window rolls; the day budget still has 60 cents left
        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert!(quota.admit(0, 50).is_ok());
        quota.record_usage(0, 50);
        assert_eq!(quota.admit(0, 20), Err(QuotaBucketKind::CostPerDay));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_consumes_nothing() {
        let quota = QuotaManager::new(&config_with_rpm(1));

        assert!(quota.admit(0, 0).is_ok());
        assert!(quota.admit(0, 0).is_err());
        assert!(quota.admit(0, 0).is_err());

        let usage = quota.usage();
        assert_eq!(usage.requests_in_window, 1);
    }
}
