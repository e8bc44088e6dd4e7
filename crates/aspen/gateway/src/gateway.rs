//! The gateway composing quota, breaker, and retry around the provider.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::provider::{ProviderCallError, ProviderClient, ProviderRequest, ProviderResponse};
use crate::quota::{QuotaBucketKind, QuotaConfig, QuotaManager, QuotaUsage};

/// Bounded exponential backoff for transient provider failures.
///
/// Retries run only while the breaker is closed; defaults are 3 attempts,
/// 100 ms base delay doubling per attempt, capped at 2 s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based attempt that just failed)
    fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Full gateway configuration for one provider endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub breaker: CircuitBreakerConfig,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
}

/// Errors surfaced by [`ProviderGateway::invoke`]
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A quota bucket would be exceeded; the provider was not called
    #[error("quota exhausted: {bucket}")]
    QuotaExhausted { bucket: QuotaBucketKind },

    /// The circuit is open; the provider was not called
    #[error("provider circuit is open")]
    CircuitOpen,

    /// A transient failure that survived the retry budget
    #[error("transient provider failure: {0}")]
    ProviderTransient(String),

    /// The provider rejected the request outright
    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),
}

/// Protected front door to one provider endpoint.
///
/// Gate order on every invoke: quota first (no breaker mutation on quota
/// rejection), then the breaker, then the call itself with bounded retry.
pub struct ProviderGateway {
    client: Arc<dyn ProviderClient>,
    breaker: CircuitBreaker,
    quota: QuotaManager,
    retry: RetryConfig,
}

impl ProviderGateway {
    pub fn new(client: Arc<dyn ProviderClient>, config: GatewayConfig) -> Self {
        let endpoint = client.provider_name().to_string();
        Self {
            client,
            breaker: CircuitBreaker::new(endpoint, config.breaker),
            quota: QuotaManager::new(&config.quota),
            retry: config.retry,
        }
    }

    /// Invoke the provider through both gates
    pub async fn invoke(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, GatewayError> {
        self.quota
            .admit(request.estimated_tokens, request.estimated_cost_cents)
            .map_err(|bucket| GatewayError::QuotaExhausted { bucket })?;

        if !self.breaker.allow_request() {
            debug!(
                provider = self.client.provider_name(),
                "Request failed fast: circuit open"
            );
            return Err(GatewayError::CircuitOpen);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.call(&request).await {
                Ok(response) => {
                    self.breaker.record_success();
                    self.quota
                        .record_usage(response.tokens_used, response.cost_cents);
                    debug!(
                        provider = self.client.provider_name(),
                        attempt,
                        tokens = response.tokens_used,
                        "Provider call succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    warn!(
                        provider = self.client.provider_name(),
                        attempt,
                        error = %err,
                        "Provider call failed"
                    );

                    let may_retry = err.is_transient()
                        && attempt < self.retry.max_attempts
                        && self.breaker.state() == CircuitState::Closed;

                    if may_retry {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                        continue;
                    }

                    return Err(match err {
                        ProviderCallError::Transient(msg) => GatewayError::ProviderTransient(msg),
                        ProviderCallError::Rejected(msg) => GatewayError::ProviderRejected(msg),
                    });
                }
            }
        }
    }

    /// Breaker snapshot for observability
    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Quota snapshot for observability
    pub fn quota_usage(&self) -> QuotaUsage {
        self.quota.usage()
    }
}
