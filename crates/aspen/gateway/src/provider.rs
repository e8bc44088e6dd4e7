//! The provider seam.
//!
//! The reasoning provider is a black box to the kernel: a capability that
//! takes an opaque payload and returns a response or an error. Concrete
//! transports implement [`ProviderClient`]; tests use scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Request passed to the provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Opaque payload; the gateway never interprets it
    pub payload: Value,
    /// Token estimate used for quota admission
    pub estimated_tokens: u64,
    /// Cost estimate in cents used for quota admission
    pub estimated_cost_cents: u64,
}

impl ProviderRequest {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            estimated_tokens: 0,
            estimated_cost_cents: 0,
        }
    }

    pub fn with_estimates(mut self, tokens: u64, cost_cents: u64) -> Self {
        self.estimated_tokens = tokens;
        self.estimated_cost_cents = cost_cents;
        self
    }
}

/// Response returned by the provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub output: Value,
    /// Actual tokens consumed, recorded against the token budget
    pub tokens_used: u64,
    /// Actual cost in cents, recorded against the cost budgets
    pub cost_cents: u64,
}

/// Errors a provider call can surface
#[derive(Debug, Error)]
pub enum ProviderCallError {
    /// Network hiccup or provider-side overload; safe to retry
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider rejected the request; retrying will not help
    #[error("provider rejected the request: {0}")]
    Rejected(String),
}

impl ProviderCallError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderCallError::Transient(_))
    }
}

/// Trait implemented by provider transports
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Endpoint name used in traces
    fn provider_name(&self) -> &str;

    /// One call to the provider
    async fn call(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderCallError>;
}
