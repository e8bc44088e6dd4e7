//! Aspen Gateway - protected access to the external reasoning provider.
//!
//! Every outbound provider call flows through [`ProviderGateway::invoke`],
//! which composes two independent gates evaluated in order:
//!
//! 1. **Quota**: rolling-window request/token/cost budgets. An exhausted
//!    bucket rejects the call before the provider is touched and before any
//!    breaker state changes.
//! 2. **Circuit breaker**: a Closed/Open/HalfOpen state machine that fails
//!    fast while the provider is known to be unhealthy and admits a limited
//!    number of trial calls after the cooldown.
//!
//! Transient provider failures are retried with bounded exponential backoff,
//! but only while the breaker is closed; every failed attempt still feeds
//! the breaker's failure count.
//!
//! One gateway instance guards one provider endpoint. Instances are built
//! explicitly by the kernel's composition root and injected where needed,
//! never as a module-level singleton.

#![deny(unsafe_code)]

pub mod breaker;
pub mod gateway;
pub mod provider;
pub mod quota;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use gateway::{GatewayConfig, GatewayError, ProviderGateway, RetryConfig};
pub use provider::{ProviderCallError, ProviderClient, ProviderRequest, ProviderResponse};
pub use quota::{QuotaBucketKind, QuotaConfig, QuotaManager, QuotaUsage};
