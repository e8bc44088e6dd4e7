//! LLM-backed agent: routes task payloads through the provider gateway.

use std::sync::Arc;

use aspen_gateway::{GatewayError, ProviderGateway, ProviderRequest};
use aspen_types::{AgentId, Task, TaskErrorKind, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Agent;

/// Per-agent defaults for quota admission estimates.
///
/// A task payload may override both via `"estimated_tokens"` and
/// `"estimated_cost_cents"` fields; anything else in the payload is passed
/// through to the provider untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAgentConfig {
    pub default_estimated_tokens: u64,
    pub default_estimated_cost_cents: u64,
}

impl Default for LlmAgentConfig {
    fn default() -> Self {
        Self {
            default_estimated_tokens: 1_000,
            default_estimated_cost_cents: 5,
        }
    }
}

/// An agent backed by the external reasoning provider.
///
/// All outbound calls traverse the gateway; quota and breaker rejections
/// come back as retryable failures, never as raised errors.
pub struct LlmAgent {
    agent_id: AgentId,
    gateway: Arc<ProviderGateway>,
    config: LlmAgentConfig,
}

impl LlmAgent {
    pub fn new(agent_id: AgentId, gateway: Arc<ProviderGateway>) -> Self {
        Self {
            agent_id,
            gateway,
            config: LlmAgentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LlmAgentConfig) -> Self {
        self.config = config;
        self
    }

    fn build_request(&self, task: &Task) -> ProviderRequest {
        let tokens = task
            .payload
            .get("estimated_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(self.config.default_estimated_tokens);
        let cost = task
            .payload
            .get("estimated_cost_cents")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(self.config.default_estimated_cost_cents);

        ProviderRequest::new(task.payload.clone()).with_estimates(tokens, cost)
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    async fn process(&self, task: &Task) -> TaskResult {
        let request = self.build_request(task);

        match self.gateway.invoke(request).await {
            Ok(response) => {
                debug!(
                    agent_id = %self.agent_id,
                    task_id = %task.id,
                    tokens = response.tokens_used,
                    "LLM task completed"
                );
                TaskResult::ok(response.output)
            }
            Err(GatewayError::QuotaExhausted { bucket }) => TaskResult::failed(
                TaskErrorKind::QuotaExhausted,
                format!("quota exhausted: {bucket}"),
            ),
            Err(GatewayError::CircuitOpen) => TaskResult::failed(
                TaskErrorKind::CircuitOpen,
                "provider circuit is open".to_string(),
            ),
            Err(GatewayError::ProviderTransient(msg)) => {
                TaskResult::failed(TaskErrorKind::ProviderTransient, msg)
            }
            Err(GatewayError::ProviderRejected(msg)) => {
                TaskResult::failed(TaskErrorKind::Internal, msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspen_gateway::{
        CircuitBreakerConfig, GatewayConfig, ProviderCallError, ProviderClient, ProviderResponse,
        QuotaConfig,
    };
    use aspen_types::CapabilityId;
    use std::sync::Mutex;

    struct ScriptedProvider {
        script: Mutex<Vec<Result<ProviderResponse, ProviderCallError>>>,
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn call(
            &self,
            _request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderCallError> {
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ProviderCallError::Transient("exhausted".to_string())))
        }
    }

    fn gateway_with(
        script: Vec<Result<ProviderResponse, ProviderCallError>>,
        config: GatewayConfig,
    ) -> Arc<ProviderGateway> {
        Arc::new(ProviderGateway::new(
            Arc::new(ScriptedProvider {
                script: Mutex::new(script),
            }),
            config,
        ))
    }

    fn task() -> Task {
        Task::new(
            CapabilityId::new("reasoning"),
            serde_json::json!({"prompt": "summarize"}),
        )
    }

    #[tokio::test]
    async fn successful_call_yields_success() {
        let gateway = gateway_with(
            vec![Ok(ProviderResponse {
                output: serde_json::json!({"text": "done"}),
                tokens_used: 42,
                cost_cents: 1,
            })],
            GatewayConfig::default(),
        );
        let agent = LlmAgent::new(AgentId::new("llm-1"), gateway);

        let result = agent.process(&task()).await;
        assert!(result.success);
        assert_eq!(result.output["text"], "done");
    }

    #[tokio::test]
    async fn quota_rejection_is_retryable() {
        let config = GatewayConfig {
            quota: QuotaConfig {
                requests_per_minute: 0,
                ..QuotaConfig::default()
            },
            ..GatewayConfig::default()
        };
        let agent = LlmAgent::new(AgentId::new("llm-1"), gateway_with(vec![], config));

        let result = agent.process(&task()).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::QuotaExhausted);
        assert!(error.retryable());
    }

    #[tokio::test]
    async fn open_circuit_is_retryable_not_raised() {
        let config = GatewayConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
            ..GatewayConfig::default()
        };
        let agent = LlmAgent::new(
            AgentId::new("llm-1"),
            gateway_with(
                vec![Err(ProviderCallError::Rejected("boom".to_string()))],
                config,
            ),
        );

        // first call trips the breaker with a rejected (non-retryable) result
        let first = agent.process(&task()).await;
        assert_eq!(first.error.unwrap().kind, TaskErrorKind::Internal);

        // second call fails fast with a retryable circuit-open tag
        let second = agent.process(&task()).await;
        let error = second.error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::CircuitOpen);
        assert!(error.retryable());
    }

    #[tokio::test]
    async fn payload_estimates_override_defaults() {
        let gateway = gateway_with(
            vec![Ok(ProviderResponse {
                output: serde_json::Value::Null,
                tokens_used: 1,
                cost_cents: 1,
            })],
            GatewayConfig {
                quota: QuotaConfig {
                    tokens_per_minute: 100,
                    ..QuotaConfig::default()
                },
                ..GatewayConfig::default()
            },
        );
        let agent = LlmAgent::new(AgentId::new("llm-1"), gateway);

        // estimate above the token budget: rejected before the provider
        let mut big = task();
        big.payload = serde_json::json!({"prompt": "x", "estimated_tokens": 500});
        let result = agent.process(&big).await;
        assert_eq!(result.error.unwrap().kind, TaskErrorKind::QuotaExhausted);
    }
}
