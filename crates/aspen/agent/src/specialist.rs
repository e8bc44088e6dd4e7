//! Specialist adapter: deterministic executors behind the Agent Protocol.
//!
//! A [`Specialist`] is a rule-based worker with an explicit lifecycle:
//! `validate_preconditions → on_start → execute → on_complete / on_error`.
//! The adapter converts the task payload into the specialist's context
//! type, drives the lifecycle, and converts the specialist's result back
//! into a protocol [`TaskResult`].
//!
//! A precondition rejection short-circuits before `on_start` and is never
//! retried.

use aspen_types::{AgentId, Task, TaskErrorKind, TaskResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::Agent;

/// Structured output of a successful specialist execution
#[derive(Clone, Debug)]
pub struct SpecialistOutput {
    pub summary: String,
    pub payload: Value,
}

impl SpecialistOutput {
    pub fn new(summary: impl Into<String>, payload: Value) -> Self {
        Self {
            summary: summary.into(),
            payload,
        }
    }
}

/// Errors a specialist execution can surface
#[derive(Debug, Error)]
pub enum SpecialistError {
    /// The execution failed; `retryable` marks transient causes
    #[error("specialist execution failed: {message}")]
    Execution { message: String, retryable: bool },
}

impl SpecialistError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            retryable: true,
        }
    }

    fn retryable(&self) -> bool {
        match self {
            SpecialistError::Execution { retryable, .. } => *retryable,
        }
    }
}

/// A deterministic rule-based worker.
///
/// The context type is the specialist's own view of the task payload;
/// conversion happens in the adapter, so specialists never see raw tasks.
#[async_trait]
pub trait Specialist: Send + Sync {
    type Context: DeserializeOwned + Send + Sync;

    /// Reject work the specialist cannot act on. Runs before any hook.
    fn validate_preconditions(&self, context: &Self::Context) -> bool;

    /// Called once before `execute`
    async fn on_start(&self, _context: &Self::Context) {}

    /// The deterministic work itself
    async fn execute(&self, context: &Self::Context)
        -> Result<SpecialistOutput, SpecialistError>;

    /// Called once after a successful `execute`
    async fn on_complete(&self, _context: &Self::Context, _output: &SpecialistOutput) {}

    /// Error hook; may replace the error (e.g. after cleanup) before the
    /// adapter folds it into the protocol result
    async fn on_error(&self, _context: &Self::Context, error: SpecialistError) -> SpecialistError {
        error
    }
}

/// Adapter implementing the Agent Protocol for a [`Specialist`]
pub struct SpecialistAdapter<S: Specialist> {
    agent_id: AgentId,
    specialist: S,
}

impl<S: Specialist> SpecialistAdapter<S> {
    pub fn new(agent_id: AgentId, specialist: S) -> Self {
        Self {
            agent_id,
            specialist,
        }
    }
}

#[async_trait]
impl<S: Specialist> Agent for SpecialistAdapter<S> {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    async fn process(&self, task: &Task) -> TaskResult {
        let context: S::Context = match serde_json::from_value(task.payload.clone()) {
            Ok(context) => context,
            Err(err) => {
                return TaskResult::failed(
                    TaskErrorKind::PreconditionFailed,
                    format!("payload does not fit the specialist context: {err}"),
                );
            }
        };

        if !self.specialist.validate_preconditions(&context) {
            debug!(
                agent_id = %self.agent_id,
                task_id = %task.id,
                "Specialist rejected preconditions"
            );
            return TaskResult::failed(
                TaskErrorKind::PreconditionFailed,
                "specialist preconditions not satisfied",
            );
        }

        self.specialist.on_start(&context).await;

        match self.specialist.execute(&context).await {
            Ok(output) => {
                self.specialist.on_complete(&context, &output).await;
                TaskResult::ok(serde_json::json!({
                    "summary": output.summary,
                    "result": output.payload,
                }))
            }
            Err(error) => {
                let error = self.specialist.on_error(&context, error).await;
                let kind = if error.retryable() {
                    TaskErrorKind::ProviderTransient
                } else {
                    TaskErrorKind::Internal
                };
                TaskResult::failed(kind, error.to_string())
            }
        }
    }
}
