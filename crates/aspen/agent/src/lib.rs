//! Aspen Agent - the executor protocol and its two adapters.
//!
//! The [`Agent`] trait is the only seam executors must satisfy: a stable
//! identifier and `process(task) -> TaskResult`. It is deliberately
//! polymorphic over exactly two kinds of executor:
//!
//! - [`LlmAgent`] routes the task payload through the provider gateway and
//!   folds gateway failures into retryable results.
//! - [`SpecialistAdapter`] wraps a deterministic [`Specialist`] and runs its
//!   precondition → start → execute → complete/error lifecycle.
//!
//! Implementations never raise past `process`: every internal error becomes
//! a `TaskResult { success: false }` so the kernel only ever handles one
//! shape of outcome.

#![deny(unsafe_code)]

pub mod llm;
pub mod specialist;

use aspen_types::{AgentId, Task, TaskResult};
use async_trait::async_trait;

pub use llm::{LlmAgent, LlmAgentConfig};
pub use specialist::{Specialist, SpecialistAdapter, SpecialistError, SpecialistOutput};

/// The Agent Protocol.
///
/// `process` takes the task and returns a result. It must not panic and
/// must not return early through an error channel; failures are data.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier used for registration, routing, and audit
    fn agent_id(&self) -> &AgentId;

    /// Execute one task to completion
    async fn process(&self, task: &Task) -> TaskResult;
}
