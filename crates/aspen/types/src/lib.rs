//! Shared types for the Aspen orchestration kernel.
//!
//! Everything the subsystems agree on lives here: the identifier newtypes,
//! the [`Task`] lifecycle model, and the failure taxonomy every executor
//! folds its errors into. The core treats task payloads as opaque
//! `serde_json::Value` data; interpretation belongs to the agents.

#![deny(unsafe_code)]

pub mod ids;
pub mod task;

pub use ids::{AgentId, CapabilityId, MissionId, TaskId};
pub use task::{
    QuotaPolicy, Task, TaskError, TaskErrorKind, TaskResult, TaskStatus,
};
