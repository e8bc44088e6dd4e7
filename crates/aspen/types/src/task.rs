//! The task lifecycle model.
//!
//! A [`Task`] is a unit of work tagged with a required capability. The
//! kernel owns all mutation; once a task reaches a terminal status it is
//! never changed again, and exactly one agent owns it while it runs.

use crate::{AgentId, CapabilityId, MissionId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ── Status ───────────────────────────────────────────────────────────

/// Lifecycle status of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on unresolved dependencies; not yet eligible for dispatch
    Blocked,
    /// Eligible and waiting in the ready queue
    Queued,
    /// Owned by exactly one agent
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

// ── Failure taxonomy ─────────────────────────────────────────────────

/// Classified failure cause carried in a [`TaskResult`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// A specialist rejected the task before starting; never retried
    PreconditionFailed,
    /// Network or provider hiccup; safe to retry
    ProviderTransient,
    /// A quota bucket would be exceeded; retry after the window rolls
    QuotaExhausted,
    /// The provider circuit is open; retry after cooldown
    CircuitOpen,
    /// The task exceeded its deadline
    Timeout,
    /// The task was cancelled by caller request or dependency failure
    Cancelled,
    /// Anything else; not retried
    Internal,
}

impl TaskErrorKind {
    /// Whether a failure of this kind may be resubmitted
    pub fn retryable(self) -> bool {
        matches!(
            self,
            TaskErrorKind::ProviderTransient
                | TaskErrorKind::QuotaExhausted
                | TaskErrorKind::CircuitOpen
        )
    }
}

/// A classified task failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ── Result ───────────────────────────────────────────────────────────

/// Outcome of one agent execution.
///
/// This is the Agent Protocol's return type: executors fold every internal
/// error into `success: false` here instead of raising past the boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    /// Structured output; partial output is kept on failure when available
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(TaskError::new(kind, message)),
        }
    }

    pub fn failed_with_output(
        kind: TaskErrorKind,
        message: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            success: false,
            output,
            error: Some(TaskError::new(kind, message)),
        }
    }

    /// Whether the failure (if any) may be retried
    pub fn retryable(&self) -> bool {
        self.error.as_ref().is_some_and(TaskError::retryable)
    }
}

// ── Quota policy ─────────────────────────────────────────────────────

/// Caller-chosen disposition when a task hits an exhausted quota bucket
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPolicy {
    /// Put the task back in the ready queue and try again later
    #[default]
    Requeue,
    /// Fail the task immediately
    Reject,
}

// ── Task ─────────────────────────────────────────────────────────────

/// A unit of work submitted to the kernel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Tag the scheduler routes by
    pub capability: CapabilityId,
    /// Opaque payload; the core never interprets it
    pub payload: Value,
    /// Higher dispatches first; equal priorities dequeue FIFO
    pub priority: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission: Option<MissionId>,
    /// The agent owning this task while it runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<AgentId>,
    /// Tasks that must reach a terminal state before this one dispatches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
    /// Per-task deadline; the kernel default applies when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "is_default_quota_policy")]
    pub quota_policy: QuotaPolicy,
    /// Final result; present exactly when the status is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

fn is_default_quota_policy(policy: &QuotaPolicy) -> bool {
    *policy == QuotaPolicy::Requeue
}

impl Task {
    /// Create a queued task with default priority
    pub fn new(capability: CapabilityId, payload: Value) -> Self {
        Self {
            id: TaskId::generate(),
            capability,
            payload,
            priority: 0,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            mission: None,
            assigned_agent: None,
            depends_on: Vec::new(),
            timeout: None,
            quota_policy: QuotaPolicy::default(),
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mission(mut self, mission: MissionId) -> Self {
        self.mission = Some(mission);
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<TaskId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_quota_policy(mut self, policy: QuotaPolicy) -> Self {
        self.quota_policy = policy;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Hand the task to an agent. No-op if already terminal.
    pub fn mark_running(&mut self, agent: AgentId) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Running;
        self.assigned_agent = Some(agent);
    }

    /// Record the final result. No-op if already terminal.
    pub fn mark_finished(&mut self, result: TaskResult) {
        if self.is_terminal() {
            return;
        }
        self.status = if result.success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        self.result = Some(result);
    }

    /// Cancel with a recorded reason. No-op if already terminal.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Cancelled;
        self.result = Some(TaskResult::failed(TaskErrorKind::Cancelled, reason));
    }

    /// Put the task back in the queue after a quota requeue
    pub fn mark_requeued(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Queued;
        self.assigned_agent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_tasks_are_immutable() {
        let mut task = Task::new(CapabilityId::new("analyze"), Value::Null);
        task.mark_finished(TaskResult::ok(serde_json::json!({"n": 1})));
        assert_eq!(task.status, TaskStatus::Succeeded);

        task.mark_cancelled("too late");
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.result.as_ref().unwrap().success);
    }

    #[test]
    fn failure_kinds_classify_retryability() {
        assert!(TaskErrorKind::ProviderTransient.retryable());
        assert!(TaskErrorKind::QuotaExhausted.retryable());
        assert!(TaskErrorKind::CircuitOpen.retryable());
        assert!(!TaskErrorKind::PreconditionFailed.retryable());
        assert!(!TaskErrorKind::Timeout.retryable());
        assert!(!TaskErrorKind::Internal.retryable());
    }

    #[test]
    fn cancellation_records_a_reason() {
        let mut task = Task::new(CapabilityId::new("analyze"), Value::Null);
        task.mark_running(AgentId::new("worker-1"));
        task.mark_cancelled("caller request");

        assert_eq!(task.status, TaskStatus::Cancelled);
        let error = task.result.unwrap().error.unwrap();
        assert_eq!(error.kind, TaskErrorKind::Cancelled);
        assert_eq!(error.message, "caller request");
    }

    #[test]
    fn task_round_trips_through_serde() {
        let task = Task::new(CapabilityId::new("review"), serde_json::json!({"doc": "d-1"}))
            .with_priority(7)
            .with_depends_on(vec![TaskId::new("t-0")]);

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, 7);
        assert_eq!(back.depends_on.len(), 1);
        assert_eq!(back.status, TaskStatus::Queued);
    }
}
