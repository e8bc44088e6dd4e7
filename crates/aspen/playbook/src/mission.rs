//! Mission state: one running execution of a playbook graph.

use std::collections::HashMap;

use aspen_types::MissionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::StepId;

/// Step status within a mission; mirrors the task lifecycle plus `Skipped`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for its dependencies or its failure trigger
    Pending,
    /// Submitted to the kernel and not yet resolved
    Submitted,
    Succeeded,
    Failed,
    /// Unreachable: a dependency failed with no failure path, or its
    /// recovery branch was never taken
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::Submitted => "submitted",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Terminal verdict for a mission
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionOutcome {
    /// Every executed step succeeded and nothing was skipped
    Succeeded,
    /// The mission ran to completion with failed or skipped steps
    PartialFailure,
    /// No step succeeded
    Failed,
    Cancelled,
}

/// Snapshot of a mission's progress
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MissionReport {
    pub mission_id: MissionId,
    pub playbook_name: String,
    pub step_statuses: HashMap<StepId, StepStatus>,
    /// Present exactly when every step is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<MissionOutcome>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl MissionReport {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn status_of(&self, step: &StepId) -> Option<StepStatus> {
        self.step_statuses.get(step).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Submitted.is_terminal());
    }
}
