//! The mission driver: wires the executor reducer to a kernel.
//!
//! The driver owns the kernel, submits step tasks, maps task completions
//! back to step outcomes, and feeds them through the reducer until the
//! mission reaches a terminal state. Completion delivery is push-based:
//! the kernel hands completions back from its dispatch rounds, so nothing
//! here polls or sleeps.

use std::collections::HashMap;

use aspen_kernel::{Kernel, KernelError, TaskCompletion};
use aspen_types::{MissionId, Task, TaskId, TaskStatus};
use thiserror::Error;
use tracing::warn;

use crate::definition::{PlaybookDefinition, PlaybookGraph, StepId};
use crate::executor::{MissionExecutor, StepOutcome, StepSubmission};
use crate::mission::MissionReport;
use crate::PlaybookError;

/// Driver-related errors
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Playbook(#[from] PlaybookError),
}

/// Runs missions over a kernel
pub struct MissionDriver {
    kernel: Kernel,
    executor: MissionExecutor,
    /// Maps in-flight kernel tasks back to their mission step
    task_index: HashMap<TaskId, (MissionId, StepId)>,
}

impl MissionDriver {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            executor: MissionExecutor::new(),
            task_index: HashMap::new(),
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    /// Validate a definition and run it to a terminal report
    pub async fn run(
        &mut self,
        definition: PlaybookDefinition,
        params: HashMap<String, String>,
    ) -> Result<MissionReport, DriverError> {
        let graph = PlaybookGraph::validate(definition)?;
        let (mission_id, submissions) = self.executor.start(graph, params);
        self.submit_steps(submissions).await?;

        while !self.executor.is_terminal(&mission_id) {
            let completions = self.kernel.run_until_idle().await?;
            if completions.is_empty() {
                // Nothing resolved and nothing in flight: the mission
                // cannot advance further.
                warn!(mission_id = %mission_id, "Mission stalled with no in-flight work");
                break;
            }

            let mut follow_ups = Vec::new();
            for completion in completions {
                follow_ups.extend(self.observe_completion(&completion)?);
            }
            self.submit_steps(follow_ups).await?;
        }

        Ok(self.executor.report(&mission_id)?)
    }

    /// Cancel a mission and its in-flight kernel tasks
    pub async fn cancel_mission(
        &mut self,
        mission_id: &MissionId,
        reason: impl Into<String>,
    ) -> Result<MissionReport, DriverError> {
        let reason = reason.into();
        let in_flight = self.executor.cancel(mission_id)?;

        let mut task_ids = Vec::new();
        for (task_id, (mission, step)) in &self.task_index {
            if mission == mission_id && in_flight.contains(step) {
                task_ids.push(task_id.clone());
            }
        }
        for task_id in task_ids {
            self.task_index.remove(&task_id);
            if let Err(err) = self.kernel.cancel(&task_id, reason.clone()).await {
                match err {
                    KernelError::TaskAlreadyTerminal(_) => {}
                    other => return Err(other.into()),
                }
            }
        }

        Ok(self.executor.report(mission_id)?)
    }

    /// Snapshot of a mission's progress
    pub fn report(&self, mission_id: &MissionId) -> Result<MissionReport, DriverError> {
        Ok(self.executor.report(mission_id)?)
    }

    async fn submit_steps(
        &mut self,
        submissions: Vec<StepSubmission>,
    ) -> Result<(), DriverError> {
        for submission in submissions {
            let task = Task::new(submission.capability, submission.payload)
                .with_priority(submission.priority)
                .with_mission(submission.mission_id.clone());
            let task_id = self.kernel.submit_task(task).await?;
            self.task_index
                .insert(task_id, (submission.mission_id, submission.step_id));
        }
        Ok(())
    }

    fn observe_completion(
        &mut self,
        completion: &TaskCompletion,
    ) -> Result<Vec<StepSubmission>, DriverError> {
        let Some((mission_id, step_id)) = self.task_index.remove(&completion.task_id) else {
            // Not a mission task (direct kernel submission); ignore.
            return Ok(Vec::new());
        };

        let outcome = match completion.status {
            TaskStatus::Succeeded => StepOutcome::succeeded(step_id),
            TaskStatus::Cancelled => StepOutcome::cancelled(step_id),
            _ => StepOutcome::failed(step_id, completion.result.retryable()),
        };

        Ok(self.executor.observe(&mission_id, outcome)?)
    }
}
