//! The mission executor: a pure state-reducer over completion events.
//!
//! `start` seeds a mission and returns the initially submittable steps;
//! `observe` folds one step outcome into the mission and returns whatever
//! became submittable as a consequence. The executor never talks to the
//! kernel and never blocks; driving it is the [`crate::MissionDriver`]'s
//! job.

use std::collections::{HashMap, HashSet};

use aspen_types::{CapabilityId, MissionId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::definition::{PlaybookGraph, StepId};
use crate::mission::{MissionOutcome, MissionReport, StepStatus};
use crate::PlaybookError;

/// A step the executor wants submitted to the kernel
#[derive(Clone, Debug)]
pub struct StepSubmission {
    pub mission_id: MissionId,
    pub step_id: StepId,
    pub capability: CapabilityId,
    pub payload: Value,
    pub priority: u32,
}

/// One resolved step, as reported back by the kernel
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step_id: StepId,
    pub success: bool,
    /// Whether the failure may be resubmitted against the retry budget
    pub retryable: bool,
    pub cancelled: bool,
}

impl StepOutcome {
    pub fn succeeded(step_id: StepId) -> Self {
        Self {
            step_id,
            success: true,
            retryable: false,
            cancelled: false,
        }
    }

    pub fn failed(step_id: StepId, retryable: bool) -> Self {
        Self {
            step_id,
            success: false,
            retryable,
            cancelled: false,
        }
    }

    pub fn cancelled(step_id: StepId) -> Self {
        Self {
            step_id,
            success: false,
            retryable: false,
            cancelled: true,
        }
    }
}

/// Why a step was skipped; recovery branches that were never needed do
/// not count against the mission verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SkipReason {
    DependencyFailed,
    RecoveryNotNeeded,
}

struct MissionState {
    mission_id: MissionId,
    graph: PlaybookGraph,
    params: HashMap<String, String>,
    statuses: HashMap<StepId, StepStatus>,
    attempts: HashMap<StepId, u32>,
    /// Conditional steps activated by a failure edge
    triggered: HashSet<StepId>,
    skip_reasons: HashMap<StepId, SkipReason>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl MissionState {
    fn is_terminal(&self) -> bool {
        self.statuses.values().all(|status| status.is_terminal())
    }

    fn outcome(&self) -> Option<MissionOutcome> {
        if !self.is_terminal() {
            return None;
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut cancelled = 0usize;
        let mut hard_skips = 0usize;

        for (step_id, status) in &self.statuses {
            match status {
                StepStatus::Succeeded => succeeded += 1,
                StepStatus::Failed => failed += 1,
                StepStatus::Cancelled => cancelled += 1,
                StepStatus::Skipped => {
                    if self.skip_reasons.get(step_id) == Some(&SkipReason::DependencyFailed) {
                        hard_skips += 1;
                    }
                }
                StepStatus::Pending | StepStatus::Submitted => {}
            }
        }

        Some(if cancelled > 0 {
            MissionOutcome::Cancelled
        } else if failed == 0 && hard_skips == 0 {
            MissionOutcome::Succeeded
        } else if succeeded > 0 {
            MissionOutcome::PartialFailure
        } else {
            MissionOutcome::Failed
        })
    }
}

/// Executor over all live missions
#[derive(Default)]
pub struct MissionExecutor {
    missions: HashMap<MissionId, MissionState>,
}

impl MissionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a mission from a validated graph; returns the mission id and
    /// the initially submittable steps.
    pub fn start(
        &mut self,
        graph: PlaybookGraph,
        params: HashMap<String, String>,
    ) -> (MissionId, Vec<StepSubmission>) {
        let mission_id = MissionId::generate();
        let statuses = graph
            .step_ids()
            .map(|id| (id.clone(), StepStatus::Pending))
            .collect();

        let mut state = MissionState {
            mission_id: mission_id.clone(),
            graph,
            params,
            statuses,
            attempts: HashMap::new(),
            triggered: HashSet::new(),
            skip_reasons: HashMap::new(),
            started_at: Utc::now(),
            ended_at: None,
        };

        let submissions = evaluate(&mut state);
        info!(
            mission_id = %mission_id,
            playbook = state.graph.name(),
            initial_steps = submissions.len(),
            "Mission started"
        );
        self.missions.insert(mission_id.clone(), state);
        (mission_id, submissions)
    }

    /// Fold one step outcome into the mission.
    ///
    /// Re-delivery of an already-resolved outcome is a no-op, so replaying
    /// events never produces duplicate submissions.
    pub fn observe(
        &mut self,
        mission_id: &MissionId,
        outcome: StepOutcome,
    ) -> Result<Vec<StepSubmission>, PlaybookError> {
        let state = self
            .missions
            .get_mut(mission_id)
            .ok_or_else(|| PlaybookError::UnknownMission(mission_id.clone()))?;

        let step_id = outcome.step_id.clone();
        if state.graph.step(&step_id).is_none() {
            return Err(PlaybookError::UnknownStep(step_id));
        }
        if state.statuses.get(&step_id) != Some(&StepStatus::Submitted) {
            debug!(mission_id = %mission_id, step = %step_id, "Ignoring stale step outcome");
            return Ok(Vec::new());
        }

        if outcome.cancelled {
            state.statuses.insert(step_id.clone(), StepStatus::Cancelled);
        } else if outcome.success {
            state.statuses.insert(step_id.clone(), StepStatus::Succeeded);
        } else {
            let max_attempts = state
                .graph
                .step(&step_id)
                .map(|step| step.max_attempts)
                .unwrap_or(1);
            let spent = state.attempts.get(&step_id).copied().unwrap_or(0);

            if outcome.retryable && spent < max_attempts {
                debug!(
                    mission_id = %mission_id,
                    step = %step_id,
                    attempt = spent,
                    "Retrying step after retryable failure"
                );
                state.statuses.insert(step_id.clone(), StepStatus::Pending);
            } else {
                state.statuses.insert(step_id.clone(), StepStatus::Failed);
                // A failure edge activates its recovery step
                if let Some(crate::definition::Transition::Step(target)) = state
                    .graph
                    .step(&step_id)
                    .and_then(|step| step.on_failure.clone())
                {
                    state.triggered.insert(target);
                }
            }
        }

        let submissions = evaluate(state);

        if state.is_terminal() && state.ended_at.is_none() {
            state.ended_at = Some(Utc::now());
            info!(
                mission_id = %mission_id,
                outcome = ?state.outcome(),
                "Mission reached a terminal state"
            );
        }

        Ok(submissions)
    }

    /// Cancel a mission: every unresolved step becomes `Cancelled`.
    ///
    /// Returns the steps that were in flight so the caller can cancel
    /// their kernel tasks.
    pub fn cancel(&mut self, mission_id: &MissionId) -> Result<Vec<StepId>, PlaybookError> {
        let state = self
            .missions
            .get_mut(mission_id)
            .ok_or_else(|| PlaybookError::UnknownMission(mission_id.clone()))?;

        let mut in_flight = Vec::new();
        for (step_id, status) in state.statuses.iter_mut() {
            match status {
                StepStatus::Submitted => {
                    in_flight.push(step_id.clone());
                    *status = StepStatus::Cancelled;
                }
                StepStatus::Pending => *status = StepStatus::Cancelled,
                _ => {}
            }
        }
        state.ended_at.get_or_insert_with(Utc::now);
        info!(mission_id = %mission_id, "Mission cancelled");
        Ok(in_flight)
    }

    pub fn is_terminal(&self, mission_id: &MissionId) -> bool {
        self.missions
            .get(mission_id)
            .map(|state| state.is_terminal())
            .unwrap_or(false)
    }

    /// Snapshot of a mission's progress
    pub fn report(&self, mission_id: &MissionId) -> Result<MissionReport, PlaybookError> {
        let state = self
            .missions
            .get(mission_id)
            .ok_or_else(|| PlaybookError::UnknownMission(mission_id.clone()))?;

        Ok(MissionReport {
            mission_id: state.mission_id.clone(),
            playbook_name: state.graph.name().to_string(),
            step_statuses: state.statuses.clone(),
            outcome: state.outcome(),
            started_at: state.started_at,
            ended_at: state.ended_at,
        })
    }
}

/// Re-evaluate readiness to a fixpoint: submit every Pending step whose
/// gates are satisfied, skip every step that became unreachable.
fn evaluate(state: &mut MissionState) -> Vec<StepSubmission> {
    let mut submissions = Vec::new();

    loop {
        let mut changed = false;

        let pending: Vec<StepId> = state
            .statuses
            .iter()
            .filter(|(_, status)| **status == StepStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        for step_id in pending {
            match readiness(state, &step_id) {
                Readiness::Ready => {
                    let step = state
                        .graph
                        .step(&step_id)
                        .expect("pending step exists in the graph");
                    let payload = substitute(&step.input_template, &state.params);
                    submissions.push(StepSubmission {
                        mission_id: state.mission_id.clone(),
                        step_id: step_id.clone(),
                        capability: step.capability.clone(),
                        payload,
                        priority: step.priority,
                    });
                    state.statuses.insert(step_id.clone(), StepStatus::Submitted);
                    *state.attempts.entry(step_id).or_insert(0) += 1;
                    changed = true;
                }
                Readiness::Skip(reason) => {
                    debug!(step = %step_id, reason = ?reason, "Step skipped");
                    state.statuses.insert(step_id.clone(), StepStatus::Skipped);
                    state.skip_reasons.insert(step_id, reason);
                    changed = true;
                }
                Readiness::Wait => {}
            }
        }

        if !changed {
            break;
        }
    }

    submissions
}

enum Readiness {
    Ready,
    Wait,
    Skip(SkipReason),
}

fn readiness(state: &MissionState, step_id: &StepId) -> Readiness {
    // Conditional steps wait for their failure trigger; once every source
    // is terminal without triggering them, the recovery was never needed.
    if state.graph.is_conditional(step_id) {
        if state.triggered.contains(step_id) {
            return Readiness::Ready;
        }
        let all_sources_terminal = state
            .graph
            .failure_sources_of(step_id)
            .all(|source| {
                state
                    .statuses
                    .get(source)
                    .map(|status| status.is_terminal())
                    .unwrap_or(false)
            });
        return if all_sources_terminal {
            Readiness::Skip(SkipReason::RecoveryNotNeeded)
        } else {
            Readiness::Wait
        };
    }

    for dep in state.graph.deps_of(step_id) {
        let dep_status = state
            .statuses
            .get(dep)
            .copied()
            .unwrap_or(StepStatus::Pending);

        match dep_status {
            StepStatus::Succeeded => {}
            StepStatus::Failed => {
                // A dependency that failed into its recovery path does not
                // unblock dependents on the success path.
                return Readiness::Skip(SkipReason::DependencyFailed);
            }
            StepStatus::Skipped | StepStatus::Cancelled => {
                return Readiness::Skip(SkipReason::DependencyFailed);
            }
            StepStatus::Pending | StepStatus::Submitted => return Readiness::Wait,
        }
    }

    Readiness::Ready
}

/// Replace `${param}` placeholders in string leaves of the template
fn substitute(template: &Value, params: &HashMap<String, String>) -> Value {
    match template {
        Value::String(text) => {
            let mut rendered = text.clone();
            for (key, value) in params {
                rendered = rendered.replace(&format!("${{{key}}}"), value);
            }
            Value::String(rendered)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, params))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), substitute(value, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}
