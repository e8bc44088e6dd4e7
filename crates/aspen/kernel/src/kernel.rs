//! The dispatch loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aspen_agent::Agent;
use aspen_gateway::{ProviderClient, ProviderGateway};
use aspen_ledger::{ExecutionLedger, LedgerError, RecordDraft, RecordedOutcome};
use aspen_scheduler::{AgentRegistration, Scheduler, SchedulerError};
use aspen_types::{
    AgentId, CapabilityId, MissionId, QuotaPolicy, Task, TaskErrorKind, TaskId, TaskResult,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::KernelConfig;
use crate::telemetry::KernelTelemetry;

/// Kernel-related errors
#[derive(Debug, Error)]
pub enum KernelError {
    /// Dispatch refused after a ledger write failure
    #[error("kernel is halted after a ledger write failure")]
    Halted,

    #[error("no registered agent covers capability '{0}'")]
    NoAgentForCapability(CapabilityId),

    #[error("unknown dependency '{0}'")]
    UnknownDependency(TaskId),

    #[error("unknown task '{0}'")]
    UnknownTask(TaskId),

    #[error("task '{0}' is already terminal")]
    TaskAlreadyTerminal(TaskId),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    LedgerWrite(#[from] LedgerError),
}

/// Public completion event observers consume (the playbook driver among
/// them)
#[derive(Clone, Debug)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub mission: Option<MissionId>,
    pub status: TaskStatus,
    pub result: TaskResult,
}

/// What a worker reports back over the completion channel
struct WorkerDone {
    task_id: TaskId,
    agent_id: AgentId,
    result: TaskResult,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

struct RunningTask {
    agent_id: AgentId,
    abort: AbortHandle,
    started_at: DateTime<Utc>,
    input_snapshot: Value,
}

/// The central dispatch engine.
///
/// Owns the scheduler, the agent table, the task table, and the ledger
/// handle. All bookkeeping happens on the caller's thread inside `tick()`;
/// only agent `process` calls run concurrently.
pub struct Kernel {
    config: KernelConfig,
    scheduler: Scheduler,
    agents: HashMap<AgentId, Arc<dyn Agent>>,
    ledger: ExecutionLedger,
    tasks: HashMap<TaskId, Task>,
    /// Blocked task -> dependencies not yet terminal
    waiting: HashMap<TaskId, HashSet<TaskId>>,
    /// Dependency -> tasks blocked on it
    dependents: HashMap<TaskId, Vec<TaskId>>,
    running: HashMap<TaskId, RunningTask>,
    /// Quota requeues spent per task
    requeues: HashMap<TaskId, u32>,
    completion_tx: mpsc::UnboundedSender<WorkerDone>,
    completion_rx: mpsc::UnboundedReceiver<WorkerDone>,
    telemetry: KernelTelemetry,
    halted: bool,
}

impl Kernel {
    pub fn new(config: KernelConfig, ledger: ExecutionLedger) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            scheduler: Scheduler::new(config.scheduling.queue_capacity),
            telemetry: KernelTelemetry::new(&config.telemetry),
            config,
            agents: HashMap::new(),
            ledger,
            tasks: HashMap::new(),
            waiting: HashMap::new(),
            dependents: HashMap::new(),
            running: HashMap::new(),
            requeues: HashMap::new(),
            completion_tx,
            completion_rx,
            halted: false,
        }
    }

    /// Build a gateway from this kernel's configuration.
    ///
    /// The breaker and quota instances live inside the returned gateway:
    /// one per provider endpoint, owned here at the composition root and
    /// injected into the agents that need them.
    pub fn provider_gateway(&self, client: Arc<dyn ProviderClient>) -> Arc<ProviderGateway> {
        Arc::new(ProviderGateway::new(client, self.config.gateway.clone()))
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub fn telemetry(&self) -> &KernelTelemetry {
        &self.telemetry
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register an agent with its capabilities and concurrency limit
    pub fn register_agent(
        &mut self,
        agent: Arc<dyn Agent>,
        capabilities: impl IntoIterator<Item = CapabilityId>,
        max_concurrency: usize,
    ) -> Result<(), KernelError> {
        let agent_id = agent.agent_id().clone();
        self.scheduler.register(AgentRegistration::new(
            agent_id.clone(),
            capabilities,
            max_concurrency,
        ))?;
        self.agents.insert(agent_id.clone(), agent);
        info!(agent_id = %agent_id, "Agent registered");
        Ok(())
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit a task built with `Task::new` and its builders
    pub async fn submit_task(&mut self, task: Task) -> Result<TaskId, KernelError> {
        if self.halted {
            return Err(KernelError::Halted);
        }
        if !self.scheduler.registry().any_covers(&task.capability) {
            return Err(KernelError::NoAgentForCapability(task.capability));
        }

        let task_id = task.id.clone();
        let mut unresolved = HashSet::new();
        let mut failed_dependency = None;

        for dep in &task.depends_on {
            match self.tasks.get(dep) {
                None => return Err(KernelError::UnknownDependency(dep.clone())),
                Some(dep_task) if dep_task.status == TaskStatus::Succeeded => {}
                Some(dep_task) if dep_task.is_terminal() => {
                    failed_dependency = Some(dep.clone());
                }
                Some(_) => {
                    unresolved.insert(dep.clone());
                }
            }
        }

        self.telemetry.task_submitted(&task_id);

        // A dependency already failed: the task terminates without running,
        // but it still gets a ledger record.
        if let Some(dep) = failed_dependency {
            let mut task = task;
            task.mark_cancelled(format!("dependency '{dep}' did not succeed"));
            self.tasks.insert(task_id.clone(), task);
            self.telemetry.task_finished(&task_id, TaskStatus::Cancelled);
            self.append_record(&task_id, None).await?;
            return Ok(task_id);
        }

        if unresolved.is_empty() {
            let mut task = task;
            task.status = TaskStatus::Queued;
            self.scheduler.submit(task.clone())?;
            self.tasks.insert(task_id.clone(), task);
        } else {
            for dep in &unresolved {
                self.dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task_id.clone());
            }
            let mut task = task;
            task.status = TaskStatus::Blocked;
            self.waiting.insert(task_id.clone(), unresolved);
            self.tasks.insert(task_id.clone(), task);
        }

        Ok(task_id)
    }

    /// Convenience submission mirroring the external API shape
    pub async fn submit(
        &mut self,
        capability: CapabilityId,
        payload: Value,
        priority: u32,
        depends_on: Vec<TaskId>,
    ) -> Result<TaskId, KernelError> {
        self.submit_task(
            Task::new(capability, payload)
                .with_priority(priority)
                .with_depends_on(depends_on),
        )
        .await
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn status(&self, task_id: &TaskId) -> Result<TaskStatus, KernelError> {
        self.tasks
            .get(task_id)
            .map(|task| task.status)
            .ok_or_else(|| KernelError::UnknownTask(task_id.clone()))
    }

    pub fn result(&self, task_id: &TaskId) -> Result<Option<TaskResult>, KernelError> {
        self.tasks
            .get(task_id)
            .map(|task| task.result.clone())
            .ok_or_else(|| KernelError::UnknownTask(task_id.clone()))
    }

    /// Whether no queued, blocked, or running work remains
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.scheduler.queued_len() == 0 && self.waiting.is_empty()
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// One round of the dispatch loop: drain completions, then dispatch
    /// every ready pairing. Never blocks on agent work.
    pub async fn tick(&mut self) -> Result<Vec<TaskCompletion>, KernelError> {
        if self.halted {
            return Err(KernelError::Halted);
        }

        let mut completions = Vec::new();
        while let Ok(done) = self.completion_rx.try_recv() {
            completions.extend(self.handle_done(done).await?);
        }

        self.dispatch_ready()?;
        Ok(completions)
    }

    /// Tick until no queued, blocked, or running work remains.
    ///
    /// Waits on the completion channel between rounds instead of spinning,
    /// so embedders and tests get a quiescent kernel back.
    pub async fn run_until_idle(&mut self) -> Result<Vec<TaskCompletion>, KernelError> {
        let mut all = self.tick().await?;

        while !self.running.is_empty() {
            let Some(done) = self.completion_rx.recv().await else {
                break;
            };
            all.extend(self.handle_done(done).await?);
            all.extend(self.tick().await?);
        }

        Ok(all)
    }

    fn dispatch_ready(&mut self) -> Result<(), KernelError> {
        while let Some((queued, agent_id)) = self.scheduler.next_ready() {
            // The queue entry may be stale (e.g. cancelled while queued);
            // the task table is authoritative.
            let Some(task) = self.tasks.get_mut(&queued.id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }

            self.scheduler.assign(&queued.id, &agent_id)?;
            task.mark_running(agent_id.clone());

            let agent = self
                .agents
                .get(&agent_id)
                .cloned()
                .expect("registered agent must have an executor");
            let snapshot = task.clone();
            let timeout = snapshot.timeout.unwrap_or(Duration::from_millis(
                self.config.execution.default_task_timeout_ms,
            ));
            let tx = self.completion_tx.clone();
            let started_at = Utc::now();

            self.telemetry.task_dispatched(&snapshot.id, &agent_id);

            let worker_task_id = snapshot.id.clone();
            let worker_agent_id = agent_id.clone();
            let handle = tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout, agent.process(&snapshot)).await {
                    Ok(result) => result,
                    Err(_) => TaskResult::failed(
                        TaskErrorKind::Timeout,
                        format!("task exceeded its deadline of {timeout:?}"),
                    ),
                };
                // The kernel may have been dropped; nothing to do then.
                let _ = tx.send(WorkerDone {
                    task_id: worker_task_id,
                    agent_id: worker_agent_id,
                    result,
                    started_at,
                    ended_at: Utc::now(),
                });
            });

            self.running.insert(
                queued.id.clone(),
                RunningTask {
                    agent_id,
                    abort: handle.abort_handle(),
                    started_at,
                    input_snapshot: queued.payload.clone(),
                },
            );
        }
        Ok(())
    }

    async fn handle_done(
        &mut self,
        done: WorkerDone,
    ) -> Result<Vec<TaskCompletion>, KernelError> {
        let Some(running) = self.running.remove(&done.task_id) else {
            // Completion for a task already finalized elsewhere (cancelled
            // mid-flight); exactly-once bookkeeping drops it.
            debug!(task_id = %done.task_id, "Dropping stale completion");
            return Ok(Vec::new());
        };

        self.scheduler.release(&done.task_id, &done.agent_id);

        let task = self
            .tasks
            .get_mut(&done.task_id)
            .ok_or_else(|| KernelError::UnknownTask(done.task_id.clone()))?;
        if task.is_terminal() {
            return Ok(Vec::new());
        }

        // Quota rejections requeue per the task's policy instead of failing,
        // until the requeue budget runs out.
        let quota_rejected = done
            .result
            .error
            .as_ref()
            .is_some_and(|error| error.kind == TaskErrorKind::QuotaExhausted);
        if quota_rejected && task.quota_policy == QuotaPolicy::Requeue {
            let spent = self.requeues.entry(done.task_id.clone()).or_insert(0);
            if *spent < self.config.scheduling.max_quota_requeues {
                *spent += 1;
                task.mark_requeued();
                let requeued = task.clone();
                warn!(
                    task_id = %done.task_id,
                    attempt = *spent,
                    "Task requeued after quota rejection"
                );
                self.telemetry.task_requeued(&done.task_id);
                self.scheduler.submit(requeued)?;
                return Ok(Vec::new());
            }
        }

        task.mark_finished(done.result.clone());
        let status = task.status;
        let mission = task.mission.clone();

        self.telemetry.task_finished(&done.task_id, status);
        self.append_record(&done.task_id, Some((running.input_snapshot, done.started_at, done.ended_at)))
            .await?;

        let mut completions = vec![TaskCompletion {
            task_id: done.task_id.clone(),
            mission,
            status,
            result: done.result,
        }];
        completions.extend(self.resolve_dependents(&done.task_id).await?);
        Ok(completions)
    }

    /// Unblock or cascade-cancel tasks waiting on a freshly terminal task
    async fn resolve_dependents(
        &mut self,
        resolved: &TaskId,
    ) -> Result<Vec<TaskCompletion>, KernelError> {
        let mut completions = Vec::new();
        let mut worklist = vec![resolved.clone()];

        while let Some(dep_id) = worklist.pop() {
            let dep_succeeded = self
                .tasks
                .get(&dep_id)
                .map(|task| task.status == TaskStatus::Succeeded)
                .unwrap_or(false);

            for dependent_id in self.dependents.remove(&dep_id).unwrap_or_default() {
                let Some(unresolved) = self.waiting.get_mut(&dependent_id) else {
                    continue;
                };
                unresolved.remove(&dep_id);
                let now_ready = unresolved.is_empty();

                if !dep_succeeded {
                    // No failure edge at the task layer: dependents of a
                    // non-successful dependency terminate, transitively.
                    self.waiting.remove(&dependent_id);
                    let task = self
                        .tasks
                        .get_mut(&dependent_id)
                        .ok_or_else(|| KernelError::UnknownTask(dependent_id.clone()))?;
                    task.mark_cancelled(format!("dependency '{dep_id}' did not succeed"));
                    let status = task.status;
                    let mission = task.mission.clone();
                    let result = task.result.clone().expect("cancelled task has a result");

                    self.telemetry.task_finished(&dependent_id, status);
                    self.append_record(&dependent_id, None).await?;

                    completions.push(TaskCompletion {
                        task_id: dependent_id.clone(),
                        mission,
                        status,
                        result,
                    });
                    worklist.push(dependent_id);
                } else if now_ready {
                    self.waiting.remove(&dependent_id);
                    let task = self
                        .tasks
                        .get_mut(&dependent_id)
                        .ok_or_else(|| KernelError::UnknownTask(dependent_id.clone()))?;
                    task.status = TaskStatus::Queued;
                    let queued = task.clone();
                    debug!(task_id = %dependent_id, "Dependencies resolved; task queued");
                    self.scheduler.submit(queued)?;
                }
            }
        }

        Ok(completions)
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Cancel a task by caller request.
    ///
    /// Aborts the worker if the task is running, releases the agent slot,
    /// appends a cancelled ledger record, and cascades to blocked
    /// dependents. Returns every completion the cancellation produced.
    pub async fn cancel(
        &mut self,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<Vec<TaskCompletion>, KernelError> {
        if self.halted {
            return Err(KernelError::Halted);
        }
        let reason = reason.into();

        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| KernelError::UnknownTask(task_id.clone()))?;
        if task.is_terminal() {
            return Err(KernelError::TaskAlreadyTerminal(task_id.clone()));
        }

        if let Some(running) = self.running.remove(task_id) {
            running.abort.abort();
            self.scheduler.release(task_id, &running.agent_id);
        }
        self.waiting.remove(task_id);

        let task = self.tasks.get_mut(task_id).expect("task checked above");
        task.mark_cancelled(reason.clone());
        let status = task.status;
        let mission = task.mission.clone();
        let result = task.result.clone().expect("cancelled task has a result");

        info!(task_id = %task_id, reason = %reason, "Task cancelled");
        self.telemetry.task_finished(task_id, status);
        self.append_record(task_id, None).await?;

        let mut completions = vec![TaskCompletion {
            task_id: task_id.clone(),
            mission,
            status,
            result,
        }];
        completions.extend(self.resolve_dependents(task_id).await?);
        Ok(completions)
    }

    // ── Ledger ───────────────────────────────────────────────────────

    /// Append the terminal record for a task; a write failure halts the
    /// kernel.
    async fn append_record(
        &mut self,
        task_id: &TaskId,
        execution: Option<(Value, DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<(), KernelError> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| KernelError::UnknownTask(task_id.clone()))?;

        let outcome = match (&task.status, &task.result) {
            (TaskStatus::Succeeded, _) => RecordedOutcome::Succeeded,
            (TaskStatus::Cancelled, Some(result)) => RecordedOutcome::Cancelled {
                reason: result
                    .error
                    .as_ref()
                    .map(|error| error.message.clone())
                    .unwrap_or_default(),
            },
            (_, Some(result)) => RecordedOutcome::Failed {
                reason: result
                    .error
                    .as_ref()
                    .map(|error| error.message.clone())
                    .unwrap_or_default(),
            },
            (_, None) => RecordedOutcome::Failed {
                reason: "no result recorded".to_string(),
            },
        };

        let (input_snapshot, started_at, ended_at) = match execution {
            Some((input, started, ended)) => (input, started, ended),
            None => (task.payload.clone(), task.created_at, Utc::now()),
        };

        let draft = RecordDraft {
            task_id: task_id.clone(),
            mission_id: task.mission.clone(),
            agent_id: task.assigned_agent.clone(),
            input_snapshot,
            output_snapshot: task
                .result
                .as_ref()
                .map(|result| result.output.clone())
                .unwrap_or(Value::Null),
            started_at,
            ended_at,
            outcome,
        };

        if let Err(err) = self.ledger.append(draft).await {
            self.halted = true;
            self.telemetry.kernel_halted();
            error!(task_id = %task_id, error = %err, "Ledger append failed; halting dispatch");
            return Err(KernelError::LedgerWrite(err));
        }
        Ok(())
    }
}
