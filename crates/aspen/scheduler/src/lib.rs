//! Aspen Scheduler - ready queue and agent concurrency accounting.
//!
//! The scheduler holds the tasks that are eligible for dispatch and the
//! registry of agents they can be routed to. Dequeue order is priority
//! first, FIFO within a priority. `next_ready` is non-blocking: it returns
//! a task/agent pairing only when a registered agent with spare
//! concurrency covers the task's capability.
//!
//! All scheduler state is mutated from the kernel's tick loop; agents
//! executing on worker tasks never touch it directly.

#![deny(unsafe_code)]

pub mod queue;
pub mod registry;

use aspen_types::{AgentId, Task, TaskId};
use thiserror::Error;
use tracing::debug;

pub use queue::ReadyQueue;
pub use registry::{AgentRegistration, AgentRegistry};

/// Scheduler-related errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("ready queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("agent '{0}' is already registered")]
    DuplicateAgent(AgentId),

    #[error("agent '{0}' is not registered")]
    UnknownAgent(AgentId),

    #[error("agent '{agent_id}' is already at max concurrency ({max_concurrency})")]
    ConcurrencyExceeded {
        agent_id: AgentId,
        max_concurrency: usize,
    },
}

/// The scheduler: ready queue plus agent registry
pub struct Scheduler {
    queue: ReadyQueue,
    registry: AgentRegistry,
}

impl Scheduler {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: ReadyQueue::new(queue_capacity),
            registry: AgentRegistry::new(),
        }
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Register an agent; duplicate ids are rejected
    pub fn register(&mut self, registration: AgentRegistration) -> Result<(), SchedulerError> {
        self.registry.register(registration)
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    // ── Queue ────────────────────────────────────────────────────────

    /// Enqueue a task whose dependencies are satisfied
    pub fn submit(&mut self, task: Task) -> Result<(), SchedulerError> {
        debug!(task_id = %task.id, capability = %task.capability, priority = task.priority, "Task enqueued");
        self.queue.push(task)
    }

    /// Number of tasks waiting in the ready queue
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Pop the highest-priority task that has an eligible agent.
    ///
    /// Tasks whose capability currently has no agent with spare concurrency
    /// stay queued in order. Returns `None` when no pairing exists.
    pub fn next_ready(&mut self) -> Option<(Task, AgentId)> {
        let mut unmatched = Vec::new();
        let mut pairing = None;

        while let Some(task) = self.queue.pop() {
            match self.registry.pick_agent(&task.capability) {
                Some(agent_id) => {
                    pairing = Some((task, agent_id));
                    break;
                }
                None => unmatched.push(task),
            }
        }

        // Put unmatched tasks back; their enqueue stamps keep FIFO order
        for task in unmatched {
            self.queue.requeue(task);
        }

        pairing
    }

    /// Atomically claim a concurrency slot for the pairing
    pub fn assign(&mut self, task_id: &TaskId, agent_id: &AgentId) -> Result<(), SchedulerError> {
        self.registry.acquire_slot(agent_id)?;
        debug!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
        Ok(())
    }

    /// Release the agent's slot when its task reaches any terminal path
    pub fn release(&mut self, task_id: &TaskId, agent_id: &AgentId) {
        self.registry.release_slot(agent_id);
        debug!(task_id = %task_id, agent_id = %agent_id, "Agent slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspen_types::CapabilityId;
    use serde_json::Value;

    fn registration(id: &str, capability: &str, max: usize) -> AgentRegistration {
        AgentRegistration::new(
            AgentId::new(id),
            [CapabilityId::new(capability)],
            max,
        )
    }

    fn task(capability: &str, priority: u32) -> Task {
        Task::new(CapabilityId::new(capability), Value::Null).with_priority(priority)
    }

    #[test]
    fn dequeues_by_priority_then_fifo() {
        let mut scheduler = Scheduler::new(100);
        scheduler.register(registration("a-1", "review", 10)).unwrap();

        let low = task("review", 1);
        let first_high = task("review", 5);
        let second_high = task("review", 5);
        let (low_id, first_id, second_id) =
            (low.id.clone(), first_high.id.clone(), second_high.id.clone());

        scheduler.submit(low).unwrap();
        scheduler.submit(first_high).unwrap();
        scheduler.submit(second_high).unwrap();

        let order: Vec<TaskId> = std::iter::from_fn(|| scheduler.next_ready())
            .map(|(task, _)| task.id)
            .collect();
        assert_eq!(order, vec![first_id, second_id, low_id]);
    }

    #[test]
    fn tasks_without_capable_agents_stay_queued() {
        let mut scheduler = Scheduler::new(100);
        scheduler.register(registration("a-1", "review", 1)).unwrap();

        scheduler.submit(task("translate", 9)).unwrap();
        scheduler.submit(task("review", 1)).unwrap();

        let (picked, agent) = scheduler.next_ready().unwrap();
        assert_eq!(picked.capability, CapabilityId::new("review"));
        assert_eq!(agent, AgentId::new("a-1"));

        // the translate task is still there for when an agent appears
        assert_eq!(scheduler.queued_len(), 1);
        assert!(scheduler.next_ready().is_none());
    }

    #[test]
    fn saturated_agents_defer_their_tasks() {
        let mut scheduler = Scheduler::new(100);
        scheduler.register(registration("a-1", "review", 1)).unwrap();

        scheduler.submit(task("review", 1)).unwrap();
        scheduler.submit(task("review", 1)).unwrap();

        let (first, agent) = scheduler.next_ready().unwrap();
        scheduler.assign(&first.id, &agent).unwrap();

        assert!(scheduler.next_ready().is_none());

        scheduler.release(&first.id, &agent);
        assert!(scheduler.next_ready().is_some());
    }

    #[test]
    fn assign_enforces_the_concurrency_cap() {
        let mut scheduler = Scheduler::new(100);
        scheduler.register(registration("a-1", "review", 1)).unwrap();

        let agent = AgentId::new("a-1");
        scheduler.assign(&TaskId::new("t-1"), &agent).unwrap();

        let err = scheduler.assign(&TaskId::new("t-2"), &agent).unwrap_err();
        assert!(matches!(err, SchedulerError::ConcurrencyExceeded { .. }));
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let mut scheduler = Scheduler::new(1);
        scheduler.submit(task("review", 1)).unwrap();
        let err = scheduler.submit(task("review", 1)).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { capacity: 1 }));
    }

    #[test]
    fn routes_to_least_loaded_agent() {
        let mut scheduler = Scheduler::new(100);
        scheduler.register(registration("a-1", "review", 2)).unwrap();
        scheduler.register(registration("a-2", "review", 2)).unwrap();

        scheduler.assign(&TaskId::new("t-0"), &AgentId::new("a-1")).unwrap();

        scheduler.submit(task("review", 1)).unwrap();
        let (_, agent) = scheduler.next_ready().unwrap();
        assert_eq!(agent, AgentId::new("a-2"));
    }
}
