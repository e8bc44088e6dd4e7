//! Telemetry and observability for the Aspen kernel.

use std::collections::HashMap;
use std::sync::RwLock;

use aspen_types::{AgentId, TaskId, TaskStatus};

use crate::config::TelemetryConfig;

/// Kernel telemetry system.
///
/// Uses `RwLock` for thread-safe interior mutability so the kernel can be
/// shared across async tasks.
pub struct KernelTelemetry {
    config: TelemetryConfig,
    metrics: RwLock<MetricsCollector>,
}

impl KernelTelemetry {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            config: config.clone(),
            metrics: RwLock::new(MetricsCollector::new()),
        }
    }

    /// Record a task submission
    pub fn task_submitted(&self, task_id: &TaskId) {
        if !self.config.enabled {
            return;
        }
        tracing::debug!("Task submitted: {}", task_id);
        self.metrics.write().unwrap().increment("tasks_submitted");
    }

    /// Record a dispatch pairing
    pub fn task_dispatched(&self, task_id: &TaskId, agent_id: &AgentId) {
        if !self.config.enabled {
            return;
        }
        tracing::debug!("Task {} dispatched to {}", task_id, agent_id);
        self.metrics.write().unwrap().increment("tasks_dispatched");
    }

    /// Record a terminal outcome
    pub fn task_finished(&self, task_id: &TaskId, status: TaskStatus) {
        if !self.config.enabled {
            return;
        }
        tracing::info!("Task {} finished: {}", task_id, status);
        let metric = match status {
            TaskStatus::Succeeded => "tasks_succeeded",
            TaskStatus::Failed => "tasks_failed",
            TaskStatus::Cancelled => "tasks_cancelled",
            _ => return,
        };
        self.metrics.write().unwrap().increment(metric);
    }

    /// Record a quota-driven requeue
    pub fn task_requeued(&self, task_id: &TaskId) {
        if !self.config.detailed_metrics {
            return;
        }
        tracing::debug!("Task {} requeued after quota rejection", task_id);
        self.metrics.write().unwrap().increment("tasks_requeued");
    }

    /// Record the kernel halting on an audit failure
    pub fn kernel_halted(&self) {
        if !self.config.enabled {
            return;
        }
        tracing::error!("Kernel halted: ledger write failed");
        self.metrics.write().unwrap().increment("kernel_halts");
    }

    /// Counter snapshot for tests and diagnostics
    pub fn counters(&self) -> HashMap<String, u64> {
        self.metrics.read().unwrap().counters.clone()
    }
}

/// Metrics collector
struct MetricsCollector {
    counters: HashMap<String, u64>,
}

impl MetricsCollector {
    fn new() -> Self {
        Self {
            counters: HashMap::new(),
        }
    }

    fn increment(&mut self, metric: &str) {
        *self.counters.entry(metric.to_string()).or_insert(0) += 1;
    }
}
