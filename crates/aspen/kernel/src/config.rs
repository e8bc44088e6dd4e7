//! Configuration for the Aspen kernel.

use aspen_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};

/// Complete kernel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub scheduling: SchedulingConfig,
    pub execution: ExecutionConfig,
    pub gateway: GatewayConfig,
    pub telemetry: TelemetryConfig,
}

impl KernelConfig {
    /// Load configuration from an optional file plus `ASPEN_*` environment
    /// overrides, falling back to defaults for anything unset.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(config::Environment::with_prefix("ASPEN").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Bound on the ready queue
    pub queue_capacity: usize,
    /// Requeues granted to a task before quota exhaustion becomes failure
    pub max_quota_requeues: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_quota_requeues: 5,
        }
    }
}

/// Task execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Deadline applied to tasks that do not carry their own
    pub default_task_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_ms: 300_000,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub detailed_metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detailed_metrics: false,
        }
    }
}
