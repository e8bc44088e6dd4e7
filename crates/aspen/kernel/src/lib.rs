//! Aspen Kernel - the central dispatch loop.
//!
//! The kernel pulls ready tasks from the scheduler, routes each by its
//! declared capability to a registered agent, and records every outcome in
//! the append-only ledger. Bookkeeping (scheduler mutation, the task table,
//! ledger sequencing) happens inside `tick()` on the caller's thread; agent
//! execution runs on spawned workers that report back over a channel, so a
//! slow LLM call never stalls dispatch.
//!
//! # Key invariants
//!
//! - Every terminal task leaves exactly one ledger record; a failed append
//!   halts dispatch instead of continuing unaudited.
//! - A task is owned by exactly one agent while it runs, and no agent ever
//!   exceeds its declared concurrency.
//! - Cancellation is never silent: it releases the slot, records the
//!   reason, and still appends a ledger record.

#![deny(unsafe_code)]

pub mod config;
pub mod kernel;
pub mod telemetry;

pub use config::{ExecutionConfig, KernelConfig, SchedulingConfig, TelemetryConfig};
pub use kernel::{Kernel, KernelError, TaskCompletion};
pub use telemetry::KernelTelemetry;
