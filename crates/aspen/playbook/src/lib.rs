//! Aspen Playbook - declarative mission graphs.
//!
//! A playbook is a dependency graph of steps, each tagged with the
//! capability that will execute it, plus conditional success/failure
//! transitions. The [`MissionExecutor`] is a pure state-reducer over
//! kernel completion events: it holds no thread of control of its own,
//! only answering "given this outcome, which steps become submittable".
//! The [`MissionDriver`] wires the reducer to a [`aspen_kernel::Kernel`]
//! and runs a mission to a terminal report.
//!
//! Failure semantics: a step whose dependency failed without a failure
//! path is skipped, transitively; a failure path (`on_failure`) activates
//! its recovery step instead.

#![deny(unsafe_code)]

pub mod definition;
pub mod driver;
pub mod executor;
pub mod mission;

pub use definition::{
    PlaybookDefinition, PlaybookGraph, PlaybookId, StepDefinition, StepId, Transition,
};
pub use driver::{DriverError, MissionDriver};
pub use executor::{MissionExecutor, StepOutcome, StepSubmission};
pub use mission::{MissionOutcome, MissionReport, StepStatus};

use thiserror::Error;

/// Playbook-related errors
#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("playbook has no steps")]
    EmptyPlaybook,

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(StepId),

    #[error("step '{0}' references unknown step '{1}'")]
    UnknownStepReference(StepId, StepId),

    #[error("playbook graph contains a cycle through '{0}'")]
    CycleDetected(StepId),

    #[error("unknown mission '{0}'")]
    UnknownMission(aspen_types::MissionId),

    #[error("unknown step '{0}'")]
    UnknownStep(StepId),
}
