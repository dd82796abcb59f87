//! Core type definitions
//!
//! - Plan: versioned step graph produced by the planner
//! - Step: one capability invocation with dependencies and a status
//! - StepResult / RunSummary: what a run produced

mod plan;
mod result;
mod step;

pub use plan::Plan;
pub use result::{
    ErrorKind, RunStatus, RunSummary, StepError, StepReport, StepResult, APPROVAL_DENIED,
    BLOCKED_BY_FAILED, BLOCKED_BY_SKIPPED, PLAN_REJECTED, RUN_ABORTED, RUN_CANCELLED,
};
pub(crate) use result::duration_ms;
pub use step::{ArgBag, ArgValue, Criticality, Step, StepId, StepRef, StepStatus};

/// Type alias for Task ID
pub type TaskId = String;
