//! # Stepwise Core
//!
//! Task execution core: turns a validated plan into completed work.
//!
//! This crate contains:
//! - Plan / Step / StepResult / RunSummary definitions
//! - Capability trait, registry and schema checks
//! - Execution context and inter-step argument resolution
//! - Plan validation, approval gate, retry policy
//! - Dependency scheduler and fan-out worker pool
//!
//! This crate does NOT care about:
//! - Where plans come from
//! - How messages cross the sandbox boundary
//! - How progress is displayed

pub mod approval;
pub mod capability;
pub mod context;
pub mod events;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod types;
pub mod validation;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::approval::{
        ApprovalDecision, ApprovalError, ApprovalGate, ApprovalNotifier, ApprovalRequest,
        ApprovalVerdict,
    };
    pub use crate::capability::{
        ApprovalRule, CancellationToken, Capability, CapabilityError, CapabilityMeta,
        CapabilityRegistry, InvocationContext,
    };
    pub use crate::context::{ExecutionContext, ResolveError};
    pub use crate::events::{
        ChannelProgressSink, ExecutionEvent, NoopProgressSink, ProgressEvent, ProgressSink,
    };
    pub use crate::pool::{AggregatedResult, ItemOutcome, WorkBatch, WorkItem, WorkerPool};
    pub use crate::retry::RetryPolicy;
    pub use crate::scheduler::Scheduler;
    pub use crate::types::{
        ArgValue, Criticality, ErrorKind, Plan, RunStatus, RunSummary, Step, StepError, StepId,
        StepReport, StepResult, StepStatus, TaskId,
    };
    pub use crate::validation::{PlanValidator, StructuralValidator, ValidationError};
}

// Re-export key types at crate root
pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
pub use capability::{Capability, CapabilityError, CapabilityMeta, CapabilityRegistry};
pub use events::{ExecutionEvent, ProgressEvent, ProgressSink};
pub use pool::WorkerPool;
pub use scheduler::Scheduler;
pub use types::{Plan, RunStatus, RunSummary, Step, StepId, StepStatus, TaskId};
