//! Step and run outcome types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use super::{Plan, StepId, StepStatus, TaskId};

/// Message recorded on steps skipped by an approval denial.
pub const APPROVAL_DENIED: &str = "approval denied";
/// Message recorded on dependents of a failed step.
pub const BLOCKED_BY_FAILED: &str = "blocked by failed dependency";
/// Message recorded on dependents of a skipped, non-optional step.
pub const BLOCKED_BY_SKIPPED: &str = "blocked by skipped dependency";
pub const RUN_CANCELLED: &str = "run cancelled";
pub const RUN_ABORTED: &str = "run aborted by critical step failure";
/// Message recorded on every step of a plan that failed validation.
pub const PLAN_REJECTED: &str = "plan rejected";

/// Category of a step-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments could not be resolved or violate the capability contract
    Argument,
    /// Timeout or transport failure that survived the retry policy
    Transient,
    /// Non-transient capability failure
    Execution,
    ApprovalDenied,
    /// A prerequisite failed or was skipped
    Dependency,
    Cancelled,
    /// A critical step failed elsewhere in the plan
    Aborted,
    /// Plan graph could not make progress
    Structural,
}

/// Error descriptor carried in a StepResult.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of a step, owned by the step that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Capability invocations made, including retries
    #[serde(default)]
    pub attempts: u32,
    /// Wall-clock time across all attempts and approval waits
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(value: Value, attempts: u32, duration: Duration) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
            attempts,
            duration_ms: duration_ms(duration),
            completed_at: Utc::now(),
        }
    }

    pub fn failure(error: StepError, attempts: u32, duration: Duration) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error),
            attempts,
            duration_ms: duration_ms(duration),
            completed_at: Utc::now(),
        }
    }

    /// Result for a step that never reached its capability.
    pub fn not_run(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failure(StepError::new(kind, message), 0, Duration::ZERO)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.message.as_str())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Overall status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step completed
    Completed,
    /// No failures, but some steps were skipped
    CompletedWithSkips,
    /// At least one step failed, or a critical step aborted the run
    Failed,
    Cancelled,
    /// The graph stopped making progress (cycle or dangling reference)
    StructuralError,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithSkips)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithSkips => "completed_with_skips",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::StructuralError => "structural_error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of one step as reported in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: StepId,
    pub capability: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
}

/// Terminal summary emitted once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub task_id: TaskId,
    pub plan_version: u32,
    pub status: RunStatus,
    /// Every step of the plan, in plan order
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Run-level error: rejected plan or unsatisfiable graph
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    /// Summary for a plan rejected before anything ran: every step skipped.
    pub fn rejected(plan: &Plan, error: impl Into<String>) -> Self {
        let now = Utc::now();
        let steps = plan
            .steps
            .iter()
            .map(|step| StepReport {
                step_id: step.id.clone(),
                capability: step.capability.clone(),
                status: StepStatus::Skipped,
                result: Some(StepResult::not_run(ErrorKind::Structural, PLAN_REJECTED)),
            })
            .collect();
        Self {
            task_id: plan.task_id.clone(),
            plan_version: plan.version,
            status: RunStatus::StructuralError,
            steps,
            duration_ms: 0,
            started_at: now,
            finished_at: now,
            error: Some(error.into()),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|report| report.step_id == id)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps
            .iter()
            .filter(|report| report.status == status)
            .count()
    }
}
