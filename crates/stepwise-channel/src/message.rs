//! Control messages exchanged across the isolation boundary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stepwise_core::approval::{ApprovalDecision, ApprovalRequest};
use stepwise_core::events::ProgressEvent;
use stepwise_core::types::{Plan, RunSummary, StepId, TaskId};

/// Which side sends a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToSandbox,
    SandboxToHost,
}

/// One message on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Run a plan. Redelivery for the same task and version is a no-op.
    Dispatch { plan: Plan },
    Cancel { task_id: TaskId },
    ApprovalDecision {
        task_id: TaskId,
        step_id: StepId,
        decision: ApprovalDecision,
    },
    HealthProbe { nonce: Uuid },
    Progress(ProgressEvent),
    Completion(RunSummary),
    /// A dispatch the sandbox will not run, answered so the host can stop waiting.
    DispatchRefused {
        task_id: TaskId,
        plan_version: u32,
        reason: String,
    },
    ApprovalRequest(ApprovalRequest),
    HealthAck { nonce: Uuid },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch { .. } => "dispatch",
            Self::Cancel { .. } => "cancel",
            Self::ApprovalDecision { .. } => "approval_decision",
            Self::HealthProbe { .. } => "health_probe",
            Self::Progress(_) => "progress",
            Self::Completion(_) => "completion",
            Self::DispatchRefused { .. } => "dispatch_refused",
            Self::ApprovalRequest(_) => "approval_request",
            Self::HealthAck { .. } => "health_ack",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Dispatch { .. }
            | Self::Cancel { .. }
            | Self::ApprovalDecision { .. }
            | Self::HealthProbe { .. } => Direction::HostToSandbox,
            Self::Progress(_)
            | Self::Completion(_)
            | Self::DispatchRefused { .. }
            | Self::ApprovalRequest(_)
            | Self::HealthAck { .. } => Direction::SandboxToHost,
        }
    }

    /// Every message except health probe/ack belongs to a task.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Dispatch { plan } => Some(&plan.task_id),
            Self::Cancel { task_id }
            | Self::ApprovalDecision { task_id, .. }
            | Self::DispatchRefused { task_id, .. } => Some(task_id),
            Self::Progress(event) => Some(&event.task_id),
            Self::Completion(summary) => Some(&summary.task_id),
            Self::ApprovalRequest(request) => Some(&request.task_id),
            Self::HealthProbe { .. } | Self::HealthAck { .. } => None,
        }
    }

    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            Self::ApprovalDecision { step_id, .. } => Some(step_id),
            Self::Progress(event) => Some(&event.step_id),
            Self::ApprovalRequest(request) => Some(&request.step_id),
            _ => None,
        }
    }

    /// Ordering lane: the task id, or the empty lane for health traffic.
    pub fn lane(&self) -> &str {
        self.task_id().unwrap_or("")
    }

    /// Last message of a lane; both ends drop its sequence state after it.
    pub fn closes_lane(&self) -> bool {
        matches!(self, Self::Completion(_) | Self::DispatchRefused { .. })
    }

    pub fn probe() -> Self {
        Self::HealthProbe {
            nonce: Uuid::new_v4(),
        }
    }
}
