//! Execution of one dispatched step
//!
//! Runs outside the scheduler loop: approval wait, capability invocation with
//! retry, output checks. Reports back through the returned completion and the
//! signal channel; never touches the step graph.

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::capability::{schema, Capability, CapabilityError, CapabilityMeta, InvocationContext};
use crate::pool::WorkerPool;
use crate::retry::{invoke_with_retry, RetryPolicy};
use crate::types::{
    ErrorKind, StepError, StepId, StepResult, StepStatus, TaskId, APPROVAL_DENIED,
};

/// In-flight notifications sent to the scheduler loop.
#[derive(Debug)]
pub(crate) enum StepSignal {
    Suspended(StepId),
    Resumed(StepId),
    Retrying {
        step_id: StepId,
        attempt: u32,
        error: String,
    },
}

/// Everything a dispatched step needs, owned.
pub(crate) struct DispatchedStep {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub description: String,
    pub capability: Arc<dyn Capability>,
    pub meta: CapabilityMeta,
    pub args: Value,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub gate: Arc<ApprovalGate>,
    pub pool: Option<WorkerPool>,
    pub token: CancellationToken,
    pub signals: mpsc::UnboundedSender<StepSignal>,
    pub slots: Arc<Semaphore>,
    pub slot: Option<OwnedSemaphorePermit>,
}

/// Final outcome of a dispatched step.
#[derive(Debug)]
pub(crate) struct StepCompletion {
    pub step_id: StepId,
    pub status: StepStatus,
    pub result: StepResult,
    /// Approval note or other detail for the progress event
    pub message: Option<String>,
}

impl DispatchedStep {
    pub fn holding(mut self, slot: OwnedSemaphorePermit) -> Self {
        self.slot = Some(slot);
        self
    }

    pub async fn execute(mut self) -> StepCompletion {
        let started = Instant::now();
        let mut args = self.args.clone();
        // Released on return, before the loop sees the completion.
        let mut slot = self.slot.take();

        if self.meta.approval.requires_approval(&args) {
            // A suspended step does not occupy a run slot.
            drop(slot.take());
            self.signal(StepSignal::Suspended(self.step_id.clone()));
            let request = ApprovalRequest {
                task_id: self.task_id.clone(),
                step_id: self.step_id.clone(),
                capability: self.meta.name.clone(),
                args: args.clone(),
                justification: self.justification(),
            };
            let decision = self.gate.request(request, &self.token).await;
            if !decision.is_approved() {
                return StepCompletion {
                    step_id: self.step_id,
                    status: StepStatus::Skipped,
                    result: StepResult::failure(
                        StepError::new(ErrorKind::ApprovalDenied, APPROVAL_DENIED),
                        0,
                        started.elapsed(),
                    ),
                    message: decision.note,
                };
            }
            if let Some(replacement) = decision.args {
                args = Value::Object(replacement);
            }
            slot = tokio::select! {
                acquired = self.slots.clone().acquire_owned() => acquired.ok(),
                _ = self.token.cancelled() => None,
            };
            if slot.is_none() {
                return self.failed(
                    StepError::new(ErrorKind::Cancelled, CapabilityError::Cancelled.to_string()),
                    0,
                    started,
                );
            }
            self.signal(StepSignal::Resumed(self.step_id.clone()));
            if let Err(violation) = schema::check(&args, &self.meta.input_schema) {
                return self.failed(
                    StepError::new(
                        ErrorKind::Argument,
                        format!("approved arguments rejected: {}", violation),
                    ),
                    0,
                    started,
                );
            }
        }

        let outcome = invoke_with_retry(
            self.capability.as_ref(),
            &args,
            self.timeout,
            &self.retry,
            &self.token,
            |attempt| {
                let ctx = InvocationContext::new(self.task_id.clone(), self.step_id.clone())
                    .with_attempt(attempt)
                    .with_cancellation_token(self.token.child_token());
                match &self.pool {
                    Some(pool) => ctx.with_pool(pool.clone()),
                    None => ctx,
                }
            },
            |attempt, error, delay| {
                tracing::warn!(
                    task_id = %self.task_id,
                    step_id = %self.step_id,
                    capability = %self.meta.name,
                    retry_attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "retrying step after transient error: {}",
                    error
                );
                self.signal(StepSignal::Retrying {
                    step_id: self.step_id.clone(),
                    attempt,
                    error: error.to_string(),
                });
            },
        )
        .await;

        match outcome.result {
            Ok(value) => match schema::check(&value, &self.meta.output_schema) {
                Ok(()) => StepCompletion {
                    step_id: self.step_id,
                    status: StepStatus::Completed,
                    result: StepResult::success(value, outcome.attempts, started.elapsed()),
                    message: None,
                },
                Err(violation) => self.failed(
                    StepError::new(
                        ErrorKind::Execution,
                        format!("output rejected: {}", violation),
                    ),
                    outcome.attempts,
                    started,
                ),
            },
            Err(error) => {
                let kind = error_kind(&error);
                self.failed(StepError::new(kind, error.to_string()), outcome.attempts, started)
            }
        }
    }

    fn failed(self, error: StepError, attempts: u32, started: Instant) -> StepCompletion {
        StepCompletion {
            step_id: self.step_id,
            status: StepStatus::Failed,
            result: StepResult::failure(error, attempts, started.elapsed()),
            message: None,
        }
    }

    fn justification(&self) -> String {
        if self.description.is_empty() {
            format!("step '{}' wants to run '{}'", self.step_id, self.meta.name)
        } else {
            self.description.clone()
        }
    }

    fn signal(&self, signal: StepSignal) {
        // The loop outlives every step future; a closed channel means the run is gone.
        let _ = self.signals.send(signal);
    }
}

fn error_kind(error: &CapabilityError) -> ErrorKind {
    match error {
        CapabilityError::InvalidArguments(_) => ErrorKind::Argument,
        CapabilityError::Timeout(_) | CapabilityError::Transport(_) => ErrorKind::Transient,
        CapabilityError::Cancelled => ErrorKind::Cancelled,
        CapabilityError::Failed(_) | CapabilityError::Unknown(_) => ErrorKind::Execution,
    }
}
