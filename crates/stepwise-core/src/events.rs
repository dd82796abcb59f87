//! Progress events
//!
//! The scheduler emits one event per step status transition and a single
//! terminal summary per run. Emission never blocks: sinks are bounded and
//! drop the newest event when full.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::types::{RunSummary, StepId, StepResult, StepStatus, TaskId};

/// One step status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub capability: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    /// Optional human-readable message (retry notes, skip reasons)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        task_id: impl Into<TaskId>,
        step_id: impl Into<StepId>,
        capability: impl Into<String>,
        status: StepStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            step_id: step_id.into(),
            capability: capability.into(),
            status,
            result: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: StepResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Everything a run emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Step(ProgressEvent),
    RunFinished(RunSummary),
}

impl ExecutionEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Step(event) => &event.task_id,
            Self::RunFinished(summary) => &summary.task_id,
        }
    }
}

/// Outbound event channel. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

/// Bounded mpsc sink with drop-newest overflow.
#[derive(Debug)]
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ExecutionEvent>,
    dropped: AtomicU64,
}

impl ChannelProgressSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::from_sender(tx), rx)
    }

    pub fn from_sender(tx: mpsc::Sender<ExecutionEvent>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events dropped because the subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: ExecutionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    task_id = %event.task_id(),
                    dropped,
                    "progress subscriber is slow; dropping event"
                );
            }
            // Nobody listening.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
