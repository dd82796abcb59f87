//! Approval gate
//!
//! Suspends a single step until a human decision arrives. Requests are keyed
//! by (task id, step id) and live only while the step waits. No decision
//! before the timeout, or cancellation of the run, denies the request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::types::{StepId, TaskId};

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Request for a human decision on one gated step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub capability: String,
    /// Resolved arguments the capability would be invoked with
    pub args: Value,
    pub justification: String,
}

impl ApprovalRequest {
    pub fn key(&self) -> ApprovalKey {
        (self.task_id.clone(), self.step_id.clone())
    }
}

pub type ApprovalKey = (TaskId, StepId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approve,
    Deny,
}

/// Human decision for a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub verdict: ApprovalVerdict,
    /// Replacement argument object, re-validated before use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            verdict: ApprovalVerdict::Approve,
            args: None,
            note: None,
        }
    }

    /// Approve, but run with `args` instead of the requested arguments.
    pub fn approve_with(args: Map<String, Value>) -> Self {
        Self {
            verdict: ApprovalVerdict::Approve,
            args: Some(args),
            note: None,
        }
    }

    pub fn deny(note: impl Into<String>) -> Self {
        Self {
            verdict: ApprovalVerdict::Deny,
            args: None,
            note: Some(note.into()),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn is_approved(&self) -> bool {
        self.verdict == ApprovalVerdict::Approve
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("no pending approval for task '{0}' step '{1}'")]
    NoPendingRequest(TaskId, StepId),
    #[error("approval for task '{0}' step '{1}' is no longer awaited")]
    RequestClosed(TaskId, StepId),
}

/// Announces new approval requests to whoever can answer them.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn notify(&self, request: ApprovalRequest) -> Result<(), String>;
}

struct PendingApproval {
    request: ApprovalRequest,
    ticket: u64,
    responder: oneshot::Sender<ApprovalDecision>,
}

/// Holds pending approval requests and routes decisions back to waiting steps.
pub struct ApprovalGate {
    pending: Mutex<HashMap<ApprovalKey, PendingApproval>>,
    next_ticket: std::sync::atomic::AtomicU64,
    timeout: Duration,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_ticket: std::sync::atomic::AtomicU64::new(1),
            timeout: DEFAULT_APPROVAL_TIMEOUT,
            notifier: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Suspend the caller until a decision, the timeout, or cancellation.
    ///
    /// Never fails: every non-decision outcome is a denial.
    pub async fn request(
        &self,
        request: ApprovalRequest,
        cancel: &CancellationToken,
    ) -> ApprovalDecision {
        let key = request.key();
        let ticket = self
            .next_ticket
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (responder, mut decision_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            let replaced = pending.insert(
                key.clone(),
                PendingApproval {
                    request: request.clone(),
                    ticket,
                    responder,
                },
            );
            if replaced.is_some() {
                tracing::warn!(
                    task_id = %key.0,
                    step_id = %key.1,
                    "replacing stale approval request"
                );
            }
        }

        tracing::info!(
            task_id = %key.0,
            step_id = %key.1,
            capability = %request.capability,
            "step awaiting approval"
        );
        // Announcing shares the deadline and cancellation with the wait.
        let announce = self.announce(request);
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(announce, deadline);
        let mut announced = false;
        let decision = loop {
            tokio::select! {
                _ = &mut announce, if !announced => announced = true,
                received = &mut decision_rx => break match received {
                    Ok(decision) => decision,
                    Err(_) => ApprovalDecision::deny("approval request dropped"),
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        task_id = %key.0,
                        step_id = %key.1,
                        timeout_ms = self.timeout.as_millis() as u64,
                        announced,
                        "approval timed out; denying"
                    );
                    break ApprovalDecision::deny("approval timed out");
                }
                _ = cancel.cancelled() => break ApprovalDecision::deny("run cancelled"),
            }
        };

        self.forget(&key, ticket).await;
        decision
    }

    /// Deliver a decision to the step waiting under (task_id, step_id).
    pub async fn resolve(
        &self,
        task_id: &str,
        step_id: &StepId,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        let key = (task_id.to_string(), step_id.clone());
        let entry = self
            .pending
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| ApprovalError::NoPendingRequest(key.0.clone(), key.1.clone()))?;
        tracing::info!(
            task_id = %key.0,
            step_id = %key.1,
            approved = decision.is_approved(),
            "approval resolved"
        );
        entry
            .responder
            .send(decision)
            .map_err(|_| ApprovalError::RequestClosed(key.0, key.1))
    }

    /// Requests currently awaiting a decision, ordered by key.
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let pending = self.pending.lock().await;
        let mut requests: Vec<ApprovalRequest> =
            pending.values().map(|entry| entry.request.clone()).collect();
        requests.sort_by(|a, b| a.key().cmp(&b.key()));
        requests
    }

    async fn announce(&self, request: ApprovalRequest) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let key = request.key();
        if let Err(err) = notifier.notify(request).await {
            tracing::warn!(task_id = %key.0, step_id = %key.1, "failed to announce approval request: {}", err);
        }
    }

    async fn forget(&self, key: &ApprovalKey, ticket: u64) {
        let mut pending = self.pending.lock().await;
        if pending.get(key).map(|entry| entry.ticket) == Some(ticket) {
            pending.remove(key);
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}
