//! InvocationContext type definition

use tokio_util::sync::CancellationToken;

use super::CapabilityError;
use crate::pool::{AggregatedResult, WorkBatch, WorkItem, WorkerPool};
use crate::types::{StepId, TaskId};

/// Context handed to every capability invocation
///
/// Provides:
/// - Task and step identification
/// - Attempt number and a per-attempt execution id
/// - CancellationToken for cooperative cancellation
/// - Access to the worker pool for fan-out
#[derive(Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    pub step_id: StepId,
    /// Distinguishes retries of the same step
    pub execution_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the run is cancelled or aborted
    pub cancellation_token: CancellationToken,
    pool: Option<WorkerPool>,
}

impl InvocationContext {
    pub fn new(task_id: impl Into<TaskId>, step_id: impl Into<StepId>) -> Self {
        Self {
            task_id: task_id.into(),
            step_id: step_id.into(),
            execution_id: Self::new_execution_id(),
            attempt: 1,
            cancellation_token: CancellationToken::new(),
            pool: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn new_execution_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    /// Run `items` on the worker pool, bounded by `max_parallel` and the pool ceiling.
    ///
    /// The batch is cancelled together with this invocation. Whether partial
    /// failure fails the step is up to the caller.
    pub async fn fan_out(
        &self,
        items: Vec<WorkItem>,
        max_parallel: usize,
    ) -> Result<AggregatedResult, CapabilityError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| CapabilityError::failed("no worker pool attached to this invocation"))?;
        let batch = WorkBatch::new(items).for_step(self.task_id.clone(), self.step_id.clone());
        Ok(pool
            .run(batch, max_parallel, self.cancellation_token.child_token())
            .await)
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("task_id", &self.task_id)
            .field("step_id", &self.step_id)
            .field("execution_id", &self.execution_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
