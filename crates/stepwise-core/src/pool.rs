//! Worker pool for fan-out
//!
//! Runs a homogeneous batch of independent capability invocations on a
//! bounded set of workers pulling from a shared queue. The hard ceiling is
//! enforced across all concurrent batches by one semaphore. Partial failure
//! is reported, never raised.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capability::{CapabilityError, CapabilityRegistry, InvocationContext};
use crate::retry::{invoke_with_retry, RetryPolicy};
use crate::types::{duration_ms, StepId, TaskId};

pub const DEFAULT_HARD_CEILING: usize = 8;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One independent capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub capability: String,
    #[serde(default)]
    pub args: Value,
}

impl WorkItem {
    pub fn new(capability: impl Into<String>, args: Value) -> Self {
        Self {
            capability: capability.into(),
            args,
        }
    }
}

/// Finite ordered sequence of work items.
#[derive(Debug, Clone, Default)]
pub struct WorkBatch {
    pub task_id: TaskId,
    /// Step that fanned out, used to label item invocations
    pub step_id: StepId,
    pub items: Vec<WorkItem>,
}

impl WorkBatch {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            task_id: TaskId::new(),
            step_id: StepId::default(),
            items,
        }
    }

    pub fn for_step(mut self, task_id: impl Into<TaskId>, step_id: impl Into<StepId>) -> Self {
        self.task_id = task_id.into();
        self.step_id = step_id.into();
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of a single item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Position in the batch
    pub index: usize,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ItemOutcome {
    fn cancelled(index: usize) -> Self {
        Self {
            index,
            ok: false,
            value: None,
            error: Some(CapabilityError::Cancelled.to_string()),
            attempts: 0,
            duration_ms: 0,
        }
    }
}

/// Every item's outcome, in batch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub outcomes: Vec<ItemOutcome>,
    pub succeeded: usize,
    pub failed: usize,
}

impl AggregatedResult {
    fn from_outcomes(mut outcomes: Vec<ItemOutcome>) -> Self {
        outcomes.sort_by_key(|outcome| outcome.index);
        let succeeded = outcomes.iter().filter(|outcome| outcome.ok).count();
        let failed = outcomes.len() - succeeded;
        Self {
            outcomes,
            succeeded,
            failed,
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn successes(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.ok)
    }

    /// JSON view: `{succeeded, failed, outcomes}`
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

struct PoolInner {
    registry: Arc<CapabilityRegistry>,
    hard_ceiling: usize,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    tracker: TaskTracker,
}

/// Cheap-to-clone handle; clones share the ceiling and shutdown state.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(registry: Arc<CapabilityRegistry>, hard_ceiling: usize) -> Self {
        Self::with_options(
            registry,
            hard_ceiling,
            RetryPolicy::default(),
            DEFAULT_SHUTDOWN_GRACE,
        )
    }

    pub fn with_options(
        registry: Arc<CapabilityRegistry>,
        hard_ceiling: usize,
        retry: RetryPolicy,
        shutdown_grace: Duration,
    ) -> Self {
        let hard_ceiling = hard_ceiling.max(1);
        Self {
            inner: Arc::new(PoolInner {
                registry,
                hard_ceiling,
                permits: Arc::new(Semaphore::new(hard_ceiling)),
                retry,
                shutdown: CancellationToken::new(),
                shutdown_grace,
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn hard_ceiling(&self) -> usize {
        self.inner.hard_ceiling
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run `batch` with at most `min(max_parallel, hard_ceiling)` workers.
    ///
    /// On cancellation or pool shutdown, workers stop pulling items, get the
    /// shutdown grace period to finish, then are aborted. Items that never
    /// finished are reported as failed ("cancelled").
    pub async fn run(
        &self,
        batch: WorkBatch,
        max_parallel: usize,
        cancel: CancellationToken,
    ) -> AggregatedResult {
        let total = batch.items.len();
        if total == 0 {
            return AggregatedResult::default();
        }
        let workers = max_parallel.max(1).min(self.inner.hard_ceiling).min(total);
        tracing::debug!(
            task_id = %batch.task_id,
            step_id = %batch.step_id,
            items = total,
            workers,
            "fan-out batch started"
        );

        let token = self.inner.shutdown.child_token();
        let queue: Arc<Mutex<VecDeque<(usize, WorkItem)>>> =
            Arc::new(Mutex::new(batch.items.into_iter().enumerate().collect()));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut join_set = JoinSet::new();

        for _ in 0..workers {
            let worker = Worker {
                inner: self.inner.clone(),
                queue: queue.clone(),
                outcomes: outcome_tx.clone(),
                token: token.clone(),
                task_id: batch.task_id.clone(),
                step_id: batch.step_id.clone(),
            };
            join_set.spawn(self.inner.tracker.track_future(worker.run()));
        }
        drop(outcome_tx);

        let finished = tokio::select! {
            _ = drain(&mut join_set) => true,
            _ = cancel.cancelled() => false,
            _ = token.cancelled() => false,
        };
        if !finished {
            token.cancel();
            let grace = self.inner.shutdown_grace;
            if tokio::time::timeout(grace, drain(&mut join_set)).await.is_err() {
                tracing::warn!(
                    task_id = %batch.task_id,
                    step_id = %batch.step_id,
                    remaining = join_set.len(),
                    "fan-out workers ignored cancellation; aborting"
                );
                join_set.abort_all();
                drain(&mut join_set).await;
            }
        }

        let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; total];
        while let Ok(outcome) = outcome_rx.try_recv() {
            let index = outcome.index;
            if let Some(slot) = outcomes.get_mut(index) {
                *slot = Some(outcome);
            }
        }
        let outcomes: Vec<ItemOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| outcome.unwrap_or_else(|| ItemOutcome::cancelled(index)))
            .collect();

        let aggregated = AggregatedResult::from_outcomes(outcomes);
        tracing::debug!(
            task_id = %batch.task_id,
            step_id = %batch.step_id,
            succeeded = aggregated.succeeded,
            failed = aggregated.failed,
            "fan-out batch finished"
        );
        aggregated
    }

    /// Cancel all batches, wait up to the grace period for their workers, and
    /// refuse further work.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        // Batches abort stragglers themselves after the grace period.
        let wait = self.inner.shutdown_grace + Duration::from_millis(100);
        if tokio::time::timeout(wait, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.inner.tracker.len(),
                "worker pool shutdown timed out"
            );
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("hard_ceiling", &self.inner.hard_ceiling)
            .field("available", &self.inner.permits.available_permits())
            .finish()
    }
}

async fn drain(join_set: &mut JoinSet<()>) {
    while let Some(joined) = join_set.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                tracing::error!("fan-out worker panicked: {}", err);
            }
        }
    }
}

struct Worker {
    inner: Arc<PoolInner>,
    queue: Arc<Mutex<VecDeque<(usize, WorkItem)>>>,
    outcomes: mpsc::UnboundedSender<ItemOutcome>,
    token: CancellationToken,
    task_id: TaskId,
    step_id: StepId,
}

impl Worker {
    async fn run(self) {
        let permit = tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => permit,
            _ = self.token.cancelled() => return,
        };
        let Ok(_permit) = permit else {
            return;
        };

        while !self.token.is_cancelled() {
            let next = self.queue.lock().await.pop_front();
            let Some((index, item)) = next else {
                break;
            };
            let outcome = self.process(index, item).await;
            if self.outcomes.send(outcome).is_err() {
                break;
            }
        }
    }

    async fn process(&self, index: usize, item: WorkItem) -> ItemOutcome {
        let started = Instant::now();
        let Some(capability) = self.inner.registry.get(&item.capability) else {
            return ItemOutcome {
                index,
                ok: false,
                value: None,
                error: Some(CapabilityError::Unknown(item.capability).to_string()),
                attempts: 0,
                duration_ms: 0,
            };
        };
        let timeout = self
            .inner
            .registry
            .meta(&item.capability)
            .map(|meta| meta.timeout)
            .unwrap_or(crate::capability::DEFAULT_CAPABILITY_TIMEOUT);
        let item_step = StepId::new(format!("{}[{}]", self.step_id, index));

        let outcome = invoke_with_retry(
            capability.as_ref(),
            &item.args,
            timeout,
            &self.inner.retry,
            &self.token,
            |attempt| {
                InvocationContext::new(self.task_id.clone(), item_step.clone())
                    .with_attempt(attempt)
                    .with_cancellation_token(self.token.child_token())
            },
            |next_attempt, error, delay| {
                tracing::warn!(
                    task_id = %self.task_id,
                    step_id = %item_step,
                    capability = %item.capability,
                    retry_attempt = next_attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "retrying fan-out item: {}",
                    error
                );
            },
        )
        .await;

        let duration_ms = duration_ms(started.elapsed());
        match outcome.result {
            Ok(value) => ItemOutcome {
                index,
                ok: true,
                value: Some(value),
                error: None,
                attempts: outcome.attempts,
                duration_ms,
            },
            Err(error) => ItemOutcome {
                index,
                ok: false,
                value: None,
                error: Some(error.to_string()),
                attempts: outcome.attempts,
                duration_ms,
            },
        }
    }
}
