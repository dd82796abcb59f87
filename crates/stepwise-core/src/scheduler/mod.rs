//! Dependency scheduler
//!
//! The scheduler is responsible for:
//! - Validating a plan before anything runs
//! - Dispatching ready steps in plan order under a concurrency ceiling
//! - Suspending gated steps on the approval gate
//! - Retrying transient failures, cascading skips, aborting on critical failure
//! - Cancellation with a grace period, then force-drop
//!
//! All bookkeeping happens in one loop that exclusively owns the step graph
//! and the execution context. Step futures only report back.

mod graph;
mod step;
#[cfg(test)]
mod tests;

pub use graph::{transition_allowed, StepGraph, StepNode, Transition, TransitionError};

use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalGate;
use crate::capability::{schema, CapabilityRegistry};
use crate::context::ExecutionContext;
use crate::events::{ExecutionEvent, ProgressEvent, ProgressSink};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::types::{
    duration_ms, Criticality, ErrorKind, Plan, RunStatus, RunSummary, StepError, StepId,
    StepResult, StepStatus, RUN_ABORTED, RUN_CANCELLED,
};
use crate::validation::{PlanValidator, StructuralValidator, ValidationError};
use step::{DispatchedStep, StepCompletion, StepSignal};

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

const MAX_LOG_TEXT_CHARS: usize = 240;
const DEADLOCK_REASON: &str = "unsatisfiable dependencies";

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Why dispatch stopped before the graph was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    Aborted,
    Deadlock,
}

impl StopReason {
    fn skip_reason(&self) -> &'static str {
        match self {
            Self::Cancelled => RUN_CANCELLED,
            Self::Aborted => RUN_ABORTED,
            Self::Deadlock => DEADLOCK_REASON,
        }
    }

    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Aborted => ErrorKind::Aborted,
            Self::Deadlock => ErrorKind::Structural,
        }
    }
}

/// The scheduler - drives a plan to completion
pub struct Scheduler {
    registry: Arc<CapabilityRegistry>,
    gate: Arc<ApprovalGate>,
    pool: Option<WorkerPool>,
    validators: Vec<Arc<dyn PlanValidator>>,
    max_parallel: usize,
    retry: RetryPolicy,
    /// Overrides capability timeouts; a step's own timeout wins over both
    step_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl Scheduler {
    pub fn new(registry: Arc<CapabilityRegistry>, gate: Arc<ApprovalGate>) -> Self {
        Self {
            registry,
            gate,
            pool: None,
            validators: Vec::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            retry: RetryPolicy::default(),
            step_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Set maximum concurrently running steps
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Worker pool handed to capabilities for fan-out
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Extra validation run after the built-in structural checks
    pub fn with_validator(mut self, validator: Arc<dyn PlanValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn validate(&self, plan: &Plan) -> Result<(), ValidationError> {
        StructuralValidator::with_registry(&self.registry).validate(plan)?;
        for validator in &self.validators {
            validator.validate(plan)?;
        }
        Ok(())
    }

    /// Validate and execute `plan`.
    ///
    /// Step failures never surface here; they are in the summary. Only a
    /// structurally invalid plan is an error, and then nothing runs.
    pub async fn run(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, ValidationError> {
        if let Err(err) = self.validate(plan) {
            tracing::warn!(
                task_id = %plan.task_id,
                plan_version = plan.version,
                "plan rejected: {}",
                err
            );
            return Err(err);
        }
        Ok(self.execute(plan, cancel, sink).await)
    }

    async fn execute(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
        sink: &dyn ProgressSink,
    ) -> RunSummary {
        let mut run = RunLoop::new(self, plan, cancel, sink);
        run.drive().await;
        run.finish()
    }
}

/// State of one run. Owned by the loop; dropped when the run ends.
struct RunLoop<'a> {
    scheduler: &'a Scheduler,
    plan: &'a Plan,
    sink: &'a dyn ProgressSink,
    graph: StepGraph,
    context: ExecutionContext,
    cancel: CancellationToken,
    /// Cancelled on abort or cancel so in-flight steps can stop cooperatively
    run_token: CancellationToken,
    signals_tx: mpsc::UnboundedSender<StepSignal>,
    signals_rx: mpsc::UnboundedReceiver<StepSignal>,
    /// Run slots; a step holds one while running, not while awaiting approval
    slots: Arc<Semaphore>,
    stop: Option<StopReason>,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
}

impl<'a> RunLoop<'a> {
    fn new(
        scheduler: &'a Scheduler,
        plan: &'a Plan,
        cancel: CancellationToken,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            scheduler,
            plan,
            sink,
            graph: StepGraph::from_plan(plan),
            context: ExecutionContext::for_plan(plan),
            run_token: cancel.child_token(),
            cancel,
            signals_tx,
            signals_rx,
            slots: Arc::new(Semaphore::new(scheduler.max_parallel.max(1))),
            stop: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    async fn drive(&mut self) {
        tracing::info!(
            task_id = %self.plan.task_id,
            plan_version = self.plan.version,
            steps = self.plan.len(),
            max_parallel = self.scheduler.max_parallel,
            "run started"
        );
        self.settle();

        let mut in_flight = FuturesUnordered::new();
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            if self.stop.is_none() && self.cancel.is_cancelled() {
                tracing::info!(task_id = %self.plan.task_id, "run cancelled");
                self.halt(StopReason::Cancelled);
            }
            if self.stop.is_none() {
                for dispatched in self.dispatch_ready() {
                    in_flight.push(dispatched.execute());
                }
            }
            if self.stop.is_some() && grace_deadline.is_none() && !in_flight.is_empty() {
                grace_deadline = Some(tokio::time::Instant::now() + self.scheduler.cancel_grace);
            }

            if in_flight.is_empty() {
                if self.graph.is_finished() {
                    break;
                }
                if self.stop.is_none() {
                    tracing::error!(
                        task_id = %self.plan.task_id,
                        remaining = ?self.graph.not_started(),
                        "no step can make progress"
                    );
                    self.stop = Some(StopReason::Deadlock);
                }
                self.skip_not_started();
                break;
            }

            tokio::select! {
                biased;
                // Handled at the top of the loop.
                _ = self.cancel.cancelled(), if self.stop.is_none() => {}
                Some(signal) = self.signals_rx.recv() => self.on_signal(signal),
                Some(completion) = in_flight.next() => {
                    // Signals sent before completion must be seen first.
                    while let Ok(signal) = self.signals_rx.try_recv() {
                        self.on_signal(signal);
                    }
                    self.on_completion(completion);
                }
                _ = sleep_until_opt(grace_deadline), if grace_deadline.is_some() => {
                    tracing::warn!(
                        task_id = %self.plan.task_id,
                        remaining = in_flight.len(),
                        "in-flight steps outlived the grace period; dropping them"
                    );
                    in_flight.clear();
                    self.drop_in_flight();
                }
            }
        }
    }

    /// Launch ready steps while run slots are free. Steps whose arguments
    /// cannot be prepared fail on the spot, which may ready or skip others.
    fn dispatch_ready(&mut self) -> Vec<DispatchedStep> {
        let mut launched = Vec::new();
        loop {
            let ready = self.graph.ready();
            if ready.is_empty() {
                break;
            }
            let mut failed_any = false;
            let mut saturated = false;
            for id in ready {
                let Ok(slot) = self.slots.clone().try_acquire_owned() else {
                    saturated = true;
                    break;
                };
                if let Err(err) = self.graph.transition(&id, StepStatus::Running) {
                    tracing::error!(task_id = %self.plan.task_id, "refusing dispatch: {}", err);
                    continue;
                }
                self.emit(&id, StepStatus::Running, None, None);
                match self.prepare(&id) {
                    Ok(dispatched) => launched.push(dispatched.holding(slot)),
                    Err(error) => {
                        drop(slot);
                        tracing::warn!(
                            task_id = %self.plan.task_id,
                            step_id = %id,
                            "step arguments rejected: {}",
                            error
                        );
                        self.on_completion(StepCompletion {
                            step_id: id,
                            status: StepStatus::Failed,
                            result: StepResult::failure(error, 0, Duration::ZERO),
                            message: None,
                        });
                        failed_any = true;
                        if self.stop.is_some() {
                            break;
                        }
                    }
                }
            }
            if saturated || !failed_any || self.stop.is_some() {
                break;
            }
        }
        launched
    }

    fn prepare(&self, id: &StepId) -> Result<DispatchedStep, StepError> {
        let node = self
            .graph
            .node(id)
            .ok_or_else(|| StepError::new(ErrorKind::Structural, format!("unknown step '{}'", id)))?;
        let step = &node.step;
        let registry = &self.scheduler.registry;
        let (capability, meta) = match (registry.get(&step.capability), registry.meta(&step.capability)) {
            (Some(capability), Some(meta)) => (capability, meta.clone()),
            _ => {
                return Err(StepError::new(
                    ErrorKind::Argument,
                    format!("unknown capability '{}'", step.capability),
                ))
            }
        };

        let args = self
            .context
            .resolve(&step.args)
            .map_err(|err| StepError::new(ErrorKind::Argument, err.to_string()))?;
        schema::check(&args, &meta.input_schema).map_err(|violation| {
            StepError::new(ErrorKind::Argument, format!("arguments rejected: {}", violation))
        })?;

        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.scheduler.step_timeout)
            .unwrap_or(meta.timeout);

        tracing::debug!(
            task_id = %self.plan.task_id,
            step_id = %id,
            capability = %step.capability,
            timeout_ms = timeout.as_millis() as u64,
            args = %truncate_for_log(&args.to_string(), MAX_LOG_TEXT_CHARS),
            "dispatching step"
        );

        Ok(DispatchedStep {
            task_id: self.plan.task_id.clone(),
            step_id: id.clone(),
            description: step.description.clone(),
            capability,
            meta,
            args,
            timeout,
            retry: self.scheduler.retry.clone(),
            gate: self.scheduler.gate.clone(),
            pool: self.scheduler.pool.clone(),
            token: self.run_token.child_token(),
            signals: self.signals_tx.clone(),
            slots: self.slots.clone(),
            slot: None,
        })
    }

    fn on_signal(&mut self, signal: StepSignal) {
        match signal {
            StepSignal::Suspended(id) => self.move_in_flight(&id, StepStatus::Suspended),
            StepSignal::Resumed(id) => self.move_in_flight(&id, StepStatus::Running),
            StepSignal::Retrying {
                step_id,
                attempt,
                error,
            } => {
                if self.graph.status(&step_id) == Some(StepStatus::Running) {
                    let message = format!("attempt {} after: {}", attempt, error);
                    self.emit(&step_id, StepStatus::Running, None, Some(message));
                }
            }
        }
    }

    fn move_in_flight(&mut self, id: &StepId, to: StepStatus) {
        match self.graph.transition(id, to) {
            Ok(_) => self.emit(id, to, None, None),
            Err(err) => tracing::debug!(task_id = %self.plan.task_id, "ignoring late signal: {}", err),
        }
    }

    /// Apply a finished step: record it, feed the context, cascade or abort.
    fn on_completion(&mut self, completion: StepCompletion) {
        let StepCompletion {
            step_id,
            status,
            result,
            message,
        } = completion;
        if !self.graph.status(&step_id).is_some_and(|s| s.is_in_flight()) {
            tracing::debug!(task_id = %self.plan.task_id, step_id = %step_id, "discarding result of settled step");
            return;
        }

        // After cancel every late result is discarded; after an abort only the
        // steps that gave up because of it are.
        let interrupted = match self.stop {
            Some(StopReason::Cancelled) => true,
            Some(StopReason::Aborted) => {
                status == StepStatus::Skipped
                    || result.error.as_ref().map(|e| e.kind) == Some(ErrorKind::Cancelled)
            }
            _ => false,
        };
        if let (true, Some(reason)) = (interrupted, self.stop) {
            let discarded = StepResult::failure(
                StepError::new(reason.error_kind(), reason.skip_reason()),
                result.attempts,
                result.duration(),
            );
            self.finish_step(&step_id, StepStatus::Skipped, discarded, None);
            return;
        }

        let critical = self
            .graph
            .node(&step_id)
            .is_some_and(|node| node.step.criticality == Criticality::Critical);
        let value = result.value.clone();
        self.finish_step(&step_id, status, result, message);
        if status == StepStatus::Completed {
            if let Some(value) = value {
                if let Err(err) = self.context.insert(step_id.clone(), value) {
                    tracing::error!(task_id = %self.plan.task_id, "{}", err);
                }
            }
        }

        if critical && status != StepStatus::Completed && self.stop.is_none() {
            tracing::warn!(
                task_id = %self.plan.task_id,
                step_id = %step_id,
                status = %status,
                "critical step did not complete; aborting run"
            );
            self.halt(StopReason::Aborted);
            return;
        }
        self.settle();
    }

    /// Stop dispatch, skip everything not started and signal in-flight steps.
    fn halt(&mut self, reason: StopReason) {
        self.stop = Some(reason);
        self.run_token.cancel();
        self.skip_not_started();
    }

    fn skip_not_started(&mut self) {
        let Some(reason) = self.stop else {
            return;
        };
        for id in self.graph.not_started() {
            let result = StepResult::not_run(reason.error_kind(), reason.skip_reason());
            self.finish_step(&id, StepStatus::Skipped, result, None);
        }
    }

    fn drop_in_flight(&mut self) {
        let reason = self.stop.unwrap_or(StopReason::Cancelled);
        for id in self.graph.in_flight() {
            let result = StepResult::not_run(reason.error_kind(), reason.skip_reason());
            self.finish_step(&id, StepStatus::Skipped, result, None);
        }
    }

    fn settle(&mut self) {
        for change in self.graph.settle() {
            let result = if change.status.is_terminal() {
                self.graph
                    .node(&change.step_id)
                    .and_then(|node| node.result.clone())
            } else {
                None
            };
            let message = change.reason.map(str::to_string);
            self.emit(&change.step_id, change.status, result, message);
        }
    }

    fn finish_step(
        &mut self,
        id: &StepId,
        status: StepStatus,
        result: StepResult,
        message: Option<String>,
    ) {
        let message = message.or_else(|| result.error_message().map(str::to_string));
        match self.graph.finish(id, status, result.clone()) {
            Ok(_) => {
                tracing::info!(
                    task_id = %self.plan.task_id,
                    step_id = %id,
                    status = %status,
                    attempts = result.attempts,
                    duration_ms = result.duration_ms,
                    "step finished"
                );
                self.emit(id, status, Some(result), message);
            }
            Err(err) => tracing::error!(task_id = %self.plan.task_id, "{}", err),
        }
    }

    fn emit(
        &self,
        id: &StepId,
        status: StepStatus,
        result: Option<StepResult>,
        message: Option<String>,
    ) {
        let capability = self
            .graph
            .node(id)
            .map(|node| node.step.capability.clone())
            .unwrap_or_default();
        let mut event = ProgressEvent::new(self.plan.task_id.clone(), id.clone(), capability, status);
        if let Some(result) = result {
            event = event.with_result(result);
        }
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.sink.emit(ExecutionEvent::Step(event));
    }

    fn finish(self) -> RunSummary {
        let status = match self.stop {
            Some(StopReason::Cancelled) => RunStatus::Cancelled,
            Some(StopReason::Deadlock) => RunStatus::StructuralError,
            Some(StopReason::Aborted) => RunStatus::Failed,
            None if self.graph.count(StepStatus::Failed) > 0 => RunStatus::Failed,
            None if self.graph.count(StepStatus::Skipped) > 0 => RunStatus::CompletedWithSkips,
            None => RunStatus::Completed,
        };
        let summary = RunSummary {
            task_id: self.plan.task_id.clone(),
            plan_version: self.plan.version,
            status,
            steps: self.graph.reports(),
            duration_ms: duration_ms(self.started.elapsed()),
            started_at: self.started_at,
            finished_at: Utc::now(),
            error: match self.stop {
                Some(StopReason::Deadlock) => Some(DEADLOCK_REASON.to_string()),
                _ => None,
            },
        };
        tracing::info!(
            task_id = %summary.task_id,
            plan_version = summary.plan_version,
            status = %summary.status,
            completed = summary.count(StepStatus::Completed),
            failed = summary.count(StepStatus::Failed),
            skipped = summary.count(StepStatus::Skipped),
            duration_ms = summary.duration_ms,
            "run finished"
        );
        self.sink.emit(ExecutionEvent::RunFinished(summary.clone()));
        summary
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
