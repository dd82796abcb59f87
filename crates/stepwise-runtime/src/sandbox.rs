//! Sandbox side of the control channel
//!
//! Receives dispatch, cancel, approval decisions and health probes from the
//! host; runs plans on the scheduler and streams progress, approval requests
//! and completions back. Each task runs in its own tokio task.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use stepwise_channel::{Connection, ControlMessage, Direction};
use stepwise_config::StepwiseConfig;
use stepwise_core::approval::{ApprovalDecision, ApprovalGate, ApprovalNotifier, ApprovalRequest};
use stepwise_core::capability::CapabilityRegistry;
use stepwise_core::events::{ChannelProgressSink, ExecutionEvent};
use stepwise_core::scheduler::Scheduler;
use stepwise_core::types::{Plan, RunSummary, StepId, TaskId};

use crate::bootstrap::{build_gate, build_scheduler};
use crate::RuntimeError;

/// Announces approval requests to the host over the channel.
struct ChannelNotifier {
    outbound: mpsc::Sender<ControlMessage>,
}

#[async_trait]
impl ApprovalNotifier for ChannelNotifier {
    async fn notify(&self, request: ApprovalRequest) -> Result<(), String> {
        self.outbound
            .send(ControlMessage::ApprovalRequest(request))
            .await
            .map_err(|_| "control channel closed".to_string())
    }
}

/// Finished tasks remembered for redelivery replies.
const FINISHED_TASK_RETENTION: usize = 1024;

#[derive(Debug)]
enum TaskState {
    Running { version: u32, token: CancellationToken },
    Finished(RunSummary),
}

/// Task states by id. Finished entries beyond the retention are evicted oldest first.
#[derive(Debug)]
struct TaskTable {
    states: HashMap<TaskId, TaskState>,
    finished: VecDeque<TaskId>,
    retention: usize,
}

impl TaskTable {
    fn new(retention: usize) -> Self {
        Self {
            states: HashMap::new(),
            finished: VecDeque::new(),
            retention: retention.max(1),
        }
    }

    fn finish(&mut self, summary: RunSummary) {
        let task_id = summary.task_id.clone();
        self.states.insert(task_id.clone(), TaskState::Finished(summary));
        self.finished.retain(|id| id != &task_id);
        self.finished.push_back(task_id);
        while self.finished.len() > self.retention {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if matches!(self.states.get(&oldest), Some(TaskState::Finished(_))) {
                self.states.remove(&oldest);
            }
        }
    }
}

/// What a dispatch message leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started,
    /// Same version is running; its completion answers the redelivery
    AlreadyRunning,
    /// Same version already finished; its completion is sent again
    Replayed,
    /// Another version is running or a later one finished; the host is told
    Refused,
}

pub struct SandboxAgent {
    scheduler: Arc<Scheduler>,
    outbound: mpsc::Sender<ControlMessage>,
    tasks: Arc<Mutex<TaskTable>>,
    tracker: TaskTracker,
    event_buffer: usize,
    shutdown_grace: Duration,
}

impl SandboxAgent {
    /// Build an agent and the receiver of everything it sends to the host.
    pub fn new(
        config: &StepwiseConfig,
        registry: Arc<CapabilityRegistry>,
    ) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(config.channel.outbound_buffer);
        let notifier = Arc::new(ChannelNotifier {
            outbound: outbound.clone(),
        });
        let gate = Arc::new(build_gate(config, notifier));
        let scheduler = Arc::new(build_scheduler(config, registry, gate));
        let agent = Self {
            scheduler,
            outbound,
            tasks: Arc::new(Mutex::new(TaskTable::new(FINISHED_TASK_RETENTION))),
            tracker: TaskTracker::new(),
            event_buffer: config.channel.event_buffer,
            shutdown_grace: config.scheduler.cancel_grace() + Duration::from_secs(1),
        };
        (agent, outbound_rx)
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        self.scheduler.gate()
    }

    /// Handle one inbound message. Only a closed outbound channel is an error.
    pub async fn handle(&self, message: ControlMessage) -> Result<(), RuntimeError> {
        if message.direction() != Direction::HostToSandbox {
            tracing::warn!(kind = message.kind(), "dropping message sent in the wrong direction");
            return Ok(());
        }
        match message {
            ControlMessage::Dispatch { plan } => {
                self.dispatch(plan).await;
            }
            ControlMessage::Cancel { task_id } => {
                self.cancel(&task_id);
            }
            ControlMessage::ApprovalDecision {
                task_id,
                step_id,
                decision,
            } => self.decide(&task_id, &step_id, decision).await,
            ControlMessage::HealthProbe { nonce } => {
                self.outbound
                    .send(ControlMessage::HealthAck { nonce })
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Start `plan`, or answer a dispatch that must not run again.
    ///
    /// Every dispatch gets a completion or a refusal for its own version,
    /// except a redelivery of the running version, which is answered by that
    /// run's completion.
    pub async fn dispatch(&self, plan: Plan) -> DispatchOutcome {
        let token = CancellationToken::new();
        let reply = match self.tasks.lock() {
            Err(_) => {
                tracing::error!(task_id = %plan.task_id, "task table poisoned; refusing dispatch");
                Some((DispatchOutcome::Refused, refusal(&plan, "task table unavailable".to_string())))
            }
            Ok(mut tasks) => match tasks.states.get(&plan.task_id) {
                Some(TaskState::Running { version, .. }) if *version == plan.version => {
                    tracing::info!(
                        task_id = %plan.task_id,
                        plan_version = plan.version,
                        "task already running at this version; ignoring dispatch"
                    );
                    return DispatchOutcome::AlreadyRunning;
                }
                Some(TaskState::Running { version, .. }) => {
                    let reason = format!("task is running version {}", version);
                    Some((DispatchOutcome::Refused, refusal(&plan, reason)))
                }
                Some(TaskState::Finished(summary)) if summary.plan_version == plan.version => {
                    tracing::info!(
                        task_id = %plan.task_id,
                        plan_version = plan.version,
                        "task already finished at this version; replaying completion"
                    );
                    Some((DispatchOutcome::Replayed, ControlMessage::Completion(summary.clone())))
                }
                Some(TaskState::Finished(summary)) if summary.plan_version > plan.version => {
                    let reason = format!("task already finished version {}", summary.plan_version);
                    Some((DispatchOutcome::Refused, refusal(&plan, reason)))
                }
                _ => {
                    tasks.states.insert(
                        plan.task_id.clone(),
                        TaskState::Running {
                            version: plan.version,
                            token: token.clone(),
                        },
                    );
                    None
                }
            },
        };
        if let Some((outcome, reply)) = reply {
            if let ControlMessage::DispatchRefused { reason, .. } = &reply {
                tracing::warn!(task_id = %plan.task_id, plan_version = plan.version, "refusing dispatch: {}", reason);
            }
            if self.outbound.send(reply).await.is_err() {
                tracing::warn!(task_id = %plan.task_id, "control channel closed before dispatch reply was sent");
            }
            return outcome;
        }

        tracing::info!(task_id = %plan.task_id, plan_version = plan.version, steps = plan.len(), "task dispatched");
        let scheduler = self.scheduler.clone();
        let outbound = self.outbound.clone();
        let tasks = self.tasks.clone();
        let event_buffer = self.event_buffer;
        self.tracker.spawn(async move {
            let summary = run_task(&scheduler, &plan, token, outbound.clone(), event_buffer).await;
            if let Ok(mut tasks) = tasks.lock() {
                tasks.finish(summary.clone());
            }
            if outbound.send(ControlMessage::Completion(summary)).await.is_err() {
                tracing::warn!(task_id = %plan.task_id, "control channel closed before completion was sent");
            }
        });
        DispatchOutcome::Started
    }

    /// Best-effort: unknown or finished tasks are ignored.
    pub fn cancel(&self, task_id: &str) -> bool {
        let token = match self.tasks.lock() {
            Ok(tasks) => match tasks.states.get(task_id) {
                Some(TaskState::Running { token, .. }) => Some(token.clone()),
                _ => None,
            },
            Err(_) => None,
        };
        match token {
            Some(token) => {
                tracing::info!(task_id = %task_id, "cancelling task");
                token.cancel();
                true
            }
            None => {
                tracing::debug!(task_id = %task_id, "cancel for a task that is not running");
                false
            }
        }
    }

    async fn decide(&self, task_id: &str, step_id: &StepId, decision: ApprovalDecision) {
        if let Err(err) = self.gate().resolve(task_id, step_id, decision).await {
            tracing::warn!(task_id = %task_id, step_id = %step_id, "dropping approval decision: {}", err);
        }
    }

    /// Cancel every running task and wait for them to report, bounded.
    pub async fn shutdown(&self) {
        if let Ok(tasks) = self.tasks.lock() {
            for state in tasks.states.values() {
                if let TaskState::Running { token, .. } = state {
                    token.cancel();
                }
            }
        }
        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("sandbox tasks did not finish within the shutdown grace");
        }
    }

    /// Serve a connection until the host hangs up, then shut down.
    pub async fn serve<R, W>(
        &self,
        connection: Connection<R, W>,
        mut outbound_rx: mpsc::Receiver<ControlMessage>,
    ) -> Result<(), RuntimeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = connection.split();
        let closing = CancellationToken::new();
        let writer_closing = closing.clone();
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<TaskId>();
        let writer_task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    message = outbound_rx.recv() => message,
                    _ = writer_closing.cancelled() => outbound_rx.try_recv().ok(),
                };
                let Some(message) = message else {
                    break;
                };
                let finished = match &message {
                    ControlMessage::Completion(summary) => {
                        tracing::debug!(task_id = %summary.task_id, "sending completion");
                        Some(summary.task_id.clone())
                    }
                    _ => None,
                };
                if let Err(err) = writer.send(message).await {
                    tracing::error!("failed to write to control channel: {}", err);
                    break;
                }
                if let Some(task_id) = finished {
                    // Reader is gone once serving stops.
                    let _ = finished_tx.send(task_id);
                }
            }
        });

        let result = loop {
            let next = tokio::select! {
                biased;
                Some(task_id) = finished_rx.recv() => {
                    reader.forget(&task_id);
                    continue;
                }
                next = reader.next() => next,
            };
            match next {
                Ok(Some(message)) => {
                    if let Err(err) = self.handle(message).await {
                        break Err(err);
                    }
                }
                Ok(None) => {
                    tracing::info!("host closed the control channel");
                    break Ok(());
                }
                Err(err) => break Err(RuntimeError::Channel(err)),
            }
        };

        self.shutdown().await;
        closing.cancel();
        if let Err(err) = writer_task.await {
            tracing::error!("channel writer task failed: {}", err);
        }
        result
    }
}

fn refusal(plan: &Plan, reason: String) -> ControlMessage {
    ControlMessage::DispatchRefused {
        task_id: plan.task_id.clone(),
        plan_version: plan.version,
        reason,
    }
}

/// Run one plan, forwarding step events as they happen.
async fn run_task(
    scheduler: &Scheduler,
    plan: &Plan,
    token: CancellationToken,
    outbound: mpsc::Sender<ControlMessage>,
    event_buffer: usize,
) -> RunSummary {
    let (sink, mut events) = ChannelProgressSink::new(event_buffer);
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            // The completion goes out separately, after every progress event.
            let ExecutionEvent::Step(event) = event else {
                continue;
            };
            if outbound.send(ControlMessage::Progress(event)).await.is_err() {
                break;
            }
        }
    });

    let summary = match scheduler.run(plan, token, &sink).await {
        Ok(summary) => summary,
        Err(err) => RunSummary::rejected(plan, err.to_string()),
    };
    if sink.dropped() > 0 {
        tracing::warn!(task_id = %plan.task_id, dropped = sink.dropped(), "progress events dropped");
    }
    drop(sink);
    if let Err(err) = forwarder.await {
        tracing::error!(task_id = %plan.task_id, "progress forwarder failed: {}", err);
    }
    summary
}
