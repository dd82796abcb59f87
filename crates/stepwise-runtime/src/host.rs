//! Host side of the control channel
//!
//! Owns the connection to one sandbox: sends dispatch, cancel and approval
//! decisions, probes health, and fans sandbox messages out on a broadcast bus
//! for UI or telemetry subscribers. Slow subscribers lag and lose events;
//! the sandbox is never back-pressured by them.

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use stepwise_channel::{Connection, ControlMessage, Direction};
use stepwise_config::ChannelConfig;
use stepwise_core::approval::{ApprovalDecision, ApprovalRequest};
use stepwise_core::events::ProgressEvent;
use stepwise_core::types::{Plan, RunSummary, StepId, TaskId};

use crate::health::{run_prober, HealthMonitor, HealthStatus};
use crate::RuntimeError;

/// What the sandbox reports, as seen by host subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Progress(ProgressEvent),
    ApprovalRequested(ApprovalRequest),
    Completed(RunSummary),
    DispatchRefused {
        task_id: TaskId,
        plan_version: u32,
        reason: String,
    },
}

impl HostEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress(event) => &event.task_id,
            Self::ApprovalRequested(request) => &request.task_id,
            Self::Completed(summary) => &summary.task_id,
            Self::DispatchRefused { task_id, .. } => task_id,
        }
    }
}

pub struct HostController {
    outbound: mpsc::Sender<ControlMessage>,
    events: broadcast::Sender<HostEvent>,
    health: HealthMonitor,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl HostController {
    /// Start reader, writer and health prober over `connection`.
    pub fn connect<R, W>(connection: Connection<R, W>, config: &ChannelConfig) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = connection.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ControlMessage>(config.outbound_buffer);
        let (events, _) = broadcast::channel(config.event_buffer);
        let health = HealthMonitor::new();
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let writer_token = token.clone();
        tracker.spawn(async move {
            loop {
                let message = tokio::select! {
                    message = outbound_rx.recv() => message,
                    _ = writer_token.cancelled() => None,
                };
                let Some(message) = message else {
                    break;
                };
                if let Err(err) = writer.send(message).await {
                    tracing::error!("failed to write to sandbox: {}", err);
                    break;
                }
            }
        });

        let reader_token = token.clone();
        let reader_events = events.clone();
        let reader_health = health.clone();
        tracker.spawn(async move {
            loop {
                let next = tokio::select! {
                    next = reader.next() => next,
                    _ = reader_token.cancelled() => break,
                };
                let message = match next {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::warn!("sandbox closed the control channel");
                        break;
                    }
                    Err(err) => {
                        tracing::error!("control channel read failed: {}", err);
                        break;
                    }
                };
                if message.direction() != Direction::SandboxToHost {
                    tracing::warn!(kind = message.kind(), "dropping message sent in the wrong direction");
                    continue;
                }
                let event = match message {
                    ControlMessage::HealthAck { nonce } => {
                        reader_health.acknowledge(nonce);
                        continue;
                    }
                    ControlMessage::Progress(event) => HostEvent::Progress(event),
                    ControlMessage::ApprovalRequest(request) => {
                        tracing::info!(
                            task_id = %request.task_id,
                            step_id = %request.step_id,
                            capability = %request.capability,
                            "sandbox requests approval"
                        );
                        HostEvent::ApprovalRequested(request)
                    }
                    ControlMessage::Completion(summary) => {
                        tracing::info!(
                            task_id = %summary.task_id,
                            status = %summary.status,
                            duration_ms = summary.duration_ms,
                            "task completed in sandbox"
                        );
                        HostEvent::Completed(summary)
                    }
                    ControlMessage::DispatchRefused {
                        task_id,
                        plan_version,
                        reason,
                    } => {
                        tracing::warn!(
                            task_id = %task_id,
                            plan_version,
                            "sandbox refused dispatch: {}",
                            reason
                        );
                        HostEvent::DispatchRefused {
                            task_id,
                            plan_version,
                            reason,
                        }
                    }
                    _ => continue,
                };
                // No subscribers is fine.
                let _ = reader_events.send(event);
            }
        });

        tracker.spawn(run_prober(
            health.clone(),
            outbound.clone(),
            config.probe_interval(),
            config.probe_timeout(),
            token.clone(),
        ));
        tracker.close();

        Self {
            outbound,
            events,
            health,
            token,
            tracker,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<HealthStatus> {
        self.health.subscribe()
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    pub async fn dispatch(&self, plan: Plan) -> Result<(), RuntimeError> {
        tracing::info!(task_id = %plan.task_id, plan_version = plan.version, "dispatching task to sandbox");
        self.send(ControlMessage::Dispatch { plan }).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<(), RuntimeError> {
        self.send(ControlMessage::Cancel {
            task_id: task_id.to_string(),
        })
        .await
    }

    pub async fn decide(
        &self,
        task_id: &str,
        step_id: &StepId,
        decision: ApprovalDecision,
    ) -> Result<(), RuntimeError> {
        self.send(ControlMessage::ApprovalDecision {
            task_id: task_id.to_string(),
            step_id: step_id.clone(),
            decision,
        })
        .await
    }

    /// Dispatch `plan` and wait for the completion of that plan version.
    /// Approval requests must be answered by another subscriber.
    pub async fn run(&self, plan: Plan) -> Result<RunSummary, RuntimeError> {
        let mut events = self.subscribe();
        let task_id = plan.task_id.clone();
        let version = plan.version;
        self.dispatch(plan).await?;
        loop {
            match events.recv().await {
                Ok(HostEvent::Completed(summary))
                    if summary.task_id == task_id && summary.plan_version == version =>
                {
                    return Ok(summary)
                }
                Ok(HostEvent::DispatchRefused {
                    task_id: refused,
                    plan_version,
                    reason,
                }) if refused == task_id && plan_version == version => {
                    return Err(RuntimeError::DispatchRefused {
                        task_id,
                        plan_version,
                        reason,
                    })
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(task_id = %task_id, skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RuntimeError::ChannelClosed),
            }
        }
    }

    /// Stop reader, writer and prober.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.wait().await;
    }

    async fn send(&self, message: ControlMessage) -> Result<(), RuntimeError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| RuntimeError::ChannelClosed)
    }
}
