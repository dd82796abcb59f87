//! Sandbox health as seen from the host.
//!
//! The host probes periodically. A probe not acknowledged within the timeout
//! marks the sandbox unhealthy; restarting it is someone else's job.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stepwise_channel::ControlMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No probe answered yet
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Tracks the outstanding probe and publishes status changes.
#[derive(Clone)]
pub struct HealthMonitor {
    status: Arc<watch::Sender<HealthStatus>>,
    outstanding: Arc<Mutex<Option<Uuid>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(HealthStatus::Unknown);
        Self {
            status: Arc::new(status),
            outstanding: Arc::new(Mutex::new(None)),
        }
    }

    pub fn status(&self) -> HealthStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status.subscribe()
    }

    /// Start a probe, superseding any outstanding one.
    pub fn begin_probe(&self) -> Uuid {
        let nonce = Uuid::new_v4();
        if let Ok(mut outstanding) = self.outstanding.lock() {
            *outstanding = Some(nonce);
        }
        nonce
    }

    /// Record an ack. Returns false for unknown or superseded nonces.
    pub fn acknowledge(&self, nonce: Uuid) -> bool {
        let matched = match self.outstanding.lock() {
            Ok(mut outstanding) if *outstanding == Some(nonce) => {
                *outstanding = None;
                true
            }
            _ => false,
        };
        if matched {
            self.publish(HealthStatus::Healthy);
        } else {
            tracing::debug!(%nonce, "ignoring ack for unknown probe");
        }
        matched
    }

    /// Mark unhealthy if `nonce` is still unanswered. Returns whether it was.
    pub fn expire(&self, nonce: Uuid) -> bool {
        let missed = match self.outstanding.lock() {
            Ok(mut outstanding) if *outstanding == Some(nonce) => {
                *outstanding = None;
                true
            }
            _ => false,
        };
        if missed {
            self.publish(HealthStatus::Unhealthy);
        }
        missed
    }

    fn publish(&self, next: HealthStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            match next {
                HealthStatus::Unhealthy => tracing::warn!(status = next.as_str(), "sandbox health changed"),
                _ => tracing::info!(status = next.as_str(), "sandbox health changed"),
            }
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe every `interval` until `token` is cancelled or the channel closes.
pub async fn run_prober(
    monitor: HealthMonitor,
    outbound: mpsc::Sender<ControlMessage>,
    interval: Duration,
    timeout: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let nonce = monitor.begin_probe();
        if outbound.send(ControlMessage::HealthProbe { nonce }).await.is_err() {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(timeout) => {
                if monitor.expire(nonce) {
                    tracing::warn!(%nonce, timeout_ms = timeout.as_millis() as u64, "health probe missed");
                }
            }
        }
    }
}
