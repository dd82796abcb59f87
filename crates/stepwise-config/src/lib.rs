//! # Stepwise Config
//!
//! Single-file configuration. One `stepwise.yaml` configures the scheduler,
//! the fan-out pool, the approval gate, the control channel and logging.
//! Every section and field is optional.

mod loader;

pub use loader::{load_config, parse_config, validate_config, ConfigError};

use serde::Deserialize;
use std::time::Duration;

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct StepwiseConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for StepwiseConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            scheduler: SchedulerConfig::default(),
            pool: PoolConfig::default(),
            approval: ApprovalConfig::default(),
            channel: ChannelConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Overrides every capability's default timeout when set
    #[serde(default)]
    pub step_timeout_ms: Option<u64>,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            step_timeout_ms: None,
            cancel_grace_ms: default_cancel_grace_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn default_max_parallel() -> usize {
    4
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

/// Transient-failure retry. `max_attempts` counts the first attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Process-wide cap on concurrently running fan-out workers
    #[serde(default = "default_hard_ceiling")]
    pub hard_ceiling: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            hard_ceiling: default_hard_ceiling(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl PoolConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_hard_ceiling() -> usize {
    8
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Undecided requests are denied after this long
    #[serde(default = "default_approval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_approval_timeout_ms(),
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Capacity of the sandbox progress sink and of the host event bus
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Capacity of the queue feeding each side's channel writer
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            event_buffer: default_event_buffer(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl ChannelConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_outbound_buffer() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log to this file instead of stderr
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
