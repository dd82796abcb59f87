//! # Stepwise Runtime
//!
//! Wires the execution core to the control channel.
//!
//! - `SandboxAgent` runs plans inside the isolated environment
//! - `HostController` drives a sandbox from the orchestrating host
//! - `HealthMonitor` tracks probe acknowledgements
//! - `bootstrap` initializes tracing and builds components from config

pub mod bootstrap;
pub mod builtin;
pub mod health;
pub mod host;
pub mod sandbox;

pub use bootstrap::{build_gate, build_pool, build_scheduler, init_tracing, retry_policy};
pub use builtin::register_builtins;
pub use health::{HealthMonitor, HealthStatus};
pub use host::{HostController, HostEvent};
pub use sandbox::{DispatchOutcome, SandboxAgent};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("control channel error: {0}")]
    Channel(#[from] stepwise_channel::ChannelError),
    #[error("config error: {0}")]
    Config(#[from] stepwise_config::ConfigError),
    #[error("control channel closed")]
    ChannelClosed,
    #[error("sandbox refused task {task_id} version {plan_version}: {reason}")]
    DispatchRefused {
        task_id: String,
        plan_version: u32,
        reason: String,
    },
}
