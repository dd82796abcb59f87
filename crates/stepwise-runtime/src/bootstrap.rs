//! Process bootstrap: tracing and component wiring from configuration.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use stepwise_config::{ObservabilityConfig, RetryConfig, StepwiseConfig};
use stepwise_core::approval::{ApprovalGate, ApprovalNotifier};
use stepwise_core::capability::CapabilityRegistry;
use stepwise_core::pool::WorkerPool;
use stepwise_core::retry::RetryPolicy;
use stepwise_core::scheduler::Scheduler;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber once. `RUST_LOG` wins over the configured
/// level; `STEPWISE_LOG_FILE` wins over the configured file. Without a file
/// logs go to stderr, since stdout may carry channel frames.
pub fn init_tracing(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let level = observability
            .log_level
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::INFO);
        let filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let log_file = log_file_path(observability);
        let file = log_file.as_deref().and_then(|path| match open_log_file(path) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("failed to open log file '{}': {}", path.display(), err);
                None
            }
        });
        let writer = match file {
            Some(file) => BoxMakeWriter::new(Mutex::new(file)),
            None => BoxMakeWriter::new(std::io::stderr),
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(log_file.is_none())
            .with_writer(writer)
            .try_init();

        tracing::info!(%level, log_file = ?log_file, "tracing initialized");
    });
}

fn log_file_path(observability: &ObservabilityConfig) -> Option<PathBuf> {
    std::env::var("STEPWISE_LOG_FILE")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| observability.log_file.clone())
        .map(PathBuf::from)
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub fn retry_policy(config: &RetryConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_attempts,
        std::time::Duration::from_millis(config.base_delay_ms),
        std::time::Duration::from_millis(config.max_delay_ms),
    )
}

/// Approval gate with the configured timeout, announcing through `notifier`.
pub fn build_gate(config: &StepwiseConfig, notifier: Arc<dyn ApprovalNotifier>) -> ApprovalGate {
    ApprovalGate::new()
        .with_timeout(config.approval.timeout())
        .with_notifier(notifier)
}

pub fn build_pool(config: &StepwiseConfig, registry: Arc<CapabilityRegistry>) -> WorkerPool {
    WorkerPool::with_options(
        registry,
        config.pool.hard_ceiling,
        retry_policy(&config.scheduler.retry),
        config.pool.shutdown_grace(),
    )
}

/// Scheduler configured from `config.scheduler`, with a fan-out pool.
pub fn build_scheduler(
    config: &StepwiseConfig,
    registry: Arc<CapabilityRegistry>,
    gate: Arc<ApprovalGate>,
) -> Scheduler {
    let pool = build_pool(config, registry.clone());
    let scheduler = Scheduler::new(registry, gate)
        .with_max_parallel(config.scheduler.max_parallel)
        .with_retry_policy(retry_policy(&config.scheduler.retry))
        .with_cancel_grace(config.scheduler.cancel_grace())
        .with_pool(pool);
    match config.scheduler.step_timeout() {
        Some(timeout) => scheduler.with_step_timeout(timeout),
        None => scheduler,
    }
}
