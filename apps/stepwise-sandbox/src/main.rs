use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use stepwise_config::{load_config, StepwiseConfig};
use stepwise_core::capability::CapabilityRegistry;
use stepwise_runtime::{init_tracing, register_builtins, SandboxAgent};

/// Runs plans sent by a host as NDJSON frames on stdin; answers on stdout.
#[derive(Debug, Parser)]
#[command(name = "stepwise-sandbox")]
struct Args {
    /// YAML config; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override scheduler.max_parallel
    #[arg(long)]
    max_parallel: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("load config '{}' failed", path.display()))?,
        None => StepwiseConfig::default(),
    };
    if let Some(max_parallel) = args.max_parallel {
        config.scheduler.max_parallel = max_parallel.max(1);
    }
    init_tracing(&config.observability);

    let mut registry = CapabilityRegistry::new();
    register_builtins(&mut registry);
    tracing::info!(capabilities = ?registry.names(), "sandbox starting");

    let (agent, outbound) = SandboxAgent::new(&config, Arc::new(registry));
    agent
        .serve(stepwise_channel::stdio(), outbound)
        .await
        .context("control channel failed")?;
    tracing::info!("sandbox stopped");
    Ok(())
}
