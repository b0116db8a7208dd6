#![doc = include_str!("../README.md")]

mod cli;

use clap::Parser;
use cli::config::{CliArgs, RunConfig};
use cli::engine::Engine;
use cli::targets::load_targets;
use cli::telemetry::init_telemetry;
use scansplit::{MemoryQueue, Pipeline, PipelineHandle};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    init_telemetry(config.log_format)?;
    log_startup_info(&config);

    let targets = load_targets(&config).await?;
    let queue = Arc::new(MemoryQueue::new());
    let pipeline = Pipeline::spawn(targets, config.pipeline.clone(), Arc::clone(&queue))?;

    let stop = CancellationToken::new();
    let mut engines = Vec::new();
    for protocol in &config.pipeline.protocols {
        for id in 0..config.consumers_per_topic {
            let engine = Engine::new(
                id,
                protocol.topic(),
                Arc::clone(&queue),
                config.consume_interval,
                stop.clone(),
                std::io::stdout(),
            );
            engines.push(tokio::spawn(engine.run()));
        }
    }

    let signals = tokio::spawn(shutdown_signal(pipeline.handle(), stop.clone()));
    let result = pipeline.wait().await;

    // Units left behind by a failed run are not worth scanning.
    if result.is_err() {
        stop.cancel();
    }

    let mut consumed = 0;
    for outcome in futures::future::join_all(engines).await {
        consumed += outcome??;
    }
    signals.abort();

    let report = result?;
    tracing::info!(
        target_batches = report.target_batches,
        port_batches = report.port_batches,
        delivered = report.total_delivered(),
        consumed,
        left_behind = report.total_delivered().saturating_sub(consumed),
        cancelled = report.cancelled,
        "Run complete"
    );
    Ok(())
}

fn log_startup_info(config: &RunConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting scansplit with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting scansplit with {} protocols over {} ports",
            config.pipeline.protocols.len(),
            config.pipeline.ports.len()
        );
    }
}

async fn shutdown_signal(handle: PipelineHandle<MemoryQueue>, stop: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, tidying pipeline...");

    // 1. Stop every stage and close the queue
    handle.tidy().await;

    // 2. Engines abandon whatever is still queued
    stop.cancel();
}
