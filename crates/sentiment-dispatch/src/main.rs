//! # `sentiment-dispatch` CLI
//!
//! Wires the gRPC engine client, the NATS JetStream broker and the async
//! correlator together behind four subcommands:
//!
//! - `analyze <text>`: one direct engine call.
//! - `submit <text> [--wait]`: publish a task; print its request id, or the
//!   result with `--wait`.
//! - `batch <texts...>`: stream every text over one engine call, with per-item
//!   fallback.
//! - `worker`: consume tasks until Ctrl+C or SIGTERM.
//!
//! Results are printed to stdout as JSON.

use anyhow::Context;
use clap::Parser;
use sentiment_dispatch::{
    AnalyzeOptions, AsyncCorrelator, CallContext, Dispatcher,
    broker::NatsBroker,
    config::{CliArgs, Command, DispatchConfig},
    telemetry::init_telemetry,
    transport::GrpcTransport,
    worker::TaskWorker,
};
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
    let config = DispatchConfig::try_from(args)?;

    let providers = init_telemetry(config.log_format)?;
    log_startup_info(&config);

    let res = run(config).await;
    providers.shutdown();
    res
}

fn log_startup_info(config: &DispatchConfig) {
    if cfg!(debug_assertions) {
        tracing::debug!("Starting with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting {:?} against engine {} and broker {}",
            config.command,
            config.engine_addr,
            config.nats.url
        );
    }
}

async fn run(config: DispatchConfig) -> anyhow::Result<()> {
    let ctx = CallContext::new(config.call_timeout);
    let options = AnalyzeOptions::default();

    match config.command.clone() {
        Command::Analyze { text } => {
            let dispatcher = Dispatcher::new(Arc::new(connect_engine(&config).await?), config.limits);
            let result = dispatcher
                .analyze_sync(&text, &config.language, &options, &ctx)
                .await?;
            print_json(&result)
        }
        Command::Batch { texts } => {
            let dispatcher = Dispatcher::new(Arc::new(connect_engine(&config).await?), config.limits);
            let result = dispatcher
                .analyze_batch(texts, &config.language, &options, &ctx)
                .await?;
            tracing::info!(
                "Batch {} resolved {}/{} items ({} via fallback)",
                result.batch_id,
                result.succeeded(),
                result.items.len(),
                result.fallback_count
            );
            print_json(&result.report())
        }
        Command::Submit { text, wait } => submit(&config, &text, wait).await,
        Command::Worker => run_worker(&config).await,
    }
}

async fn submit(config: &DispatchConfig, text: &str, wait: bool) -> anyhow::Result<()> {
    // Submission never calls the engine itself.
    let transport = GrpcTransport::connect_lazy(
        &config.engine_addr,
        config.engine_connect_timeout,
        config.compression,
        config.stream_buffer_size,
    )?;
    let broker = NatsBroker::connect(config.nats.clone()).await?;
    let correlator = AsyncCorrelator::start(Arc::new(broker), config.correlator);
    let dispatcher =
        Dispatcher::new(Arc::new(transport), config.limits).with_correlator(Arc::new(correlator));

    let ctx = CallContext::new(config.call_timeout);
    let submission = dispatcher
        .analyze_async(text, &config.language, &AnalyzeOptions::default(), &ctx)
        .await?;

    let res = if wait {
        tracing::info!("Waiting for {}", submission.request_id);
        match submission.completion.await {
            Ok(result) => print_json(&result),
            Err(e) => Err(e).context("no result for submitted task"),
        }
    } else {
        print_json(&serde_json::json!({ "request_id": submission.request_id }))
    };

    dispatcher.shutdown().await;
    res
}

async fn run_worker(config: &DispatchConfig) -> anyhow::Result<()> {
    let transport = connect_engine(config).await?;
    let broker = NatsBroker::connect(config.nats.clone()).await?;
    let worker = TaskWorker::new(Arc::new(broker), Arc::new(transport), config.worker);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    worker.run(shutdown).await;

    tracing::info!("Worker shut down successfully");
    Ok(())
}

async fn connect_engine(config: &DispatchConfig) -> anyhow::Result<GrpcTransport> {
    let transport = GrpcTransport::connect(
        &config.engine_addr,
        config.engine_connect_timeout,
        config.compression,
        config.stream_buffer_size,
    )
    .await?;
    Ok(transport)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, draining workers...");
    shutdown.cancel();
}
