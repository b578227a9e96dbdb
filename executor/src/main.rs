use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;
mod commands;
mod error;
mod handlers;
mod invoke;
mod logstream;
mod manifests;
mod models;
mod orchestrator;
mod pod_io;
mod reaper;
mod s3;
mod server;
mod shutdown;
mod state;
mod timing;

use args::ExecutorArgs;
use reaper::Reaper;
use server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = ExecutorArgs::parse();

    let kube = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let s3 = s3::create_client(&args.s3).await;

    let token = CancellationToken::new();
    let reaper = Reaper::new(
        kube.clone(),
        &args.namespace,
        &args.hostname,
        Duration::from_secs(args.maintenance_interval),
        Duration::from_secs(args.inactive_threshold),
        token.clone(),
    );
    let reaper_task = tokio::spawn(reaper.run());

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let state = AppState::new(args, kube, s3);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "starting executor HTTP server");
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;

    // The reaper gets a bounded window to observe cancellation before the
    // process exits.
    token.cancel();
    if tokio::time::timeout(Duration::from_secs(5), reaper_task)
        .await
        .is_err()
    {
        tracing::warn!("reaper did not stop within 5s");
    }
    tracing::info!("server stopped gracefully");
    Ok(())
}
