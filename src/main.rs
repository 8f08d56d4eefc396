//! Syncpulse binary.
//!
//! `serve` runs the webhook server and the rollup scheduler together.
//! `rollup` runs one aggregation pass and exits. `check` probes a database
//! and exits.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use syncpulse::rollup::JobOutcome;
use syncpulse::server::AppState;
use syncpulse::{
    EventHandler, LinearClient, NotionClient, RollupRunner, Scheduler, SyncConfig, Workspace,
};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "syncpulse", version, about = "Project update webhook relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server and rollup scheduler.
    Serve,
    /// Run one rollup pass now. On a gated weekday the pass reports
    /// `skipped`.
    Rollup,
    /// Probe a database for reachability.
    Check {
        /// Database id to probe.
        database_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "syncpulse=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load().context("loading configuration")?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Rollup => {
            let (_workspace, runner) = rollup_parts(config);
            let outcome = runner.run(chrono::Utc::now()).await;
            tracing::info!(outcome = ?outcome, "rollup finished");
            match outcome {
                JobOutcome::Failed { error, .. } => anyhow::bail!("rollup failed: {error}"),
                _ => Ok(()),
            }
        },
        Command::Check { database_id } => {
            let workspace = NotionClient::new(config.notion_api_key);
            workspace
                .database_reachable(&database_id)
                .await
                .with_context(|| format!("database {database_id} is not reachable"))?;
            tracing::info!(database_id = %database_id, "database reachable");
            Ok(())
        },
    }
}

/// Builds the workspace client and the rollup runner from the config.
fn rollup_parts(config: SyncConfig) -> (Arc<NotionClient>, Arc<RollupRunner<NotionClient>>) {
    let workspace = Arc::new(NotionClient::new(config.notion_api_key));
    let runner = Arc::new(RollupRunner::new(
        Arc::clone(&workspace),
        config.source_database_id,
        config.rollup_database_id,
        config.rollup,
    ));
    (workspace, runner)
}

async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let port = config.port;
    let interval = config.rollup.interval;
    let webhook_secret = config.webhook_secret;
    let linear_api_key = config.linear_api_key;
    let source_database_id = config.source_database_id.clone();

    let workspace = Arc::new(NotionClient::new(config.notion_api_key));
    let runner = Arc::new(RollupRunner::new(
        Arc::clone(&workspace),
        config.source_database_id,
        config.rollup_database_id,
        config.rollup,
    ));

    let directory = Arc::new(LinearClient::new(linear_api_key));
    let handler = Arc::new(EventHandler::new(
        directory,
        Arc::clone(&workspace),
        source_database_id,
        webhook_secret,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(Arc::clone(&runner), interval, shutdown_rx.clone());
    let scheduler_handle = tokio::spawn(scheduler.run());

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let state = AppState {
        handler,
        runner,
        workspace,
    };
    let result = syncpulse::server::serve(state, port, shutdown_rx).await;

    // Let an in-flight rollup finish before exiting.
    scheduler_handle.await.context("scheduler task panicked")?;
    result.context("server failed")
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
