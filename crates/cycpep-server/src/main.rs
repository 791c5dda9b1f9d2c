//! `cycpep-server`: MCP stdio server for background prediction jobs.

mod bootstrap_helpers;
mod cli_args;

use anyhow::{Context, Result};
use clap::Parser;
use cycpep_jobs::JobManager;
use cycpep_tools::{serve_mcp_stdio, JobToolbox};

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_server(cli).await
}

async fn run_server(cli: Cli) -> Result<()> {
    let config = cli.job_manager_config();
    let manager = JobManager::open(config.clone()).with_context(|| {
        format!(
            "failed to open job store at {}",
            config.jobs_root.display()
        )
    })?;
    if cli.recover_interrupted {
        let report = manager
            .recover_interrupted()
            .await
            .context("failed to recover interrupted jobs")?;
        if !report.failed.is_empty() || !report.relaunched.is_empty() {
            tracing::warn!(
                failed = report.failed.len(),
                relaunched = report.relaunched.len(),
                "recovered jobs from previous server"
            );
        }
    }

    let toolbox = JobToolbox::new(manager.clone(), cli.prediction_scripts());
    tracing::info!(
        jobs_root = %manager.store().root().display(),
        scripts_dir = %toolbox.scripts().scripts_dir.display(),
        "serving mcp over stdio"
    );
    let served = tokio::select! {
        served = serve_mcp_stdio(&toolbox) => Some(served),
        _ = tokio::signal::ctrl_c() => None,
    };

    let drained = manager.shutdown().await;
    if !drained.is_empty() {
        tracing::warn!(jobs = drained.len(), "cancelled in-flight jobs at shutdown");
    }
    match served {
        Some(report) => {
            let report = report.context("mcp server stopped")?;
            tracing::info!(
                processed_frames = report.processed_frames,
                error_count = report.error_count,
                "mcp input closed"
            );
        }
        None => {
            tracing::info!("interrupted; server stopped");
            // The blocked stdin read would otherwise keep the runtime from exiting.
            std::process::exit(0);
        }
    }
    Ok(())
}
