use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use strata_core::Environment;
use strata_pipeline::{Pipeline, PipelineConfig, Stage, StageSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strata")]
#[command(about = "Layered open-data pipeline: source, ingest, model")]
struct Cli {
    /// Overrides STRATA_ENV for this invocation.
    #[arg(long, global = true)]
    env: Option<Environment>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every configured dataset into the landing zone.
    Source,
    /// Merge landed files into the silver store and archive them.
    Ingest,
    /// Rebuild gold tables and their reference exports.
    Model,
    /// Source, ingest and model in sequence.
    Run,
    /// Run each stage on its cron schedule until interrupted.
    Schedule,
}

fn print_summary(summary: &StageSummary) {
    println!(
        "{} complete: run_id={} env={} succeeded={} skipped={} failed={}",
        summary.stage.as_str(),
        summary.run_id,
        summary.environment,
        summary.succeeded.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    for failure in &summary.failed {
        eprintln!("  {}: {}", failure.name, failure.error);
    }
}

fn report(summaries: &[StageSummary]) -> Result<()> {
    summaries.iter().for_each(print_summary);
    let failed: usize = summaries.iter().map(|s| s.failed.len()).sum();
    if failed > 0 {
        bail!("{failed} dataset(s) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env()?;
    if let Some(env) = cli.env {
        config.environment = env;
    }
    let pipeline = Pipeline::from_config(config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Source => report(&[pipeline.run_stage(Stage::Sourcing).await?]),
        Commands::Ingest => report(&[pipeline.run_stage(Stage::Ingestion).await?]),
        Commands::Model => report(&[pipeline.run_stage(Stage::Modelling).await?]),
        Commands::Run => report(&pipeline.run_all().await?),
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set STRATA_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(())
        }
    }
}
