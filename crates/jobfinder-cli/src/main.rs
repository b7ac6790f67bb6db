use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfinder_sync::{AppRuntime, PgMirror, SyncConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobfinder")]
#[command(about = "Job posting collection, matching and notification")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API (and the cron scheduler when enabled).
    Serve,
    /// Scrape enabled sources once, score and notify.
    Sync {
        /// Only run this source.
        #[arg(long)]
        source: Option<String>,
        /// Write a digest report afterwards.
        #[arg(long)]
        report: bool,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Write a digest report from the current state.
    Report {
        /// Run a sync first.
        #[arg(long)]
        sync: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobfinder=debug,sqlx=warn".into()),
        )
        .with(fmt::layer())
        .init();
}

async fn sync_once(runtime: &AppRuntime, source: Option<&str>) -> Result<()> {
    let pipeline = runtime.pipeline();
    let runs = match source {
        Some(source) => vec![pipeline
            .run_source(source)
            .await
            .with_context(|| format!("running source {source}"))?],
        None => pipeline.run_all().await,
    };
    for run in &runs {
        match &run.error {
            Some(err) => println!("{}: failed ({err})", run.source),
            None => println!(
                "{}: found={} new={} run_id={}",
                run.source, run.jobs_found, run.jobs_new, run.id
            ),
        }
    }
    Ok(())
}

async fn write_report(runtime: &AppRuntime) -> Result<()> {
    let summary = runtime.write_report().await?;
    println!(
        "report written: dir={} matches={} new={}",
        summary.dir.display(),
        summary.total_matches,
        summary.new_matches
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => jobfinder_web::serve_from_env().await?,
        Commands::Sync { source, report } => {
            let runtime = AppRuntime::from_env().await?;
            sync_once(&runtime, source.as_deref()).await?;
            if report {
                write_report(&runtime).await?;
            }
            runtime.shutdown(Duration::from_secs(30)).await;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            let mirror = PgMirror::connect(&url).await?;
            mirror.migrate().await?;
            println!("migrations applied");
        }
        Commands::Report { sync } => {
            let runtime = AppRuntime::from_env().await?;
            if sync {
                sync_once(&runtime, None).await?;
            }
            write_report(&runtime).await?;
            runtime.shutdown(Duration::from_secs(30)).await;
        }
    }

    Ok(())
}
