use std::io;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use energy_core::{parse_timestamp, Domain, TimeRange};
use energy_storage::PgStore;
use energy_sync::{Collected, PipelineSettings, SyncConfig, SyncRuntime};
use energy_web::AppState;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "energy-cli")]
#[command(about = "Energy time-series ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    Household,
    Weather,
    Grid,
    All,
}

impl Target {
    fn domains(self) -> Vec<Domain> {
        match self {
            Target::Household => vec![Domain::Household],
            Target::Weather => vec![Domain::Weather],
            Target::Grid => vec![Domain::Grid],
            Target::All => Domain::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the cron scheduler until Ctrl-C.
    Run,
    /// One tracked batch job per selected domain.
    Ingest {
        #[arg(value_enum, default_value = "all")]
        target: Target,
    },
    /// Ingest an explicit time range in chunks.
    Historical {
        #[arg(long, value_parser = parse_instant)]
        start: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        end: DateTime<Utc>,
        #[arg(long, value_enum, default_value = "all")]
        domain: Target,
    },
    /// Detect and fill gaps in the weather series.
    Backfill,
    /// Poll every source and flush on size or time until Ctrl-C.
    Stream,
    /// Store reachability, table sizes and recent jobs as JSON.
    Status {
        #[arg(long, default_value_t = 7)]
        days: i64,
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
    /// Fetch, reconcile and validate one domain without writing.
    Probe {
        #[arg(value_enum)]
        target: Target,
    },
    /// Serve the JSON status endpoints.
    Serve,
    /// Apply database migrations.
    Migrate,
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("unrecognised timestamp {raw:?}"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ENERGY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    Ok(())
}

fn print_probe(domain: Domain, collected: &Collected) {
    let source = collected.source.as_deref().unwrap_or("none");
    let tier = collected
        .tier
        .map(|t| format!("{t:?}").to_lowercase())
        .unwrap_or_else(|| "none".to_string());
    println!(
        "probe {domain}: source={source} tier={tier} synthetic={} fetched={} kept={} rejected={} filled={}",
        collected.synthetic,
        collected.fetched_rows,
        collected.validation.kept,
        collected.validation.rejected(),
        collected.validation.filled_cells,
    );
    if let Some(origin) = &collected.origin {
        println!("  origin: {origin}");
    }
    for (column, count) in &collected.validation.range_violations {
        println!("  out of range: {column} x{count}");
    }
    if !collected.discarded.is_empty() {
        println!("  discarded entities: {}", collected.discarded.join(", "));
    }
    for failure in &collected.failures {
        println!("  failed: {} ({})", failure.source, failure.error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let runtime = SyncRuntime::connect_from_env().await?;
    run_command(&runtime, cli.command.unwrap_or(Commands::Run)).await
}

async fn migrate(config: &SyncConfig, settings: &PipelineSettings) -> Result<()> {
    let store = PgStore::connect(&config.database_url, &config.pool_settings(&settings.database))
        .await
        .context("connecting to database")?;
    store.migrate().await?;
    store.close().await;
    Ok(())
}

async fn run_command(runtime: &SyncRuntime, command: Commands) -> Result<()> {
    match command {
        Commands::Run => {
            if !runtime.config.scheduler_enabled {
                warn!("scheduler disabled by ENERGY_SCHEDULER_ENABLED; nothing to run");
                return Ok(());
            }
            runtime.orchestrator.start().await?;
            wait_for_ctrl_c().await?;
            runtime.orchestrator.stop().await?;
        }
        Commands::Ingest { target } => {
            let mut failed = 0usize;
            for domain in target.domains() {
                let run = runtime.orchestrator.run_job(domain).await?;
                println!(
                    "{} job {}: {:?} processed={} written={} rejected={} sources={} synthetic={}",
                    run.job_name,
                    run.job_id,
                    run.status,
                    run.report.processed,
                    run.report.written,
                    run.report.rejected,
                    run.report.sources.join(","),
                    run.report.synthetic,
                );
                if let Some(message) = &run.report.failure {
                    println!("  error: {message}");
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{failed} ingestion job(s) failed");
            }
        }
        Commands::Historical { start, end, domain } => {
            let range = TimeRange::new(start, end)?;
            for domain in domain.domains() {
                let run = runtime.orchestrator.run_historical(domain, range).await?;
                println!(
                    "{} job {}: processed={} written={} rejected={} failed_batches={}",
                    run.job_name,
                    run.job_id,
                    run.report.processed,
                    run.report.written,
                    run.report.rejected,
                    run.report.failed_batches,
                );
            }
        }
        Commands::Backfill => {
            let reports = runtime.orchestrator.backfill_gaps().await?;
            for report in reports {
                println!(
                    "{}: gaps={} filled={} skipped={} written={}",
                    report.location_id,
                    report.gaps.len(),
                    report.filled.len(),
                    report.skipped.len(),
                    report.ingest.written,
                );
                for gap in &report.skipped {
                    println!("  not filled: {} .. {} ({} missing)", gap.start, gap.end, gap.missing);
                }
            }
        }
        Commands::Stream => {
            let runner = runtime.streaming();
            let (stop_tx, stop_rx) = watch::channel(false);
            let handle = tokio::spawn(runner.run(stop_rx));
            wait_for_ctrl_c().await?;
            stop_tx.send(true).context("signalling streaming loops")?;
            let stats = handle.await.context("joining streaming runner")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if stats.dropped_rows > 0 {
                bail!("{} buffered row(s) could not be written before exit", stats.dropped_rows);
            }
        }
        Commands::Status { days, recent } => {
            let snapshot = runtime.status(days, recent).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Probe { target } => {
            for domain in target.domains() {
                let pipeline = runtime.pipelines.get(domain);
                for collected in pipeline.probe().await {
                    print_probe(domain, &collected);
                }
            }
        }
        Commands::Serve => {
            energy_web::serve(AppState::from_runtime(runtime), runtime.config.web_port).await?;
        }
        Commands::Migrate => {
            migrate(&runtime.config, &runtime.settings).await?;
            println!("migrations applied");
        }
    }
    Ok(())
}
