use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use oss_stats_core::{github_dependent_forecast, npm_download_forecast, SystemClock};
use oss_stats_storage::{DocumentStore, MemoryStore, PgDocumentStore};
use oss_stats_sync::{
    clear_and_sync, http_sources, spawn_scheduled_runs, CronIntervalScheduler, InMemoryScheduler,
    IntervalScheduler, Reconciler, StatsConfig, StatsQuery, SyncOrchestrator,
};
use oss_stats_web::AppState;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oss-stats")]
#[command(about = "Sync and serve open-source popularity stats")]
struct Cli {
    /// Log at debug level regardless of RUST_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and print its report.
    Sync,
    /// Delete all repo and package rows, then sync.
    ClearAndSync,
    /// Apply SQL migrations to DATABASE_URL.
    Migrate {
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,
    },
    /// Start the recurring sync and the HTTP server.
    Serve,
    ShowOwner { name: String },
    ShowNpmOrg { name: String },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(config: &StatsConfig) -> Result<Arc<dyn DocumentStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgDocumentStore::connect(url)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; stats live in memory for this process only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn orchestrator(
    config: &StatsConfig,
    reconciler: Reconciler,
    scheduler: Arc<dyn IntervalScheduler>,
) -> Result<SyncOrchestrator> {
    let (github, npm) = http_sources(config)?;
    Ok(SyncOrchestrator::new(github, npm, reconciler, scheduler).with_interval(config.sync_interval()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = StatsConfig::from_env().context("loading configuration")?;
    info!(?config, "configuration loaded");
    let store = open_store(&config).await?;
    let reconciler = Reconciler::new(store.clone(), Arc::new(SystemClock));

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let orchestrator = orchestrator(&config, reconciler, Arc::new(InMemoryScheduler::new()))?;
            let report = orchestrator.run(&config.sync_args()).await?;
            print_json(&report)?;
        }
        Commands::ClearAndSync => {
            let orchestrator = orchestrator(&config, reconciler, Arc::new(InMemoryScheduler::new()))?;
            let report = clear_and_sync(&orchestrator, &config.sync_args()).await?;
            print_json(&report)?;
        }
        Commands::Migrate { dir } => {
            let url = config
                .database_url
                .as_deref()
                .context("migrate needs DATABASE_URL")?;
            let pg = PgDocumentStore::connect(url)
                .await
                .context("connecting to postgres")?;
            pg.migrate(&dir)
                .await
                .with_context(|| format!("running migrations from {}", dir.display()))?;
            println!("migrations applied from {}", dir.display());
        }
        Commands::Serve => {
            let (scheduler, runs) = CronIntervalScheduler::start(&config.scheduler_namespace).await?;
            let orchestrator = Arc::new(orchestrator(&config, reconciler.clone(), Arc::new(scheduler))?);
            let _runner = spawn_scheduled_runs(orchestrator.clone(), runs);

            // The first pass registers the recurring job.
            let initial = orchestrator.clone();
            let args = config.sync_args();
            tokio::spawn(async move {
                match initial.run(&args).await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        failed = report.failed.len(),
                        "initial sync finished"
                    ),
                    Err(err) => warn!(error = %err, "initial sync failed"),
                }
            });

            let state = AppState::from_config(&config, StatsQuery::new(store), reconciler);
            tokio::select! {
                served = oss_stats_web::serve(state, config.port) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutting down"),
            }
        }
        Commands::ShowOwner { name } => {
            let query = StatsQuery::new(store);
            let owner = query
                .get_github_owner(&name)
                .await?
                .with_context(|| format!("github owner `{name}` has not been synced"))?;
            let forecast = github_dependent_forecast(
                owner.dependent_count,
                owner.dependent_count_previous.as_ref(),
                owner.updated_at,
            );
            print_json(&json!({
                "owner": owner,
                "dependentCountEstimate": forecast.estimate(Utc::now().timestamp_millis()),
            }))?;
        }
        Commands::ShowNpmOrg { name } => {
            let query = StatsQuery::new(store);
            let org = query
                .get_npm_org(&name)
                .await?
                .with_context(|| format!("npm org `{name}` has not been synced"))?;
            let now = Utc::now();
            let forecast = npm_download_forecast(
                org.download_count,
                &org.day_of_week_averages,
                org.updated_at,
                now,
            );
            print_json(&json!({
                "org": org,
                "downloadCountEstimate": forecast.estimate(now.timestamp_millis()),
            }))?;
        }
    }

    Ok(())
}
