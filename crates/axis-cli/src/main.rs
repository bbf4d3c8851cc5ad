use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axis_core::Deadline;
use axis_sources::{CalendarEvent, CanvasAssignment, HttpGithubClient};
use axis_store::{ApiClientConfig, ApiFetcher, DeadlineStore, MemoryDeadlineStore};
use axis_sync::{
    duplicate_groups, maybe_build_scheduler, merge_suggestions, sync_canvas, sync_exam_calendar,
    sync_github, CourseRegistry, SyncConfig, SyncReport,
};
use axis_web::AppState;
use chrono::Utc;
use clap::{Parser, Subcommand};

const DEFAULT_USER: &str = "default";

#[derive(Debug, Parser)]
#[command(name = "axis-cli")]
#[command(about = "AXIS deadline reconciliation command-line interface")]
struct Cli {
    /// User whose deadline list the command operates on.
    #[arg(long, default_value = DEFAULT_USER)]
    user: String,

    /// JSON file of existing deadlines to preload into the in-memory store.
    #[arg(long)]
    deadlines: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print duplicate groups and merge suggestions for a deadline list.
    Review,
    /// Reconcile a Canvas assignment export into the store.
    SyncCanvas {
        /// JSON file holding an array of Canvas assignments.
        #[arg(long)]
        input: PathBuf,
    },
    /// Reconcile README deadlines for every enabled course in the registry.
    SyncGithub,
    /// Reconcile exam candidates extracted from a calendar export.
    SyncExam {
        /// JSON file holding an array of calendar events.
        #[arg(long)]
        input: PathBuf,
    },
    /// Serve the review API over HTTP.
    Serve,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn preload_store(cli: &Cli) -> Result<MemoryDeadlineStore> {
    let store = MemoryDeadlineStore::new();
    if let Some(path) = &cli.deadlines {
        let deadlines: Vec<Deadline> = read_json(path)?;
        store.seed(&cli.user, deadlines).await;
    }
    Ok(store)
}

fn print_report(bridge: &str, report: &SyncReport) {
    println!(
        "{bridge} sync complete: created={} updated={} skipped={} errors={}",
        report.created,
        report.updated,
        report.skipped,
        report.errors.len()
    );
    for error in &report.errors {
        eprintln!("  {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let now = Utc::now();

    match &cli.command {
        Commands::Review => {
            let store = preload_store(&cli).await?;
            let deadlines = store.list(&cli.user, now, true).await?;
            let groups = duplicate_groups(&deadlines);
            let suggestions = merge_suggestions(&deadlines);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "duplicate_groups": groups,
                    "merge_suggestions": suggestions,
                }))?
            );
        }
        Commands::SyncCanvas { input } => {
            let store = preload_store(&cli).await?;
            let assignments: Vec<CanvasAssignment> = read_json(input)?;
            let report = sync_canvas(&store, &cli.user, &assignments, now).await;
            print_report("canvas", &report);
        }
        Commands::SyncGithub => {
            let store = preload_store(&cli).await?;
            let registry = CourseRegistry::load(&config.courses_path)?;
            let fetcher = ApiFetcher::new(ApiClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            let client = HttpGithubClient::new(fetcher, config.github_api_base.clone());
            let report =
                sync_github(&store, &cli.user, &client, &registry.courses, now).await;
            print_report("github", &report);
        }
        Commands::SyncExam { input } => {
            let store = preload_store(&cli).await?;
            let events: Vec<CalendarEvent> = read_json(input)?;
            let report = sync_exam_calendar(&store, &cli.user, &events, now).await;
            print_report("exam", &report);
        }
        Commands::Serve => {
            let store = preload_store(&cli).await?;
            if let Some(scheduler) = maybe_build_scheduler(&config).await? {
                scheduler.start().await?;
            }
            axis_web::serve(AppState::new(Arc::new(store), cli.user.clone())).await?;
        }
    }

    Ok(())
}
