use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tmdb_storage::cleanup_intermediate;
use tmdb_sync::{
    analyze_to_csv, bronze_credits, bronze_movies, load_snapshot, maybe_build_scheduler,
    transform_merge, MovieStore, PgMovieStore, Pipeline, PipelineConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tmdb-cli")]
#[command(about = "TMDB movies/credits batch pipeline")]
struct Cli {
    /// Data root holding raw/, bronze/, silver/ and outputs/ (overrides TMDB_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Postgres connection string (overrides DATABASE_URL).
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every stage once.
    Run,
    /// Normalize both raw CSVs into bronze snapshots.
    Bronze,
    /// Merge bronze snapshots into the silver snapshot.
    Transform,
    /// Replace the stored table with the silver snapshot.
    Load,
    /// Write the genre report from the stored table.
    Analyze,
    /// Remove bronze/silver snapshots.
    Cleanup,
    /// Create the schema and table.
    Migrate,
    /// Run the pipeline on TMDB_SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn connect(config: &PipelineConfig) -> Result<PgMovieStore> {
    PgMovieStore::connect(&config.database_url).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let mut config = PipelineConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }
    let layout = config.layout();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let store = connect(&config).await?;
            let summary = Pipeline::new(config, Arc::new(store)).run_once().await?;
            println!(
                "run complete: run_id={} movies={} loaded={} report_rows={} report={}",
                summary.run_id,
                summary.movies_kept,
                summary.loaded_rows,
                summary.report_rows,
                summary.report_path
            );
        }
        Commands::Bronze => {
            layout.ensure_dirs().await?;
            let movies = bronze_movies(&layout.movies_csv(), &layout.bronze_movies())?;
            let credits = bronze_credits(&layout.credits_csv(), &layout.bronze_credits())?;
            println!(
                "bronze complete: movies={} ({} dropped) credits={} ({} dropped)",
                movies.artifact.rows, movies.stats.rows_dropped, credits.artifact.rows, credits.stats.rows_dropped
            );
        }
        Commands::Transform => {
            let merged = transform_merge(&layout.bronze_movies(), &layout.bronze_credits(), &layout.silver_merged())?;
            println!(
                "transform complete: rows={} unmatched={} sha256={}",
                merged.artifact.rows, merged.stats.unmatched, merged.artifact.content_hash
            );
        }
        Commands::Load => {
            let store = connect(&config).await?;
            store.ensure_schema().await?;
            let rows = load_snapshot(&store, &layout.silver_merged(), config.load_chunk_size).await?;
            println!("load complete: rows={rows}");
        }
        Commands::Analyze => {
            let store = connect(&config).await?;
            let report = analyze_to_csv(&store, &layout.report_csv()).await?;
            println!("analyze complete: rows={} report={}", report.rows.len(), report.path.display());
        }
        Commands::Cleanup => {
            for path in cleanup_intermediate(&layout).await? {
                println!("{}", path.display());
            }
        }
        Commands::Migrate => {
            connect(&config).await?.ensure_schema().await?;
            println!("migrate complete");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let mut sched = maybe_build_scheduler(&config)
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
