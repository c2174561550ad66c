use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sieve_core::config::ERRORS_KEY;
use sieve_core::{
    AppError, Loader, Record, RefillOrchestrator, ResourcePool, ResultFile, RunConfig, TaskContext,
    TaskExecutor, TaskOutcome, TaskPool, load_sources,
};

/// Counter bumped for every record the checkpoint executor writes.
const CHECKED_COUNTER: &str = "checked";

#[derive(Parser)]
#[command(name = "sieve", version, about = "Stream, dedup and process large record lists")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load sources, drop known records and process the rest until drained
    Run {
        /// Path to the run configuration (JSON)
        #[arg(short, long, env = "SIEVE_CONFIG")]
        config: PathBuf,

        /// Override the configured number of workers
        #[arg(short = 't', long, env = "SIEVE_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Override the in-memory record cap per chunk
        #[arg(long, env = "SIEVE_MAX_RECORDS")]
        max_records: Option<usize>,

        /// Override the helper executable path
        #[arg(long, env = "SIEVE_HELPER")]
        helper: Option<PathBuf>,
    },

    /// Load and filter the first chunk and print it without processing
    Preview {
        /// Path to the run configuration (JSON)
        #[arg(short, long, env = "SIEVE_CONFIG")]
        config: PathBuf,

        /// Number of records to print
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the source files a run would read
    Sources {
        /// Path to the run configuration (JSON)
        #[arg(short, long, env = "SIEVE_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sieve=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            concurrency,
            max_records,
            helper,
        } => {
            let mut run = load_config(&config).await?;
            if let Some(concurrency) = concurrency {
                run.concurrency = concurrency;
            }
            if let Some(max_records) = max_records {
                run.max_records = max_records;
            }
            if let Some(helper) = helper {
                run.helper_path = helper;
            }
            run.validate().context("Invalid configuration after overrides")?;
            cmd_run(run).await?;
        }
        Commands::Preview { config, limit } => {
            let run = load_config(&config).await?;
            cmd_preview(&run, limit).await?;
        }
        Commands::Sources { config } => {
            let run = load_config(&config).await?;
            cmd_sources(&run).await?;
        }
    }

    Ok(())
}

async fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path)
        .await
        .with_context(|| format!("Failed to load config: {}", path.display()))
}

// ---------------------------------------------------------------------------
// Checkpoint executor
// ---------------------------------------------------------------------------

/// Appends every processed record to the checkpoint file.
///
/// Listing the checkpoint file as an exclusion lets a rerun skip records a
/// previous run already handled.
struct CheckpointExecutor {
    output: ResultFile,
}

impl TaskExecutor<usize> for CheckpointExecutor {
    async fn execute(
        &self,
        record: &Record,
        slot: Option<&usize>,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, AppError> {
        if let Some(slot) = slot {
            tracing::trace!(task_id = ctx.task_id(), slot, "Processing on slot");
        }
        self.output
            .save(&record.to_string(), ctx.metrics(), CHECKED_COUNTER)
            .await?;
        Ok(TaskOutcome::done())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: RunConfig) -> Result<()> {
    config.bootstrap().await.context("Failed to create run files")?;

    let sources = config.sources().await.context("Failed to resolve sources")?;
    if sources.is_empty() {
        bail!("No sources to load for '{}'", config.name);
    }

    let removal = config.removal_sets();
    let loader = Arc::new(Loader::detect(&config.helper_path));

    let records = load_sources(loader.as_ref(), &sources, &removal, config.max_records)
        .await
        .context("Failed to load the first chunk")?;
    let initial = records.len();
    tracing::info!("loaded {} records", initial);
    if initial == 0 {
        tracing::info!("Nothing left to process");
        return Ok(());
    }

    let checkpoint = config.require_file(&config.checkpoint)?;
    let metrics = config.build_metrics();
    metrics.add(CHECKED_COUNTER, 0);

    let name = config.name.clone();
    let executor = CheckpointExecutor {
        output: ResultFile::new(checkpoint),
    };
    let mut pool: TaskPool<usize, CheckpointExecutor> =
        TaskPool::with_metrics(config.pool_config(), metrics)
            .with_executor(executor)
            .with_records(config.name.clone(), records)
            .on_drain(move || tracing::info!("Run '{}' finished", name));
    if config.resources > 0 {
        pool = pool.with_resources(ResourcePool::new(0..config.resources));
    }
    if let Some(errors) = config.file(ERRORS_KEY) {
        pool = pool.with_error_log(ResultFile::new(errors));
    }

    let handle = pool.handle();
    let refill = RefillOrchestrator::new(loader, sources, removal, config.refill_config())
        .spawn(handle.clone(), initial);

    pool.start().context("Failed to start task pool")?;
    handle.wait_drained().await;
    pool.join().await;

    if let Some(refill) = refill {
        let summary = refill.await.context("Refill loop panicked")?;
        tracing::info!(
            rounds = summary.rounds,
            added = summary.added,
            stop = ?summary.stop,
            "Refill summary"
        );
    }

    let snapshot = handle.metrics().snapshot(handle.depth());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}

async fn cmd_preview(config: &RunConfig, limit: usize) -> Result<()> {
    let sources = config.sources().await.context("Failed to resolve sources")?;
    let loader = Loader::detect(&config.helper_path);
    let removal = config.removal_sets();
    let records = load_sources(&loader, &sources, &removal, config.max_records)
        .await
        .context("Failed to load the first chunk")?;

    for record in records.iter().take(limit) {
        println!("{record}");
    }
    println!("\nTotal: {} records after filtering", records.len());

    Ok(())
}

async fn cmd_sources(config: &RunConfig) -> Result<()> {
    let sources = config.sources().await.context("Failed to resolve sources")?;

    if sources.is_empty() {
        println!("No sources configured for '{}'", config.name);
        return Ok(());
    }

    for source in &sources {
        println!("{}", source.display());
    }
    println!("\nTotal: {} sources", sources.len());

    Ok(())
}
