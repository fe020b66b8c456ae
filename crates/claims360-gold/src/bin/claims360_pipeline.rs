//! # claims360-pipeline
//!
//! Command-line runner for the claims360 Gold layer over a local table
//! store.
//!
//! ## Usage
//!
//! ```bash
//! # Create all tables
//! claims360-pipeline --storage-root ./lake init
//!
//! # Load silver inputs
//! claims360-pipeline --storage-root ./lake append --table silver.curated_claims --file claims.jsonl
//! claims360-pipeline --storage-root ./lake append --table silver.payments_835_events --file remits.jsonl
//!
//! # One pipeline update, or continuous mode until Ctrl-C
//! claims360-pipeline --storage-root ./lake update
//! claims360-pipeline --storage-root ./lake run
//!
//! # Denial event change feed
//! claims360-pipeline --storage-root ./lake changes --from-version 1
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use claims360_core::{LocalFsBackend, ScopedStorage, StorageBackend, init_logging};
use claims360_gold::{ExecutionContext, Pipeline, PipelineConfig, PipelineTables, metrics};
use claims360_table::Row;

/// claims360 Gold pipeline.
#[derive(Debug, Parser)]
#[command(name = "claims360-pipeline")]
#[command(about = "Materializes the claims360 Gold tables")]
#[command(version)]
struct Args {
    /// Catalog the tables live in.
    #[arg(long, env = "CLAIMS360_CATALOG", global = true)]
    catalog: Option<String>,

    /// Root directory of the local table store.
    #[arg(long, env = "CLAIMS360_STORAGE_ROOT", global = true)]
    storage_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create every pipeline table.
    Init,

    /// Run one full refresh of gold.fact_claim.
    Refresh,

    /// Drain the payment event stream into gold.fact_denial_event.
    ApplyChanges,

    /// Run every stage once, in dependency order.
    Update,

    /// Run continuously until Ctrl-C.
    Run,

    /// Append JSON-lines rows to a source table.
    Append {
        /// Qualified table name (e.g. `silver.payments_835_events`).
        #[arg(long)]
        table: String,

        /// File with one JSON object per line.
        #[arg(long)]
        file: PathBuf,
    },

    /// Print the gold.fact_denial_event change feed as JSON lines.
    Changes {
        /// First version to include.
        #[arg(long, default_value = "1")]
        from_version: u64,

        /// Last version to include (default: latest).
        #[arg(long)]
        to_version: Option<u64>,
    },
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(catalog) = &args.catalog {
        config.catalog.clone_from(catalog);
    }
    if let Some(root) = &args.storage_root {
        config.storage_root = Some(root.clone());
    }
    Ok(config)
}

fn open_storage(config: &PipelineConfig) -> Result<ScopedStorage> {
    let root = config
        .storage_root
        .as_ref()
        .ok_or_else(|| anyhow!("missing CLAIMS360_STORAGE_ROOT (or --storage-root)"))?;
    let backend: Arc<dyn StorageBackend> = Arc::new(LocalFsBackend::new(root)?);
    ScopedStorage::new(backend, &config.catalog).map_err(anyhow::Error::from)
}

async fn read_jsonl(path: &Path) -> Result<Vec<Row>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<Row>(line)
                .with_context(|| format!("{}:{}: not a JSON object", path.display(), n + 1))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_logging(config.log_format);
    metrics::register_metrics();

    let storage = open_storage(&config)?;
    let tables = PipelineTables::ensure(&storage).await?;
    let ctx = ExecutionContext::new(storage, config);

    tracing::info!(
        catalog = %ctx.config().catalog,
        run_id = %ctx.run_id(),
        command = ?args.command,
        "starting claims360 pipeline"
    );

    match args.command {
        Commands::Init => {
            for table in tables.all() {
                println!("{} at version {}", table.name(), table.latest_version().await?);
            }
        }
        Commands::Refresh => {
            let report = Pipeline::new(ctx, &tables)?.refresh().await?;
            println!(
                "gold.fact_claim version {} ({} rows from source version {})",
                report.version, report.rows, report.source_version
            );
        }
        Commands::ApplyChanges => {
            let report = Pipeline::new(ctx, &tables)?.apply_changes().await?;
            let totals = report.totals();
            println!(
                "gold.fact_denial_event at position {} after {} batch(es): {totals:?}",
                report.position,
                report.batches.len()
            );
        }
        Commands::Update => {
            let mut pipeline = Pipeline::new(ctx, &tables)?;
            for stage in pipeline.plan() {
                tracing::debug!(stage = %stage, "planned");
            }
            let report = pipeline.update().await?;
            println!("{report:#?}");
        }
        Commands::Run => {
            let pipeline = Pipeline::new(ctx, &tables)?;
            pipeline
                .run_continuous(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "failed to listen for Ctrl-C");
                    }
                })
                .await?;
        }
        Commands::Append { table, file } => {
            let target = tables.source_by_name(&table).ok_or_else(|| {
                anyhow!("{table} is not a pipeline source; only silver inputs accept appends")
            })?;
            let rows = read_jsonl(&file).await?;
            let count = rows.len();
            let outcome = target.append(rows, None).await?;
            println!("appended {count} row(s) to {table} at version {}", outcome.version());
        }
        Commands::Changes {
            from_version,
            to_version,
        } => {
            let changes = tables
                .fact_denial_event
                .read_changes(from_version, to_version)
                .await?;
            for change in changes {
                println!("{}", serde_json::to_string(&change)?);
            }
        }
    }

    Ok(())
}
