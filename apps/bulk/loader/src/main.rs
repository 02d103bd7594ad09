//! Bulk Loader
//!
//! Loads a JSON document file and runs a resilient bulk insert or delete against a
//! simulated store, then prints the run summary and its estimated cost.

use std::path::PathBuf;

use bulk_executor::{OperationMetrics, init_metrics, render_metrics};
use clap::{Args, Parser, Subcommand};
use core_config::FromEnv;
use core_config::tracing::{init_tracing, install_color_eyre};
use eyre::Result;
use tokio::sync::watch;
use tracing::{info, warn};

mod config;
mod loader;

use config::Config;
use loader::{DEFAULT_UNITS_PER_SECOND, Simulation};

#[derive(Parser)]
#[command(name = "bulk-loader")]
#[command(about = "Resilient bulk insert/delete of JSON documents")]
struct Cli {
    /// Print Prometheus metrics after the run
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// JSON file holding an array of documents
    #[arg(short, long)]
    file: PathBuf,

    /// Items per bulk call (overrides BULK_BATCH_SIZE)
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Batches in flight, -1 for automatic (overrides BULK_MAX_CONCURRENCY)
    #[arg(short = 'c', long, allow_hyphen_values = true)]
    max_concurrency: Option<i32>,

    /// Probability that the simulated store throttles an item
    #[arg(long, default_value_t = 0.0)]
    throttle_rate: f64,

    /// Simulated round-trip time of every bulk call
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Regions the data is replicated to, for cost estimates
    #[arg(short, long, default_value_t = 1)]
    regions: u32,
}

impl RunArgs {
    fn simulation(&self) -> Simulation {
        Simulation {
            throttle_rate: self.throttle_rate,
            latency_ms: self.latency_ms,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Insert documents from a file
    Insert {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Delete the documents referenced by a file
    Delete {
        #[command(flatten)]
        run: RunArgs,

        /// Fill the store with the file contents first, so the deletes hit existing items
        #[arg(long)]
        seed: bool,
    },

    /// Estimate the cost of a workload under both pricing models
    Estimate {
        /// Total cost units consumed
        #[arg(long)]
        cost_units: f64,

        /// Wall-clock duration of the workload
        #[arg(long)]
        duration_ms: f64,

        /// Regions the data is replicated to
        #[arg(short, long, default_value_t = 1)]
        regions: u32,

        /// Provisioned throughput for the provisioned estimate
        #[arg(long, default_value_t = DEFAULT_UNITS_PER_SECOND)]
        units_per_second: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config.environment, &config.log_directive);

    if cli.metrics {
        init_metrics();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, finishing in-flight batches");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Commands::Insert { run } => {
            let documents = loader::read_documents(&run.file)?;
            let config = config.with_overrides(run.batch_size, run.max_concurrency);
            info!(file = %run.file.display(), documents = documents.len(), "Starting insert");

            let report = loader::insert(
                documents,
                config.batch,
                &run.simulation(),
                run.regions,
                shutdown_rx,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Delete { run, seed } => {
            let documents = loader::read_documents(&run.file)?;
            let config = config.with_overrides(run.batch_size, run.max_concurrency);
            info!(
                file = %run.file.display(),
                documents = documents.len(),
                seed,
                "Starting delete"
            );

            let report = loader::delete(
                documents,
                config.batch,
                &run.simulation(),
                run.regions,
                seed,
                shutdown_rx,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Estimate {
            cost_units,
            duration_ms,
            regions,
            units_per_second,
        } => {
            let metrics = OperationMetrics {
                total_cost: cost_units,
                total_duration_ms: duration_ms,
                ..Default::default()
            };
            let estimates = loader::estimates(&metrics, regions, units_per_second);
            println!("{}", serde_json::to_string_pretty(&estimates)?);
        }
    }

    if cli.metrics {
        print!("{}", render_metrics());
    }

    Ok(())
}
