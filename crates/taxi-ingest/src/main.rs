//! Taxi Ingest - load NYC taxi trip files into PostgreSQL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taxi_common::logging::{init_logging, LogConfig, LogLevel};
use taxi_ingest::config::AppConfig;
use taxi_ingest::download::{SourceFetcher, TripDataDownloader};
use taxi_ingest::pipeline::TripPipeline;
use taxi_ingest::{stats, ImportLedger};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taxi-ingest")]
#[command(author, version, about = "NYC taxi trip ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the monthly Parquet files
    #[arg(long, global = true, env = "TAXI_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download missing files, then import everything local
    Run {
        /// Only import what is already on disk
        #[arg(long)]
        no_download: bool,

        /// Rows per batch
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Files imported concurrently
        #[arg(long)]
        parallel: Option<usize>,

        /// Catalog description (JSON) to create the table from
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Download missing files only
    Download {
        /// Years to fetch, e.g. `2024` or `2022-2024`
        #[arg(long)]
        years: Option<String>,
    },

    /// Import specific files
    Import {
        /// Parquet files, imported in the given order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Rows per batch
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// List the import ledger, or show one file's entry
    Ledger {
        /// File name as recorded, e.g. `yellow_tripdata_2024-01.parquet`
        file: Option<String>,
    },

    /// Print trip statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("taxi-ingest")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = AppConfig::load().context("Failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Run {
            no_download,
            chunk_size,
            parallel,
            catalog,
        } => {
            if no_download {
                config.download.enabled = false;
            }
            if let Some(chunk_size) = chunk_size {
                config.loader.chunk_size = chunk_size;
            }
            if let Some(parallel) = parallel {
                config.loader.max_parallel_files = parallel;
            }
            if catalog.is_some() {
                config.catalog_path = catalog;
            }
            config.validate()?;

            let pool = config.database.connect().await.context("Failed to connect to database")?;
            let summary = TripPipeline::from_app_config(pool, &config)?.run().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::Download { years } => {
            if let Some(years) = years {
                config.download.years = taxi_ingest::config::parse_years(&years)?;
            }
            config.download.show_progress = true;

            let downloader = TripDataDownloader::new(config.download.clone(), &config.data_dir)?;
            let report = downloader.fetch_all_available().await?;
            let missing: Vec<String> = report.missing.iter().map(ToString::to_string).collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "available": report.available,
                    "periods_missing": missing,
                }))?
            );
        },
        Command::Import { files, chunk_size } => {
            if let Some(chunk_size) = chunk_size {
                config.loader.chunk_size = chunk_size;
            }
            config.validate()?;

            let pool = config.database.connect().await.context("Failed to connect to database")?;
            let summary = TripPipeline::new(pool, (&config).into())
                .import_paths(&files)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        },
        Command::Ledger { file } => {
            let pool = config.database.connect().await.context("Failed to connect to database")?;
            let ledger = ImportLedger::new(pool, &config.target.schema)?;
            match file {
                Some(file) => {
                    let entry = ledger
                        .entry(&file)
                        .await
                        .context("Failed to read import ledger")?
                        .with_context(|| format!("'{}' is not in the import ledger", file))?;
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                },
                None => {
                    let entries = ledger.entries().await.context("Failed to read import ledger")?;
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                },
            }
        },
        Command::Stats => {
            let pool = config.database.connect().await.context("Failed to connect to database")?;
            let statistics = stats::collect(&pool, &config.target).await?;
            println!("{}", serde_json::to_string_pretty(&statistics)?);
        },
    }

    info!("Done");
    Ok(())
}
