//! NYC taxi trip ingestion
//!
//! Idempotent bulk load of the TLC monthly trip record files into
//! PostgreSQL. Every file is imported exactly once: its rows and its entry in
//! the `import_log` ledger commit in a single transaction, so re-running the
//! pipeline over the same directory is always safe.
//!
//! - [`download`]: fetch missing monthly files
//! - [`schema`]: derive and create the destination table
//! - [`loader`]: per-file atomic transfer
//! - [`ledger`]: which files are already in
//! - [`pipeline`]: the whole run, with a summary
//! - [`stats`]: totals over the loaded trips
//!
//! # Example
//!
//! ```no_run
//! use taxi_ingest::config::AppConfig;
//! use taxi_ingest::pipeline::TripPipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let pool = config.database.connect().await?;
//!     let summary = TripPipeline::from_app_config(pool, &config)?.run().await?;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod download;
pub mod error;
pub mod ledger;
pub mod loader;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod stats;
pub mod value;

pub use config::AppConfig;
pub use error::{ErrorKind, ImportError, PipelineError};
pub use ledger::{ImportLedger, LedgerEntry};
pub use loader::{BulkLoader, FileImport, ImportOutcome};
pub use pipeline::{PipelineSummary, TripPipeline};
pub use source::{BatchSource, ImportBatch, ParquetSource};
pub use value::SqlValue;
