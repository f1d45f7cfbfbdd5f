//! Pipeline orchestration
//!
//! `run` = fetch what is missing, reconcile the table once, load every local
//! file, summarise. One file failing never stops the others; a run stops
//! only when there is no file at all, or none it can derive the table from.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Instant;
use taxi_common::period::TRIP_FILE_EXTENSION;
use taxi_common::Period;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, LoaderConfig, TargetConfig};
use crate::download::{SourceFetcher, TripDataDownloader};
use crate::error::{ErrorKind, PipelineError};
use crate::loader::{BulkLoader, FileImport, ImportOutcome};
use crate::schema::{SchemaError, SchemaReconciler, TableSchema};

/// What the orchestrator needs from the application configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub target: TargetConfig,
    pub loader: LoaderConfig,
    pub data_dir: PathBuf,
    pub catalog_path: Option<PathBuf>,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            target: config.target.clone(),
            loader: config.loader,
            data_dir: config.data_dir.clone(),
            catalog_path: config.catalog_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub filename: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub files_newly_imported: Vec<String>,
    pub files_skipped: Vec<String>,
    pub files_failed: Vec<FailedFile>,
    pub rows_imported: u64,
    pub periods_missing: Vec<Period>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_error: Option<String>,
}

impl PipelineSummary {
    pub fn from_imports(imports: Vec<FileImport>) -> Self {
        let mut summary = PipelineSummary::default();
        for import in imports {
            summary.rows_imported += import.rows_imported();
            match import.result {
                Ok(ImportOutcome::Imported { .. }) => summary.files_newly_imported.push(import.file_name),
                Ok(ImportOutcome::Skipped) => summary.files_skipped.push(import.file_name),
                Err(e) => summary.files_failed.push(FailedFile {
                    filename: import.file_name,
                    error_kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }
        summary
    }

    pub fn has_failures(&self) -> bool {
        !self.files_failed.is_empty()
    }
}

/// `*.parquet` files in `dir`, sorted by name. A missing directory has none.
pub fn list_source_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_trip_file = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(TRIP_FILE_EXTENSION));
        if is_trip_file {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

pub struct TripPipeline {
    pool: PgPool,
    config: PipelineConfig,
    fetcher: Option<Box<dyn SourceFetcher>>,
}

impl TripPipeline {
    /// Pipeline without a download step
    pub fn new(pool: PgPool, config: PipelineConfig) -> Self {
        Self {
            pool,
            config,
            fetcher: None,
        }
    }

    /// Pipeline wired from the application configuration, downloading when enabled
    pub fn from_app_config(pool: PgPool, config: &AppConfig) -> Result<Self, PipelineError> {
        let pipeline = Self::new(pool, PipelineConfig::from(config));
        if !config.download.enabled {
            return Ok(pipeline);
        }
        let downloader = TripDataDownloader::new(config.download.clone(), &config.data_dir)?;
        Ok(pipeline.with_fetcher(Box::new(downloader)))
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Fetch, reconcile, load, summarise.
    pub async fn run(&self) -> Result<PipelineSummary, PipelineError> {
        let started = Instant::now();

        info!("Step 1/3: Fetching source files");
        let mut periods_missing = Vec::new();
        let mut download_error = None;
        match &self.fetcher {
            Some(fetcher) => match fetcher.fetch_all_available().await {
                Ok(report) => periods_missing = report.missing,
                Err(e) => {
                    warn!(error = %e, "Download step failed; importing what is already local");
                    download_error = Some(e.to_string());
                },
            },
            None => info!("Downloads disabled"),
        }

        info!("Step 2/3: Listing local files");
        let files = list_source_files(&self.config.data_dir)?;
        if files.is_empty() {
            return Err(PipelineError::NoSourceFiles(self.config.data_dir.clone()));
        }
        info!(files = files.len(), "Found source files");

        info!("Step 3/3: Importing");
        let mut summary = self.import_paths(&files).await?;
        summary.periods_missing = periods_missing;
        summary.download_error = download_error;

        info!(
            imported = summary.files_newly_imported.len(),
            skipped = summary.files_skipped.len(),
            failed = summary.files_failed.len(),
            rows = summary.rows_imported,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Pipeline run complete"
        );
        if summary.has_failures() {
            warn!(
                files = ?summary.files_failed.iter().map(|f| f.filename.as_str()).collect::<Vec<_>>(),
                "Some files were not imported; they will be retried on the next run"
            );
        }
        Ok(summary)
    }

    /// Reconcile the table and load `files` in order.
    pub async fn import_paths(&self, files: &[PathBuf]) -> Result<PipelineSummary, PipelineError> {
        if files.is_empty() {
            return Err(PipelineError::NoSourceFiles(self.config.data_dir.clone()));
        }

        let reconciler = SchemaReconciler::new(self.pool.clone(), self.config.target.clone())?;
        let planned = self.plan_destination(&reconciler, files).await?;
        let destination = reconciler.ensure(&planned).await?;

        let loader = BulkLoader::new(
            self.pool.clone(),
            &self.config.target,
            destination,
            self.config.loader,
        )?;

        let imports = loader.import_files(files).await;
        for import in &imports {
            if let Err(e) = &import.result {
                warn!(
                    file = %import.file_name,
                    kind = %e.kind(),
                    error = %e,
                    elapsed_ms = import.elapsed.as_millis() as u64,
                    "Import failed"
                );
            }
        }

        Ok(PipelineSummary::from_imports(imports))
    }

    /// Table definition to ensure: the catalog when configured, else the
    /// existing table, else the first file whose schema can be read.
    /// Unreadable files are left for the loader to report.
    async fn plan_destination(
        &self,
        reconciler: &SchemaReconciler,
        files: &[PathBuf],
    ) -> Result<TableSchema, PipelineError> {
        if let Some(catalog) = &self.config.catalog_path {
            return Ok(reconciler.reconcile_from_catalog(catalog).await?);
        }

        if let Some(existing) = reconciler.describe_existing().await? {
            debug!(columns = existing.columns.len(), "Destination table exists, not sampling");
            return Ok(existing);
        }

        for path in files {
            match reconciler.reconcile_from_file(path).await {
                Ok(planned) => return Ok(planned),
                Err(e @ (SchemaError::Source(_) | SchemaError::EmptySchema | SchemaError::DuplicateColumn(_))) => {
                    warn!(file = %path.display(), error = %e, "Cannot derive the table from this file, trying the next");
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(PipelineError::NoReadableSource(files.len()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ImportError;
    use std::time::Duration;

    fn import(file_name: &str, result: Result<ImportOutcome, ImportError>) -> FileImport {
        FileImport {
            file_name: file_name.to_string(),
            result,
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_summary_from_imports() {
        let summary = PipelineSummary::from_imports(vec![
            import("a.parquet", Ok(ImportOutcome::Imported { rows: 10 })),
            import("b.parquet", Err(ImportError::SchemaMismatch("bad".into()))),
            import("c.parquet", Ok(ImportOutcome::Skipped)),
            import("d.parquet", Ok(ImportOutcome::Imported { rows: 5 })),
        ]);

        assert_eq!(summary.files_newly_imported, vec!["a.parquet", "d.parquet"]);
        assert_eq!(summary.files_skipped, vec!["c.parquet"]);
        assert_eq!(summary.files_failed.len(), 1);
        assert_eq!(summary.files_failed[0].error_kind, ErrorKind::SchemaMismatchError);
        assert_eq!(summary.rows_imported, 15);
        assert!(summary.has_failures());
    }

    #[test]
    fn test_summary_json_shape() {
        let summary = PipelineSummary {
            files_newly_imported: vec!["yellow_tripdata_2024-01.parquet".into()],
            periods_missing: vec![Period::new(2024, 2).unwrap()],
            ..Default::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["files_newly_imported"][0], "yellow_tripdata_2024-01.parquet");
        assert_eq!(json["periods_missing"][0], "2024-02");
        assert_eq!(json["rows_imported"], 0);
        assert!(json.get("download_error").is_none());
    }

    #[test]
    fn test_list_source_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "yellow_tripdata_2024-02.parquet",
            "yellow_tripdata_2024-01.parquet",
            "yellow_tripdata_2024-03.parquet.part",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let files = list_source_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["yellow_tripdata_2024-01.parquet", "yellow_tripdata_2024-02.parquet"]);

        assert!(list_source_files(&dir.path().join("missing")).unwrap().is_empty());
    }
}
