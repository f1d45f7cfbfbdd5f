//! Monthly trip file downloads
//!
//! Fetches `<dataset>_tripdata_<YYYY-MM>.parquet` for every month of the
//! configured years into the data directory. A file already on disk is never
//! fetched again. Bytes land in a `.part` file that is renamed only after the
//! whole body arrived, so the data directory only ever holds complete files.

use async_trait::async_trait;
use chrono::Datelike;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taxi_common::Period;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;

const PARTIAL_SUFFIX: &str = "part";
/// Longest wait between two download attempts
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Server errors and transport failures are worth another attempt
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            DownloadError::Status { status, .. } => *status >= 500,
            DownloadError::Io(_) => false,
        }
    }
}

/// Local availability after a fetch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// File names present locally, in period order
    pub available: Vec<String>,
    /// Periods that could not be obtained this time
    pub missing: Vec<Period>,
}

/// Makes source files available in the data directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_all_available(&self) -> Result<FetchReport, DownloadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    AlreadyPresent,
    Downloaded { bytes: u64 },
}

/// Downloads trip files from the TLC CDN (or any mirror with the same layout)
pub struct TripDataDownloader {
    client: reqwest::Client,
    config: DownloadConfig,
    data_dir: PathBuf,
    retry_delay: Duration,
}

impl TripDataDownloader {
    pub fn new(config: DownloadConfig, data_dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("taxi-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            data_dir: data_dir.into(),
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Base delay between attempts; doubled after every failure
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Every month of the configured years, up to the current month
    pub fn periods(&self) -> Vec<Period> {
        let now = chrono::Utc::now();
        let current = (now.year(), now.month());

        let mut periods: Vec<Period> = self
            .config
            .years
            .iter()
            .flat_map(|year| Period::months_of(*year))
            .filter(|p| (i32::from(p.year), u32::from(p.month)) <= current)
            .collect();
        periods.sort();
        periods.dedup();
        periods
    }

    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), file_name)
    }

    /// Make one period's file available locally.
    pub async fn fetch_period(&self, period: Period) -> Result<FetchStatus, DownloadError> {
        let file_name = period.file_name(&self.config.dataset);
        let destination = self.data_dir.join(&file_name);

        if tokio::fs::try_exists(&destination).await? {
            debug!(file = %file_name, "Already present, not downloading");
            return Ok(FetchStatus::AlreadyPresent);
        }

        let url = self.url_for(&file_name);
        let bytes = self.download_with_retry(&url, &destination).await?;
        info!(file = %file_name, bytes, "Downloaded");
        Ok(FetchStatus::Downloaded { bytes })
    }

    /// Delay after failed attempt `attempt` (1-based), capped at [`MAX_BACKOFF`]
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_BACKOFF)
    }

    async fn download_with_retry(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.download_once(url, destination).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    let backoff = self.backoff(attempt);
                    warn!(url, attempt, error = %e, "Download attempt failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let partial = destination.with_extension(format!(
            "{}.{}",
            destination
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or_default(),
            PARTIAL_SUFFIX
        ));

        let result = self.stream_to(url, &partial).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&partial, destination).await?;
                Ok(bytes)
            },
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(file = %partial.display(), error = %cleanup, "Could not remove partial download");
                    }
                }
                Err(e)
            },
        }
    }

    async fn stream_to(&self, url: &str, partial: &Path) -> Result<u64, DownloadError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let pb = self.progress_bar(response.content_length(), partial);

        let mut file = tokio::fs::File::create(partial).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }
        file.flush().await?;
        file.sync_all().await?;

        pb.finish_and_clear();
        Ok(downloaded)
    }

    fn progress_bar(&self, total: Option<u64>, path: &Path) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total.unwrap_or(0));
        pb.set_style(
            ProgressStyle::with_template(
                "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        pb.set_message(format!("Downloading {}", name));
        pb
    }
}

#[async_trait]
impl SourceFetcher for TripDataDownloader {
    async fn fetch_all_available(&self) -> Result<FetchReport, DownloadError> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        let mut report = FetchReport::default();
        let periods = self.periods();
        info!(periods = periods.len(), dir = %self.data_dir.display(), "Fetching trip files");

        for period in periods {
            match self.fetch_period(period).await {
                Ok(_) => report.available.push(period.file_name(&self.config.dataset)),
                Err(DownloadError::Io(e)) => return Err(DownloadError::Io(e)),
                Err(e) => {
                    warn!(period = %period, error = %e, "Period not available");
                    report.missing.push(period);
                },
            }
        }

        info!(
            available = report.available.len(),
            missing = report.missing.len(),
            "Fetch pass complete"
        );
        Ok(report)
    }
}
