//! Bronze-layer file handling (landing, reading, archiving) + HTTP fetch utilities.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use strata_core::{BatchError, RecordBatch, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const SOURCING_DIR: &str = "sourcing";
pub const ARCHIVE_DIR: &str = "archive";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LandingError {
    #[error("landing directory {} holds no files to ingest", .0.display())]
    Empty(PathBuf),
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv codec for {}: {source}", .path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("archived copy of {} does not match the original", .0.display())]
    ArchiveMismatch(PathBuf),
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> LandingError {
    let path = path.to_path_buf();
    move |source| LandingError::Io {
        action,
        path,
        source,
    }
}

/// Serializes a batch as CSV with a header row.
pub fn encode_csv(batch: &RecordBatch) -> Result<Vec<u8>, CodecError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(batch.columns())?;
    for row in batch.rows() {
        writer.write_record(row.iter().map(Value::to_string))?;
    }
    writer.into_inner().map_err(|err| CodecError::Io(err.into_error()))
}

/// Parses CSV with a header row; every cell is typed with [`Value::from_cell`].
pub fn decode_csv(bytes: &[u8]) -> Result<RecordBatch, CodecError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let columns = reader.headers()?.iter().map(str::to_string).collect();
    let mut batch = RecordBatch::new(columns)?;
    for record in reader.records() {
        let record = record?;
        batch.push_row(record.iter().map(Value::from_cell).collect())?;
    }
    Ok(batch)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Everything read from one landing directory.
#[derive(Debug, Clone)]
pub struct LandedBatch {
    pub batch: RecordBatch,
    pub files: Vec<PathBuf>,
}

/// Root of the bronze layer: `{root}/{namespace}/{dataset}/{sourcing,archive}/`.
#[derive(Debug, Clone)]
pub struct LandingZone {
    root: PathBuf,
}

impl LandingZone {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sourcing_dir(&self, namespace: &str, dataset: &str) -> PathBuf {
        self.root.join(namespace).join(dataset).join(SOURCING_DIR)
    }

    pub fn archive_dir(&self, namespace: &str, dataset: &str) -> PathBuf {
        self.root.join(namespace).join(dataset).join(ARCHIVE_DIR)
    }

    /// Landing file name; its stem becomes the load marker and sorts chronologically.
    pub fn file_name_for(staged_at: DateTime<Utc>) -> String {
        format!("{}.csv", staged_at.format("%Y%m%d_%H%M%S%.6f"))
    }

    /// Writes one landing file for a dataset using a temp file and atomic rename.
    pub async fn stage_batch(
        &self,
        namespace: &str,
        dataset: &str,
        batch: &RecordBatch,
        overwrite: bool,
        staged_at: DateTime<Utc>,
    ) -> Result<PathBuf, LandingError> {
        let dir = self.sourcing_dir(namespace, dataset);
        fs::create_dir_all(&dir)
            .await
            .map_err(io_err("creating landing directory", &dir))?;

        if overwrite {
            for path in list_landed_files(&dir).await? {
                fs::remove_file(&path)
                    .await
                    .map_err(io_err("removing sourced file", &path))?;
                info!(file = %path.display(), "removed previously sourced file");
            }
        }

        let target = dir.join(Self::file_name_for(staged_at));
        let bytes = encode_csv(batch).map_err(|source| LandingError::Codec {
            path: target.clone(),
            source,
        })?;

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err("opening temp landing file", &temp_path))?;
        file.write_all(&bytes)
            .await
            .map_err(io_err("writing temp landing file", &temp_path))?;
        file.flush()
            .await
            .map_err(io_err("flushing temp landing file", &temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(LandingError::Io {
                action: "renaming temp landing file",
                path: target,
                source: err,
            });
        }

        info!(
            namespace,
            dataset,
            file = %target.display(),
            rows = batch.len(),
            "staged landing file"
        );
        Ok(target)
    }
}

/// Regular, non-hidden files of a landing directory in name order. A missing
/// directory has no files.
pub async fn list_landed_files(dir: &Path) -> Result<Vec<PathBuf>, LandingError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err("listing", dir)(err)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err("listing", dir))? {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry
            .file_type()
            .await
            .map_err(io_err("inspecting", &entry.path()))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn load_marker_for(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reads every landed file into one batch, tagging rows with their file's load marker.
pub async fn read_batch(landing_dir: &Path) -> Result<LandedBatch, LandingError> {
    let files = list_landed_files(landing_dir).await?;
    if files.is_empty() {
        return Err(LandingError::Empty(landing_dir.to_path_buf()));
    }

    let mut batches = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = fs::read(path)
            .await
            .map_err(io_err("reading landed file", path))?;
        let batch = decode_csv(&bytes).map_err(|source| LandingError::Codec {
            path: path.clone(),
            source,
        })?;
        debug!(file = %path.display(), rows = batch.len(), "read landed file");
        batches.push(batch.with_load_marker(&load_marker_for(path)));
    }

    Ok(LandedBatch {
        batch: RecordBatch::concat(batches),
        files,
    })
}

/// Moves every file currently in `landing_dir` into `archive_dir`.
pub async fn archive(landing_dir: &Path, archive_dir: &Path) -> Result<Vec<PathBuf>, LandingError> {
    let files = list_landed_files(landing_dir).await?;
    archive_files(&files, archive_dir).await
}

/// Moves exactly `files` into `archive_dir`, leaving anything landed since they
/// were read in place. Files that are already gone are skipped so a partially
/// archived set can be archived again.
pub async fn archive_files(
    files: &[PathBuf],
    archive_dir: &Path,
) -> Result<Vec<PathBuf>, LandingError> {
    fs::create_dir_all(archive_dir)
        .await
        .map_err(io_err("creating archive directory", archive_dir))?;

    let mut archived = Vec::new();
    for source in files {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = archive_dir.join(name);
        info!(from = %source.display(), to = %target.display(), "archiving landed file");

        match fs::rename(source, &target).await {
            Ok(()) => archived.push(target),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(file = %source.display(), "landed file vanished before archiving");
            }
            Err(err) => {
                warn!(file = %source.display(), error = %err, "rename failed, copying instead");
                copy_then_remove(source, &target).await?;
                archived.push(target);
            }
        }
    }
    Ok(archived)
}

async fn copy_then_remove(source: &Path, target: &Path) -> Result<(), LandingError> {
    let original = fs::read(source)
        .await
        .map_err(io_err("reading landed file", source))?;
    fs::write(target, &original)
        .await
        .map_err(io_err("writing archived file", target))?;
    let copied = fs::read(target)
        .await
        .map_err(io_err("reading archived file", target))?;
    if sha256_hex(&original) != sha256_hex(&copied) {
        let _ = fs::remove_file(target).await;
        return Err(LandingError::ArchiveMismatch(source.to_path_buf()));
    }
    fs::remove_file(source)
        .await
        .map_err(io_err("removing landed file", source))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Sized for a rate-limited open-data portal: throttling windows there last
/// seconds, so the first retry waits one second and later ones up to thirty.
impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // one request pulls up to 10k records for a day
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GETs `url` with query parameters, retrying transient failures with backoff.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
