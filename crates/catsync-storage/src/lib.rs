//! Durable storage and HTTP fetch utilities for catsync: atomic file writes, the raw feed
//! archive, the sync state store and a retrying feed fetcher.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catsync_core::SyncRecord;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "catsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers only ever
/// observe the previous or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "catsync".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

#[derive(Debug, Clone)]
pub struct ArchivedFeed {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of every raw feed document a cycle fetched.
#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path_for(&self, fetched_at: DateTime<Utc>, content_hash: &str) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string()).join(format!("{content_hash}.xml"))
    }

    /// Store the feed unless a document with the same hash was already archived that day.
    pub async fn store(&self, fetched_at: DateTime<Utc>, bytes: &[u8]) -> anyhow::Result<ArchivedFeed> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.relative_path_for(fetched_at, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !exists {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("archiving feed to {}", absolute_path.display()))?;
        }

        Ok(ArchivedFeed {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }
}

pub const STATE_FORMAT_VERSION: u32 = 1;

/// Everything already pushed to the storefront, keyed by source product id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub version: u32,
    pub products: BTreeMap<String, SyncRecord>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            products: BTreeMap::new(),
        }
    }
}

impl SyncState {
    pub fn get(&self, product_id: &str) -> Option<&SyncRecord> {
        self.products.get(product_id)
    }

    pub fn upsert(&mut self, product_id: impl Into<String>, record: SyncRecord) {
        self.products.insert(product_id.into(), record);
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.products.values().map(|r| r.last_synced_at).max()
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {} is corrupt: {reason}; fix or remove it before syncing again", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("state file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing sync state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Loads and atomically saves the [`SyncState`] JSON file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or empty file is a first run. Anything unreadable is corruption; prior state
    /// is never guessed.
    pub async fn load(&self) -> Result<SyncState, StateError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(SyncState::default()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                return Err(StateError::Corrupt {
                    path: self.path.clone(),
                    reason: err.to_string(),
                })
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(SyncState::default());
        }

        let state: SyncState = serde_json::from_str(&text).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if state.version != STATE_FORMAT_VERSION {
            return Err(StateError::Corrupt {
                path: self.path.clone(),
                reason: format!("unsupported format version {}", state.version),
            });
        }
        Ok(state)
    }

    pub async fn save(&self, state: &SyncState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StateError::Io {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), products = state.products.len(), "sync state saved");
        Ok(())
    }
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Reads a `Retry-After` header given in (possibly fractional) seconds.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Exponential from `delay`, capped at sixteen times the base delay.
    pub fn from_retry_settings(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay.saturating_mul(16),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt) but never shorter than a server hint.
    pub fn delay_with_hint(&self, attempt_index: usize, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
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
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
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
    #[error("reading feed file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Time source for backoff waits and the inter-cycle pause.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
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

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Backoff waits between attempts go through `sleeper`.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        sleeper: &dyn Sleeper,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url, sleeper).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str, sleeper: &dyn Sleeper) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
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

                    let retryable = classify_status(status) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self
                            .backoff
                            .delay_with_hint(attempt, retry_after_from_headers(resp.headers()));
                        warn!(status = status.as_u16(), attempt, ?delay, "feed fetch failed, retrying");
                        sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "feed fetch failed, retrying");
                        sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
