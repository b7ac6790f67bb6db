//! Authoritative in-memory stores, raw payload archive and bounded HTTP access.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobfinder_core::CoreError;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{AcquireError, Mutex, Semaphore};
use tracing::debug;
use uuid::Uuid;

mod criteria;
mod matches;
mod postings;
mod runs;
mod subscriptions;

pub use criteria::CriteriaStore;
pub use matches::{MatchFilter, MatchStore, UpsertOutcome};
pub use postings::{raw_hash, IngestOutcome, PostingStore};
pub use runs::ScrapeRunTracker;
pub use subscriptions::{BackoffPolicy, SubscriptionRegistry};

pub const CRATE_NAME: &str = "jobfinder-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("scrape run {run_id} for source `{source_id}` is already in progress")]
    RunAlreadyInProgress { source_id: String, run_id: Uuid },
    #[error("scrape run {0} is already finished")]
    RunAlreadyFinished(Uuid),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("hashing raw posting: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    pub already_present: bool,
}

/// Content-addressed archive of raw adapter payloads
/// (`<source>/<yyyymmdd>/<sha256>.<ext>`).
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path_for(
        source: &str,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        content_type: &str,
    ) -> PathBuf {
        let ext = match content_type.split(';').next().unwrap_or_default().trim() {
            "text/html" => "html",
            "application/json" => "json",
            "application/rss+xml" | "application/xml" | "text/xml" => "xml",
            _ => "bin",
        };
        PathBuf::from(source)
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write once; identical payloads resolve to the same path and are not rewritten.
    pub async fn archive(
        &self,
        source: &str,
        fetched_at: DateTime<Utc>,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::relative_path_for(source, fetched_at, &content_hash, content_type);
        let target = self.root.join(&relative_path);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |already_present| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            byte_size: bytes.len(),
            already_present,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking archive path {}", target.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(archived(true));
            }
            return Err(err).with_context(|| format!("moving payload into {}", target.display()));
        }
        debug!(source, path = %relative_path.display(), "archived raw payload");
        Ok(archived(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is closed")]
    Closed(#[from] AcquireError),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared HTTP client. Every request is attempted once and bounded by the
/// client timeout; retrying is left to the next scheduled cycle.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
        })
    }

    async fn host_semaphore(&self, url: &str) -> Arc<Semaphore> {
        let host = jobfinder_core::url_fingerprint(url)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut map = self.per_host.lock().await;
        map.entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    fn map_send_error(url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request(err)
        }
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await?;
        let per_host = self.host_semaphore(url).await;
        let _host = per_host
            .acquire()
            .await?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_send_error(url, e))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::map_send_error(url, e))?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }

    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<StatusCode, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await?;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(url, e))?;
        let status = resp.status();
        if status.is_success() {
            Ok(status)
        } else {
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}
