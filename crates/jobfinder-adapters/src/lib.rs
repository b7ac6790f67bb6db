//! Source adapter contract and the generic posting producers behind it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfinder_core::RawPosting;
use jobfinder_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod html;

pub use html::{parse_listing_html, parse_salary_range, HtmlListingAdapter, ListingSelectors};

pub const CRATE_NAME: &str = "jobfinder-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// JSON array of postings on disk.
    Fixture,
    /// Listing pages fetched over HTTP and read with CSS selectors.
    HtmlListing,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub selectors: Option<ListingSelectors>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Bytes an adapter parsed, handed back for archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatch {
    pub postings: Vec<RawPosting>,
    pub payloads: Vec<RawPayload>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source `{source_id}` did not answer within {after:?}")]
    Timeout { source_id: String, after: Duration },
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {error}")]
    Fixture {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("source configuration error: {0}")]
    Config(String),
    #[error("source adapter aborted: {0}")]
    Aborted(String),
}

/// An opaque producer of raw postings for one source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<SourceBatch, AdapterError>;
}

/// Posting record as stored in a fixture file; the source comes from the config.
#[derive(Debug, Clone, Deserialize)]
struct FixturePosting {
    external_id: String,
    title: String,
    company: String,
    url: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    is_remote: bool,
    #[serde(default)]
    salary_min: Option<i64>,
    #[serde(default)]
    salary_max: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tech_tags: Vec<String>,
    #[serde(default)]
    posted_at: Option<DateTime<Utc>>,
}

impl FixturePosting {
    fn into_raw(self, source_id: &str) -> RawPosting {
        RawPosting {
            source: source_id.to_string(),
            external_id: self.external_id,
            title: self.title,
            company: self.company,
            url: self.url,
            location: self.location,
            is_remote: self.is_remote,
            salary_min: self.salary_min,
            salary_max: self.salary_max,
            description: self.description,
            tech_tags: self.tech_tags,
            posted_at: self.posted_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureFileAdapter {
    source_id: String,
    path: PathBuf,
}

impl FixtureFileAdapter {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureFileAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, _ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|error| AdapterError::Fixture {
                path: self.path.clone(),
                error,
            })?;
        let records: Vec<FixturePosting> = serde_json::from_slice(&body).map_err(|e| {
            AdapterError::Parse(format!("{}: {e}", self.path.display()))
        })?;
        let postings = records
            .into_iter()
            .map(|r| r.into_raw(&self.source_id))
            .collect();
        Ok(SourceBatch {
            postings,
            payloads: vec![RawPayload {
                url: format!("file://{}", self.path.display()),
                content_type: "application/json".to_string(),
                body,
            }],
        })
    }
}

/// Build the adapter a source entry asks for. Relative fixture paths resolve
/// against `workspace_root`.
pub fn adapter_for_source(
    config: &SourceConfig,
    workspace_root: &Path,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match config.kind {
        SourceKind::Fixture => {
            let path = config.fixture_path.as_ref().ok_or_else(|| {
                AdapterError::Config(format!("{} needs fixture_path", config.source_id))
            })?;
            let path = if path.is_absolute() {
                path.clone()
            } else {
                workspace_root.join(path)
            };
            Ok(Box::new(FixtureFileAdapter::new(&config.source_id, path)))
        }
        SourceKind::HtmlListing => {
            if config.listing_urls.is_empty() {
                return Err(AdapterError::Config(format!(
                    "{} needs at least one listing url",
                    config.source_id
                )));
            }
            let selectors = config.selectors.clone().ok_or_else(|| {
                AdapterError::Config(format!("{} needs selectors", config.source_id))
            })?;
            Ok(Box::new(HtmlListingAdapter::new(
                &config.source_id,
                config.listing_urls.clone(),
                selectors,
                http,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfinder_storage::HttpClientConfig;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }

    fn fixture_config(path: &str) -> SourceConfig {
        SourceConfig {
            source_id: "remoteok".into(),
            display_name: "RemoteOK".into(),
            enabled: true,
            kind: SourceKind::Fixture,
            fixture_path: Some(PathBuf::from(path)),
            listing_urls: vec![],
            selectors: None,
            notes: None,
        }
    }

    #[tokio::test]
    async fn fixture_adapter_reads_workspace_fixture() {
        let adapter = adapter_for_source(
            &fixture_config("fixtures/remoteok.json"),
            &workspace_root(),
            http(),
        )
        .expect("adapter");
        let batch = adapter.fetch(&ctx()).await.expect("fixture batch");

        assert_eq!(adapter.source_id(), "remoteok");
        assert!(!batch.postings.is_empty());
        assert!(batch.postings.iter().all(|p| p.source == "remoteok"));
        assert_eq!(batch.payloads.len(), 1);
        assert_eq!(batch.payloads[0].content_type, "application/json");
    }

    #[tokio::test]
    async fn missing_fixture_is_an_adapter_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = FixtureFileAdapter::new("remoteok", dir.path().join("absent.json"));
        assert!(matches!(
            adapter.fetch(&ctx()).await,
            Err(AdapterError::Fixture { .. })
        ));
    }

    #[tokio::test]
    async fn malformed_fixture_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{\"not\": \"a list\"}").expect("write fixture");
        let adapter = FixtureFileAdapter::new("remoteok", path);
        assert!(matches!(
            adapter.fetch(&ctx()).await,
            Err(AdapterError::Parse(_))
        ));
    }

    #[test]
    fn incomplete_source_configs_are_rejected() {
        let mut config = fixture_config("x.json");
        config.fixture_path = None;
        assert!(matches!(
            adapter_for_source(&config, Path::new("."), http()),
            Err(AdapterError::Config(_))
        ));

        config.kind = SourceKind::HtmlListing;
        config.listing_urls = vec!["https://jobs.example/list".into()];
        assert!(matches!(
            adapter_for_source(&config, Path::new("."), http()),
            Err(AdapterError::Config(_))
        ));
    }

    #[test]
    fn source_configs_parse_from_json() {
        let config: SourceConfig = serde_json::from_value(serde_json::json!({
            "source_id": "board",
            "display_name": "Board",
            "enabled": false,
            "kind": "html_listing",
            "listing_urls": ["https://board.example/jobs"],
            "selectors": {
                "item": "li.job",
                "title": ".title",
                "company": ".company",
                "link": "a"
            }
        }))
        .expect("config");
        assert_eq!(config.kind, SourceKind::HtmlListing);
        assert!(config.selectors.is_some());
        assert!(config.fixture_path.is_none());
    }
}
