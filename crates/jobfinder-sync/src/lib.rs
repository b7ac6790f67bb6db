//! Sync orchestration: source runs, scoring, notification dispatch, the
//! optional Postgres mirror and digest reports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jobfinder_adapters::adapter_for_source;
use jobfinder_storage::{
    CriteriaStore, HttpClientConfig, HttpFetcher, MatchStore, PayloadArchive, PostingStore,
    ScrapeRunTracker, SubscriptionRegistry,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod config;
mod dispatch;
mod persist;
mod pipeline;
mod reports;

pub use config::{SourceRegistry, SyncConfig};
pub use dispatch::{
    DeliveryError, DispatchReport, DispatchSettings, Dispatcher, HttpPushTransport, MatchEvent,
    MatchNotice, PushTransport,
};
pub use persist::{HydrateSummary, PgMirror};
pub use pipeline::{PipelineSettings, SkippedSource, SyncPipeline, TriggerAck, TriggeredRun};
pub use reports::{write_digest_report, ReportManifest, ReportManifestFile, ReportSummary};

pub const CRATE_NAME: &str = "jobfinder-sync";

/// Every authoritative store, shared by the pipeline, the dispatcher and the API.
pub struct Stores {
    pub criteria: CriteriaStore,
    pub postings: PostingStore,
    pub matches: Arc<MatchStore>,
    pub runs: ScrapeRunTracker,
    pub subscriptions: Arc<SubscriptionRegistry>,
}

impl Stores {
    pub fn new(min_match_score: u8) -> Self {
        Self {
            criteria: CriteriaStore::new(),
            postings: PostingStore::new(),
            matches: Arc::new(MatchStore::new(min_match_score)),
            runs: ScrapeRunTracker::new(),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
        }
    }
}

/// A wired process: stores, pipeline and a running dispatcher task.
pub struct AppRuntime {
    config: SyncConfig,
    pipeline: Arc<SyncPipeline>,
    mirror: Option<Arc<PgMirror>>,
    dispatcher: JoinHandle<()>,
}

impl AppRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.workspace_root)?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let stores = Arc::new(Stores::new(config.min_match_score));
        let mirror = connect_mirror(&config, &stores).await;

        let dispatcher = Dispatcher::new(
            Arc::clone(&stores.subscriptions),
            Arc::new(HttpPushTransport::new(Arc::clone(&http))),
            DispatchSettings {
                score_threshold: config.notify_score_threshold,
                failure_threshold: config.notify_failure_threshold,
                push_timeout: config.push_timeout(),
                dashboard_url: config.dashboard_url.clone(),
                ..Default::default()
            },
        )
        .with_matches(Arc::clone(&stores.matches))
        .with_mirror(mirror.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(dispatcher).spawn(events_rx);

        let mut pipeline = SyncPipeline::new(
            PipelineSettings {
                adapter_timeout: config.adapter_timeout(),
                notify_score_threshold: config.notify_score_threshold,
            },
            Arc::clone(&stores),
            events_tx,
        )
        .with_archive(Some(PayloadArchive::new(config.artifacts_dir.clone())))
        .with_mirror(mirror.clone());

        for source in &registry.sources {
            match adapter_for_source(source, &config.workspace_root, Arc::clone(&http)) {
                Ok(adapter) => pipeline = pipeline.with_source(source.clone(), Arc::from(adapter)),
                Err(err) => warn!(source = %source.source_id, error = %err, "source not registered"),
            }
        }
        info!(
            sources = registry.sources.len(),
            enabled = registry.enabled().count(),
            mirror = mirror.is_some(),
            "sync runtime ready"
        );

        Ok(Self {
            config,
            pipeline: Arc::new(pipeline),
            mirror,
            dispatcher,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pipeline(&self) -> Arc<SyncPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn mirror(&self) -> Option<&Arc<PgMirror>> {
        self.mirror.as_ref()
    }

    pub async fn write_report(&self) -> Result<ReportSummary> {
        write_digest_report(self.pipeline.stores(), &self.config.reports_dir(), Utc::now()).await
    }

    /// A cron scheduler running every enabled source, or `None` when disabled.
    /// The caller starts it.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(&self.pipeline);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let runs = pipeline.run_all().await;
                let failed = runs.iter().filter(|r| r.error.is_some()).count();
                info!(runs = runs.len(), failed, "scheduled sync finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    /// Close the event channel and give the dispatcher `grace` to flush.
    /// Pipeline handles cloned elsewhere must be dropped first.
    pub async fn shutdown(self, grace: Duration) {
        let Self {
            pipeline,
            mut dispatcher,
            ..
        } = self;
        drop(pipeline);
        if tokio::time::timeout(grace, &mut dispatcher).await.is_err() {
            warn!("dispatcher did not drain in time");
            dispatcher.abort();
        }
    }
}

async fn connect_mirror(config: &SyncConfig, stores: &Stores) -> Option<Arc<PgMirror>> {
    let url = config.database_url.as_deref()?;
    let mirror = match PgMirror::connect(url).await {
        Ok(mirror) => mirror,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "postgres unavailable; running in memory only");
            return None;
        }
    };
    if let Err(err) = mirror.migrate().await {
        warn!(error = %format!("{err:#}"), "postgres migrations failed; running in memory only");
        return None;
    }
    if let Err(err) = mirror.hydrate(stores).await {
        warn!(error = %format!("{err:#}"), "hydrating from postgres failed");
    }
    Some(Arc::new(mirror))
}
