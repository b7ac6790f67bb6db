//! Scrape, dedup, score, upsert. One run per source; sources run concurrently
//! and fail independently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobfinder_adapters::{
    AdapterContext, AdapterError, SourceAdapter, SourceBatch, SourceConfig,
};
use jobfinder_core::{
    score, CoreError, Criteria, CriteriaInput, Match, MatchStatus, NotificationSubscription,
    Posting, RawPosting, ScrapeRun,
};
use jobfinder_storage::{PayloadArchive, StoreError, UpsertOutcome};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatch::{MatchEvent, MatchNotice};
use crate::persist::PgMirror;
use crate::Stores;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub adapter_timeout: Duration,
    /// Re-scored matches crossing this score are announced like new ones.
    pub notify_score_threshold: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_secs(60),
            notify_score_threshold: 90,
        }
    }
}

struct RegisteredSource {
    config: SourceConfig,
    adapter: Arc<dyn SourceAdapter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredRun {
    pub source: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSource {
    pub source: String,
    pub reason: String,
}

/// Acknowledgement for an asynchronous trigger; runs continue in the background.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerAck {
    pub runs: Vec<TriggeredRun>,
    pub skipped: Vec<SkippedSource>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct IngestTally {
    found: u32,
    new: u32,
    rejected: u32,
    matches_created: usize,
}

pub struct SyncPipeline {
    settings: PipelineSettings,
    stores: Arc<Stores>,
    sources: Vec<Arc<RegisteredSource>>,
    archive: Option<PayloadArchive>,
    mirror: Option<Arc<PgMirror>>,
    events: mpsc::UnboundedSender<MatchEvent>,
}

impl SyncPipeline {
    pub fn new(
        settings: PipelineSettings,
        stores: Arc<Stores>,
        events: mpsc::UnboundedSender<MatchEvent>,
    ) -> Self {
        Self {
            settings,
            stores,
            sources: Vec::new(),
            archive: None,
            mirror: None,
            events,
        }
    }

    pub fn with_source(mut self, config: SourceConfig, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(Arc::new(RegisteredSource { config, adapter }));
        self
    }

    pub fn with_archive(mut self, archive: Option<PayloadArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_mirror(mut self, mirror: Option<Arc<PgMirror>>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn stores(&self) -> &Arc<Stores> {
        &self.stores
    }

    pub fn sources(&self) -> Vec<SourceConfig> {
        self.sources.iter().map(|s| s.config.clone()).collect()
    }

    fn source(&self, source_id: &str) -> Option<&Arc<RegisteredSource>> {
        self.sources.iter().find(|s| s.config.source_id == source_id)
    }

    async fn begin_run(&self, source_id: &str) -> Result<Uuid, StoreError> {
        let run_id = self.stores.runs.begin_run(source_id).await?;
        if let (Some(mirror), Some(run)) = (&self.mirror, self.stores.runs.get(run_id).await) {
            mirror.save_run(&run).await;
        }
        Ok(run_id)
    }

    /// Begin runs and return at once; the work continues on spawned tasks.
    /// A named source with an open run fails with `RunAlreadyInProgress`;
    /// when triggering all sources such sources are reported as skipped.
    pub async fn trigger(self: &Arc<Self>, source: Option<&str>) -> Result<TriggerAck, StoreError> {
        let mut ack = TriggerAck::default();
        let targets = match source {
            Some(source_id) => {
                let registered = self
                    .source(source_id)
                    .ok_or_else(|| StoreError::not_found("source", source_id))?;
                if !registered.config.enabled {
                    return Err(CoreError::Validation(format!("source `{source_id}` is disabled")).into());
                }
                vec![Arc::clone(registered)]
            }
            None => self
                .sources
                .iter()
                .filter(|s| s.config.enabled)
                .cloned()
                .collect(),
        };

        for registered in targets {
            let source_id = registered.config.source_id.clone();
            let run_id = match self.begin_run(&source_id).await {
                Ok(run_id) => run_id,
                Err(err @ StoreError::RunAlreadyInProgress { .. }) if source.is_none() => {
                    ack.skipped.push(SkippedSource {
                        source: source_id,
                        reason: err.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.execute_run(&registered, run_id).await;
            });
            ack.runs.push(TriggeredRun {
                source: source_id,
                run_id,
            });
        }
        Ok(ack)
    }

    /// Run one source to completion.
    pub async fn run_source(&self, source_id: &str) -> Result<ScrapeRun, StoreError> {
        let registered = self
            .source(source_id)
            .ok_or_else(|| StoreError::not_found("source", source_id))?;
        let run_id = self.begin_run(source_id).await?;
        self.execute_run(registered, run_id)
            .await
            .ok_or_else(|| StoreError::not_found("scrape run", run_id))
    }

    /// Run every enabled source concurrently and wait for all of them.
    /// Sources that already have an open run are skipped.
    pub async fn run_all(self: &Arc<Self>) -> Vec<ScrapeRun> {
        let mut tasks = JoinSet::new();
        for registered in self.sources.iter().filter(|s| s.config.enabled) {
            let run_id = match self.begin_run(&registered.config.source_id).await {
                Ok(run_id) => run_id,
                Err(err) => {
                    warn!(source = %registered.config.source_id, error = %err, "skipping source");
                    continue;
                }
            };
            let this = Arc::clone(self);
            let registered = Arc::clone(registered);
            tasks.spawn(async move { this.execute_run(&registered, run_id).await });
        }

        let mut finished = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(run)) => finished.push(run),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "scrape task panicked"),
            }
        }
        finished.sort_by(|a, b| a.source.cmp(&b.source));
        finished
    }

    async fn execute_run(&self, registered: &RegisteredSource, run_id: Uuid) -> Option<ScrapeRun> {
        let source_id = registered.config.source_id.clone();
        let span = info_span!("scrape_run", source = %source_id, %run_id);
        async {
            let ctx = AdapterContext {
                run_id,
                fetched_at: Utc::now(),
            };
            let fetched = self.fetch_isolated(registered, &ctx).await;

            let (tally, error) = match fetched {
                Ok(batch) => {
                    self.archive_payloads(&source_id, &ctx, &batch.payloads).await;
                    (self.ingest_batch(&batch.postings).await, None)
                }
                Err(err) => {
                    warn!(error = %err, "source adapter failed");
                    (IngestTally::default(), Some(err.to_string()))
                }
            };

            let finished = match self
                .stores
                .runs
                .end_run(run_id, tally.found, tally.new, error)
                .await
            {
                Ok(run) => run,
                Err(err) => {
                    warn!(error = %err, "could not close scrape run");
                    return None;
                }
            };
            if let Some(mirror) = &self.mirror {
                mirror.save_run(&finished).await;
            }
            self.finish_pass(Some(source_id.clone()));
            info!(
                found = tally.found,
                new = tally.new,
                rejected = tally.rejected,
                matches_created = tally.matches_created,
                failed = finished.error.is_some(),
                "scrape run finished"
            );
            Some(finished)
        }
        .instrument(span)
        .await
    }

    /// Fetch on a separate task so an adapter panic or hang ends as an
    /// adapter error and the run still closes.
    async fn fetch_isolated(
        &self,
        registered: &RegisteredSource,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let adapter = Arc::clone(&registered.adapter);
        let task_ctx = ctx.clone();
        let mut fetch = tokio::spawn(async move { adapter.fetch(&task_ctx).await });
        match tokio::time::timeout(self.settings.adapter_timeout, &mut fetch).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(join)) => Err(AdapterError::Aborted(join.to_string())),
            Err(_) => {
                fetch.abort();
                Err(AdapterError::Timeout {
                    source_id: registered.config.source_id.clone(),
                    after: self.settings.adapter_timeout,
                })
            }
        }
    }

    async fn archive_payloads(
        &self,
        source_id: &str,
        ctx: &AdapterContext,
        payloads: &[jobfinder_adapters::RawPayload],
    ) {
        let Some(archive) = &self.archive else {
            return;
        };
        for payload in payloads {
            if let Err(err) = archive
                .archive(source_id, ctx.fetched_at, &payload.content_type, &payload.body)
                .await
            {
                warn!(url = %payload.url, error = %err, "raw payload archive failed");
            }
        }
    }

    async fn ingest_batch(&self, raws: &[RawPosting]) -> IngestTally {
        let mut tally = IngestTally {
            found: u32::try_from(raws.len()).unwrap_or(u32::MAX),
            ..Default::default()
        };
        let criteria = self.stores.criteria.active().await;
        for raw in raws {
            let outcome = match self.stores.postings.ingest(raw).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tally.rejected += 1;
                    debug!(external_id = %raw.external_id, error = %err, "raw posting rejected");
                    continue;
                }
            };
            if outcome.is_created() {
                tally.new += 1;
            }
            if let Some(posting) = outcome.changed_posting() {
                if let Some(mirror) = &self.mirror {
                    mirror.save_posting(posting).await;
                }
                tally.matches_created += self.score_posting(posting, &criteria).await;
            }
        }
        tally
    }

    /// Score one posting against each criteria set and upsert the results.
    /// Returns the number of matches created.
    async fn score_posting(&self, posting: &Posting, criteria: &[Criteria]) -> usize {
        let mut created = 0;
        for c in criteria {
            let outcome = score(c, posting);
            let upsert = self
                .stores
                .matches
                .upsert(c.id, posting.canonical_id, outcome.score, outcome.is_vetoed())
                .await;
            if upsert.is_created() {
                created += 1;
            }
            if let Some(veto) = outcome.veto {
                debug!(criteria_id = %c.id, canonical_id = %posting.canonical_id, ?veto, "posting vetoed");
            }
            self.publish(upsert, posting).await;
        }
        created
    }

    async fn publish(&self, upsert: UpsertOutcome, posting: &Posting) {
        let notice = |record: Match| MatchNotice {
            record,
            title: posting.title.clone(),
            company: posting.company.clone(),
        };
        let event = match upsert {
            UpsertOutcome::Created(record) => {
                if let Some(mirror) = &self.mirror {
                    mirror.save_match(&record).await;
                }
                Some(MatchEvent::Created(notice(record)))
            }
            UpsertOutcome::Rescored {
                previous_score,
                record,
            } => {
                if let Some(mirror) = &self.mirror {
                    mirror.save_match(&record).await;
                }
                let threshold = self.settings.notify_score_threshold;
                let crossed = previous_score <= threshold && record.match_score > threshold;
                (crossed && record.status == MatchStatus::New)
                    .then(|| MatchEvent::Rescored(notice(record)))
            }
            UpsertOutcome::Vetoed { .. } | UpsertOutcome::BelowThreshold => None,
        };
        if let Some(event) = event {
            self.send(event);
        }
    }

    fn send(&self, event: MatchEvent) {
        if self.events.send(event).is_err() {
            debug!("match event dropped; dispatcher is not running");
        }
    }

    fn finish_pass(&self, source: Option<String>) {
        self.send(MatchEvent::PassFinished { source });
    }

    /// Score every known posting against one criteria set.
    pub async fn rescore_criteria(&self, criteria: &Criteria) -> usize {
        if !criteria.is_active {
            return 0;
        }
        let postings = self.stores.postings.all().await;
        let mut created = 0;
        for posting in &postings {
            created += self
                .score_posting(posting, std::slice::from_ref(criteria))
                .await;
        }
        self.finish_pass(None);
        debug!(criteria_id = %criteria.id, postings = postings.len(), created, "criteria re-scored");
        created
    }

    pub async fn create_criteria(&self, input: CriteriaInput) -> Result<Criteria, StoreError> {
        let criteria = self.stores.criteria.create(input).await?;
        if let Some(mirror) = &self.mirror {
            mirror.save_criteria(&criteria).await;
        }
        self.rescore_criteria(&criteria).await;
        Ok(criteria)
    }

    pub async fn replace_criteria(
        &self,
        id: Uuid,
        input: CriteriaInput,
    ) -> Result<Criteria, StoreError> {
        let criteria = self.stores.criteria.replace(id, input).await?;
        if let Some(mirror) = &self.mirror {
            mirror.save_criteria(&criteria).await;
        }
        self.rescore_criteria(&criteria).await;
        Ok(criteria)
    }

    /// Delete a criteria set together with its matches.
    pub async fn delete_criteria(&self, id: Uuid) -> Result<Criteria, StoreError> {
        let criteria = self.stores.criteria.delete(id).await?;
        let removed = self.stores.matches.remove_for_criteria(id).await;
        if let Some(mirror) = &self.mirror {
            mirror.delete_criteria(id).await;
        }
        info!(criteria_id = %id, matches_removed = removed.len(), "criteria deleted");
        Ok(criteria)
    }

    pub async fn transition_match(
        &self,
        match_id: Uuid,
        to: MatchStatus,
    ) -> Result<Match, StoreError> {
        let record = self.stores.matches.transition(match_id, to).await?;
        if let Some(mirror) = &self.mirror {
            mirror.save_match(&record).await;
        }
        Ok(record)
    }

    pub async fn subscribe(
        &self,
        endpoint: &str,
        subscription_payload: serde_json::Value,
    ) -> Result<NotificationSubscription, StoreError> {
        let sub = self
            .stores
            .subscriptions
            .subscribe(endpoint, subscription_payload)
            .await?;
        if let Some(mirror) = &self.mirror {
            mirror.save_subscription(&sub).await;
        }
        Ok(sub)
    }

    pub async fn unsubscribe(&self, endpoint: &str) -> Result<NotificationSubscription, StoreError> {
        let sub = self
            .stores
            .subscriptions
            .unsubscribe(endpoint)
            .await
            .ok_or_else(|| StoreError::not_found("subscription", endpoint))?;
        if let Some(mirror) = &self.mirror {
            mirror.delete_subscription(&sub.endpoint).await;
        }
        Ok(sub)
    }
}
