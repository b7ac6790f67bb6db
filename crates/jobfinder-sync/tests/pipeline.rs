use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobfinder_adapters::{
    AdapterContext, AdapterError, FixtureFileAdapter, SourceAdapter, SourceBatch, SourceConfig,
    SourceKind,
};
use jobfinder_core::{
    CoreError, CriteriaInput, MatchStatus, NotificationSubscription, PushPayload,
};
use jobfinder_storage::{MatchFilter, StoreError};
use jobfinder_sync::{
    DeliveryError, DispatchSettings, Dispatcher, MatchEvent, PipelineSettings, PushTransport,
    Stores, SyncPipeline,
};
use serde_json::json;
use tokio::sync::mpsc;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn source_config(source_id: &str, enabled: bool) -> SourceConfig {
    SourceConfig {
        source_id: source_id.to_string(),
        display_name: source_id.to_string(),
        enabled,
        kind: SourceKind::Fixture,
        fixture_path: Some(PathBuf::from(format!("fixtures/{source_id}.json"))),
        listing_urls: Vec::new(),
        selectors: None,
        notes: None,
    }
}

fn fixture_adapter(source_id: &str) -> Arc<dyn SourceAdapter> {
    Arc::new(FixtureFileAdapter::new(
        source_id,
        workspace_root().join(format!("fixtures/{source_id}.json")),
    ))
}

struct FailingAdapter;

#[async_trait]
impl SourceAdapter for FailingAdapter {
    fn source_id(&self) -> &str {
        "broken"
    }

    async fn fetch(&self, _ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        Err(AdapterError::Parse("unexpected markup".into()))
    }
}

struct StalledAdapter;

#[async_trait]
impl SourceAdapter for StalledAdapter {
    fn source_id(&self) -> &str {
        "stalled"
    }

    async fn fetch(&self, _ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        std::future::pending::<()>().await;
        Ok(SourceBatch::default())
    }
}

struct PanickingAdapter;

#[async_trait]
impl SourceAdapter for PanickingAdapter {
    fn source_id(&self) -> &str {
        "boom"
    }

    async fn fetch(&self, _ctx: &AdapterContext) -> Result<SourceBatch, AdapterError> {
        panic!("listing layout changed");
    }
}

fn backend_criteria() -> CriteriaInput {
    CriteriaInput {
        name: "Rust backend".into(),
        titles: vec!["Backend Engineer".into()],
        tech_stack: vec!["rust".into(), "tokio".into()],
        company_whitelist: vec!["Ferrous Systems".into()],
        is_active: true,
        ..Default::default()
    }
}

fn fixture_pipeline() -> (Arc<SyncPipeline>, mpsc::UnboundedReceiver<MatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pipeline = SyncPipeline::new(
        PipelineSettings::default(),
        Arc::new(Stores::new(40)),
        tx,
    )
    .with_source(source_config("remoteok", true), fixture_adapter("remoteok"))
    .with_source(
        source_config("weworkremotely", true),
        fixture_adapter("weworkremotely"),
    );
    (Arc::new(pipeline), rx)
}

#[tokio::test]
async fn sources_dedupe_into_one_posting_and_reruns_are_idempotent() {
    let (pipeline, _rx) = fixture_pipeline();
    let criteria = pipeline.create_criteria(backend_criteria()).await.unwrap();

    let runs = pipeline.run_all().await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.error.is_none() && r.finished_at.is_some()));
    assert_eq!(runs.iter().map(|r| r.jobs_found).sum::<u32>(), 5);
    assert_eq!(runs.iter().map(|r| r.jobs_new).sum::<u32>(), 4);

    let stores = pipeline.stores();
    assert_eq!(stores.postings.len().await, 4);
    let acme = stores
        .postings
        .all()
        .await
        .into_iter()
        .find(|p| p.company == "Acme Analytics")
        .expect("merged acme posting");
    assert_eq!(acme.sources.len(), 2);

    let matches = stores
        .matches
        .list(&MatchFilter {
            criteria_id: Some(criteria.id),
            ..Default::default()
        })
        .await;
    assert_eq!(matches[0].match_score, 100);
    let match_count = stores.matches.len().await;

    let rerun = pipeline.run_all().await;
    assert_eq!(rerun.iter().map(|r| r.jobs_new).sum::<u32>(), 0);
    assert_eq!(stores.postings.len().await, 4);
    assert_eq!(stores.matches.len().await, match_count);
}

#[tokio::test]
async fn failing_source_does_not_block_the_others() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(
        SyncPipeline::new(PipelineSettings::default(), Arc::new(Stores::new(40)), tx)
            .with_source(source_config("broken", true), Arc::new(FailingAdapter))
            .with_source(source_config("remoteok", true), fixture_adapter("remoteok")),
    );

    let runs = pipeline.run_all().await;
    assert_eq!(runs.len(), 2);
    let broken = runs.iter().find(|r| r.source == "broken").unwrap();
    assert!(broken.error.as_deref().unwrap().contains("unexpected markup"));
    assert_eq!(broken.jobs_found, 0);
    let healthy = runs.iter().find(|r| r.source == "remoteok").unwrap();
    assert!(healthy.error.is_none());
    assert_eq!(healthy.jobs_new, 3);

    let stores = pipeline.stores();
    assert!(stores.runs.open_run("broken").await.is_none());
    assert!(stores.runs.open_run("remoteok").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn stalled_source_is_closed_with_a_timeout_error() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pipeline = SyncPipeline::new(
        PipelineSettings {
            adapter_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        Arc::new(Stores::new(40)),
        tx,
    )
    .with_source(source_config("stalled", true), Arc::new(StalledAdapter));

    let run = pipeline.run_source("stalled").await.unwrap();
    assert!(run.finished_at.is_some());
    assert!(run.error.unwrap().contains("did not answer"));
    assert!(pipeline.stores().runs.open_run("stalled").await.is_none());
}

#[tokio::test]
async fn panicking_source_closes_its_run_and_can_run_again() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(
        SyncPipeline::new(PipelineSettings::default(), Arc::new(Stores::new(40)), tx)
            .with_source(source_config("boom", true), Arc::new(PanickingAdapter))
            .with_source(source_config("remoteok", true), fixture_adapter("remoteok")),
    );

    let runs = pipeline.run_all().await;
    assert_eq!(runs.len(), 2);
    let boom = runs.iter().find(|r| r.source == "boom").unwrap();
    assert!(boom.finished_at.is_some());
    assert!(boom.error.as_deref().unwrap().contains("aborted"));
    assert!(pipeline.stores().runs.open_run("boom").await.is_none());

    let ack = pipeline.trigger(Some("boom")).await.unwrap();
    assert_eq!(ack.runs.len(), 1);
}

#[tokio::test]
async fn new_criteria_scores_postings_already_ingested() {
    let (pipeline, _rx) = fixture_pipeline();
    pipeline.run_source("remoteok").await.unwrap();
    assert_eq!(pipeline.stores().matches.len().await, 0);

    let created = pipeline.create_criteria(backend_criteria()).await.unwrap();
    let matches = pipeline
        .stores()
        .matches
        .list(&MatchFilter {
            criteria_id: Some(created.id),
            ..Default::default()
        })
        .await;
    assert!(!matches.is_empty());
    assert!(matches.iter().all(|m| m.status == MatchStatus::New));
}

#[tokio::test]
async fn veto_after_status_change_keeps_the_match_history() {
    let (pipeline, _rx) = fixture_pipeline();
    let criteria = pipeline.create_criteria(backend_criteria()).await.unwrap();
    pipeline.run_source("remoteok").await.unwrap();

    let stores = pipeline.stores();
    let ferrous = stores
        .matches
        .list(&MatchFilter {
            min_score: Some(100),
            ..Default::default()
        })
        .await
        .remove(0);
    pipeline
        .transition_match(ferrous.id, MatchStatus::Applied)
        .await
        .unwrap();

    let mut blacklisted = backend_criteria();
    blacklisted.company_blacklist = vec!["Ferrous Systems".into()];
    blacklisted.company_whitelist.clear();
    pipeline
        .replace_criteria(criteria.id, blacklisted)
        .await
        .unwrap();

    let kept = stores.matches.get(ferrous.id).await.expect("match kept");
    assert_eq!(kept.status, MatchStatus::Applied);
    assert_eq!(kept.match_score, 100);
}

#[tokio::test]
async fn deleting_criteria_removes_its_matches() {
    let (pipeline, _rx) = fixture_pipeline();
    let criteria = pipeline.create_criteria(backend_criteria()).await.unwrap();
    pipeline.run_source("remoteok").await.unwrap();
    assert!(pipeline.stores().matches.len().await > 0);

    pipeline.delete_criteria(criteria.id).await.unwrap();
    assert_eq!(pipeline.stores().matches.len().await, 0);
    assert!(matches!(
        pipeline.delete_criteria(criteria.id).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn trigger_reports_busy_sources() {
    let (pipeline, _rx) = fixture_pipeline();
    let open = pipeline.stores().runs.begin_run("remoteok").await.unwrap();

    let err = pipeline.trigger(Some("remoteok")).await.unwrap_err();
    assert!(matches!(err, StoreError::RunAlreadyInProgress { run_id, .. } if run_id == open));

    let ack = pipeline.trigger(None).await.unwrap();
    assert_eq!(ack.skipped.len(), 1);
    assert_eq!(ack.skipped[0].source, "remoteok");
    assert_eq!(ack.runs.len(), 1);
    assert_eq!(ack.runs[0].source, "weworkremotely");
}

#[tokio::test]
async fn trigger_rejects_unknown_and_disabled_sources() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(
        SyncPipeline::new(PipelineSettings::default(), Arc::new(Stores::new(40)), tx)
            .with_source(source_config("remoteok", false), fixture_adapter("remoteok")),
    );

    assert!(matches!(
        pipeline.trigger(Some("nope")).await,
        Err(StoreError::NotFound { entity: "source", .. })
    ));
    assert!(matches!(
        pipeline.trigger(Some("remoteok")).await,
        Err(StoreError::Core(CoreError::Validation(_)))
    ));
    let ack = pipeline.trigger(None).await.unwrap();
    assert!(ack.runs.is_empty());
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<PushPayload>>,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn deliver(
        &self,
        _subscription: &NotificationSubscription,
        payload: &PushPayload,
    ) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

#[tokio::test]
async fn high_scoring_matches_are_pushed_after_the_run() {
    let (pipeline, rx) = fixture_pipeline();
    let transport = Arc::new(RecordingTransport::default());
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&pipeline.stores().subscriptions),
            transport.clone(),
            DispatchSettings::default(),
        )
        .with_matches(Arc::clone(&pipeline.stores().matches)),
    );
    let handle = dispatcher.spawn(rx);

    pipeline
        .subscribe("https://push.example/device-1", json!({"keys": {"auth": "x"}}))
        .await
        .unwrap();
    pipeline.create_criteria(backend_criteria()).await.unwrap();
    pipeline.run_source("remoteok").await.unwrap();
    drop(pipeline);
    handle.await.unwrap();

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "New job match");
    assert!(sent[0].body.starts_with("Senior Backend Engineer at Ferrous Systems"));
}

#[tokio::test]
async fn matches_saved_before_the_flush_are_not_pushed() {
    let (pipeline, rx) = fixture_pipeline();
    pipeline
        .subscribe("https://push.example/device-1", json!({}))
        .await
        .unwrap();
    pipeline.create_criteria(backend_criteria()).await.unwrap();
    pipeline.run_source("remoteok").await.unwrap();

    let stores = Arc::clone(pipeline.stores());
    for record in stores.matches.list(&MatchFilter::default()).await {
        pipeline
            .transition_match(record.id, MatchStatus::Saved)
            .await
            .unwrap();
    }

    let transport = Arc::new(RecordingTransport::default());
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&stores.subscriptions),
            transport.clone(),
            DispatchSettings::default(),
        )
        .with_matches(Arc::clone(&stores.matches)),
    );
    let handle = dispatcher.spawn(rx);
    drop(pipeline);
    handle.await.unwrap();

    assert!(transport.sent.lock().unwrap().is_empty());
}
