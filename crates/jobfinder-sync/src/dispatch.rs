//! Notification dispatch: batches eligible matches into one push per
//! subscription per cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfinder_core::{Match, MatchStatus, NotificationSubscription, PushPayload};
use jobfinder_storage::{
    BackoffPolicy, FetchError, HttpFetcher, MatchStore, SubscriptionRegistry,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persist::PgMirror;

/// A match plus the posting fields shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchNotice {
    pub record: Match,
    pub title: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    Created(MatchNotice),
    /// Re-scored from at or below the notify threshold to above it.
    Rescored(MatchNotice),
    /// Closes one scoring pass; triggers a dispatch cycle.
    PassFinished { source: Option<String> },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("push delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("push endpoint is gone (http {0})")]
    Gone(u16),
    #[error("push endpoint rejected the notification (http {0})")]
    Rejected(u16),
    #[error("push transport error: {0}")]
    Transport(String),
}

/// Delivery capability; encryption and protocol details live behind it.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        subscription: &NotificationSubscription,
        payload: &PushPayload,
    ) -> Result<(), DeliveryError>;
}

/// Posts the payload as JSON to the subscription endpoint.
pub struct HttpPushTransport {
    http: Arc<HttpFetcher>,
}

impl HttpPushTransport {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn deliver(
        &self,
        subscription: &NotificationSubscription,
        payload: &PushPayload,
    ) -> Result<(), DeliveryError> {
        match self.http.post_json(&subscription.endpoint, payload).await {
            Ok(_) => Ok(()),
            Err(FetchError::HttpStatus { status, .. }) if status == 404 || status == 410 => {
                Err(DeliveryError::Gone(status))
            }
            Err(FetchError::HttpStatus { status, .. }) => Err(DeliveryError::Rejected(status)),
            Err(err) => Err(DeliveryError::Transport(err.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Matches must score strictly above this to be pushed.
    pub score_threshold: u8,
    pub failure_threshold: u32,
    pub push_timeout: Duration,
    pub dashboard_url: String,
    pub backoff: BackoffPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            score_threshold: 90,
            failure_threshold: 5,
            push_timeout: Duration::from_secs(10),
            dashboard_url: "/".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub eligible: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub deactivated: usize,
    /// Active subscriptions still inside their backoff window.
    pub deferred: usize,
}

pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn PushTransport>,
    settings: DispatchSettings,
    // Current match state; notices are re-read from here before a push.
    matches: Option<Arc<MatchStore>>,
    mirror: Option<Arc<PgMirror>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<dyn PushTransport>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            transport,
            settings,
            matches: None,
            mirror: None,
        }
    }

    pub fn with_matches(mut self, matches: Arc<MatchStore>) -> Self {
        self.matches = Some(matches);
        self
    }

    pub fn with_mirror(mut self, mirror: Option<Arc<PgMirror>>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn is_eligible(&self, record: &Match) -> bool {
        record.status == MatchStatus::New && record.match_score > self.settings.score_threshold
    }

    /// Replace each queued snapshot with the stored record. Matches deleted
    /// since they were queued are dropped.
    async fn refresh(&self, notices: &[MatchNotice]) -> Vec<MatchNotice> {
        let Some(matches) = &self.matches else {
            return notices.to_vec();
        };
        let mut current = Vec::with_capacity(notices.len());
        for notice in notices {
            if let Some(record) = matches.get(notice.record.id).await {
                current.push(MatchNotice {
                    record,
                    ..notice.clone()
                });
            }
        }
        current
    }

    /// Eligible notices, one per match, best score first.
    fn eligible(&self, notices: &[MatchNotice]) -> Vec<MatchNotice> {
        let mut latest: HashMap<Uuid, &MatchNotice> = HashMap::new();
        for notice in notices {
            latest
                .entry(notice.record.id)
                .and_modify(|seen| {
                    if notice.record.scored_at >= seen.record.scored_at {
                        *seen = notice;
                    }
                })
                .or_insert(notice);
        }
        let mut eligible = latest
            .into_values()
            .filter(|n| self.is_eligible(&n.record))
            .cloned()
            .collect::<Vec<_>>();
        eligible.sort_by(|a, b| {
            b.record
                .match_score
                .cmp(&a.record.match_score)
                .then(a.record.id.cmp(&b.record.id))
        });
        eligible
    }

    pub fn build_payload(&self, eligible: &[MatchNotice]) -> Option<PushPayload> {
        let top = eligible.first()?;
        let headline = format!(
            "{} at {} ({})",
            top.title, top.company, top.record.match_score
        );
        let (title, body) = match eligible.len() {
            1 => ("New job match".to_string(), headline),
            n => (
                format!("{n} new job matches"),
                format!("{headline} and {} more", n - 1),
            ),
        };
        Some(PushPayload {
            title,
            body,
            url: self.settings.dashboard_url.clone(),
        })
    }

    pub async fn notify(&self, new_matches: &[MatchNotice]) -> DispatchReport {
        self.notify_at(new_matches, Utc::now()).await
    }

    /// One dispatch cycle. Delivery failures are recorded per subscription
    /// and never surface to the caller.
    pub async fn notify_at(&self, new_matches: &[MatchNotice], now: DateTime<Utc>) -> DispatchReport {
        let eligible = self.eligible(&self.refresh(new_matches).await);
        let mut report = DispatchReport {
            eligible: eligible.len(),
            ..Default::default()
        };
        let Some(payload) = self.build_payload(&eligible) else {
            return report;
        };

        let active = self.registry.active().await.len();
        let due = self.registry.due(&self.settings.backoff, now).await;
        report.deferred = active.saturating_sub(due.len());

        for sub in due {
            report.attempted += 1;
            let outcome = tokio::time::timeout(
                self.settings.push_timeout,
                self.transport.deliver(&sub, &payload),
            )
            .await
            .unwrap_or(Err(DeliveryError::Timeout(self.settings.push_timeout)));

            let updated = match outcome {
                Ok(()) => {
                    report.delivered += 1;
                    self.registry.record_success(&sub.endpoint).await
                }
                Err(DeliveryError::Gone(status)) => {
                    report.failed += 1;
                    info!(endpoint = %sub.endpoint, status, "push endpoint gone");
                    self.registry.deactivate(&sub.endpoint, now).await
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(endpoint = %sub.endpoint, error = %err, "push delivery failed");
                    self.registry
                        .record_failure(&sub.endpoint, self.settings.failure_threshold, now)
                        .await
                }
            };
            if let Some(updated) = updated {
                if !updated.active {
                    report.deactivated += 1;
                }
                if let Some(mirror) = &self.mirror {
                    mirror.save_subscription(&updated).await;
                }
            }
        }
        debug!(?report, "dispatch cycle finished");
        report
    }

    /// Consume match events until every sender is dropped. Notices are
    /// buffered and flushed on each `PassFinished`.
    pub fn spawn(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MatchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut pending = Vec::new();
            while let Some(event) = events.recv().await {
                match event {
                    MatchEvent::Created(notice) | MatchEvent::Rescored(notice) => {
                        pending.push(notice)
                    }
                    MatchEvent::PassFinished { source } => {
                        let batch = std::mem::take(&mut pending);
                        let report = self.notify(&batch).await;
                        if report.attempted > 0 {
                            info!(
                                source = source.as_deref().unwrap_or("criteria"),
                                eligible = report.eligible,
                                delivered = report.delivered,
                                failed = report.failed,
                                "dispatched match notifications"
                            );
                        }
                    }
                }
            }
            if !pending.is_empty() {
                self.notify(&pending).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, PushPayload)>>,
        failing: Vec<String>,
        gone: Vec<String>,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn deliver(
            &self,
            subscription: &NotificationSubscription,
            payload: &PushPayload,
        ) -> Result<(), DeliveryError> {
            if self.gone.contains(&subscription.endpoint) {
                return Err(DeliveryError::Gone(410));
            }
            if self.failing.contains(&subscription.endpoint) {
                return Err(DeliveryError::Rejected(500));
            }
            self.sent
                .lock()
                .unwrap()
                .push((subscription.endpoint.clone(), payload.clone()));
            Ok(())
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl PushTransport for StalledTransport {
        async fn deliver(
            &self,
            _subscription: &NotificationSubscription,
            _payload: &PushPayload,
        ) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn notice(score: u8, status: MatchStatus) -> MatchNotice {
        let now = Utc::now();
        MatchNotice {
            record: Match {
                id: Uuid::new_v4(),
                criteria_id: Uuid::new_v4(),
                canonical_id: Uuid::new_v4(),
                match_score: score,
                status,
                created_at: now,
                status_changed_at: now,
                scored_at: now,
            },
            title: "Backend Engineer".into(),
            company: "Acme".into(),
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            backoff: BackoffPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn eligible_matches_are_batched_into_one_push_per_subscription() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("a", json!({})).await.unwrap();
        registry.subscribe("b", json!({})).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(registry, transport.clone(), settings());

        let report = dispatcher
            .notify(&[
                notice(95, MatchStatus::New),
                notice(99, MatchStatus::New),
                notice(90, MatchStatus::New),
                notice(97, MatchStatus::Saved),
            ])
            .await;

        assert_eq!(report.eligible, 2);
        assert_eq!(report.delivered, 2);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.title, "2 new job matches");
        assert!(sent[0].1.body.contains("(99)"));
        assert_eq!(sent[0].1.url, "/");
    }

    #[tokio::test]
    async fn nothing_is_sent_without_eligible_matches() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("a", json!({})).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(registry, transport.clone(), settings());
        let report = dispatcher.notify(&[notice(60, MatchStatus::New)]).await;
        assert_eq!(report, DispatchReport::default());
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn five_consecutive_failures_deactivate_and_later_cycles_skip() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("flaky", json!({})).await.unwrap();
        registry.subscribe("ok", json!({})).await.unwrap();
        let transport = Arc::new(RecordingTransport {
            failing: vec!["flaky".into()],
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(registry.clone(), transport.clone(), settings());

        for cycle in 1..=5 {
            let report = dispatcher.notify(&[notice(95, MatchStatus::New)]).await;
            assert_eq!(report.attempted, 2, "cycle {cycle}");
        }
        let flaky = registry.get("flaky").await.unwrap();
        assert!(!flaky.active);
        assert_eq!(flaky.failure_count, 5);

        let report = dispatcher.notify(&[notice(95, MatchStatus::New)]).await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn gone_endpoints_are_deactivated_immediately() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("expired", json!({})).await.unwrap();
        let transport = Arc::new(RecordingTransport {
            gone: vec!["expired".into()],
            ..Default::default()
        });
        let dispatcher = Dispatcher::new(registry.clone(), transport, settings());
        let report = dispatcher.notify(&[notice(95, MatchStatus::New)]).await;
        assert_eq!(report.deactivated, 1);
        assert!(registry.active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_delivery_counts_as_failure() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("slow", json!({})).await.unwrap();
        let dispatcher = Dispatcher::new(registry.clone(), Arc::new(StalledTransport), settings());
        let report = dispatcher.notify(&[notice(95, MatchStatus::New)]).await;
        assert_eq!(report.failed, 1);
        assert_eq!(registry.get("slow").await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn matches_acted_on_before_the_flush_are_not_pushed() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("a", json!({})).await.unwrap();
        let matches = Arc::new(MatchStore::new(40));
        let criteria_id = Uuid::new_v4();
        let mut queued = Vec::new();
        for score in [97, 95] {
            let upserted = matches
                .upsert(criteria_id, Uuid::new_v4(), score, false)
                .await;
            queued.push(MatchNotice {
                record: upserted.record().cloned().unwrap(),
                title: "Backend Engineer".into(),
                company: "Acme".into(),
            });
        }
        matches
            .transition(queued[0].record.id, MatchStatus::Saved)
            .await
            .unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(registry, transport.clone(), settings())
            .with_matches(Arc::clone(&matches));
        let report = dispatcher.notify(&queued).await;

        assert_eq!(report.eligible, 1);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].1.title, "New job match");
        assert!(sent[0].1.body.contains("(95)"));
    }

    #[tokio::test]
    async fn spawned_dispatcher_flushes_on_pass_finished() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.subscribe("a", json!({})).await.unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Arc::new(Dispatcher::new(registry, transport.clone(), settings()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = dispatcher.spawn(rx);

        tx.send(MatchEvent::Created(notice(96, MatchStatus::New))).unwrap();
        tx.send(MatchEvent::Created(notice(93, MatchStatus::New))).unwrap();
        tx.send(MatchEvent::PassFinished {
            source: Some("remoteok".into()),
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.title, "2 new job matches");
    }
}
