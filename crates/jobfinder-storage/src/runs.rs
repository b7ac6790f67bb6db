use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobfinder_core::ScrapeRun;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::StoreError;

const INTERRUPTED_RUN_ERROR: &str = "interrupted: process stopped before the run finished";

#[derive(Debug, Default)]
struct RunState {
    runs: HashMap<Uuid, ScrapeRun>,
    open: HashMap<String, Uuid>,
}

/// Append-only scrape run log with at most one open run per source.
#[derive(Debug, Default)]
pub struct ScrapeRunTracker {
    inner: Mutex<RunState>,
}

impl ScrapeRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin_run(&self, source: &str) -> Result<Uuid, StoreError> {
        self.begin_run_at(source, Utc::now()).await
    }

    pub async fn begin_run_at(
        &self,
        source: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.inner.lock().await;
        if let Some(run_id) = state.open.get(source) {
            return Err(StoreError::RunAlreadyInProgress {
                source_id: source.to_string(),
                run_id: *run_id,
            });
        }
        let run = ScrapeRun {
            id: Uuid::new_v4(),
            source: source.to_string(),
            started_at,
            finished_at: None,
            jobs_found: 0,
            jobs_new: 0,
            error: None,
        };
        let run_id = run.id;
        state.open.insert(source.to_string(), run_id);
        state.runs.insert(run_id, run);
        Ok(run_id)
    }

    pub async fn end_run(
        &self,
        run_id: Uuid,
        jobs_found: u32,
        jobs_new: u32,
        error: Option<String>,
    ) -> Result<ScrapeRun, StoreError> {
        self.end_run_at(run_id, jobs_found, jobs_new, error, Utc::now())
            .await
    }

    pub async fn end_run_at(
        &self,
        run_id: Uuid,
        jobs_found: u32,
        jobs_new: u32,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<ScrapeRun, StoreError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::not_found("scrape run", run_id))?;
        if !run.is_open() {
            return Err(StoreError::RunAlreadyFinished(run_id));
        }
        run.finished_at = Some(finished_at);
        run.jobs_found = jobs_found;
        run.jobs_new = jobs_new;
        run.error = error;
        state.open.remove(&run.source);
        Ok(run.clone())
    }

    pub async fn get(&self, run_id: Uuid) -> Option<ScrapeRun> {
        self.inner.lock().await.runs.get(&run_id).cloned()
    }

    pub async fn open_run(&self, source: &str) -> Option<Uuid> {
        self.inner.lock().await.open.get(source).copied()
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Vec<ScrapeRun> {
        let mut runs = self
            .inner
            .lock()
            .await
            .runs
            .values()
            .cloned()
            .collect::<Vec<_>>();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        runs
    }

    /// Load a persisted run. A run left open by a previous process can never
    /// finish, so it is closed with an error; the returned record reflects that.
    pub async fn restore(&self, mut run: ScrapeRun, now: DateTime<Utc>) -> ScrapeRun {
        if run.is_open() {
            warn!(run_id = %run.id, source = %run.source, "closing scrape run interrupted by restart");
            run.finished_at = Some(now);
            run.error = Some(INTERRUPTED_RUN_ERROR.to_string());
        }
        self.inner.lock().await.runs.insert(run.id, run.clone());
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_begin_for_open_source_fails() {
        let tracker = ScrapeRunTracker::new();
        let first = tracker.begin_run("greenhouse").await.unwrap();
        let err = tracker.begin_run("greenhouse").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::RunAlreadyInProgress { ref source_id, run_id }
                if source_id == "greenhouse" && run_id == first
        ));
    }

    #[tokio::test]
    async fn other_sources_are_not_blocked_and_source_reopens_after_end() {
        let tracker = ScrapeRunTracker::new();
        let run = tracker.begin_run("greenhouse").await.unwrap();
        tracker.begin_run("lever").await.unwrap();

        let finished = tracker
            .end_run(run, 10, 3, Some("timeout".into()))
            .await
            .unwrap();
        assert_eq!(finished.jobs_found, 10);
        assert_eq!(finished.error.as_deref(), Some("timeout"));
        assert!(tracker.open_run("greenhouse").await.is_none());
        assert!(tracker.begin_run("greenhouse").await.is_ok());
    }

    #[tokio::test]
    async fn finished_runs_are_immutable() {
        let tracker = ScrapeRunTracker::new();
        let run = tracker.begin_run("remoteok").await.unwrap();
        tracker.end_run(run, 1, 1, None).await.unwrap();
        assert!(matches!(
            tracker.end_run(run, 9, 9, None).await,
            Err(StoreError::RunAlreadyFinished(id)) if id == run
        ));
        assert_eq!(tracker.get(run).await.unwrap().jobs_found, 1);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let tracker = ScrapeRunTracker::new();
        let t0 = Utc::now();
        let older = tracker.begin_run_at("a", t0).await.unwrap();
        let newer = tracker
            .begin_run_at("b", t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();
        let ids = tracker.list(10).await.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![newer, older]);
        assert_eq!(tracker.list(1).await.len(), 1);
    }

    #[tokio::test]
    async fn restoring_an_open_run_closes_it() {
        let tracker = ScrapeRunTracker::new();
        let now = Utc::now();
        let restored = tracker
            .restore(
                ScrapeRun {
                    id: Uuid::new_v4(),
                    source: "dice".into(),
                    started_at: now,
                    finished_at: None,
                    jobs_found: 0,
                    jobs_new: 0,
                    error: None,
                },
                now,
            )
            .await;
        assert!(!restored.is_open());
        assert!(restored.error.is_some());
        assert!(tracker.begin_run("dice").await.is_ok());
    }
}
