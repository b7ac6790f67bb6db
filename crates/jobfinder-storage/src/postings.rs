//! Posting deduplicator: folds raw postings into canonical records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobfinder_core::{canonical_id, canonical_key, CoreError, Posting, RawPosting};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{sha256_hex, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created(Posting),
    Updated(Posting),
    Unchanged(Uuid),
}

impl IngestOutcome {
    pub fn canonical_id(&self) -> Uuid {
        match self {
            Self::Created(p) | Self::Updated(p) => p.canonical_id,
            Self::Unchanged(id) => *id,
        }
    }

    /// The posting when this ingest changed something worth re-scoring.
    pub fn changed_posting(&self) -> Option<&Posting> {
        match self {
            Self::Created(p) | Self::Updated(p) => Some(p),
            Self::Unchanged(_) => None,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Stable content hash of a raw posting as delivered by its source.
pub fn raw_hash(raw: &RawPosting) -> Result<String, StoreError> {
    Ok(sha256_hex(&serde_json::to_vec(raw)?))
}

#[derive(Debug, Default)]
struct PostingState {
    postings: HashMap<Uuid, Posting>,
    // (source, external_id) -> raw hash last ingested for that record
    seen: HashMap<(String, String), String>,
}

#[derive(Debug, Default)]
pub struct PostingStore {
    inner: Mutex<PostingState>,
}

impl PostingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canonicalize(&self, raw: &RawPosting) -> Uuid {
        jobfinder_core::canonicalize(raw)
    }

    pub async fn ingest(&self, raw: &RawPosting) -> Result<IngestOutcome, StoreError> {
        self.ingest_at(raw, Utc::now()).await
    }

    pub async fn ingest_at(
        &self,
        raw: &RawPosting,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        validate_raw(raw)?;
        let hash = raw_hash(raw)?;
        let id = canonical_id(&canonical_key(&raw.company, &raw.title, &raw.url));
        let seen_key = (raw.source.clone(), raw.external_id.clone());

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        if state.seen.get(&seen_key) == Some(&hash) && state.postings.contains_key(&id) {
            return Ok(IngestOutcome::Unchanged(id));
        }
        state.seen.insert(seen_key, hash.clone());

        match state.postings.get_mut(&id) {
            Some(existing) if existing.raw_hash == hash => Ok(IngestOutcome::Unchanged(id)),
            Some(existing) => {
                if existing.merge_from(raw, hash, now) {
                    debug!(canonical_id = %id, source = %raw.source, "merged fresher posting data");
                    Ok(IngestOutcome::Updated(existing.clone()))
                } else {
                    Ok(IngestOutcome::Unchanged(id))
                }
            }
            None => {
                let posting = Posting::from_raw(raw, hash, now);
                state.postings.insert(id, posting.clone());
                Ok(IngestOutcome::Created(posting))
            }
        }
    }

    pub async fn get(&self, canonical_id: Uuid) -> Option<Posting> {
        self.inner.lock().await.postings.get(&canonical_id).cloned()
    }

    pub async fn all(&self) -> Vec<Posting> {
        let mut all = self
            .inner
            .lock()
            .await
            .postings
            .values()
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by_key(|p| p.canonical_id);
        all
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.postings.len()
    }

    pub async fn restore(&self, posting: Posting) {
        let mut state = self.inner.lock().await;
        state.seen.insert(
            (posting.source.clone(), posting.external_id.clone()),
            posting.raw_hash.clone(),
        );
        state.postings.insert(posting.canonical_id, posting);
    }
}

fn validate_raw(raw: &RawPosting) -> Result<(), CoreError> {
    for (field, value) in [
        ("source", &raw.source),
        ("title", &raw.title),
        ("company", &raw.company),
        ("url", &raw.url),
    ] {
        if value.trim().is_empty() {
            return Err(CoreError::Validation(format!("raw posting is missing {field}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(source: &str, external_id: &str) -> RawPosting {
        RawPosting {
            source: source.into(),
            external_id: external_id.into(),
            title: "Backend Engineer".into(),
            company: "Acme".into(),
            url: "https://jobs.acme.example/backend?ref=feed".into(),
            location: Some("Remote".into()),
            is_remote: true,
            salary_min: None,
            salary_max: None,
            description: None,
            tech_tags: vec![],
            posted_at: None,
        }
    }

    #[tokio::test]
    async fn reingesting_identical_raw_posting_is_a_noop() {
        let store = PostingStore::new();
        let first = store.ingest(&raw("remoteok", "1")).await.unwrap();
        assert!(first.is_created());
        let before = store.get(first.canonical_id()).await.unwrap();

        let again = store.ingest(&raw("remoteok", "1")).await.unwrap();
        assert_eq!(again, IngestOutcome::Unchanged(first.canonical_id()));
        assert_eq!(store.get(first.canonical_id()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn cross_source_duplicates_merge_into_one_posting() {
        let store = PostingStore::new();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 2, 3, 0, 0, 0).single().unwrap();

        let mut a = raw("remoteok", "ro-9");
        a.posted_at = Some(t1);
        let mut b = raw("weworkremotely", "wwr-4");
        b.url = "http://www.jobs.acme.example/backend/".into();
        b.posted_at = Some(t0);
        b.salary_min = Some(140_000);

        let first = store.ingest(&a).await.unwrap();
        let second = store.ingest(&b).await.unwrap();
        assert_eq!(first.canonical_id(), second.canonical_id());
        assert_eq!(store.canonicalize(&a), store.canonicalize(&b));
        assert_eq!(store.len().await, 1);

        let IngestOutcome::Updated(merged) = second else {
            panic!("expected merge update, got {second:?}");
        };
        assert_eq!(merged.posted_at, Some(t0));
        assert_eq!(merged.salary_min, Some(140_000));
        assert_eq!(merged.sources.len(), 2);
    }

    #[tokio::test]
    async fn changed_raw_content_updates_posting() {
        let store = PostingStore::new();
        store.ingest(&raw("remoteok", "1")).await.unwrap();
        let mut changed = raw("remoteok", "1");
        changed.salary_max = Some(180_000);
        let outcome = store.ingest(&changed).await.unwrap();
        assert_eq!(
            outcome.changed_posting().and_then(|p| p.salary_max),
            Some(180_000)
        );
    }

    #[tokio::test]
    async fn same_source_can_move_a_posting_on_site() {
        let store = PostingStore::new();
        let created = store.ingest(&raw("remoteok", "1")).await.unwrap();
        let mut on_site = raw("remoteok", "1");
        on_site.is_remote = false;
        on_site.location = Some("Berlin".into());

        let outcome = store.ingest(&on_site).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Updated(ref p) if !p.is_remote));
        assert!(!store.get(created.canonical_id()).await.unwrap().is_remote);
    }

    #[tokio::test]
    async fn a_new_source_for_a_known_posting_is_an_update() {
        let store = PostingStore::new();
        store.ingest(&raw("remoteok", "ro-9")).await.unwrap();
        let outcome = store.ingest(&raw("weworkremotely", "wwr-4")).await.unwrap();
        let IngestOutcome::Updated(merged) = outcome else {
            panic!("expected update, got {outcome:?}");
        };
        assert!(merged.sources.contains("weworkremotely"));
    }

    #[tokio::test]
    async fn raw_posting_without_title_is_rejected() {
        let store = PostingStore::new();
        let mut bad = raw("remoteok", "1");
        bad.title = "  ".into();
        assert!(matches!(
            store.ingest(&bad).await,
            Err(StoreError::Core(CoreError::Validation(_)))
        ));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn restored_postings_stay_idempotent() {
        let store = PostingStore::new();
        let created = store.ingest(&raw("remoteok", "1")).await.unwrap();
        let posting = created.changed_posting().unwrap().clone();

        let fresh = PostingStore::new();
        fresh.restore(posting).await;
        assert!(matches!(
            fresh.ingest(&raw("remoteok", "1")).await.unwrap(),
            IngestOutcome::Unchanged(_)
        ));
    }
}
