//! Match store: one record per (criteria, posting) with a user-owned status.
//!
//! All mutations run under one lock, so a scoring upsert and a status
//! transition on the same match are applied as separate read-modify-write
//! steps and neither overwrites the other's field.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use jobfinder_core::{Match, MatchStatus};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Match),
    Rescored { previous_score: u8, record: Match },
    Vetoed { existing: Option<Match> },
    BelowThreshold,
}

impl UpsertOutcome {
    pub fn record(&self) -> Option<&Match> {
        match self {
            Self::Created(m) | Self::Rescored { record: m, .. } => Some(m),
            Self::Vetoed { existing } => existing.as_ref(),
            Self::BelowThreshold => None,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatchFilter {
    pub status: Option<MatchStatus>,
    pub min_score: Option<u8>,
    pub criteria_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct MatchState {
    by_id: HashMap<Uuid, Match>,
    by_key: HashMap<(Uuid, Uuid), Uuid>,
}

#[derive(Debug)]
pub struct MatchStore {
    min_create_score: u8,
    inner: Mutex<MatchState>,
}

impl MatchStore {
    /// `min_create_score` gates creation only; existing matches are always re-scored.
    pub fn new(min_create_score: u8) -> Self {
        Self {
            min_create_score,
            inner: Mutex::new(MatchState::default()),
        }
    }

    pub async fn upsert(
        &self,
        criteria_id: Uuid,
        canonical_id: Uuid,
        score: u8,
        veto: bool,
    ) -> UpsertOutcome {
        self.upsert_at(criteria_id, canonical_id, score, veto, Utc::now())
            .await
    }

    pub async fn upsert_at(
        &self,
        criteria_id: Uuid,
        canonical_id: Uuid,
        score: u8,
        veto: bool,
        now: DateTime<Utc>,
    ) -> UpsertOutcome {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let existing_id = state.by_key.get(&(criteria_id, canonical_id)).copied();

        if veto {
            return UpsertOutcome::Vetoed {
                existing: existing_id.and_then(|id| state.by_id.get(&id).cloned()),
            };
        }

        if let Some(record) = existing_id.and_then(|id| state.by_id.get_mut(&id)) {
            let previous_score = record.match_score;
            record.match_score = score;
            record.scored_at = now;
            return UpsertOutcome::Rescored {
                previous_score,
                record: record.clone(),
            };
        }

        if score < self.min_create_score {
            return UpsertOutcome::BelowThreshold;
        }

        let record = Match {
            id: Uuid::new_v4(),
            criteria_id,
            canonical_id,
            match_score: score,
            status: MatchStatus::New,
            created_at: now,
            status_changed_at: now,
            scored_at: now,
        };
        state.by_key.insert((criteria_id, canonical_id), record.id);
        state.by_id.insert(record.id, record.clone());
        debug!(match_id = %record.id, %criteria_id, %canonical_id, score, "match created");
        UpsertOutcome::Created(record)
    }

    pub async fn transition(&self, match_id: Uuid, to: MatchStatus) -> Result<Match, StoreError> {
        self.transition_at(match_id, to, Utc::now()).await
    }

    pub async fn transition_at(
        &self,
        match_id: Uuid,
        to: MatchStatus,
        now: DateTime<Utc>,
    ) -> Result<Match, StoreError> {
        let mut state = self.inner.lock().await;
        let record = state
            .by_id
            .get_mut(&match_id)
            .ok_or_else(|| StoreError::not_found("match", match_id))?;
        record.status = record.status.transition(to)?;
        record.status_changed_at = now;
        Ok(record.clone())
    }

    pub async fn get(&self, match_id: Uuid) -> Option<Match> {
        self.inner.lock().await.by_id.get(&match_id).cloned()
    }

    pub async fn find(&self, criteria_id: Uuid, canonical_id: Uuid) -> Option<Match> {
        let state = self.inner.lock().await;
        state
            .by_key
            .get(&(criteria_id, canonical_id))
            .and_then(|id| state.by_id.get(id))
            .cloned()
    }

    /// Matching records ordered by score (highest first), then age.
    pub async fn list(&self, filter: &MatchFilter) -> Vec<Match> {
        let state = self.inner.lock().await;
        let mut rows = state
            .by_id
            .values()
            .filter(|m| filter.status.map_or(true, |s| m.status == s))
            .filter(|m| filter.min_score.map_or(true, |s| m.match_score >= s))
            .filter(|m| filter.criteria_id.map_or(true, |c| m.criteria_id == c))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.match_score
                .cmp(&a.match_score)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Drops every match of a deleted criteria set; returns the removed ids.
    pub async fn remove_for_criteria(&self, criteria_id: Uuid) -> Vec<Uuid> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let removed = state
            .by_id
            .values()
            .filter(|m| m.criteria_id == criteria_id)
            .map(|m| m.id)
            .collect::<Vec<_>>();
        for id in &removed {
            if let Some(m) = state.by_id.remove(id) {
                state.by_key.remove(&(m.criteria_id, m.canonical_id));
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn restore(&self, record: Match) {
        let mut state = self.inner.lock().await;
        state
            .by_key
            .insert((record.criteria_id, record.canonical_id), record.id);
        state.by_id.insert(record.id, record);
    }
}
