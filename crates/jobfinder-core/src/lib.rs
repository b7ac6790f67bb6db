//! Core domain model for JobFinder: criteria, postings, matches and runs.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod canonical;
mod scoring;

pub use canonical::{
    canonical_id, canonical_key, canonicalize, normalize_company, normalize_title,
    url_fingerprint,
};
pub use scoring::{
    score, tokenize, ScoreOutcome, VetoReason, TECH_STACK_WEIGHT, TITLE_WEIGHT, WHITELIST_BONUS,
};

pub const CRATE_NAME: &str = "jobfinder-core";

const MAX_CRITERIA_NAME_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: MatchStatus, to: MatchStatus },
    #[error("unknown match status `{0}`")]
    UnknownStatus(String),
}

/// Request shape for creating or fully replacing a criteria set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriteriaInput {
    pub name: String,
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub min_salary: i64,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub company_blacklist: Vec<String>,
    #[serde(default)]
    pub company_whitelist: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// A validated, named search rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub id: Uuid,
    pub name: String,
    pub titles: BTreeSet<String>,
    pub tech_stack: BTreeSet<String>,
    pub min_salary: i64,
    pub exclude_keywords: BTreeSet<String>,
    pub company_blacklist: BTreeSet<String>,
    pub company_whitelist: BTreeSet<String>,
    pub is_active: bool,
}

impl Criteria {
    /// Validate an input and build the stored representation under `id`.
    pub fn from_input(id: Uuid, input: CriteriaInput) -> Result<Self, CoreError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(CoreError::Validation("name must not be empty".into()));
        }
        if name.chars().count() > MAX_CRITERIA_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "name must be at most {MAX_CRITERIA_NAME_LEN} characters"
            )));
        }
        if input.min_salary < 0 {
            return Err(CoreError::Validation(format!(
                "min_salary must be >= 0, got {}",
                input.min_salary
            )));
        }

        let company_blacklist = clean_set(input.company_blacklist);
        let company_whitelist = clean_set(input.company_whitelist);
        let denied = company_blacklist
            .iter()
            .map(|c| normalize_company(c))
            .collect::<BTreeSet<_>>();
        let overlap = company_whitelist
            .iter()
            .filter(|c| denied.contains(&normalize_company(c)))
            .cloned()
            .collect::<Vec<_>>();
        if !overlap.is_empty() {
            return Err(CoreError::Validation(format!(
                "companies listed in both whitelist and blacklist: {}",
                overlap.join(", ")
            )));
        }

        Ok(Self {
            id,
            name,
            titles: clean_set(input.titles),
            tech_stack: clean_set(input.tech_stack),
            min_salary: input.min_salary,
            exclude_keywords: clean_set(input.exclude_keywords),
            company_blacklist,
            company_whitelist,
            is_active: input.is_active,
        })
    }
}

fn clean_set(values: Vec<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Source-native posting record handed over by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosting {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub url: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub is_remote: bool,
    #[serde(default)]
    pub salary_min: Option<i64>,
    #[serde(default)]
    pub salary_max: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tech_tags: Vec<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

/// Canonical posting merged from one or more sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub canonical_id: Uuid,
    pub canonical_key: String,
    pub source: String,
    pub sources: BTreeSet<String>,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub url: String,
    pub location: Option<String>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub is_remote: bool,
    pub description: Option<String>,
    pub tech_tags: BTreeSet<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub raw_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Posting {
    pub fn from_raw(raw: &RawPosting, raw_hash: String, now: DateTime<Utc>) -> Self {
        let canonical_key = canonical_key(&raw.company, &raw.title, &raw.url);
        Self {
            canonical_id: canonical_id(&canonical_key),
            canonical_key,
            source: raw.source.clone(),
            sources: BTreeSet::from([raw.source.clone()]),
            external_id: raw.external_id.clone(),
            title: raw.title.trim().to_string(),
            company: raw.company.trim().to_string(),
            url: raw.url.trim().to_string(),
            location: non_blank(raw.location.as_deref()),
            salary_min: raw.salary_min,
            salary_max: raw.salary_max,
            is_remote: raw.is_remote,
            description: non_blank(raw.description.as_deref()),
            tech_tags: clean_set(raw.tech_tags.clone()),
            posted_at: raw.posted_at,
            raw_hash,
            first_seen_at: now,
            updated_at: now,
        }
    }

    /// Fold a fresher raw record for the same canonical key into this posting.
    ///
    /// Keeps the earliest `posted_at`, fills absent optional fields and lets
    /// the fresher record override the salary bounds it reports and the
    /// remote flag. Returns `true` when content or the source set changed;
    /// `raw_hash` and `updated_at` only move in that case.
    pub fn merge_from(&mut self, raw: &RawPosting, raw_hash: String, now: DateTime<Utc>) -> bool {
        let before = self.content_fingerprint();

        self.posted_at = match (self.posted_at, raw.posted_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if raw.salary_min.is_some() {
            self.salary_min = raw.salary_min;
        }
        if raw.salary_max.is_some() {
            self.salary_max = raw.salary_max;
        }
        self.is_remote = raw.is_remote;
        if self.location.is_none() {
            self.location = non_blank(raw.location.as_deref());
        }
        if self.description.is_none() {
            self.description = non_blank(raw.description.as_deref());
        }
        self.tech_tags.extend(clean_set(raw.tech_tags.clone()));
        let new_source = self.sources.insert(raw.source.clone());

        let changed = new_source || before != self.content_fingerprint();
        if changed {
            self.raw_hash = raw_hash;
            self.updated_at = now;
        }
        changed
    }

    fn content_fingerprint(
        &self,
    ) -> (
        Option<DateTime<Utc>>,
        Option<i64>,
        Option<i64>,
        bool,
        Option<String>,
        Option<String>,
        BTreeSet<String>,
    ) {
        (
            self.posted_at,
            self.salary_min,
            self.salary_max,
            self.is_remote,
            self.location.clone(),
            self.description.clone(),
            self.tech_tags.clone(),
        )
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    New,
    Saved,
    Applied,
    Rejected,
    Reviewed,
}

impl MatchStatus {
    pub const ALL: [MatchStatus; 5] = [
        MatchStatus::New,
        MatchStatus::Saved,
        MatchStatus::Applied,
        MatchStatus::Rejected,
        MatchStatus::Reviewed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Saved => "saved",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
            Self::Reviewed => "reviewed",
        }
    }

    /// User-driven edges of the lifecycle graph. `new` is only ever entered
    /// through match creation.
    pub fn can_transition_to(self, to: MatchStatus) -> bool {
        use MatchStatus::*;
        matches!(
            (self, to),
            (New, Saved)
                | (New, Applied)
                | (New, Rejected)
                | (New, Reviewed)
                | (Saved, Applied)
                | (Saved, Rejected)
                | (Applied, Rejected)
        )
    }

    pub fn transition(self, to: MatchStatus) -> Result<MatchStatus, CoreError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(CoreError::InvalidTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Reviewed)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "saved" => Ok(Self::Saved),
            "applied" => Ok(Self::Applied),
            "rejected" => Ok(Self::Rejected),
            "reviewed" => Ok(Self::Reviewed),
            _ => Err(CoreError::UnknownStatus(s.to_string())),
        }
    }
}

/// Scored, status-tracked association of one criteria set and one posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub criteria_id: Uuid,
    pub canonical_id: Uuid,
    pub match_score: u8,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs_found: u32,
    pub jobs_new: u32,
    pub error: Option<String>,
}

impl ScrapeRun {
    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSubscription {
    pub id: Uuid,
    pub endpoint: String,
    pub subscription_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Body handed to the push transport; the client opens `url` on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub url: String,
}
