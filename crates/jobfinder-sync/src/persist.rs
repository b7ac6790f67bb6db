//! Postgres write-through mirror. The in-memory stores stay authoritative;
//! every write here is best effort and only logged on failure.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use jobfinder_core::{Criteria, Match, NotificationSubscription, Posting, ScrapeRun};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::Stores;

#[derive(Debug, Clone, Copy)]
enum Table {
    Criteria,
    Postings,
    Matches,
    ScrapeRuns,
    Subscriptions,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Self::Criteria => "criteria",
            Self::Postings => "postings",
            Self::Matches => "matches",
            Self::ScrapeRuns => "scrape_runs",
            Self::Subscriptions => "notification_subscriptions",
        }
    }

    fn upsert_sql(self) -> &'static str {
        match self {
            Self::Criteria => {
                "INSERT INTO criteria (id, body, updated_at) VALUES ($1, $2, NOW())
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()"
            }
            Self::Postings => {
                "INSERT INTO postings (id, body, updated_at) VALUES ($1, $2, NOW())
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()"
            }
            Self::Matches => {
                "INSERT INTO matches (id, body, updated_at) VALUES ($1, $2, NOW())
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()"
            }
            Self::ScrapeRuns => {
                "INSERT INTO scrape_runs (id, body, updated_at) VALUES ($1, $2, NOW())
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()"
            }
            Self::Subscriptions => {
                "INSERT INTO notification_subscriptions (id, body, updated_at) VALUES ($1, $2, NOW())
                 ON CONFLICT (id) DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()"
            }
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            Self::Criteria => "SELECT body FROM criteria",
            Self::Postings => "SELECT body FROM postings",
            Self::Matches => "SELECT body FROM matches",
            Self::ScrapeRuns => "SELECT body FROM scrape_runs",
            Self::Subscriptions => "SELECT body FROM notification_subscriptions",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrateSummary {
    pub criteria: usize,
    pub postings: usize,
    pub matches: usize,
    pub scrape_runs: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Clone)]
pub struct PgMirror {
    pool: PgPool,
}

impl PgMirror {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        Ok(())
    }

    async fn upsert<T: Serialize>(&self, table: Table, id: Uuid, record: &T) {
        let body = match serde_json::to_value(record) {
            Ok(body) => body,
            Err(err) => {
                warn!(table = table.name(), %id, error = %err, "mirror serialization failed");
                return;
            }
        };
        if let Err(err) = sqlx::query(table.upsert_sql())
            .bind(id)
            .bind(body)
            .execute(&self.pool)
            .await
        {
            warn!(table = table.name(), %id, error = %err, "mirror write failed");
        }
    }

    pub async fn save_criteria(&self, criteria: &Criteria) {
        self.upsert(Table::Criteria, criteria.id, criteria).await;
    }

    pub async fn save_posting(&self, posting: &Posting) {
        self.upsert(Table::Postings, posting.canonical_id, posting).await;
    }

    pub async fn save_match(&self, record: &Match) {
        self.upsert(Table::Matches, record.id, record).await;
    }

    pub async fn save_run(&self, run: &ScrapeRun) {
        self.upsert(Table::ScrapeRuns, run.id, run).await;
    }

    pub async fn save_subscription(&self, sub: &NotificationSubscription) {
        self.upsert(Table::Subscriptions, sub.id, sub).await;
    }

    /// Removes the criteria row and every match row that references it.
    pub async fn delete_criteria(&self, id: Uuid) {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM matches WHERE body->>'criteria_id' = $1")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM criteria WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        }
        .await;
        if let Err(err) = result {
            warn!(criteria_id = %id, error = %err, "mirror delete failed");
        }
    }

    pub async fn delete_subscription(&self, endpoint: &str) {
        if let Err(err) =
            sqlx::query("DELETE FROM notification_subscriptions WHERE body->>'endpoint' = $1")
                .bind(endpoint)
                .execute(&self.pool)
                .await
        {
            warn!(endpoint, error = %err, "mirror delete failed");
        }
    }

    async fn load<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let rows = sqlx::query(table.select_sql())
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("loading {}", table.name()))?;
        rows.into_iter()
            .map(|row| -> Result<T> {
                let body: serde_json::Value = row.try_get("body")?;
                serde_json::from_value(body)
                    .with_context(|| format!("decoding {} row", table.name()))
            })
            .collect()
    }

    /// Load every mirrored record into the stores. Runs left open by a
    /// previous process come back closed and are written back.
    pub async fn hydrate(&self, stores: &Stores) -> Result<HydrateSummary> {
        let mut summary = HydrateSummary::default();

        for criteria in self.load::<Criteria>(Table::Criteria).await? {
            stores.criteria.restore(criteria).await;
            summary.criteria += 1;
        }
        for posting in self.load::<Posting>(Table::Postings).await? {
            stores.postings.restore(posting).await;
            summary.postings += 1;
        }
        for record in self.load::<Match>(Table::Matches).await? {
            stores.matches.restore(record).await;
            summary.matches += 1;
        }
        let now = Utc::now();
        for run in self.load::<ScrapeRun>(Table::ScrapeRuns).await? {
            let was_open = run.is_open();
            let restored = stores.runs.restore(run, now).await;
            if was_open {
                self.save_run(&restored).await;
            }
            summary.scrape_runs += 1;
        }
        for sub in self
            .load::<NotificationSubscription>(Table::Subscriptions)
            .await?
        {
            stores.subscriptions.restore(sub).await;
            summary.subscriptions += 1;
        }
        info!(?summary, "hydrated stores from postgres");
        Ok(summary)
    }
}
