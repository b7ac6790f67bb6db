//! Push subscription registry, handed to whichever component enumerates subscribers.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobfinder_core::{CoreError, NotificationSubscription};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::StoreError;

/// Exponential spacing between delivery attempts after failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Wait imposed after the `failure_count`-th consecutive failure.
    pub fn delay_after_failures(&self, failure_count: u32) -> Duration {
        if failure_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32
            .checked_shl(failure_count - 1)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn is_due(&self, sub: &NotificationSubscription, now: DateTime<Utc>) -> bool {
        match sub.last_failure_at {
            None => true,
            Some(last) => {
                let wait = chrono::Duration::from_std(self.delay_after_failures(sub.failure_count))
                    .unwrap_or(chrono::Duration::MAX);
                last.checked_add_signed(wait).map_or(false, |ready| now >= ready)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<HashMap<String, NotificationSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Re-subscribing replaces the payload and
    /// reactivates a deactivated subscription.
    pub async fn subscribe(
        &self,
        endpoint: &str,
        subscription_payload: serde_json::Value,
    ) -> Result<NotificationSubscription, StoreError> {
        self.subscribe_at(endpoint, subscription_payload, Utc::now())
            .await
    }

    pub async fn subscribe_at(
        &self,
        endpoint: &str,
        subscription_payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<NotificationSubscription, StoreError> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(CoreError::Validation("endpoint must not be empty".into()).into());
        }
        let mut map = self.inner.write().await;
        let sub = map
            .entry(endpoint.to_string())
            .and_modify(|existing| {
                existing.subscription_payload = subscription_payload.clone();
                existing.active = true;
                existing.failure_count = 0;
                existing.last_failure_at = None;
                existing.deactivated_at = None;
            })
            .or_insert_with(|| NotificationSubscription {
                id: Uuid::new_v4(),
                endpoint: endpoint.to_string(),
                subscription_payload,
                created_at: now,
                last_failure_at: None,
                failure_count: 0,
                active: true,
                deactivated_at: None,
            });
        Ok(sub.clone())
    }

    pub async fn unsubscribe(&self, endpoint: &str) -> Option<NotificationSubscription> {
        self.inner.write().await.remove(endpoint.trim())
    }

    pub async fn get(&self, endpoint: &str) -> Option<NotificationSubscription> {
        self.inner.read().await.get(endpoint).cloned()
    }

    pub async fn list(&self) -> Vec<NotificationSubscription> {
        let mut all = self.inner.read().await.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub async fn active(&self) -> Vec<NotificationSubscription> {
        let mut active = self.list().await;
        active.retain(|s| s.active);
        active
    }

    /// Active subscriptions whose backoff window has elapsed.
    pub async fn due(
        &self,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Vec<NotificationSubscription> {
        let mut due = self.active().await;
        due.retain(|s| policy.is_due(s, now));
        due
    }

    pub async fn record_success(&self, endpoint: &str) -> Option<NotificationSubscription> {
        let mut map = self.inner.write().await;
        let sub = map.get_mut(endpoint)?;
        sub.failure_count = 0;
        sub.last_failure_at = None;
        Some(sub.clone())
    }

    /// Count one consecutive failure; deactivate once `threshold` is reached.
    pub async fn record_failure(
        &self,
        endpoint: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Option<NotificationSubscription> {
        let mut map = self.inner.write().await;
        let sub = map.get_mut(endpoint)?;
        sub.failure_count = sub.failure_count.saturating_add(1);
        sub.last_failure_at = Some(now);
        if sub.active && sub.failure_count >= threshold.max(1) {
            sub.active = false;
            sub.deactivated_at = Some(now);
            warn!(endpoint, failures = sub.failure_count, "push subscription deactivated");
        }
        Some(sub.clone())
    }

    pub async fn deactivate(
        &self,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Option<NotificationSubscription> {
        let mut map = self.inner.write().await;
        let sub = map.get_mut(endpoint)?;
        if sub.active {
            sub.active = false;
            sub.deactivated_at = Some(now);
            info!(endpoint, "push subscription deactivated by transport");
        }
        Some(sub.clone())
    }

    pub async fn restore(&self, sub: NotificationSubscription) {
        self.inner.write().await.insert(sub.endpoint.clone(), sub);
    }
}
