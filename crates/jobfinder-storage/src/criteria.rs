use std::collections::HashMap;

use jobfinder_core::{Criteria, CriteriaInput};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::StoreError;

/// Named search criteria. Updates always replace the whole record.
#[derive(Debug, Default)]
pub struct CriteriaStore {
    inner: RwLock<HashMap<Uuid, Criteria>>,
}

impl CriteriaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, input: CriteriaInput) -> Result<Criteria, StoreError> {
        let criteria = Criteria::from_input(Uuid::new_v4(), input)?;
        self.inner
            .write()
            .await
            .insert(criteria.id, criteria.clone());
        Ok(criteria)
    }

    pub async fn replace(&self, id: Uuid, input: CriteriaInput) -> Result<Criteria, StoreError> {
        let criteria = Criteria::from_input(id, input)?;
        let mut map = self.inner.write().await;
        let slot = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("criteria", id))?;
        *slot = criteria.clone();
        Ok(criteria)
    }

    pub async fn delete(&self, id: Uuid) -> Result<Criteria, StoreError> {
        self.inner
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("criteria", id))
    }

    pub async fn get(&self, id: Uuid) -> Option<Criteria> {
        self.inner.read().await.get(&id).cloned()
    }

    /// All criteria ordered by name, then id.
    pub async fn list(&self) -> Vec<Criteria> {
        let mut all = self.inner.read().await.values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        all
    }

    pub async fn active(&self) -> Vec<Criteria> {
        let mut active = self.list().await;
        active.retain(|c| c.is_active);
        active
    }

    pub async fn restore(&self, criteria: Criteria) {
        self.inner.write().await.insert(criteria.id, criteria);
    }
}
