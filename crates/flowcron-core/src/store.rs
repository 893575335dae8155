//! In-memory repository — no persistence, used for tests and dry runs.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{FlowError, Result};
use crate::traits::repository::{Entity, Repository};

pub struct MemoryRepository<T: Entity> {
    items: RwLock<Vec<T>>,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self { items: RwLock::new(Vec::new()) }
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.items.read().await.iter().find(|e| e.id() == id).cloned())
    }

    async fn list(&self, filter: &T::Filter) -> Result<Vec<T>> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|e| e.matches(filter))
            .cloned()
            .collect())
    }

    async fn save(&self, entity: &T) -> Result<()> {
        let mut items = self.items.write().await;
        if items.iter().any(|e| e.id() == entity.id()) {
            return Err(FlowError::Duplicate(format!("{} {}", T::KIND, entity.id())));
        }
        if let Some(key) = entity.dedup_key()
            && items.iter().any(|e| e.dedup_key().as_deref() == Some(key.as_str()))
        {
            return Err(FlowError::Duplicate(format!("{} {key}", T::KIND)));
        }
        items.push(entity.clone());
        Ok(())
    }

    async fn update(&self, entity: &T) -> Result<()> {
        let mut items = self.items.write().await;
        match items.iter_mut().find(|e| e.id() == entity.id()) {
            Some(slot) => {
                *slot = entity.clone();
                Ok(())
            }
            None => Err(FlowError::Database(format!(
                "{} {} not found",
                T::KIND,
                entity.id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionFilter, ExecutionRecord, ExecutionStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_get_update_list() {
        let repo = MemoryRepository::<ExecutionRecord>::new();
        let mut rec = ExecutionRecord::start("e1", "wf-a", json!({}));
        repo.save(&rec).await.unwrap();
        repo.save(&ExecutionRecord::start("e2", "wf-b", json!({}))).await.unwrap();

        rec.finish(ExecutionStatus::Completed, None, None).unwrap();
        repo.update(&rec).await.unwrap();

        let got = repo.get("e1").await.unwrap().unwrap();
        assert_eq!(got.status, ExecutionStatus::Completed);

        let filter = ExecutionFilter { workflow_id: Some("wf-b".into()), ..Default::default() };
        let listed = repo.list(&filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "e2");
    }

    #[tokio::test]
    async fn test_duplicate_id_and_missing_update() {
        let repo = MemoryRepository::<ExecutionRecord>::new();
        let rec = ExecutionRecord::start("e1", "wf", json!({}));
        repo.save(&rec).await.unwrap();
        assert!(matches!(repo.save(&rec).await, Err(FlowError::Duplicate(_))));

        let ghost = ExecutionRecord::start("ghost", "wf", json!({}));
        assert!(repo.update(&ghost).await.is_err());
        assert_eq!(repo.len().await, 1);
    }
}
