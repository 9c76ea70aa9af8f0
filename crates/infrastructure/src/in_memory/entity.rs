use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use scheduler_domain::{Entity, EntityRepository};
use scheduler_errors::SchedulerResult;

#[derive(Debug, Clone, Default)]
pub struct InMemoryEntityRepository {
    entities: Arc<RwLock<HashMap<i64, Entity>>>,
}

impl InMemoryEntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: Vec<Entity>) -> Self {
        let map = entities.into_iter().map(|e| (e.id, e)).collect();
        Self {
            entities: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn insert(&self, entity: Entity) {
        self.entities.write().await.insert(entity.id, entity);
    }

    /// 设置或清除外部挂起标记
    pub async fn set_holds(&self, entity_id: i64, holds: Vec<String>) -> bool {
        match self.entities.write().await.get_mut(&entity_id) {
            Some(entity) => {
                entity.holds = holds;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Entity>> {
        Ok(self.entities.read().await.get(&id).cloned())
    }
}
