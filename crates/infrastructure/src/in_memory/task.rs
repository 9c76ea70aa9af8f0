use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use scheduler_domain::{Task, TaskKey, TaskRepository, TaskState};
use scheduler_errors::{SchedulerError, SchedulerResult};

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<i64, Task>,
    keys: HashMap<TaskKey, i64>,
    next_id: i64,
}

/// 以 (实体, 模块, 参数) 为唯一键的内存任务仓储
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskRepository {
    table: Arc<Mutex<TaskTable>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.table.lock().await.tasks.len()
    }

    pub async fn all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.table.lock().await.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn upsert(&self, task: &Task) -> SchedulerResult<Task> {
        let mut table = self.table.lock().await;
        let key = task.key();

        if let Some(id) = table.keys.get(&key).copied() {
            let existing = table
                .tasks
                .get_mut(&id)
                .ok_or_else(|| SchedulerError::Internal(format!("任务索引损坏: {id}")))?;
            let added = existing.merge_projects(task.project_ids.iter().copied());
            debug!("任务 {} 已存在，合并 {} 个新项目", id, added);
            return Ok(existing.clone());
        }

        table.next_id += 1;
        let mut created = task.clone();
        created.id = table.next_id;
        table.keys.insert(key, created.id);
        table.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.table.lock().await.tasks.get(&id).cloned())
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        let mut table = self.table.lock().await;
        match table.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(SchedulerError::task_not_found(task.id)),
        }
    }

    async fn update_state(&self, task: &Task, expected: TaskState) -> SchedulerResult<Task> {
        let mut table = self.table.lock().await;
        let stored = table
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| SchedulerError::task_not_found(task.id))?;
        if stored.state != expected {
            return Err(SchedulerError::invalid_transition(
                format!("任务 {}", task.id),
                stored.state,
                task.state,
            ));
        }
        stored.state = task.state;
        stored.finished_at = task.finished_at;
        Ok(stored.clone())
    }

    async fn update_priority(&self, id: i64, priority: i32) -> SchedulerResult<Task> {
        let mut table = self.table.lock().await;
        let stored = table
            .tasks
            .get_mut(&id)
            .ok_or_else(|| SchedulerError::task_not_found(id))?;
        stored.priority = priority.max(0);
        Ok(stored.clone())
    }

    async fn find_ready(&self, limit: usize) -> SchedulerResult<Vec<Task>> {
        let table = self.table.lock().await;
        let mut ready: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Ready)
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn find_by_entity(&self, entity_id: i64) -> SchedulerResult<Vec<Task>> {
        let table = self.table.lock().await;
        let mut tasks: Vec<Task> = table
            .tasks
            .values()
            .filter(|t| t.entity_id == entity_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }
}
