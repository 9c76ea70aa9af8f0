use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use scheduler_domain::{Job, JobRepository};
use scheduler_errors::{SchedulerError, SchedulerResult};

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<i64, Job>,
    next_id: i64,
}

impl JobTable {
    fn active_for_task(&self, task_id: i64, except: Option<i64>) -> Option<&Job> {
        self.jobs
            .values()
            .find(|j| j.task_id == task_id && j.is_active() && Some(j.id) != except)
    }
}

/// 内存作业仓储
///
/// 同一任务最多一个 Ready/Running 作业，在创建和更新时检查。
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobRepository {
    table: Arc<Mutex<JobTable>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.table.lock().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: &Job) -> SchedulerResult<Job> {
        let mut table = self.table.lock().await;
        if job.is_active() && table.active_for_task(job.task_id, None).is_some() {
            return Err(SchedulerError::DuplicateActiveJob {
                task_id: job.task_id,
            });
        }

        table.next_id += 1;
        let mut created = job.clone();
        created.id = table.next_id;
        table.jobs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.table.lock().await.jobs.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> SchedulerResult<()> {
        let mut table = self.table.lock().await;
        if !table.jobs.contains_key(&job.id) {
            return Err(SchedulerError::job_not_found(job.id));
        }
        if job.is_active() && table.active_for_task(job.task_id, Some(job.id)).is_some() {
            return Err(SchedulerError::DuplicateActiveJob {
                task_id: job.task_id,
            });
        }
        table.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_active(&self) -> SchedulerResult<Vec<Job>> {
        let table = self.table.lock().await;
        let mut jobs: Vec<Job> = table.jobs.values().filter(|j| j.is_active()).cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn find_by_task(&self, task_id: i64) -> SchedulerResult<Vec<Job>> {
        let table = self.table.lock().await;
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|j| j.task_id == task_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn find_active_for_task(&self, task_id: i64) -> SchedulerResult<Option<Job>> {
        Ok(self.table.lock().await.active_for_task(task_id, None).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scheduler_domain::JobState;
    use std::path::PathBuf;

    fn job(task_id: i64) -> Job {
        Job {
            id: 0,
            task_id,
            entity_id: 1,
            account_id: 1,
            allocation_id: 1,
            state: JobState::Ready,
            queue_id: None,
            path: PathBuf::from("/data/1/static"),
            run_path: "/scratch/1_static".to_string(),
            description: "1_static".to_string(),
            nodes: 1,
            ncpus: 8,
            walltime_seconds: 3600,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_single_active_job_per_task() {
        let repo = InMemoryJobRepository::new();
        let mut first = repo.create(&job(1)).await.unwrap();

        let err = repo.create(&job(1)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateActiveJob { task_id: 1 }));

        // 其他任务不受影响
        repo.create(&job(2)).await.unwrap();

        first.transition_to(JobState::Running).unwrap();
        first.transition_to(JobState::Completed).unwrap();
        repo.update(&first).await.unwrap();

        let second = repo.create(&job(1)).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(repo.find_by_task(1).await.unwrap().len(), 2);
        assert_eq!(
            repo.find_active_for_task(1).await.unwrap().map(|j| j.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_one() {
        let repo = InMemoryJobRepository::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.create(&job(5)).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(repo.find_active().await.unwrap().len(), 1);
    }
}
