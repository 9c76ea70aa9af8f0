//! Test environment setup
//!
//! `TestEnv` wires the in-memory repositories, the in-memory template store
//! and the mock ports together and seeds a small default cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use scheduler_infrastructure::{
    InMemoryEntityRepository, InMemoryJobRepository, InMemoryRegistry, InMemoryTaskRepository,
    InMemoryTemplateStore,
};

use crate::builders::{AccountBuilder, AllocationBuilder, EntityBuilder, HostBuilder, ProjectBuilder};
use crate::mocks::{MockCalculator, MockRemoteExecutor};

/// Submission template using every supported placeholder
pub const QUEST_TEMPLATE: &str = "#!/bin/bash
#PBS -A {key}
#PBS -N {name}
#PBS -l nodes={nodes}:ppn={ppn}
#PBS -l walltime={walltime}
#PBS -j oe

cd $PBS_O_WORKDIR
NPROCS=`wc -l < $PBS_NODEFILE`
export OMP_NUM_THREADS={threads}
# {host} cpu_per_core={cpu_per_core} cpu_per_task={cpu_per_task}
{header}
{mpi} {binary} {pipes}
{footer}
";

pub const DEFAULT_HOST_ID: i64 = 1;
pub const DEFAULT_ACCOUNT_ID: i64 = 1;
pub const DEFAULT_ALLOCATION_ID: i64 = 1;
pub const DEFAULT_PROJECT_ID: i64 = 1;
pub const DEFAULT_ENTITY_ID: i64 = 42;
pub const DEFAULT_USER_ID: i64 = 1;

pub struct TestEnv {
    pub tasks: Arc<InMemoryTaskRepository>,
    pub jobs: Arc<InMemoryJobRepository>,
    pub entities: Arc<InMemoryEntityRepository>,
    pub registry: Arc<InMemoryRegistry>,
    pub templates: Arc<InMemoryTemplateStore>,
    pub remote: Arc<MockRemoteExecutor>,
    pub calculator: Arc<MockCalculator>,
    /// Entity roots live here so job scripts can actually be written
    pub workdir: TempDir,
}

impl TestEnv {
    /// Environment without any resources
    pub fn empty() -> Self {
        Self {
            tasks: Arc::new(InMemoryTaskRepository::new()),
            jobs: Arc::new(InMemoryJobRepository::new()),
            entities: Arc::new(InMemoryEntityRepository::new()),
            registry: Arc::new(InMemoryRegistry::new()),
            templates: Arc::new(InMemoryTemplateStore::new()),
            remote: Arc::new(MockRemoteExecutor::new()),
            calculator: Arc::new(MockCalculator::needs_job("static")),
            workdir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    /// Host `quest`, account `oqmd`, allocation `b1004`, project `chem`
    /// and entity 42 with the `quest` template
    pub async fn new() -> Self {
        let env = Self::empty();

        env.registry
            .add_host(HostBuilder::new(DEFAULT_HOST_ID, "quest").build())
            .await;
        env.registry
            .add_account(AccountBuilder::new(DEFAULT_ACCOUNT_ID, DEFAULT_USER_ID, DEFAULT_HOST_ID).build())
            .await;
        env.registry
            .add_allocation(AllocationBuilder::new(DEFAULT_ALLOCATION_ID, "b1004", DEFAULT_HOST_ID).build())
            .await;
        env.registry
            .add_project(
                ProjectBuilder::new(DEFAULT_PROJECT_ID, "chem")
                    .with_users([DEFAULT_USER_ID])
                    .with_allocations([DEFAULT_ALLOCATION_ID])
                    .build(),
            )
            .await;
        env.entities
            .insert(
                EntityBuilder::new(DEFAULT_ENTITY_ID)
                    .with_root_path(env.entity_root(DEFAULT_ENTITY_ID))
                    .with_projects([DEFAULT_PROJECT_ID])
                    .build(),
            )
            .await;
        env.templates.insert("quest", QUEST_TEMPLATE).await;
        env
    }

    pub fn entity_root(&self, entity_id: i64) -> PathBuf {
        self.workdir.path().join("entries").join(entity_id.to_string())
    }

    /// Wait for a condition to become true, polling every 10ms
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::{EntityRepository, ResourceRegistry};

    #[tokio::test]
    async fn test_default_environment() {
        let env = TestEnv::new().await;

        let host = env.registry.get_host(DEFAULT_HOST_ID).await.unwrap().unwrap();
        assert_eq!(host.name, "quest");

        let entity = env
            .entities
            .get_by_id(DEFAULT_ENTITY_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(entity.root_path.starts_with(env.workdir.path()));
    }

    #[tokio::test]
    async fn test_wait_for() {
        let mut polls = 0;
        let done = TestEnv::wait_for(
            || {
                polls += 1;
                let ready = polls >= 3;
                async move { ready }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(done);
    }
}
