//! Test data builders with sensible defaults
//!
//! The defaults describe a single-host cluster: host `quest` (8 cores per
//! node), account `oqmd`, allocation `b1004` and project `chem`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;

use scheduler_domain::{
    Account, Allocation, Entity, Host, Job, JobState, Parameters, Project, ProjectState,
    QueueSystem, Task, TaskState,
};

pub struct EntityBuilder {
    entity: Entity,
}

impl EntityBuilder {
    pub fn new(id: i64) -> Self {
        Self {
            entity: Entity {
                id,
                name: format!("entity_{id}"),
                root_path: PathBuf::from(format!("/data/entries/{id}")),
                workload_size: 10,
                holds: vec![],
                project_ids: BTreeSet::from([1]),
            },
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.entity.name = name.to_string();
        self
    }

    pub fn with_root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.entity.root_path = path.into();
        self
    }

    pub fn with_workload(mut self, workload_size: u32) -> Self {
        self.entity.workload_size = workload_size;
        self
    }

    pub fn with_projects(mut self, project_ids: impl IntoIterator<Item = i64>) -> Self {
        self.entity.project_ids = project_ids.into_iter().collect();
        self
    }

    pub fn with_hold(mut self, hold: &str) -> Self {
        self.entity.holds.push(hold.to_string());
        self
    }

    pub fn build(self) -> Entity {
        self.entity
    }
}

pub struct HostBuilder {
    host: Host,
}

impl HostBuilder {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            host: Host {
                id,
                name: name.to_string(),
                address: format!("{name}.example.edu"),
                ppn: 8,
                template_name: name.to_string(),
                active: true,
                queue_system: QueueSystem::Pbs,
                binaries: BTreeMap::from([(
                    "vasp_53".to_string(),
                    "/opt/vasp/5.3/vasp".to_string(),
                )]),
                default_binary: None,
            },
        }
    }

    pub fn with_ppn(mut self, ppn: u32) -> Self {
        self.host.ppn = ppn;
        self
    }

    pub fn with_template(mut self, template_name: &str) -> Self {
        self.host.template_name = template_name.to_string();
        self
    }

    pub fn with_queue_system(mut self, queue_system: QueueSystem) -> Self {
        self.host.queue_system = queue_system;
        self
    }

    pub fn with_binary(mut self, alias: &str, path: &str) -> Self {
        self.host
            .binaries
            .insert(alias.to_string(), path.to_string());
        self
    }

    pub fn with_default_binary(mut self, alias: &str) -> Self {
        self.host.default_binary = Some(alias.to_string());
        self
    }

    pub fn without_binaries(mut self) -> Self {
        self.host.binaries.clear();
        self.host.default_binary = None;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.host.active = false;
        self
    }

    pub fn build(self) -> Host {
        self.host
    }
}

pub struct AccountBuilder {
    account: Account,
}

impl AccountBuilder {
    pub fn new(id: i64, user_id: i64, host_id: i64) -> Self {
        Self {
            account: Account {
                id,
                user_id,
                host_id,
                username: "oqmd".to_string(),
                run_path: PathBuf::from("/scratch/oqmd"),
            },
        }
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.account.username = username.to_string();
        self
    }

    pub fn with_run_path(mut self, run_path: impl Into<PathBuf>) -> Self {
        self.account.run_path = run_path.into();
        self
    }

    pub fn build(self) -> Account {
        self.account
    }
}

pub struct AllocationBuilder {
    allocation: Allocation,
}

impl AllocationBuilder {
    pub fn new(id: i64, name: &str, host_id: i64) -> Self {
        Self {
            allocation: Allocation {
                id,
                name: name.to_string(),
                key: name.to_string(),
                host_id,
                active: true,
                capacity: 10,
                in_use: 0,
                user_ids: BTreeSet::new(),
                serial_walltime_seconds: None,
            },
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.allocation.key = key.to_string();
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.allocation.capacity = capacity;
        self
    }

    pub fn with_users(mut self, user_ids: impl IntoIterator<Item = i64>) -> Self {
        self.allocation.user_ids = user_ids.into_iter().collect();
        self
    }

    pub fn with_serial_walltime(mut self, seconds: i64) -> Self {
        self.allocation.serial_walltime_seconds = Some(seconds);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.allocation.active = false;
        self
    }

    pub fn build(self) -> Allocation {
        self.allocation
    }
}

pub struct ProjectBuilder {
    project: Project,
}

impl ProjectBuilder {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            project: Project {
                id,
                name: name.to_string(),
                priority: 0,
                state: ProjectState::Active,
                active: true,
                user_ids: BTreeSet::new(),
                allocation_ids: BTreeSet::new(),
            },
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.project.priority = priority;
        self
    }

    pub fn with_users(mut self, user_ids: impl IntoIterator<Item = i64>) -> Self {
        self.project.user_ids = user_ids.into_iter().collect();
        self
    }

    pub fn with_allocations(mut self, allocation_ids: impl IntoIterator<Item = i64>) -> Self {
        self.project.allocation_ids = allocation_ids.into_iter().collect();
        self
    }

    pub fn held(mut self) -> Self {
        self.project.state = ProjectState::Held;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.project.active = false;
        self
    }

    pub fn build(self) -> Project {
        self.project
    }
}

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(entity_id: i64, module: &str) -> Self {
        Self {
            task: Task::new(
                entity_id,
                module.to_string(),
                Parameters::new(),
                40,
                BTreeSet::from([1]),
            ),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    /// Non-object values are ignored
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Value::Object(map) = parameters {
            self.task.parameters = map;
        }
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_projects(mut self, project_ids: impl IntoIterator<Item = i64>) -> Self {
        self.task.project_ids = project_ids.into_iter().collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(task_id: i64) -> Self {
        Self {
            job: Job {
                id: 0,
                task_id,
                entity_id: 42,
                account_id: 1,
                allocation_id: 1,
                state: JobState::Ready,
                queue_id: None,
                path: PathBuf::from("/data/entries/42/static"),
                run_path: "/scratch/oqmd/42_static".to_string(),
                description: "42_static".to_string(),
                nodes: 1,
                ncpus: 8,
                walltime_seconds: 3600,
                created_at: Utc::now(),
                finished_at: None,
            },
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_entity(mut self, entity_id: i64) -> Self {
        self.job.entity_id = entity_id;
        self
    }

    pub fn with_account(mut self, account_id: i64) -> Self {
        self.job.account_id = account_id;
        self
    }

    pub fn with_allocation(mut self, allocation_id: i64) -> Self {
        self.job.allocation_id = allocation_id;
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn with_queue_id(mut self, queue_id: &str) -> Self {
        self.job.queue_id = Some(queue_id.to_string());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.job.path = path.into();
        self
    }

    pub fn with_walltime_seconds(mut self, seconds: i64) -> Self {
        self.job.walltime_seconds = seconds;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.job.created_at = created_at;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_builder() {
        let task = TaskBuilder::new(42, "static")
            .with_id(7)
            .with_parameters(json!({"encut": 520}))
            .with_state(TaskState::Held)
            .build();
        assert_eq!(task.id, 7);
        assert_eq!(task.parameters["encut"], json!(520));
        assert_eq!(task.state, TaskState::Held);
    }

    #[test]
    fn test_resource_builders() {
        let host = HostBuilder::new(1, "quest").with_ppn(16).inactive().build();
        assert_eq!(host.ppn, 16);
        assert!(!host.active);
        assert_eq!(
            host.resolve_binary(Some("vasp_53")).as_deref(),
            Some("/opt/vasp/5.3/vasp")
        );

        let allocation = AllocationBuilder::new(3, "b1004", 1).with_capacity(2).build();
        assert_eq!(allocation.remaining(), 2);

        let project = ProjectBuilder::new(1, "chem").held().build();
        assert!(!project.is_schedulable());
    }
}
