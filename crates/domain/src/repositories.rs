//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，具体实现由基础设施层提供

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::entities::{Entity, Job, Task};
use crate::value_objects::TaskState;
use crate::resources::{Account, Allocation, Host, Project, ProjectFilter};
use scheduler_errors::SchedulerResult;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 按 (实体, 模块, 参数) 幂等插入
    ///
    /// 已存在时只把项目集合并入已有任务，整个读-改-写过程是原子的。
    async fn upsert(&self, task: &Task) -> SchedulerResult<Task>;
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>>;
    async fn update(&self, task: &Task) -> SchedulerResult<()>;
    /// 条件状态更新
    ///
    /// 仅当存储的任务仍处于 `expected` 状态时写入 `task` 的状态和完成时间，
    /// 项目集合等其余字段保持存储值。状态已被改变时返回 `InvalidTransition`。
    async fn update_state(&self, task: &Task, expected: TaskState) -> SchedulerResult<Task>;
    async fn update_priority(&self, id: i64, priority: i32) -> SchedulerResult<Task>;
    /// Ready 状态的任务，按优先级、创建时间排序
    async fn find_ready(&self, limit: usize) -> SchedulerResult<Vec<Task>>;
    async fn find_by_entity(&self, entity_id: i64) -> SchedulerResult<Vec<Task>>;
}

/// 作业仓储抽象
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 创建作业
    ///
    /// 同一任务已有 Ready/Running 作业时返回 `DuplicateActiveJob`。
    async fn create(&self, job: &Job) -> SchedulerResult<Job>;
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Job>>;
    async fn update(&self, job: &Job) -> SchedulerResult<()>;
    async fn find_active(&self) -> SchedulerResult<Vec<Job>>;
    async fn find_by_task(&self, task_id: i64) -> SchedulerResult<Vec<Job>>;
    async fn find_active_for_task(&self, task_id: i64) -> SchedulerResult<Option<Job>>;
}

#[async_trait]
pub trait EntityRepository: Send + Sync {
    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Entity>>;
}

/// 资源注册表
///
/// 查询在没有匹配项时返回空结果而不是错误。
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn list_projects(&self, filter: &ProjectFilter) -> SchedulerResult<Vec<Project>>;

    /// 项目在主机上的分配
    ///
    /// `active_only` 只保留激活且仍有剩余容量的分配。
    async fn list_allocations(
        &self,
        project_id: i64,
        host_id: Option<i64>,
        active_only: bool,
    ) -> SchedulerResult<Vec<Allocation>>;

    /// 从分配推导出一个可用账户，`user_filter` 限定账户所属用户
    async fn derive_account(
        &self,
        allocation: &Allocation,
        user_filter: Option<&BTreeSet<i64>>,
    ) -> SchedulerResult<Option<Account>>;

    async fn get_host(&self, id: i64) -> SchedulerResult<Option<Host>>;
    async fn get_account(&self, id: i64) -> SchedulerResult<Option<Account>>;
    async fn get_allocation(&self, id: i64) -> SchedulerResult<Option<Allocation>>;
    async fn get_project(&self, id: i64) -> SchedulerResult<Option<Project>>;

    /// 原子地占用分配的一个槽位，容量已满返回 `false`
    async fn try_claim(&self, allocation_id: i64) -> SchedulerResult<bool>;
    async fn release(&self, allocation_id: i64) -> SchedulerResult<()>;
}
