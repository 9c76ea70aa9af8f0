use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use scheduler_config::TaskConfig;
use scheduler_domain::{
    choose, Account, Allocation, Calculator, Chooser, Entity, EntityRepository, Host, Job,
    JobRepository, JobState, Parameters, Project, ProjectFilter, ResourceRegistry, Task,
    TaskRepository, TaskState,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_observability::{MetricsCollector, StructuredLogger};

use crate::host_policy::HostPolicyRegistry;
use crate::job_engine::{JobEngine, JobRequest};

#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    pub default_node_count: u32,
    pub default_walltime_hours: f64,
    pub priority_factor: i32,
    pub priority_cap: i32,
}

impl From<&TaskConfig> for TaskEngineConfig {
    fn from(config: &TaskConfig) -> Self {
        Self {
            default_node_count: config.default_node_count,
            default_walltime_hours: config.default_walltime_hours,
            priority_factor: config.priority_factor,
            priority_cap: config.priority_cap,
        }
    }
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self::from(&TaskConfig::default())
    }
}

/// 放置时显式指定的资源，未指定的部分随机选择
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementRequest {
    pub project: Option<i64>,
    pub allocation: Option<i64>,
    pub account: Option<i64>,
    pub host: Option<i64>,
}

impl PlacementRequest {
    pub fn on_host(host_id: i64) -> Self {
        Self {
            host: Some(host_id),
            ..Self::default()
        }
    }

    pub fn for_project(project_id: i64) -> Self {
        Self {
            project: Some(project_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    /// 已创建作业，任务进入运行状态
    Placed(Job),
    /// 计算已收敛，无需作业
    Completed,
    /// 计算未收敛且没有后续指令
    Failed,
    /// 本轮没有可用资源，任务保持就绪
    Skipped(String),
}

/// 选定的放置目标
struct Placement {
    project: Project,
    allocation: Allocation,
    host: Host,
}

/// 任务引擎：创建任务、判断资格、选择资源并调用计算函数
pub struct TaskEngine {
    task_repo: Arc<dyn TaskRepository>,
    job_repo: Arc<dyn JobRepository>,
    entity_repo: Arc<dyn EntityRepository>,
    registry: Arc<dyn ResourceRegistry>,
    calculator: Arc<dyn Calculator>,
    chooser: Arc<dyn Chooser>,
    policies: Arc<HostPolicyRegistry>,
    job_engine: Arc<JobEngine>,
    config: TaskEngineConfig,
    metrics: Arc<MetricsCollector>,
}

impl TaskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        job_repo: Arc<dyn JobRepository>,
        entity_repo: Arc<dyn EntityRepository>,
        registry: Arc<dyn ResourceRegistry>,
        calculator: Arc<dyn Calculator>,
        chooser: Arc<dyn Chooser>,
        policies: Arc<HostPolicyRegistry>,
        job_engine: Arc<JobEngine>,
        config: TaskEngineConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            task_repo,
            job_repo,
            entity_repo,
            registry,
            calculator,
            chooser,
            policies,
            job_engine,
            config,
            metrics,
        }
    }

    async fn load_entity(&self, entity_id: i64) -> SchedulerResult<Entity> {
        self.entity_repo
            .get_by_id(entity_id)
            .await?
            .ok_or_else(|| SchedulerError::entity_not_found(entity_id))
    }

    async fn load_task(&self, task_id: i64) -> SchedulerResult<Task> {
        self.task_repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    /// 幂等创建任务
    ///
    /// 同一 (实体, 模块, 参数) 已存在时合并项目集合并返回已有任务。显式给出的优先级会覆盖已有值。
    pub async fn create(
        &self,
        entity_id: i64,
        module: &str,
        parameters: Parameters,
        priority: Option<i32>,
        projects: Option<BTreeSet<i64>>,
    ) -> SchedulerResult<Task> {
        if module.trim().is_empty() {
            return Err(SchedulerError::invalid_params("模块名不能为空"));
        }
        let entity = self.load_entity(entity_id).await?;
        let projects = projects.unwrap_or_else(|| entity.project_ids.clone());
        let default_priority = Task::default_priority(
            entity.workload_size,
            self.config.priority_factor,
            self.config.priority_cap,
        );

        let candidate = Task::new(
            entity_id,
            module.to_string(),
            parameters,
            priority.unwrap_or(default_priority),
            projects,
        );
        let key = candidate.key();
        let existed = self
            .task_repo
            .find_by_entity(entity_id)
            .await?
            .iter()
            .any(|t| t.key() == key);

        let mut task = self.task_repo.upsert(&candidate).await?;
        if let Some(priority) = priority {
            if task.priority != priority.max(0) {
                task = self.task_repo.update_priority(task.id, priority).await?;
            }
        }

        if !existed {
            self.metrics.record_task_created();
        }
        StructuredLogger::log_task_created(task.id, entity_id, module, task.priority, existed);
        Ok(task)
    }

    /// 任务就绪且所属实体没有挂起标记
    pub async fn is_eligible(&self, task: &Task) -> SchedulerResult<bool> {
        if !task.is_ready() {
            return Ok(false);
        }
        let entity = self.load_entity(task.entity_id).await?;
        Ok(!entity.is_held())
    }

    /// 选择项目，显式请求的项目必须属于任务且可调度
    ///
    /// 只请求了分配时，候选项目限定为拥有该分配的项目。
    async fn pick_project(
        &self,
        task: &Task,
        request: &PlacementRequest,
        filter: ProjectFilter,
    ) -> SchedulerResult<Option<Project>> {
        if let Some(project_id) = request.project {
            let project = self
                .registry
                .get_project(project_id)
                .await?
                .ok_or_else(|| SchedulerError::resource_not_found("项目", project_id))?;
            if !task.project_ids.contains(&project.id) {
                return Err(SchedulerError::resource_unavailable(format!(
                    "项目 {} 不属于任务 {}",
                    project.name, task.id
                )));
            }
            if !project.is_schedulable() {
                return Err(SchedulerError::resource_unavailable(format!(
                    "项目 {} 未激活或已挂起",
                    project.name
                )));
            }
            return Ok(Some(project));
        }
        let mut projects = self.registry.list_projects(&filter).await?;
        if let Some(allocation_id) = request.allocation {
            projects.retain(|p| p.allocation_ids.contains(&allocation_id));
        }
        debug!("任务 {} 有 {} 个候选项目", task.id, projects.len());
        Ok(choose(self.chooser.as_ref(), &projects).cloned())
    }

    async fn pick_allocation(
        &self,
        project: &Project,
        requested: Option<i64>,
        host_id: Option<i64>,
    ) -> SchedulerResult<Option<Allocation>> {
        if let Some(allocation_id) = requested {
            let allocation = self
                .registry
                .get_allocation(allocation_id)
                .await?
                .ok_or_else(|| SchedulerError::resource_not_found("分配", allocation_id))?;
            if !project.allocation_ids.contains(&allocation.id) {
                return Err(SchedulerError::resource_unavailable(format!(
                    "分配 {} 不属于项目 {}",
                    allocation.name, project.name
                )));
            }
            if !allocation.active {
                return Err(SchedulerError::resource_unavailable(format!(
                    "分配 {} 未激活",
                    allocation.name
                )));
            }
            if host_id.is_some_and(|id| id != allocation.host_id) {
                return Err(SchedulerError::resource_unavailable(format!(
                    "分配 {} 不在请求的主机上",
                    allocation.name
                )));
            }
            return Ok(Some(allocation));
        }
        let allocations = self
            .registry
            .list_allocations(project.id, host_id, true)
            .await?;
        Ok(choose(self.chooser.as_ref(), &allocations).cloned())
    }

    /// 选择项目和分配
    ///
    /// 显式指定主机、项目或分配却找不到资源时返回 `ResourceUnavailable`，
    /// 完全隐式的选择找不到资源时返回 `Ok(Err(原因))` 表示本轮跳过。
    async fn select(
        &self,
        task: &Task,
        request: &PlacementRequest,
    ) -> SchedulerResult<Result<Placement, String>> {
        let among = ProjectFilter::among(&task.project_ids).schedulable();

        let (project, allocation) = if let Some(host_id) = request.host {
            let project = self
                .pick_project(task, request, among.with_host(host_id))
                .await?
                .ok_or_else(|| {
                    SchedulerError::resource_unavailable(format!(
                        "任务 {} 在主机 {} 上没有可用项目",
                        task.id, host_id
                    ))
                })?;
            let allocation = self
                .pick_allocation(&project, request.allocation, Some(host_id))
                .await?
                .ok_or_else(|| {
                    SchedulerError::resource_unavailable(format!(
                        "项目 {} 在主机 {} 上没有可用分配",
                        project.name, host_id
                    ))
                })?;
            (project, allocation)
        } else if request.project.is_some() || request.allocation.is_some() {
            let project = self
                .pick_project(task, request, among)
                .await?
                .ok_or_else(|| {
                    SchedulerError::resource_unavailable(format!(
                        "任务 {} 没有包含所请求分配的可调度项目",
                        task.id
                    ))
                })?;
            let allocation = self
                .pick_allocation(&project, request.allocation, None)
                .await?
                .ok_or_else(|| {
                    SchedulerError::resource_unavailable(format!(
                        "项目 {} 没有剩余容量的分配",
                        project.name
                    ))
                })?;
            (project, allocation)
        } else {
            let Some(project) = self.pick_project(task, request, among).await? else {
                return Ok(Err("没有可调度的项目".to_string()));
            };
            let Some(allocation) = self.pick_allocation(&project, None, None).await? else {
                return Ok(Err(format!("项目 {} 没有可用分配", project.name)));
            };
            (project, allocation)
        };

        let host = self
            .registry
            .get_host(allocation.host_id)
            .await?
            .ok_or_else(|| SchedulerError::resource_not_found("主机", allocation.host_id))?;
        Ok(Ok(Placement {
            project,
            allocation,
            host,
        }))
    }

    async fn resolve_account(
        &self,
        task: &Task,
        placement: &Placement,
        requested: Option<i64>,
    ) -> SchedulerResult<Account> {
        if let Some(account_id) = requested {
            let account = self
                .registry
                .get_account(account_id)
                .await?
                .ok_or_else(|| SchedulerError::resource_not_found("账户", account_id))?;
            if account.host_id != placement.host.id {
                return Err(SchedulerError::resource_unavailable(format!(
                    "账户 {} 不在主机 {} 上",
                    account.username, placement.host.name
                )));
            }
            return Ok(account);
        }
        let users = &placement.project.user_ids;
        let user_filter = (!users.is_empty()).then_some(users);
        self.registry
            .derive_account(&placement.allocation, user_filter)
            .await?
            .ok_or_else(|| {
                SchedulerError::resource_unavailable(format!(
                    "任务 {} 在分配 {} 上没有可用账户",
                    task.id, placement.allocation.name
                ))
            })
    }

    /// 把本地的状态变化写回仓储
    ///
    /// 只有存储的任务仍处于 `expected` 状态时才生效。状态已被其他操作改变时
    /// 把存储值载入 `task` 并返回 `false`。
    async fn commit_state(&self, task: &mut Task, expected: TaskState) -> SchedulerResult<bool> {
        match self.task_repo.update_state(task, expected).await {
            Ok(stored) => {
                *task = stored;
                Ok(true)
            }
            Err(SchedulerError::InvalidTransition { .. }) => {
                *task = self.load_task(task.id).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 为任务选择资源并调用计算函数
    ///
    /// 先从仓储重新载入任务再判断资格，调用方持有的副本可能已经过期。
    /// 需要作业时占用分配槽位并创建作业，任务进入运行状态。
    /// 配置错误会把任务标记为失败并释放槽位，其余错误不改变任务状态。
    pub async fn place(
        &self,
        task: &mut Task,
        request: PlacementRequest,
    ) -> SchedulerResult<PlacementOutcome> {
        *task = self.load_task(task.id).await?;
        if !self.is_eligible(task).await? {
            let reason = format!("任务状态为 {} 或实体被挂起", task.state);
            return Ok(self.skip(task, reason));
        }
        if self.job_repo.find_active_for_task(task.id).await?.is_some() {
            return Ok(self.skip(task, "已有活跃作业".to_string()));
        }

        let placement = match self.select(task, &request).await? {
            Ok(placement) => placement,
            Err(reason) => return Ok(self.skip(task, reason)),
        };
        let account = self.resolve_account(task, &placement, request.account).await?;
        let entity = self.load_entity(task.entity_id).await?;
        let Placement {
            allocation, host, ..
        } = &placement;

        let defaults =
            task.placement_parameters(self.config.default_node_count, self.config.default_walltime_hours);
        let parameters = self
            .policies
            .patch_parameters(Some(host), Some(allocation), &defaults);

        let result = self
            .calculator
            .compute(&task.module, &entity, &parameters)
            .await?;

        if !result.needs_job() {
            return if result.converged {
                task.complete()?;
                if !self.commit_state(task, TaskState::Ready).await? {
                    return Ok(self.skip(task, format!("计算期间任务状态变为 {}", task.state)));
                }
                self.metrics.record_task_completed();
                StructuredLogger::log_task_state_change(task.id, "ready", "completed");
                Ok(PlacementOutcome::Completed)
            } else {
                task.fail()?;
                if !self.commit_state(task, TaskState::Ready).await? {
                    return Ok(self.skip(task, format!("计算期间任务状态变为 {}", task.state)));
                }
                self.metrics.record_task_failed("unconverged");
                StructuredLogger::log_task_failed(task.id, &task.module, "计算未收敛且没有后续作业");
                Ok(PlacementOutcome::Failed)
            };
        }

        let instructions = self.policies.patch_instructions(
            Some(host),
            Some(allocation),
            &result.kind,
            &parameters,
            &result.instructions,
        );
        let walltime_format = self.policies.walltime_format(Some(host), Some(allocation));

        if !self.registry.try_claim(allocation.id).await? {
            return Err(SchedulerError::resource_unavailable(format!(
                "分配 {} 已满",
                allocation.name
            )));
        }

        let created = self
            .job_engine
            .create(JobRequest {
                task: &*task,
                entity: &entity,
                account: &account,
                host,
                allocation,
                parameters: &parameters,
                instructions: &instructions,
                walltime_format,
            })
            .await;

        let mut job = match created {
            Ok(job) => job,
            Err(e) => {
                self.registry.release(allocation.id).await?;
                if e.is_fatal() {
                    StructuredLogger::log_allocation_misconfigured(
                        task.id,
                        &allocation.name,
                        &e.to_string(),
                    );
                    task.fail()?;
                    if self.commit_state(task, TaskState::Ready).await? {
                        self.metrics.record_task_failed("misconfigured");
                    }
                }
                return Err(e);
            }
        };

        task.start()?;
        if !self.commit_state(task, TaskState::Ready).await? {
            // 放置期间任务被挂起或改变，撤销刚创建的作业
            let reason = format!("放置期间任务状态变为 {}", task.state);
            self.job_engine.fail(&mut job, &reason).await?;
            return Ok(self.skip(task, reason));
        }
        self.metrics.record_task_placed(&host.name);
        StructuredLogger::log_task_placed(task.id, job.id, &allocation.name, &host.name, job.nodes);
        Ok(PlacementOutcome::Placed(job))
    }

    fn skip(&self, task: &Task, reason: String) -> PlacementOutcome {
        self.metrics.record_placement_skipped(&reason);
        StructuredLogger::log_placement_skipped(task.id, &reason);
        PlacementOutcome::Skipped(reason)
    }

    /// 放置任务并返回新建的作业，没有作业时返回空列表
    pub async fn get_jobs(&self, task_id: i64, request: PlacementRequest) -> SchedulerResult<Vec<Job>> {
        let mut task = self.load_task(task_id).await?;
        match self.place(&mut task, request).await? {
            PlacementOutcome::Placed(job) => Ok(vec![job]),
            outcome => {
                debug!("任务 {} 未生成作业: {:?}", task_id, outcome);
                Ok(Vec::new())
            }
        }
    }

    pub async fn jobs(&self, task_id: i64) -> SchedulerResult<Vec<Job>> {
        self.job_repo.find_by_task(task_id).await
    }

    /// 最近一个作业的状态
    pub async fn last_job_state(&self, task_id: i64) -> SchedulerResult<Option<JobState>> {
        let jobs = self.job_repo.find_by_task(task_id).await?;
        Ok(jobs
            .iter()
            .max_by_key(|job| (job.created_at, job.id))
            .map(|job| job.state))
    }

    async fn update_state<F>(&self, task_id: i64, change: F) -> SchedulerResult<Task>
    where
        F: FnOnce(&mut Task) -> SchedulerResult<()>,
    {
        let mut task = self.load_task(task_id).await?;
        let from = task.state;
        change(&mut task)?;
        let task = self.task_repo.update_state(&task, from).await?;
        StructuredLogger::log_task_state_change(task.id, &from.to_string(), &task.state.to_string());
        Ok(task)
    }

    pub async fn complete(&self, task_id: i64) -> SchedulerResult<Task> {
        let task = self.update_state(task_id, Task::complete).await?;
        self.metrics.record_task_completed();
        Ok(task)
    }

    pub async fn fail(&self, task_id: i64) -> SchedulerResult<Task> {
        let task = self.update_state(task_id, Task::fail).await?;
        self.metrics.record_task_failed("manual");
        Ok(task)
    }

    /// 挂起任务，已提交的作业不受影响
    pub async fn hold(&self, task_id: i64) -> SchedulerResult<Task> {
        if self.job_repo.find_active_for_task(task_id).await?.is_some() {
            warn!("任务 {} 挂起时仍有活跃作业", task_id);
        }
        self.update_state(task_id, Task::hold).await
    }

    pub async fn release(&self, task_id: i64) -> SchedulerResult<Task> {
        self.update_state(task_id, Task::release).await
    }

    /// 人工重试失败的任务
    pub async fn retry(&self, task_id: i64) -> SchedulerResult<Task> {
        let task = self.update_state(task_id, Task::retry).await?;
        info!("任务 {} 已重新排队", task_id);
        Ok(task)
    }
}
