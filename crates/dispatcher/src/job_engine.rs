use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use scheduler_config::JobConfig;
use scheduler_domain::{
    Account, Allocation, Entity, Host, Job, JobRepository, JobState, LaunchSpec, Parameters,
    RemoteExecutor, ResourceRegistry, Task, TaskRepository, TaskState, TemplateStore,
    WalltimeFormat,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_observability::{MetricsCollector, StructuredLogger};

use crate::template::render_template;

const DEFAULT_THREADS: u32 = 1;
const DEFAULT_CPU_PER_CORE: u32 = 4;
const DEFAULT_CPU_PER_TASK: u32 = 4;

#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    pub max_nodes: u32,
    pub serial_walltime_seconds: i64,
    pub default_walltime_seconds: i64,
    pub grace_period: Duration,
    pub script_name: String,
}

impl From<&JobConfig> for JobEngineConfig {
    fn from(config: &JobConfig) -> Self {
        Self {
            max_nodes: config.max_nodes,
            serial_walltime_seconds: config.serial_walltime_seconds,
            default_walltime_seconds: config.default_walltime_seconds,
            grace_period: Duration::seconds(config.grace_period_seconds),
            script_name: config.script_name.clone(),
        }
    }
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self::from(&JobConfig::default())
    }
}

/// 创建作业所需的全部上下文
///
/// `parameters` 是经过主机策略调整后的参数，`instructions` 是调整后的作业指令。
#[derive(Debug, Clone, Copy)]
pub struct JobRequest<'a> {
    pub task: &'a Task,
    pub entity: &'a Entity,
    pub account: &'a Account,
    pub host: &'a Host,
    pub allocation: &'a Allocation,
    pub parameters: &'a Parameters,
    pub instructions: &'a Parameters,
    pub walltime_format: WalltimeFormat,
}

/// 作业引擎：生成提交脚本、提交、轮询完成状态、回收结果
pub struct JobEngine {
    job_repo: Arc<dyn JobRepository>,
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<dyn ResourceRegistry>,
    remote: Arc<dyn RemoteExecutor>,
    templates: Arc<dyn TemplateStore>,
    config: JobEngineConfig,
    metrics: Arc<MetricsCollector>,
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

impl JobEngine {
    pub fn new(
        job_repo: Arc<dyn JobRepository>,
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<dyn ResourceRegistry>,
        remote: Arc<dyn RemoteExecutor>,
        templates: Arc<dyn TemplateStore>,
        config: JobEngineConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            job_repo,
            task_repo,
            registry,
            remote,
            templates,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    /// 创建作业：计算节点数和walltime，渲染脚本并写入作业目录
    ///
    /// 分配槽位由调用方事先占用。
    pub async fn create(&self, request: JobRequest<'_>) -> SchedulerResult<Job> {
        let JobRequest {
            task,
            entity,
            account,
            host,
            allocation,
            parameters,
            instructions,
            walltime_format,
        } = request;

        let spec = LaunchSpec::from_instructions(instructions)
            .map_err(|e| SchedulerError::misconfigured(e.to_string()))?;
        let path: PathBuf = spec
            .path
            .clone()
            .unwrap_or_else(|| entity.root_path.join(&task.module));

        let (nodes, ppn, walltime_seconds) = if spec.is_serial() {
            let walltime = allocation
                .serial_walltime_seconds
                .unwrap_or(self.config.serial_walltime_seconds);
            (1, 1, walltime)
        } else {
            let factor = spec.job_factor.unwrap_or(1).max(1);
            let nodes = scheduler_domain::param_keys::node_count(parameters)
                .saturating_mul(factor)
                .clamp(1, self.config.max_nodes.max(1));
            let walltime = spec
                .walltime
                .map(|seconds| seconds.round() as i64)
                .unwrap_or(self.config.default_walltime_seconds);
            (nodes, host.ppn, walltime)
        };

        if ppn == 0 {
            return Err(SchedulerError::misconfigured(format!(
                "主机 {} 的每节点核数为 0",
                host.name
            )));
        }
        if walltime_seconds <= 0 {
            return Err(SchedulerError::misconfigured(format!(
                "任务 {} 的walltime无效: {} 秒",
                task.id, walltime_seconds
            )));
        }

        let binary = host.resolve_binary(spec.binary.as_deref()).ok_or_else(|| {
            SchedulerError::misconfigured(format!(
                "主机 {} 上找不到程序 {}",
                host.name,
                spec.binary.as_deref().unwrap_or("<默认>")
            ))
        })?;

        let template = self
            .templates
            .load(&host.template_name)
            .await?
            .ok_or_else(|| {
                SchedulerError::misconfigured(format!(
                    "主机 {} 的提交脚本模板 {} 不存在",
                    host.name, host.template_name
                ))
            })?;

        let description = Job::describe(entity, &path, &task.parameters);
        let run_path = account
            .run_path
            .join(&description)
            .to_string_lossy()
            .into_owned();

        let values: BTreeMap<&str, String> = BTreeMap::from([
            ("host", host.name.clone()),
            ("key", allocation.key.clone()),
            ("name", description.clone()),
            ("walltime", walltime_format.format(walltime_seconds)),
            ("nodes", nodes.to_string()),
            ("ppn", ppn.to_string()),
            ("threads", spec.threads.unwrap_or(DEFAULT_THREADS).to_string()),
            ("header", spec.header.clone().unwrap_or_default()),
            ("mpi", spec.mpi.clone().unwrap_or_default()),
            ("binary", binary),
            ("pipes", spec.pipes.clone().unwrap_or_default()),
            ("footer", spec.footer.clone().unwrap_or_default()),
            (
                "cpu_per_core",
                spec.cpu_per_core.unwrap_or(DEFAULT_CPU_PER_CORE).to_string(),
            ),
            (
                "cpu_per_task",
                spec.cpu_per_task.unwrap_or(DEFAULT_CPU_PER_TASK).to_string(),
            ),
        ]);
        let script = render_template(&template, &values)?;

        tokio::fs::create_dir_all(&path).await?;
        let script_path = path.join(&self.config.script_name);
        tokio::fs::write(&script_path, script).await?;
        debug!("提交脚本已写入 {}", script_path.display());

        let job = Job {
            id: 0,
            task_id: task.id,
            entity_id: entity.id,
            account_id: account.id,
            allocation_id: allocation.id,
            state: JobState::Ready,
            queue_id: None,
            path,
            run_path,
            description,
            nodes,
            ncpus: nodes * ppn,
            walltime_seconds,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.job_repo.create(&job).await
    }

    pub async fn account_and_host(&self, job: &Job) -> SchedulerResult<(Account, Host)> {
        let account = self
            .registry
            .get_account(job.account_id)
            .await?
            .ok_or_else(|| SchedulerError::resource_not_found("账户", job.account_id))?;
        let host = self
            .registry
            .get_host(account.host_id)
            .await?
            .ok_or_else(|| SchedulerError::resource_not_found("主机", account.host_id))?;
        Ok((account, host))
    }

    async fn load_task(&self, task_id: i64) -> SchedulerResult<Task> {
        self.task_repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(task_id))
    }

    pub async fn submit(&self, job: &mut Job) -> SchedulerResult<bool> {
        self.submit_at(job, Utc::now()).await
    }

    /// 提交作业，主机未启用时不做任何操作并返回 `false`
    ///
    /// 远程提交成功后才推进作业和任务的状态。
    pub async fn submit_at(&self, job: &mut Job, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let (account, host) = self.account_and_host(job).await?;
        if !host.active {
            StructuredLogger::log_job_submit_skipped(job.id, &host.name);
            return Ok(false);
        }
        if job.state != JobState::Ready {
            return Err(SchedulerError::invalid_transition(
                format!("作业 {}", job.id),
                job.state,
                JobState::Running,
            ));
        }

        let started = Instant::now();
        let result = self
            .remote
            .submit(
                &account,
                &host,
                &job.path,
                &job.run_path,
                &self.config.script_name,
            )
            .await;
        self.metrics
            .record_remote_call("submit", started.elapsed().as_secs_f64(), result.is_ok());
        let queue_id = result.inspect_err(|e| {
            StructuredLogger::log_remote_call_failed("submit", &host.name, &e.to_string())
        })?;

        job.created_at = now;
        job.queue_id = Some(queue_id.clone());
        job.transition_to(JobState::Running)?;
        self.job_repo.update(job).await?;

        let mut task = self.load_task(job.task_id).await?;
        match task.state {
            TaskState::Running => {}
            TaskState::Ready => {
                task.start()?;
                self.task_repo.update_state(&task, TaskState::Ready).await?;
            }
            other => debug!("任务 {} 当前状态为 {}，提交后保持不变", task.id, other),
        }

        self.metrics.record_job_submitted(&host.name);
        StructuredLogger::log_job_submitted(job.id, job.task_id, &queue_id, &host.name);
        Ok(true)
    }

    /// 查询主机队列，失败时返回 `None`
    pub async fn fetch_listing(&self, account: &Account, host: &Host) -> Option<HashSet<String>> {
        let started = Instant::now();
        let result = self.remote.list_running(account, host).await;
        self.metrics.record_remote_call(
            "list_running",
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        match result {
            Ok(listing) => Some(listing),
            Err(e) => {
                StructuredLogger::log_remote_call_failed("list_running", &host.name, &e.to_string());
                None
            }
        }
    }

    /// 根据已取得的队列列表判断作业是否结束
    ///
    /// 宽限期内、列表为空或不可用时都视为未结束。
    pub fn is_done_with(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        listing: Option<&HashSet<String>>,
    ) -> bool {
        if job.within_grace_window(now, self.config.grace_period) {
            return false;
        }
        let Some(listing) = listing.filter(|l| !l.is_empty()) else {
            return false;
        };
        match &job.queue_id {
            Some(queue_id) => !listing.contains(queue_id),
            None => false,
        }
    }

    pub fn within_grace_window(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.within_grace_window(now, self.config.grace_period)
    }

    pub async fn is_done_at(&self, job: &Job, now: DateTime<Utc>) -> SchedulerResult<bool> {
        if self.within_grace_window(job, now) {
            return Ok(false);
        }
        let (account, host) = self.account_and_host(job).await?;
        let listing = self.fetch_listing(&account, &host).await;
        Ok(self.is_done_with(job, now, listing.as_ref()))
    }

    pub async fn is_done(&self, job: &Job) -> SchedulerResult<bool> {
        self.is_done_at(job, Utc::now()).await
    }

    /// 回收作业：取回输出文件，清理远程目录，任务重新排队等待评估
    pub async fn collect(&self, job: &mut Job) -> SchedulerResult<()> {
        if job.state != JobState::Running {
            return Err(SchedulerError::invalid_transition(
                format!("作业 {}", job.id),
                job.state,
                JobState::Completed,
            ));
        }
        let (account, host) = self.account_and_host(job).await?;

        let started = Instant::now();
        let moved = self
            .remote
            .move_files(&account, &host, &job.run_path, &job.path, "*", true)
            .await;
        self.metrics.record_remote_call(
            "move_files",
            started.elapsed().as_secs_f64(),
            moved.is_ok(),
        );
        moved.inspect_err(|e| {
            StructuredLogger::log_remote_call_failed("move_files", &host.name, &e.to_string())
        })?;

        let cleanup = format!("rm -rf {}", quote(&job.run_path));
        self.remote
            .execute(&account, &host, &cleanup, true)
            .await?;

        let mut task = self.load_task(job.task_id).await?;
        if task.state == TaskState::Running {
            task.requeue()?;
            self.task_repo
                .update_state(&task, TaskState::Running)
                .await?;
        } else {
            debug!("任务 {} 当前状态为 {}，回收后不重新排队", task.id, task.state);
        }

        job.transition_to(JobState::Completed)?;
        job.finished_at = Some(Utc::now());
        self.job_repo.update(job).await?;
        self.registry.release(job.allocation_id).await?;

        self.metrics.record_job_collected();
        StructuredLogger::log_job_collected(job.id, job.task_id, &job.run_path);
        Ok(())
    }

    /// 标记作业失败并释放分配槽位，运行中的任务重新排队
    pub async fn fail(&self, job: &mut Job, reason: &str) -> SchedulerResult<()> {
        job.transition_to(JobState::Failed)?;
        job.finished_at = Some(Utc::now());
        self.job_repo.update(job).await?;
        self.registry.release(job.allocation_id).await?;

        match self.task_repo.get_by_id(job.task_id).await? {
            Some(mut task) if task.state == TaskState::Running => {
                task.requeue()?;
                self.task_repo
                    .update_state(&task, TaskState::Running)
                    .await?;
            }
            Some(_) => {}
            None => warn!("作业 {} 关联的任务 {} 不存在", job.id, job.task_id),
        }

        self.metrics.record_job_failed();
        StructuredLogger::log_job_failed(job.id, job.task_id, reason);
        info!("作业 {} 已标记为失败: {}", job.id, reason);
        Ok(())
    }
}
