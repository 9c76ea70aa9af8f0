use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use scheduler_config::{ExpiredJobAction, SchedulerConfig};
use scheduler_domain::{Job, JobRepository, JobState, TaskRepository};
use scheduler_errors::SchedulerResult;
use scheduler_observability::{MetricsCollector, StructuredLogger};

use crate::job_engine::JobEngine;
use crate::task_engine::{PlacementOutcome, PlacementRequest, TaskEngine};

#[derive(Debug, Clone)]
pub struct SchedulerLoopConfig {
    pub pass_interval: Duration,
    pub tasks_per_pass: usize,
    pub expired_job_action: ExpiredJobAction,
}

impl From<&SchedulerConfig> for SchedulerLoopConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            pass_interval: Duration::from_secs(config.pass_interval_seconds),
            tasks_per_pass: config.tasks_per_pass,
            expired_job_action: config.expired_job_action,
        }
    }
}

impl Default for SchedulerLoopConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// 单轮调度的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub submitted: usize,
    pub submit_skipped: usize,
    pub collected: usize,
    pub expired: usize,
    pub placed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// 调度循环
///
/// 每一轮依次：提交就绪作业，轮询运行中的作业并回收已结束的，为就绪任务放置新作业。
/// 每轮之间不保留状态，远程调用失败留到下一轮重试。
pub struct SchedulerLoop {
    task_repo: Arc<dyn TaskRepository>,
    job_repo: Arc<dyn JobRepository>,
    task_engine: Arc<TaskEngine>,
    job_engine: Arc<JobEngine>,
    config: SchedulerLoopConfig,
    metrics: Arc<MetricsCollector>,
}

impl SchedulerLoop {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        job_repo: Arc<dyn JobRepository>,
        task_engine: Arc<TaskEngine>,
        job_engine: Arc<JobEngine>,
        config: SchedulerLoopConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            task_repo,
            job_repo,
            task_engine,
            job_engine,
            config,
            metrics,
        }
    }

    pub async fn run_pass(&self) -> SchedulerResult<PassReport> {
        self.run_pass_at(Utc::now()).await
    }

    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> SchedulerResult<PassReport> {
        let started = Instant::now();
        let mut report = PassReport::default();

        let active = self.job_repo.find_active().await?;
        let (ready, running): (Vec<Job>, Vec<Job>) = active
            .into_iter()
            .partition(|job| job.state == JobState::Ready);

        self.submit_ready(ready, now, &mut report).await;
        self.poll_running(running, now, &mut report).await;
        self.place_ready_tasks(&mut report).await?;

        let active_jobs = self.job_repo.find_active().await?.len();
        self.metrics.update_active_jobs(active_jobs);

        let elapsed = started.elapsed();
        self.metrics.record_pass(elapsed.as_secs_f64());
        StructuredLogger::log_pass_complete(
            report.submitted,
            report.collected,
            report.placed,
            report.skipped,
            report.errors,
            elapsed.as_millis() as u64,
        );
        Ok(report)
    }

    async fn submit_ready(&self, jobs: Vec<Job>, now: DateTime<Utc>, report: &mut PassReport) {
        for mut job in jobs {
            match self.job_engine.submit_at(&mut job, now).await {
                Ok(true) => report.submitted += 1,
                Ok(false) => report.submit_skipped += 1,
                Err(e) => {
                    warn!("作业 {} 提交失败，下一轮重试: {}", job.id, e);
                    report.errors += 1;
                }
            }
        }
    }

    async fn poll_running(&self, jobs: Vec<Job>, now: DateTime<Utc>, report: &mut PassReport) {
        // 每个账户每轮只查询一次队列
        let mut listings: HashMap<i64, Option<HashSet<String>>> = HashMap::new();

        for mut job in jobs {
            if self.job_engine.within_grace_window(&job, now) {
                continue;
            }

            let listing = match listings.get(&job.account_id) {
                Some(listing) => listing.clone(),
                None => {
                    let listing = match self.job_engine.account_and_host(&job).await {
                        Ok((account, host)) => self.job_engine.fetch_listing(&account, &host).await,
                        Err(e) => {
                            error!("作业 {} 的账户或主机不可用: {}", job.id, e);
                            None
                        }
                    };
                    listings.insert(job.account_id, listing.clone());
                    listing
                }
            };

            let expired_blind = listing.as_ref().is_none_or(HashSet::is_empty)
                && job.walltime_expired_at(now - self.job_engine.config().grace_period);

            if self.job_engine.is_done_with(&job, now, listing.as_ref()) {
                match self.job_engine.collect(&mut job).await {
                    Ok(()) => report.collected += 1,
                    Err(e) => {
                        warn!("作业 {} 回收失败，下一轮重试: {}", job.id, e);
                        report.errors += 1;
                    }
                }
            } else if expired_blind {
                report.expired += 1;
                let result = match self.config.expired_job_action {
                    ExpiredJobAction::Collect => self.job_engine.collect(&mut job).await,
                    ExpiredJobAction::Fail => {
                        self.job_engine
                            .fail(&mut job, "超过walltime且无法确认队列状态")
                            .await
                    }
                };
                match result {
                    Ok(()) => info!("超时作业 {} 已处理", job.id),
                    Err(e) => {
                        warn!("超时作业 {} 处理失败: {}", job.id, e);
                        report.errors += 1;
                    }
                }
            }
        }
    }

    /// 按优先级逐个尝试就绪任务
    ///
    /// 实体被挂起的任务直接跳过，不占用每轮 `tasks_per_pass` 的名额。
    async fn place_ready_tasks(&self, report: &mut PassReport) -> SchedulerResult<()> {
        let candidates = self.task_repo.find_ready(usize::MAX).await?;
        debug!("本轮候选任务 {} 个", candidates.len());

        let mut attempted = 0;
        for mut task in candidates {
            if attempted >= self.config.tasks_per_pass {
                break;
            }
            match self.task_engine.is_eligible(&task).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("任务 {} 的实体被挂起，本轮跳过", task.id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!("任务 {} 资格检查出错: {}", task.id, e);
                    report.errors += 1;
                    continue;
                }
            }
            attempted += 1;

            match self
                .task_engine
                .place(&mut task, PlacementRequest::default())
                .await
            {
                Ok(PlacementOutcome::Placed(_)) => report.placed += 1,
                Ok(PlacementOutcome::Completed) => report.completed += 1,
                Ok(PlacementOutcome::Failed) => report.failed += 1,
                Ok(PlacementOutcome::Skipped(_)) => report.skipped += 1,
                Err(e) if e.is_retryable() => {
                    debug!("任务 {} 本轮无法放置: {}", task.id, e);
                    self.metrics.record_placement_skipped("retryable");
                    report.skipped += 1;
                }
                Err(e) if e.is_fatal() => {
                    error!("任务 {} 放置失败: {}", task.id, e);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("任务 {} 放置出错: {}", task.id, e);
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// 按固定间隔运行调度，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.pass_interval);
        info!(
            "调度循环启动，间隔 {:?}，每轮最多 {} 个任务",
            self.config.pass_interval, self.config.tasks_per_pass
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_pass().await {
                        error!("调度轮次失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("调度循环收到关闭信号");
                    break;
                }
            }
        }
    }
}
