use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use scheduler_config::AppConfig;
use scheduler_dispatcher::{
    HostPolicyRegistry, JobEngine, JobEngineConfig, PassReport, SchedulerLoop,
    SchedulerLoopConfig, TaskEngine, TaskEngineConfig, UniformChooser,
};
use scheduler_infrastructure::{
    FileTemplateStore, InMemoryEntityRepository, InMemoryJobRepository, InMemoryRegistry,
    InMemoryTaskRepository, Inventory, ProcessCalculator, SshRemoteExecutor,
};
use scheduler_observability::MetricsCollector;

/// 主应用程序
pub struct Application {
    scheduler: SchedulerLoop,
    task_engine: Arc<TaskEngine>,
}

impl Application {
    /// 根据配置装配各组件，并把资源清单载入内存注册表
    pub async fn new(config: AppConfig) -> Result<Self> {
        let inventory = Inventory::load(&config.registry.inventory_path)
            .await
            .with_context(|| {
                format!("加载资源清单失败: {}", config.registry.inventory_path.display())
            })?;

        let registry = Arc::new(InMemoryRegistry::new());
        let entities = Arc::new(InMemoryEntityRepository::new());
        inventory.populate(&registry, &entities).await;

        let tasks = Arc::new(InMemoryTaskRepository::new());
        let jobs = Arc::new(InMemoryJobRepository::new());
        let metrics = Arc::new(MetricsCollector::new().context("创建指标收集器失败")?);

        let job_engine = Arc::new(JobEngine::new(
            jobs.clone(),
            tasks.clone(),
            registry.clone(),
            Arc::new(SshRemoteExecutor::new(config.remote.clone())),
            Arc::new(FileTemplateStore::new(
                config.templates.directory.clone(),
                config.templates.extension.clone(),
            )),
            JobEngineConfig::from(&config.job),
            metrics.clone(),
        ));

        let task_engine = Arc::new(TaskEngine::new(
            tasks.clone(),
            jobs.clone(),
            entities,
            registry,
            Arc::new(ProcessCalculator::new(config.calculation.clone())),
            Arc::new(UniformChooser),
            Arc::new(HostPolicyRegistry::from_config(&config.host_policies)),
            job_engine.clone(),
            TaskEngineConfig::from(&config.task),
            metrics.clone(),
        ));

        let scheduler = SchedulerLoop::new(
            tasks,
            jobs,
            task_engine.clone(),
            job_engine,
            SchedulerLoopConfig::from(&config.scheduler),
            metrics,
        );

        let app = Self {
            scheduler,
            task_engine,
        };
        app.seed_tasks(&inventory).await?;
        Ok(app)
    }

    async fn seed_tasks(&self, inventory: &Inventory) -> Result<()> {
        for task in &inventory.tasks {
            let projects = (!task.projects.is_empty()).then(|| task.projects.clone());
            self.task_engine
                .create(
                    task.entity_id,
                    &task.module,
                    task.parameters.clone(),
                    task.priority,
                    projects,
                )
                .await
                .with_context(|| {
                    format!("创建任务失败: 实体 {} 模块 {}", task.entity_id, task.module)
                })?;
        }
        info!("已载入 {} 个初始任务", inventory.tasks.len());
        Ok(())
    }

    /// 执行单轮调度
    pub async fn run_once(&self) -> Result<PassReport> {
        self.scheduler.run_pass().await.context("调度轮次失败")
    }

    /// 持续调度直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        self.scheduler.run(shutdown_rx).await;
    }
}
