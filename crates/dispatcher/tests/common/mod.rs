#![allow(dead_code)]

use std::sync::Arc;

use scheduler_config::{ExpiredJobAction, HostPolicyConfig};
use scheduler_dispatcher::{
    HostPolicyRegistry, JobEngine, JobEngineConfig, SchedulerLoop, SchedulerLoopConfig,
    TaskEngine, TaskEngineConfig,
};
use scheduler_domain::{Chooser, Task};
use scheduler_observability::MetricsCollector;
use scheduler_testing_utils::{SequenceChooser, TestEnv};

pub struct Harness {
    pub env: TestEnv,
    pub task_engine: Arc<TaskEngine>,
    pub job_engine: Arc<JobEngine>,
    pub scheduler: SchedulerLoop,
}

pub struct HarnessOptions {
    pub chooser: Arc<dyn Chooser>,
    pub policies: HostPolicyConfig,
    pub expired_job_action: ExpiredJobAction,
    pub tasks_per_pass: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            chooser: Arc::new(SequenceChooser::first()),
            policies: HostPolicyConfig::default(),
            expired_job_action: ExpiredJobAction::Collect,
            tasks_per_pass: 50,
        }
    }
}

pub async fn harness() -> Harness {
    harness_with(TestEnv::new().await, HarnessOptions::default())
}

pub fn harness_with(env: TestEnv, options: HarnessOptions) -> Harness {
    let metrics = Arc::new(MetricsCollector::new().unwrap());

    let job_engine = Arc::new(JobEngine::new(
        env.jobs.clone(),
        env.tasks.clone(),
        env.registry.clone(),
        env.remote.clone(),
        env.templates.clone(),
        JobEngineConfig::default(),
        metrics.clone(),
    ));
    let task_engine = Arc::new(TaskEngine::new(
        env.tasks.clone(),
        env.jobs.clone(),
        env.entities.clone(),
        env.registry.clone(),
        env.calculator.clone(),
        options.chooser,
        Arc::new(HostPolicyRegistry::from_config(&options.policies)),
        job_engine.clone(),
        TaskEngineConfig::default(),
        metrics.clone(),
    ));
    let scheduler = SchedulerLoop::new(
        env.tasks.clone(),
        env.jobs.clone(),
        task_engine.clone(),
        job_engine.clone(),
        SchedulerLoopConfig {
            tasks_per_pass: options.tasks_per_pass,
            expired_job_action: options.expired_job_action,
            ..SchedulerLoopConfig::default()
        },
        metrics,
    );

    Harness {
        env,
        task_engine,
        job_engine,
        scheduler,
    }
}

pub fn params(value: serde_json::Value) -> scheduler_domain::Parameters {
    value.as_object().cloned().unwrap_or_default()
}

impl Harness {
    /// 在默认实体上创建 static 任务
    pub async fn static_task(&self, parameters: serde_json::Value) -> Task {
        self.task_engine
            .create(42, "static", params(parameters), None, None)
            .await
            .unwrap()
    }

    pub async fn reload(&self, task_id: i64) -> Task {
        use scheduler_domain::TaskRepository;
        self.env.tasks.get_by_id(task_id).await.unwrap().unwrap()
    }
}
