//! 外部协作方接口

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::Entity;
use crate::resources::{Account, Host};
use crate::value_objects::Parameters;
use scheduler_errors::SchedulerResult;

/// 计算函数的返回值
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CalculationResult {
    /// 计算类别，例如 `relaxation`、`wavefunction`
    pub kind: String,
    pub converged: bool,
    /// 作业指令，为空表示无需再提交作业
    #[serde(default)]
    pub instructions: Parameters,
}

impl CalculationResult {
    pub fn needs_job(&self) -> bool {
        !self.instructions.is_empty()
    }
}

/// 外部科学计算函数
#[async_trait]
pub trait Calculator: Send + Sync {
    async fn compute(
        &self,
        module: &str,
        entity: &Entity,
        parameters: &Parameters,
    ) -> SchedulerResult<CalculationResult>;
}

/// 通过账户访问远程主机
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// 拷贝本地目录到远程运行目录并提交脚本，返回队列id
    async fn submit(
        &self,
        account: &Account,
        host: &Host,
        source: &Path,
        run_path: &str,
        script: &str,
    ) -> SchedulerResult<String>;

    /// 主机队列中正在运行的作业id
    async fn list_running(&self, account: &Account, host: &Host) -> SchedulerResult<HashSet<String>>;

    async fn move_files(
        &self,
        account: &Account,
        host: &Host,
        run_path: &str,
        destination: &Path,
        pattern: &str,
        remove_source: bool,
    ) -> SchedulerResult<()>;

    async fn execute(
        &self,
        account: &Account,
        host: &Host,
        command: &str,
        ignore_failure: bool,
    ) -> SchedulerResult<String>;
}

/// 提交脚本模板存储
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn load(&self, name: &str) -> SchedulerResult<Option<String>>;
}

/// 均匀随机选择
pub trait Chooser: Send + Sync {
    /// 在 `0..len` 中选一个下标，`len == 0` 时返回 `None`
    fn pick(&self, len: usize) -> Option<usize>;
}

pub fn choose<'a, T>(chooser: &dyn Chooser, items: &'a [T]) -> Option<&'a T> {
    chooser.pick(items.len()).and_then(|i| items.get(i))
}
