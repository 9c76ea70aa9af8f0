//! 资源注册表实体
//!
//! 主机、账户、分配与项目。调度核心只读取这些记录并在分配上执行原子的占用/释放。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 主机使用的批处理队列系统
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueSystem {
    #[default]
    Slurm,
    Pbs,
}

impl QueueSystem {
    pub fn submit_command(self) -> &'static str {
        match self {
            QueueSystem::Slurm => "sbatch",
            QueueSystem::Pbs => "qsub",
        }
    }
}

impl fmt::Display for QueueSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueSystem::Slurm => write!(f, "slurm"),
            QueueSystem::Pbs => write!(f, "pbs"),
        }
    }
}

/// 计算集群
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub address: String,
    /// 每个节点的核数
    pub ppn: u32,
    /// 提交脚本模板名
    pub template_name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub queue_system: QueueSystem,
    /// 可执行程序别名表
    #[serde(default)]
    pub binaries: BTreeMap<String, String>,
    #[serde(default)]
    pub default_binary: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Host {
    /// 解析要运行的程序路径
    ///
    /// 先查别名表；未请求程序时使用默认程序；请求值本身像路径（含 `/` 或以 `~` 开头）时原样使用。
    pub fn resolve_binary(&self, requested: Option<&str>) -> Option<String> {
        let name = match requested {
            Some(name) => name,
            None => self.default_binary.as_deref()?,
        };
        if let Some(path) = self.binaries.get(name) {
            return Some(path.clone());
        }
        if name.contains('/') || name.starts_with('~') {
            return Some(name.to_string());
        }
        None
    }
}

/// 用户在主机上的登录凭据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: i64,
    pub user_id: i64,
    pub host_id: i64,
    pub username: String,
    /// 远程运行目录的根路径
    pub run_path: PathBuf,
}

/// 主机上的计算配额
///
/// `capacity` 为同时占用的作业槽位上限，`in_use` 由注册表原子维护。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub id: i64,
    pub name: String,
    /// 提交脚本中的计费键
    pub key: String,
    pub host_id: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    pub capacity: u32,
    #[serde(default)]
    pub in_use: u32,
    #[serde(default)]
    pub user_ids: BTreeSet<i64>,
    /// 串行作业的walltime（秒），未设置时使用全局默认值
    #[serde(default)]
    pub serial_walltime_seconds: Option<i64>,
}

impl Allocation {
    pub fn has_capacity(&self) -> bool {
        self.in_use < self.capacity
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.in_use)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Held,
    #[default]
    Active,
}

/// 项目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub state: ProjectState,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub user_ids: BTreeSet<i64>,
    #[serde(default)]
    pub allocation_ids: BTreeSet<i64>,
}

impl Project {
    /// 可运行：未被挂起且处于激活状态
    pub fn is_schedulable(&self) -> bool {
        self.active && self.state == ProjectState::Active
    }
}

/// 项目查询过滤条件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectFilter {
    /// 限定在这些项目中
    pub ids: Option<BTreeSet<i64>>,
    /// 只保留在该主机上有分配的项目
    pub host_id: Option<i64>,
    pub schedulable_only: bool,
}

impl ProjectFilter {
    pub fn among(ids: &BTreeSet<i64>) -> Self {
        Self {
            ids: Some(ids.clone()),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host_id: i64) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn schedulable(mut self) -> Self {
        self.schedulable_only = true;
        self
    }

    pub fn matches_project(&self, project: &Project) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&project.id) {
                return false;
            }
        }
        !self.schedulable_only || project.is_schedulable()
    }
}
