use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigError;

/// walltime 超时作业的处理方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredJobAction {
    /// 直接回收，由任务重新评估
    #[default]
    Collect,
    /// 标记作业失败并释放分配槽位
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pass_interval_seconds: u64,
    /// 每轮最多尝试放置的任务数
    pub tasks_per_pass: usize,
    pub expired_job_action: ExpiredJobAction,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_seconds: 60,
            tasks_per_pass: 50,
            expired_job_action: ExpiredJobAction::Collect,
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.pass_interval_seconds,
            "scheduler.pass_interval_seconds",
        )?;
        ValidationUtils::validate_count(self.tasks_per_pass as u64, "scheduler.tasks_per_pass", 10000)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub default_node_count: u32,
    pub default_walltime_hours: f64,
    pub priority_factor: i32,
    pub priority_cap: i32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_node_count: 1,
            default_walltime_hours: 4.0,
            priority_factor: 4,
            priority_cap: 50,
        }
    }
}

impl ConfigValidator for TaskConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(
            u64::from(self.default_node_count),
            "task.default_node_count",
            1024,
        )?;
        ValidationUtils::validate_positive(
            self.default_walltime_hours,
            "task.default_walltime_hours",
        )?;
        if self.priority_factor < 0 || self.priority_cap < 0 {
            return Err(ConfigError::Validation(
                "task.priority_factor and task.priority_cap must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub max_nodes: u32,
    pub serial_walltime_seconds: i64,
    pub default_walltime_seconds: i64,
    /// 提交后的宽限期，期间不查询队列
    pub grace_period_seconds: i64,
    pub script_name: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_nodes: 32,
            serial_walltime_seconds: 4 * 24 * 3600,
            default_walltime_seconds: 3600,
            grace_period_seconds: 600,
            script_name: "auto.q".to_string(),
        }
    }
}

impl ConfigValidator for JobConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(u64::from(self.max_nodes), "job.max_nodes", 1024)?;
        if self.serial_walltime_seconds <= 0 || self.default_walltime_seconds <= 0 {
            return Err(ConfigError::Validation(
                "job walltime defaults must be greater than 0".to_string(),
            ));
        }
        if self.grace_period_seconds < 0 {
            return Err(ConfigError::Validation(
                "job.grace_period_seconds cannot be negative".to_string(),
            ));
        }
        ValidationUtils::validate_not_empty(&self.script_name, "job.script_name")?;
        if self.script_name.contains('/') {
            return Err(ConfigError::Validation(
                "job.script_name must be a plain file name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("config/templates"),
            extension: "q".to_string(),
        }
    }
}

impl ConfigValidator for TemplateConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.directory.to_string_lossy(), "templates.directory")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_command: String,
    pub scp_command: String,
    pub connect_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_command: "ssh".to_string(),
            scp_command: "scp".to_string(),
            connect_timeout_seconds: 10,
            command_timeout_seconds: 300,
        }
    }
}

impl ConfigValidator for RemoteConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.ssh_command, "remote.ssh_command")?;
        ValidationUtils::validate_not_empty(&self.scp_command, "remote.scp_command")?;
        ValidationUtils::validate_timeout_seconds(
            self.connect_timeout_seconds,
            "remote.connect_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.command_timeout_seconds,
            "remote.command_timeout_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub inventory_path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            inventory_path: PathBuf::from("config/inventory.toml"),
        }
    }
}

impl ConfigValidator for RegistryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(
            &self.inventory_path.to_string_lossy(),
            "registry.inventory_path",
        )
    }
}

/// 外部计算命令，通过标准输入输出交换JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            command: "compute".to_string(),
            args: Vec::new(),
            timeout_seconds: 600,
        }
    }
}

impl ConfigValidator for CalculationConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.command, "calculation.command")?;
        ValidationUtils::validate_timeout_seconds(
            self.timeout_seconds,
            "calculation.timeout_seconds",
        )?;
        Ok(())
    }
}
