use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    host_policy::HostPolicyConfig,
    logging::ObservabilityConfig,
    scheduler::{
        CalculationConfig, JobConfig, RegistryConfig, RemoteConfig, SchedulerConfig, TaskConfig,
        TemplateConfig,
    },
};
use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub task: TaskConfig,
    pub job: JobConfig,
    pub templates: TemplateConfig,
    pub remote: RemoteConfig,
    pub registry: RegistryConfig,
    pub calculation: CalculationConfig,
    pub observability: ObservabilityConfig,
    pub host_policies: HostPolicyConfig,
}

impl AppConfig {
    /// 加载配置
    ///
    /// 依次读取配置文件（显式路径或默认路径之一）和 `SCHEDULER__` 前缀的环境变量，
    /// 例如 `SCHEDULER__JOB__MAX_NODES=16`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/scheduler.toml",
                "scheduler.toml",
                "/etc/hpc-scheduler/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.scheduler.validate()?;
        self.task.validate()?;
        self.job.validate()?;
        self.templates.validate()?;
        self.remote.validate()?;
        self.registry.validate()?;
        self.calculation.validate()?;
        self.observability.validate()?;
        self.host_policies.validate()?;
        Ok(())
    }
}
