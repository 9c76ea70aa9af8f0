//! TOML 资源清单
//!
//! 嵌入式部署时用清单文件初始化内存注册表，清单中的任务在启动时按幂等方式创建。

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use scheduler_domain::{Account, Allocation, Entity, Host, Parameters, Project};
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::in_memory::{InMemoryEntityRepository, InMemoryRegistry};

/// 清单中的初始任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryTask {
    pub entity_id: i64,
    pub module: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub priority: Option<i32>,
    /// 为空时使用实体的项目
    #[serde(default)]
    pub projects: BTreeSet<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Inventory {
    pub hosts: Vec<Host>,
    pub accounts: Vec<Account>,
    pub allocations: Vec<Allocation>,
    pub projects: Vec<Project>,
    pub entities: Vec<Entity>,
    pub tasks: Vec<InventoryTask>,
}

impl Inventory {
    pub async fn load(path: &Path) -> SchedulerResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SchedulerError::config_error(format!("无法读取资源清单 {}: {}", path.display(), e))
        })?;
        let inventory = Self::parse(&content)?;
        info!(
            "加载资源清单 {}: {} 个主机, {} 个分配, {} 个项目, {} 个实体",
            path.display(),
            inventory.hosts.len(),
            inventory.allocations.len(),
            inventory.projects.len(),
            inventory.entities.len()
        );
        Ok(inventory)
    }

    pub fn parse(content: &str) -> SchedulerResult<Self> {
        let inventory: Inventory = toml::from_str(content)
            .map_err(|e| SchedulerError::config_error(format!("资源清单格式错误: {e}")))?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// 检查引用完整性
    pub fn validate(&self) -> SchedulerResult<()> {
        let host_ids: HashSet<i64> = self.hosts.iter().map(|h| h.id).collect();
        let allocation_ids: HashSet<i64> = self.allocations.iter().map(|a| a.id).collect();
        let project_ids: HashSet<i64> = self.projects.iter().map(|p| p.id).collect();
        let entity_ids: HashSet<i64> = self.entities.iter().map(|e| e.id).collect();

        for host in &self.hosts {
            if host.ppn == 0 {
                return Err(SchedulerError::config_error(format!(
                    "主机 {} 的 ppn 必须大于0",
                    host.name
                )));
            }
        }
        for account in &self.accounts {
            if !host_ids.contains(&account.host_id) {
                return Err(SchedulerError::config_error(format!(
                    "账户 {} 引用了不存在的主机 {}",
                    account.username, account.host_id
                )));
            }
        }
        for allocation in &self.allocations {
            if !host_ids.contains(&allocation.host_id) {
                return Err(SchedulerError::config_error(format!(
                    "分配 {} 引用了不存在的主机 {}",
                    allocation.name, allocation.host_id
                )));
            }
        }
        for project in &self.projects {
            if let Some(missing) = project
                .allocation_ids
                .iter()
                .find(|id| !allocation_ids.contains(id))
            {
                return Err(SchedulerError::config_error(format!(
                    "项目 {} 引用了不存在的分配 {}",
                    project.name, missing
                )));
            }
        }
        for entity in &self.entities {
            if let Some(missing) = entity.project_ids.iter().find(|id| !project_ids.contains(id)) {
                return Err(SchedulerError::config_error(format!(
                    "实体 {} 引用了不存在的项目 {}",
                    entity.name, missing
                )));
            }
        }
        for task in &self.tasks {
            if !entity_ids.contains(&task.entity_id) {
                return Err(SchedulerError::config_error(format!(
                    "任务 {} 引用了不存在的实体 {}",
                    task.module, task.entity_id
                )));
            }
        }
        Ok(())
    }

    /// 填充内存注册表和实体仓储
    pub async fn populate(
        &self,
        registry: &InMemoryRegistry,
        entities: &InMemoryEntityRepository,
    ) {
        for host in &self.hosts {
            registry.add_host(host.clone()).await;
        }
        for account in &self.accounts {
            registry.add_account(account.clone()).await;
        }
        for allocation in &self.allocations {
            registry.add_allocation(allocation.clone()).await;
        }
        for project in &self.projects {
            registry.add_project(project.clone()).await;
        }
        for entity in &self.entities {
            entities.insert(entity.clone()).await;
        }
    }
}
