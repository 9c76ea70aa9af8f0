use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use scheduler_domain::{Parameters, WalltimeFormat};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigError;

/// 按计算类别确定walltime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KindWalltime {
    /// 固定秒数
    Fixed { seconds: f64 },
    /// 任务 `walltime_hours` 的倍数
    Scaled { scale: f64 },
}

impl KindWalltime {
    pub fn seconds(&self, walltime_hours: f64) -> f64 {
        match self {
            KindWalltime::Fixed { seconds } => *seconds,
            KindWalltime::Scaled { scale } => walltime_hours * 3600.0 * scale,
        }
    }
}

/// 主机/分配特定的提交调整规则
///
/// `host` 与 `allocation` 按名称匹配，两者都设置时必须同时满足。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostPolicyRule {
    pub name: String,
    pub host: Option<String>,
    pub allocation: Option<String>,
    pub walltime_format: Option<WalltimeFormat>,
    /// 设置后 `kpar = fix_kpar 或 kpar_per_node × 节点数`，不再按核数推导
    pub kpar_per_node: Option<u32>,
    /// 用类别walltime覆盖计算函数给出的walltime
    pub force_walltime: bool,
    /// 无条件合并进作业指令
    pub set: Parameters,
    /// 仅当作业指令明确为并行（`serial = false`）时合并
    pub set_when_parallel: Parameters,
    pub header: Vec<String>,
    pub footer: Vec<String>,
}

impl HostPolicyRule {
    pub fn matches(&self, host_name: Option<&str>, allocation_name: Option<&str>) -> bool {
        let host_ok = match &self.host {
            Some(expected) => host_name == Some(expected.as_str()),
            None => true,
        };
        let allocation_ok = match &self.allocation {
            Some(expected) => allocation_name == Some(expected.as_str()),
            None => true,
        };
        host_ok && allocation_ok
    }
}

impl ConfigValidator for HostPolicyRule {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.name, "host_policies.rules.name")?;
        if self.host.is_none() && self.allocation.is_none() {
            return Err(ConfigError::Validation(format!(
                "host policy rule '{}' must name a host or an allocation",
                self.name
            )));
        }
        if self.kpar_per_node == Some(0) {
            return Err(ConfigError::Validation(format!(
                "host policy rule '{}': kpar_per_node must be greater than 0",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostPolicyConfig {
    pub kind_walltime: BTreeMap<String, KindWalltime>,
    pub rules: Vec<HostPolicyRule>,
}

impl Default for HostPolicyConfig {
    fn default() -> Self {
        Self {
            kind_walltime: BTreeMap::from([
                (
                    "wavefunction".to_string(),
                    KindWalltime::Fixed { seconds: 1800.0 },
                ),
                (
                    "hse_relaxation".to_string(),
                    KindWalltime::Scaled { scale: 2.0 },
                ),
            ]),
            rules: Vec::new(),
        }
    }
}

impl ConfigValidator for HostPolicyConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        for (kind, walltime) in &self.kind_walltime {
            let value = match walltime {
                KindWalltime::Fixed { seconds } => *seconds,
                KindWalltime::Scaled { scale } => *scale,
            };
            ValidationUtils::validate_positive(value, &format!("host_policies.kind_walltime.{kind}"))?;
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}
