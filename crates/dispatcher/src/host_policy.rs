//! 主机策略覆盖层
//!
//! 各集群的特殊要求（程序路径、MPI启动命令、并行参数、前后置命令、walltime格式）
//! 以规则形式注册，放置逻辑中不出现按主机名分支的代码。

use std::collections::BTreeMap;

use serde_json::{json, Value};

use scheduler_config::{HostPolicyConfig, HostPolicyRule, KindWalltime};
use scheduler_domain::{param_keys, Allocation, Host, Parameters, WalltimeFormat};

/// 作业指令中的walltime键（秒）
const WALLTIME: &str = "walltime";

/// 单条主机策略
pub trait HostPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, host: &Host, allocation: Option<&Allocation>) -> bool;

    /// 调整传给计算函数的参数
    fn patch_parameters(&self, _host: &Host, _parameters: &mut Parameters) {}

    /// 调整计算函数返回的作业指令
    fn patch_instructions(
        &self,
        _kind: &str,
        _parameters: &Parameters,
        _instructions: &mut Parameters,
    ) {
    }

    fn walltime_format(&self) -> Option<WalltimeFormat> {
        None
    }
}

fn kind_walltime_seconds(
    table: &BTreeMap<String, KindWalltime>,
    kind: &str,
    parameters: &Parameters,
) -> f64 {
    let hours = param_keys::walltime_hours(parameters);
    table
        .get(kind)
        .map(|w| w.seconds(hours))
        .unwrap_or(hours * 3600.0)
}

/// 对所有主机生效的默认策略
///
/// 按核数推导并行参数：`ncore = ppn`，`ppn` 能被4整除时 `kpar = 4`，偶数时 `kpar = 2`。
/// 计算函数未给出walltime时按计算类别补上。
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    kind_walltime: BTreeMap<String, KindWalltime>,
}

impl DefaultPolicy {
    pub fn new(kind_walltime: BTreeMap<String, KindWalltime>) -> Self {
        Self { kind_walltime }
    }
}

impl HostPolicy for DefaultPolicy {
    fn name(&self) -> &str {
        "default"
    }

    fn applies_to(&self, _host: &Host, _allocation: Option<&Allocation>) -> bool {
        true
    }

    fn patch_parameters(&self, host: &Host, parameters: &mut Parameters) {
        let mut tags = Parameters::new();
        if host.ppn > 0 {
            tags.insert("ncore".to_string(), json!(host.ppn));
            if host.ppn % 4 == 0 {
                tags.insert("kpar".to_string(), json!(4));
            } else if host.ppn % 2 == 0 {
                tags.insert("kpar".to_string(), json!(2));
            }
        }
        parameters.insert(param_keys::PARALLELIZATION.to_string(), Value::Object(tags));
    }

    fn patch_instructions(&self, kind: &str, parameters: &Parameters, instructions: &mut Parameters) {
        if !instructions.contains_key(WALLTIME) {
            let seconds = kind_walltime_seconds(&self.kind_walltime, kind, parameters);
            instructions.insert(WALLTIME.to_string(), json!(seconds));
        }
    }
}

/// 由配置规则构造的策略
#[derive(Debug, Clone)]
pub struct RulePolicy {
    rule: HostPolicyRule,
    kind_walltime: BTreeMap<String, KindWalltime>,
}

impl RulePolicy {
    pub fn new(rule: HostPolicyRule, kind_walltime: BTreeMap<String, KindWalltime>) -> Self {
        Self {
            rule,
            kind_walltime,
        }
    }
}

impl HostPolicy for RulePolicy {
    fn name(&self) -> &str {
        &self.rule.name
    }

    fn applies_to(&self, host: &Host, allocation: Option<&Allocation>) -> bool {
        self.rule
            .matches(Some(host.name.as_str()), allocation.map(|a| a.name.as_str()))
    }

    fn patch_parameters(&self, _host: &Host, parameters: &mut Parameters) {
        if let Some(per_node) = self.rule.kpar_per_node {
            let kpar = param_keys::fix_kpar(parameters).unwrap_or_else(|| {
                u64::from(per_node) * u64::from(param_keys::node_count(parameters))
            });
            let mut tags = Parameters::new();
            tags.insert("kpar".to_string(), json!(kpar));
            parameters.insert(param_keys::PARALLELIZATION.to_string(), Value::Object(tags));
        }
    }

    fn patch_instructions(&self, kind: &str, parameters: &Parameters, instructions: &mut Parameters) {
        for (key, value) in &self.rule.set {
            instructions.insert(key.clone(), value.clone());
        }

        let parallel = instructions.get("serial").and_then(Value::as_bool) == Some(false);
        if parallel {
            for (key, value) in &self.rule.set_when_parallel {
                instructions.insert(key.clone(), value.clone());
            }
        }

        if !self.rule.header.is_empty() {
            instructions.insert("header".to_string(), json!(self.rule.header.join("\n")));
        }
        if !self.rule.footer.is_empty() {
            instructions.insert("footer".to_string(), json!(self.rule.footer.join("\n")));
        }
        if self.rule.force_walltime {
            let seconds = kind_walltime_seconds(&self.kind_walltime, kind, parameters);
            instructions.insert(WALLTIME.to_string(), json!(seconds));
        }
    }

    fn walltime_format(&self) -> Option<WalltimeFormat> {
        self.rule.walltime_format
    }
}

/// 策略注册表
///
/// 默认策略先执行，其余策略按注册顺序执行，后者覆盖前者。主机未知时整体不生效。
pub struct HostPolicyRegistry {
    policies: Vec<Box<dyn HostPolicy>>,
}

impl HostPolicyRegistry {
    pub fn new(default: DefaultPolicy) -> Self {
        Self {
            policies: vec![Box::new(default)],
        }
    }

    pub fn from_config(config: &HostPolicyConfig) -> Self {
        let mut registry = Self::new(DefaultPolicy::new(config.kind_walltime.clone()));
        for rule in &config.rules {
            registry.register(Box::new(RulePolicy::new(
                rule.clone(),
                config.kind_walltime.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, policy: Box<dyn HostPolicy>) {
        self.policies.push(policy);
    }

    fn matching<'a>(
        &'a self,
        host: &'a Host,
        allocation: Option<&'a Allocation>,
    ) -> impl Iterator<Item = &'a dyn HostPolicy> + 'a {
        self.policies
            .iter()
            .map(|p| p.as_ref())
            .filter(move |p| p.applies_to(host, allocation))
    }

    pub fn matching_names(&self, host: &Host, allocation: Option<&Allocation>) -> Vec<String> {
        self.matching(host, allocation)
            .map(|p| p.name().to_string())
            .collect()
    }

    /// 返回调整后的参数副本
    pub fn patch_parameters(
        &self,
        host: Option<&Host>,
        allocation: Option<&Allocation>,
        parameters: &Parameters,
    ) -> Parameters {
        let mut patched = parameters.clone();
        if let Some(host) = host {
            for policy in self.matching(host, allocation) {
                policy.patch_parameters(host, &mut patched);
            }
        }
        patched
    }

    /// 返回调整后的作业指令副本
    pub fn patch_instructions(
        &self,
        host: Option<&Host>,
        allocation: Option<&Allocation>,
        kind: &str,
        parameters: &Parameters,
        instructions: &Parameters,
    ) -> Parameters {
        let mut patched = instructions.clone();
        if let Some(host) = host {
            for policy in self.matching(host, allocation) {
                policy.patch_instructions(kind, parameters, &mut patched);
            }
        }
        patched
    }

    pub fn walltime_format(&self, host: Option<&Host>, allocation: Option<&Allocation>) -> WalltimeFormat {
        host.and_then(|host| {
            self.matching(host, allocation)
                .filter_map(|p| p.walltime_format())
                .last()
        })
        .unwrap_or_default()
    }
}
