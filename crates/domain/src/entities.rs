use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{param_keys, JobState, Parameters, TaskState};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 计算实体
///
/// 任务所属的科学计算对象，决定任务的工作目录根路径、工作量大小以及默认项目。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub root_path: PathBuf,
    /// 工作量规模，用于推导默认优先级
    pub workload_size: u32,
    /// 外部挂起标记，非空时该实体的任务都不可调度
    #[serde(default)]
    pub holds: Vec<String>,
    #[serde(default)]
    pub project_ids: BTreeSet<i64>,
}

impl Entity {
    pub fn is_held(&self) -> bool {
        !self.holds.is_empty()
    }
}

/// 任务唯一键：(实体, 模块, 参数)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub entity_id: i64,
    pub module: String,
    pub parameters: String,
}

/// 任务定义
///
/// 一个待完成的计算工作单元。任务由计算模块名和参数映射描述，必须关联至少一个项目才能被放置。
///
/// # 字段说明
///
/// - `module`: 外部计算函数的模块名
/// - `parameters`: 传给计算函数的参数
/// - `priority`: 优先级，数值越小越紧急
/// - `project_ids`: 关联项目，放置时在其中选择
/// - `finished_at`: 只在进入 Completed 时设置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub entity_id: i64,
    pub module: String,
    pub parameters: Parameters,
    pub state: TaskState,
    pub priority: i32,
    pub project_ids: BTreeSet<i64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        entity_id: i64,
        module: String,
        parameters: Parameters,
        priority: i32,
        project_ids: BTreeSet<i64>,
    ) -> Self {
        Self {
            id: 0, // 将由仓储生成
            entity_id,
            module,
            parameters,
            state: TaskState::Ready,
            priority: priority.max(0),
            project_ids,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 默认优先级：`min(factor × 工作量, cap)`
    pub fn default_priority(workload_size: u32, factor: i32, cap: i32) -> i32 {
        let raw = i64::from(workload_size) * i64::from(factor);
        raw.clamp(0, i64::from(cap.max(0))) as i32
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            entity_id: self.entity_id,
            module: self.module.clone(),
            // Map 按键排序，序列化结果与插入顺序无关
            parameters: serde_json::Value::Object(self.parameters.clone()).to_string(),
        }
    }

    /// 合并项目集合（并集），返回新增的项目数
    pub fn merge_projects<I: IntoIterator<Item = i64>>(&mut self, project_ids: I) -> usize {
        let before = self.project_ids.len();
        self.project_ids.extend(project_ids);
        self.project_ids.len() - before
    }

    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    pub fn transition_to(&mut self, next: TaskState) -> SchedulerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::invalid_transition(
                format!("任务 {}", self.id),
                self.state,
                next,
            ));
        }
        self.state = next;
        Ok(())
    }

    pub fn start(&mut self) -> SchedulerResult<()> {
        self.transition_to(TaskState::Running)
    }

    /// 标记完成并记录完成时间
    pub fn complete(&mut self) -> SchedulerResult<()> {
        self.transition_to(TaskState::Completed)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn hold(&mut self) -> SchedulerResult<()> {
        self.transition_to(TaskState::Held)
    }

    pub fn fail(&mut self) -> SchedulerResult<()> {
        self.transition_to(TaskState::Failed)
    }

    /// 作业回收后重新排队，等待下一轮重新评估
    pub fn requeue(&mut self) -> SchedulerResult<()> {
        if self.state != TaskState::Running && self.state != TaskState::Ready {
            return Err(SchedulerError::invalid_transition(
                format!("任务 {}", self.id),
                self.state,
                TaskState::Ready,
            ));
        }
        self.transition_to(TaskState::Ready)
    }

    /// 人工重试失败的任务
    pub fn retry(&mut self) -> SchedulerResult<()> {
        if self.state != TaskState::Failed {
            return Err(SchedulerError::invalid_transition(
                format!("任务 {}", self.id),
                self.state,
                TaskState::Ready,
            ));
        }
        self.transition_to(TaskState::Ready)
    }

    /// 解除外部挂起
    pub fn release(&mut self) -> SchedulerResult<()> {
        if self.state != TaskState::Held {
            return Err(SchedulerError::invalid_transition(
                format!("任务 {}", self.id),
                self.state,
                TaskState::Ready,
            ));
        }
        self.transition_to(TaskState::Ready)
    }

    /// 在参数副本上填充未设置的放置参数，持久化的参数（也是唯一键的一部分）保持不变
    pub fn placement_parameters(&self, node_count: u32, walltime_hours: f64) -> Parameters {
        let mut parameters = self.parameters.clone();
        parameters
            .entry(param_keys::NODE_COUNT)
            .or_insert_with(|| serde_json::json!(node_count));
        parameters
            .entry(param_keys::WALLTIME_HOURS)
            .or_insert_with(|| serde_json::json!(walltime_hours));
        parameters
    }

    pub fn node_count(&self) -> u32 {
        param_keys::node_count(&self.parameters)
    }

    pub fn walltime_hours(&self) -> f64 {
        param_keys::walltime_hours(&self.parameters)
    }
}

/// 作业定义
///
/// 任务的一次具体批处理队列提交。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub task_id: i64,
    pub entity_id: i64,
    pub account_id: i64,
    pub allocation_id: i64,
    pub state: JobState,
    /// 提交后由远程队列分配
    pub queue_id: Option<String>,
    pub path: PathBuf,
    pub run_path: String,
    pub description: String,
    pub nodes: u32,
    pub ncpus: u32,
    pub walltime_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn walltime(&self) -> Duration {
        Duration::seconds(self.walltime_seconds)
    }

    pub fn transition_to(&mut self, next: JobState) -> SchedulerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::invalid_transition(
                format!("作业 {}", self.id),
                self.state,
                next,
            ));
        }
        self.state = next;
        Ok(())
    }

    /// 自创建以来经过的时间是否超过了申请的walltime
    pub fn walltime_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.walltime()
    }

    pub fn walltime_expired(&self) -> bool {
        self.walltime_expired_at(Utc::now())
    }

    /// 创建后的宽限期内队列列表可能还未刷新
    pub fn within_grace_window(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now - grace < self.created_at
    }

    /// 作业路径相对于实体根路径的子目录
    pub fn subdir(path: &Path, entity_root: &Path) -> String {
        let relative = path.strip_prefix(entity_root).unwrap_or(path);
        relative
            .to_string_lossy()
            .trim_matches('/')
            .replace('/', "_")
    }

    /// 生成稳定的作业描述，同时作为远程工作目录名
    ///
    /// 格式为 `{实体id}_{子目录}{后缀}`，后缀来自任务参数中除放置相关键以外的部分，按键排序。
    /// 数组和映射会被展开，不适合出现在目录名中的字符替换为 `-`。
    pub fn describe(entity: &Entity, path: &Path, parameters: &Parameters) -> String {
        let suffix: String = parameters
            .iter()
            .filter(|(key, _)| !param_keys::is_placement_key(key))
            .map(|(key, value)| format!("_{}:{}", path_safe(key), path_token(value)))
            .collect();

        format!(
            "{}_{}{}",
            entity.id,
            Self::subdir(path, &entity.root_path),
            suffix
        )
    }
}

/// 参数值在目录名中的形式：数组以 `-` 连接，映射展开为以 `,` 连接的 `k=v`
fn path_token(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => path_safe(s),
        serde_json::Value::Array(items) => items
            .iter()
            .map(path_token)
            .collect::<Vec<_>>()
            .join("-"),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, value)| format!("{}={}", path_safe(key), path_token(value)))
            .collect::<Vec<_>>()
            .join(","),
        other => path_safe(&other.to_string()),
    }
}

fn path_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "_-.:=+,@%".contains(c) {
                c
            } else {
                '-'
            }
        })
        .collect()
}
