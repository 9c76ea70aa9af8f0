use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 任务参数映射，键有序，比较时与插入顺序无关
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// 任务参数中与放置/并行化相关的键
pub mod param_keys {
    pub const NODE_COUNT: &str = "node_count";
    pub const WALLTIME_HOURS: &str = "walltime_hours";
    pub const PARALLELIZATION: &str = "parallelization";
    pub const FIX_KPAR: &str = "fix_kpar";
    pub const KPOINTS_GEN: &str = "kpoints_gen";

    /// 生成作业描述时忽略的键，保证只在放置参数上不同的作业共享同一个远程目录名
    pub const PLACEMENT_KEYS: [&str; 5] =
        [NODE_COUNT, WALLTIME_HOURS, PARALLELIZATION, FIX_KPAR, KPOINTS_GEN];

    pub fn is_placement_key(key: &str) -> bool {
        PLACEMENT_KEYS.contains(&key)
    }

    pub fn node_count(parameters: &super::Parameters) -> u32 {
        parameters
            .get(NODE_COUNT)
            .and_then(|v| v.as_u64())
            .map(|n| n.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(1)
    }

    pub fn walltime_hours(parameters: &super::Parameters) -> f64 {
        parameters
            .get(WALLTIME_HOURS)
            .and_then(|v| v.as_f64())
            .unwrap_or(4.0)
    }

    pub fn fix_kpar(parameters: &super::Parameters) -> Option<u64> {
        parameters
            .get(FIX_KPAR)
            .and_then(|v| v.as_u64())
            .filter(|k| *k > 0)
    }
}

/// 任务状态
///
/// 状态码与历史数据保持一致：
///
/// | 状态 | 码 |
/// |------|----|
/// | Held | -2 |
/// | Failed | -1 |
/// | Ready | 0 |
/// | Running | 1 |
/// | Completed | 2 |
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "HELD")]
    Held,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl TaskState {
    pub fn code(self) -> i32 {
        match self {
            TaskState::Held => -2,
            TaskState::Failed => -1,
            TaskState::Ready => 0,
            TaskState::Running => 1,
            TaskState::Completed => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -2 => Some(TaskState::Held),
            -1 => Some(TaskState::Failed),
            0 => Some(TaskState::Ready),
            1 => Some(TaskState::Running),
            2 => Some(TaskState::Completed),
            _ => None,
        }
    }

    /// 状态只能向前推进，例外是 Failed->Ready（人工重试）、Running->Ready（作业回收后重新排队）
    /// 以及解除外部挂起 Held->Ready。Completed 为终态。
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Completed, _) => false,
            (_, Held) => true,
            (Held, Ready) => true,
            (Failed, Ready) => true,
            (Running, Ready) => true,
            (Ready, Running | Completed | Failed) => true,
            (Running, Completed | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Held => write!(f, "held"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
        }
    }
}

/// 作业状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl JobState {
    pub fn code(self) -> i32 {
        match self {
            JobState::Failed => -1,
            JobState::Ready => 0,
            JobState::Running => 1,
            JobState::Completed => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(JobState::Failed),
            0 => Some(JobState::Ready),
            1 => Some(JobState::Running),
            2 => Some(JobState::Completed),
            _ => None,
        }
    }

    /// Ready 和 Running 视为活跃状态，同一任务同时最多一个
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Ready | JobState::Running)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Ready, Running | Failed) | (Running, Completed | Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed => write!(f, "failed"),
            JobState::Ready => write!(f, "ready"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
        }
    }
}

/// 提交脚本中的walltime文本格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WalltimeFormat {
    /// `DD:HH:MM:SS`
    #[default]
    DayInclusive,
    /// `HH:MM:SS`，小时数不按天折算
    HourOnly,
}

impl WalltimeFormat {
    pub fn format(self, seconds: i64) -> String {
        let total = seconds.max(0);
        let minutes = (total % 3600) / 60;
        let secs = total % 60;
        match self {
            WalltimeFormat::DayInclusive => {
                let days = total / 86_400;
                let hours = (total % 86_400) / 3600;
                format!("{days:02}:{hours:02}:{minutes:02}:{secs:02}")
            }
            WalltimeFormat::HourOnly => {
                let hours = total / 3600;
                format!("{hours:02}:{minutes:02}:{secs:02}")
            }
        }
    }
}

/// 计算函数返回的作业指令
///
/// 指令对调度核心是不透明的键值对，这里只解析提交脚本需要的字段，其余字段被忽略。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchSpec {
    pub path: Option<PathBuf>,
    pub serial: Option<bool>,
    pub binary: Option<String>,
    pub mpi: Option<String>,
    pub pipes: Option<String>,
    pub header: Option<String>,
    pub footer: Option<String>,
    pub threads: Option<u32>,
    pub cpu_per_core: Option<u32>,
    pub cpu_per_task: Option<u32>,
    /// 秒
    pub walltime: Option<f64>,
    pub job_factor: Option<u32>,
}

impl LaunchSpec {
    pub fn from_instructions(instructions: &Parameters) -> SchedulerResult<Self> {
        serde_json::from_value(serde_json::Value::Object(instructions.clone()))
            .map_err(|e| SchedulerError::invalid_params(format!("无法解析作业指令: {e}")))
    }

    pub fn is_serial(&self) -> bool {
        self.serial.unwrap_or(false)
    }
}
