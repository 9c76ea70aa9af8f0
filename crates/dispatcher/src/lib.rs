//! 调度核心
//!
//! 任务引擎负责选择资源并调用计算函数，作业引擎负责提交、轮询和回收，
//! 调度循环按固定间隔驱动两者。

pub mod host_policy;
pub mod job_engine;
pub mod scheduler;
pub mod selection;
pub mod task_engine;
pub mod template;

pub use host_policy::{DefaultPolicy, HostPolicy, HostPolicyRegistry, RulePolicy};
pub use job_engine::{JobEngine, JobEngineConfig, JobRequest};
pub use scheduler::{PassReport, SchedulerLoop, SchedulerLoopConfig};
pub use selection::UniformChooser;
pub use task_engine::{PlacementOutcome, PlacementRequest, TaskEngine, TaskEngineConfig};
pub use template::render_template;
