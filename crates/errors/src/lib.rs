use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("资源不可用: {0}")]
    ResourceUnavailable(String),
    #[error("分配配置错误: {0}")]
    AllocationMisconfigured(String),
    #[error("远程调用失败: {operation} - {message}")]
    RemoteCall { operation: String, message: String },
    #[error("非法的状态转换: {entity} 从 {from} 到 {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },
    #[error("任务 {task_id} 已存在活跃的作业")]
    DuplicateActiveJob { task_id: i64 },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },
    #[error("计算实体未找到: {id}")]
    EntityNotFound { id: i64 },
    #[error("{kind}未找到: {id}")]
    ResourceNotFound { kind: &'static str, id: i64 },
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("IO错误: {0}")]
    Io(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn resource_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ResourceUnavailable(msg.into())
    }
    pub fn misconfigured<S: Into<String>>(msg: S) -> Self {
        Self::AllocationMisconfigured(msg.into())
    }
    pub fn remote<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::RemoteCall {
            operation: operation.into(),
            message: message.into(),
        }
    }
    pub fn invalid_transition<E, F, T>(entity: E, from: F, to: T) -> Self
    where
        E: Into<String>,
        F: ToString,
        T: ToString,
    {
        Self::InvalidTransition {
            entity: entity.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn job_not_found(id: i64) -> Self {
        Self::JobNotFound { id }
    }
    pub fn entity_not_found(id: i64) -> Self {
        Self::EntityNotFound { id }
    }
    pub fn resource_not_found(kind: &'static str, id: i64) -> Self {
        Self::ResourceNotFound { kind, id }
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    /// 致命错误需要人工介入，对应任务会被标记为失败
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::AllocationMisconfigured(_)
                | SchedulerError::Configuration(_)
                | SchedulerError::Internal(_)
        )
    }
    /// 可重试错误在下一轮调度中自动重试，不改变持久化状态
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::ResourceUnavailable(_)
                | SchedulerError::RemoteCall { .. }
                | SchedulerError::DuplicateActiveJob { .. }
                | SchedulerError::Io(_)
                | SchedulerError::Timeout(_)
        )
    }
    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::ResourceUnavailable(_) => "计算资源暂时不足，请稍后重试",
            SchedulerError::AllocationMisconfigured(_) => "集群分配配置有误，请联系管理员",
            SchedulerError::RemoteCall { .. } => "远程集群暂时无法访问，请稍后重试",
            SchedulerError::TaskNotFound { .. } => "请求的任务不存在",
            SchedulerError::JobNotFound { .. } => "请求的作业不存在",
            SchedulerError::EntityNotFound { .. } => "请求的计算实体不存在",
            SchedulerError::InvalidTaskParams(_) => "任务参数配置有误",
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
