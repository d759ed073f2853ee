use thiserror::Error;

/// 文档存储客户端返回的错误分类
///
/// 由存储客户端完成错误码到分类的映射，本层只根据分类决定是否重试。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("请求被限流, 建议 {retry_after_ms}ms 后重试")]
    Throttled { retry_after_ms: u64 },
    #[error("请求超时")]
    Timeout,
    #[error("存储服务暂不可用: {0}")]
    ServiceUnavailable(String),
    #[error("文档不存在: {id}")]
    NotFound { id: String },
    #[error("文档已存在: {id}")]
    Conflict { id: String },
    #[error("文档版本不匹配: {id}")]
    PreconditionFailed { id: String },
    #[error("无效的请求: {0}")]
    BadRequest(String),
    #[error("脚本 {script} 执行失败: {reason}")]
    ScriptFailed {
        script: String,
        reason: String,
        transient: bool,
    },
}

impl StoreError {
    /// 是否为瞬时错误(限流、超时、服务抖动)
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Throttled { .. } | StoreError::Timeout | StoreError::ServiceUnavailable(_) => {
                true
            }
            StoreError::ScriptFailed { transient, .. } => *transient,
            _ => false,
        }
    }

    /// 限流时存储端给出的最短等待时间
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            StoreError::Throttled { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("无效的参数: {0}")]
    InvalidArgument(String),
    #[error("队列 {queues:?} 对应多个不同的队列提供者")]
    AmbiguousQueueProvider { queues: Vec<String> },
    #[error("获取分布式锁超时: {resource}")]
    DistributedLockTimeout { resource: String },
    #[error("分布式锁已丢失: {resource}")]
    LockLost { resource: String },
    #[error("存储不可用: {operation} 重试 {attempts} 次后仍失败 - {message}")]
    StorageUnavailable {
        operation: String,
        attempts: u32,
        message: String,
    },
    #[error("操作已取消")]
    OperationCanceled,
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn lock_timeout<S: Into<String>>(resource: S) -> Self {
        Self::DistributedLockTimeout {
            resource: resource.into(),
        }
    }
    pub fn lock_lost<S: Into<String>>(resource: S) -> Self {
        Self::LockLost {
            resource: resource.into(),
        }
    }
    /// 配置错误与参数错误对本次调用是致命的, 重试没有意义
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidArgument(_)
                | SchedulerError::AmbiguousQueueProvider { .. }
                | SchedulerError::Configuration(_)
                | SchedulerError::Internal(_)
        )
    }
    /// 调用方可以重试整个工作单元的协调类错误
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::DistributedLockTimeout { .. }
            | SchedulerError::LockLost { .. }
            | SchedulerError::StorageUnavailable { .. } => true,
            SchedulerError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
    pub fn is_canceled(&self) -> bool {
        matches!(self, SchedulerError::OperationCanceled)
    }
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::Store(StoreError::NotFound { .. }))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
