use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("无效的任务消息: {0}")]
    InvalidMessage(String),
    #[error("任务类型 {0} 未注册处理器")]
    HandlerNotFound(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl WorkerError {
    pub fn invalid_message<S: Into<String>>(msg: S) -> Self {
        Self::InvalidMessage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::MessageQueue(_) | WorkerError::Network(_))
    }
}
