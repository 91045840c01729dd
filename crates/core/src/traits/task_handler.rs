use async_trait::async_trait;

use crate::errors::WorkerResult;
use crate::models::{TaskMessage, TaskType};

/// 按任务类型注册的任务处理器
///
/// 返回值语义：
/// - `Ok(true)` 处理成功
/// - `Ok(false)` 瞬时失败，可重试（如下游服务暂时不可用）
/// - `Err(_)` 非预期错误，视为bug，不重试直接进入死信队列
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 该处理器负责的任务类型
    fn task_type(&self) -> TaskType;

    async fn handle(&self, message: &TaskMessage) -> WorkerResult<bool>;
}
