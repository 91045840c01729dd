use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::WorkerResult;
use crate::traits::MessageHandler;

/// 死信队列状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterInfo {
    pub message_count: u32,
}

/// 队列传输层抽象接口
///
/// Worker生命周期控制器只依赖该接口，便于在测试中替换实现。
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// 启动消费循环，每条消息交给handler处理
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> WorkerResult<()>;

    /// 停止消费：取消消费循环，给在途任务一段宽限期，随后关闭连接
    async fn stop(&self) -> WorkerResult<()>;

    /// 查询死信队列深度
    async fn dead_letter_info(&self) -> WorkerResult<DeadLetterInfo>;

    /// 将至多limit条死信消息以清零的重试计数重新投入主队列，
    /// 返回实际移动的条数。由运维手动触发，不会自动执行。
    async fn requeue_dead_letters(&self, limit: u32) -> WorkerResult<u32>;
}
