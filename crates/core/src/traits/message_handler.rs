use async_trait::async_trait;
use serde_json::Value;

/// 单条消息的处置结果，驱动传输层的ack/重试/死信决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 处理成功，确认消息
    Completed,
    /// 瞬时失败，递增重试计数后重新发布
    Retry,
    /// 永久失败（格式错误、未注册处理器、处理器异常），直接进入死信队列
    Reject,
}

/// 注入到传输层的消息处理回调
///
/// 传输层只关心处置结果，不关心处理内容；确认消息是传输层的职责，
/// 实现方不得自行ack。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> DispatchOutcome;
}
