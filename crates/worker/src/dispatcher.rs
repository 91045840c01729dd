use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lessonforge_core::{DispatchOutcome, MessageHandler, TaskHandler, TaskMessage, TaskType};
use serde_json::Value;
use tracing::{debug, error, warn};

/// 任务分发器
///
/// 解析wire载荷、按任务类型选择处理器并调用，把结果折叠成
/// 单一的处置信号。确认broker消息不是这里的职责。
pub struct TaskDispatcher {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl TaskDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 注册任务处理器，同类型后注册的覆盖先注册的
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        debug!("注册任务处理器: {:?}", task_type);
        self.handlers.insert(task_type, handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// 分发一条已解码的消息
    ///
    /// 任何失败都在此收口，绝不向消费循环传播：
    /// - 解析/校验失败是永久性格式错误，重试无济于事，直接Reject
    /// - 未注册处理器是配置错误，同样Reject
    /// - 处理器报告的失败（Ok(false)）可重试
    /// - 处理器返回错误视为bug，保持与源系统一致的不对称策略，Reject
    pub async fn dispatch(&self, payload: &Value) -> DispatchOutcome {
        let message = match TaskMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("任务消息解析失败, 转入死信队列: {e}");
                return DispatchOutcome::Reject;
            }
        };

        let job_id = message.job_id().to_string();
        let task_type = message.task_type();
        let Some(handler) = self.handlers.get(&task_type) else {
            error!("任务类型 {:?} 未注册处理器: job_id={job_id}", task_type);
            return DispatchOutcome::Reject;
        };

        match handler.handle(&message).await {
            Ok(true) => {
                debug!("任务处理成功: job_id={job_id}");
                DispatchOutcome::Completed
            }
            Ok(false) => {
                warn!("任务处理失败, 等待重试: job_id={job_id}");
                DispatchOutcome::Retry
            }
            Err(e) => {
                error!("任务处理器异常, 转入死信队列: job_id={job_id}, error={e}");
                DispatchOutcome::Reject
            }
        }
    }
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageHandler for TaskDispatcher {
    async fn handle(&self, payload: Value) -> DispatchOutcome {
        self.dispatch(&payload).await
    }
}
