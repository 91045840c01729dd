use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use lessonforge_core::{
    DispatchOutcome, TaskHandler, TaskMessage, TaskType, WorkerError, WorkerResult,
};
use lessonforge_worker::TaskDispatcher;
use serde_json::json;
use tokio::sync::Mutex;

/// Mock处理器：按预设结果序列应答并记录收到的消息
struct MockHandler {
    task_type: TaskType,
    results: Mutex<VecDeque<WorkerResult<bool>>>,
    calls: Mutex<Vec<TaskMessage>>,
}

impl MockHandler {
    fn new(task_type: TaskType, results: Vec<WorkerResult<bool>>) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn handle(&self, message: &TaskMessage) -> WorkerResult<bool> {
        self.calls.lock().await.push(message.clone());
        self.results.lock().await.pop_front().unwrap_or(Ok(true))
    }
}

fn generate_content_payload() -> serde_json::Value {
    json!({
        "taskType": 0,
        "jobId": "j1",
        "topic": "细胞分裂",
        "sourceBlobNames": ["bio/chapter3.pdf"]
    })
}

#[tokio::test]
async fn test_successful_dispatch_invokes_handler_once() {
    let handler = MockHandler::new(TaskType::GenerateContent, vec![Ok(true)]);
    let mut dispatcher = TaskDispatcher::new();
    dispatcher.register(handler.clone());

    let outcome = dispatcher.dispatch(&generate_content_payload()).await;

    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(handler.call_count().await, 1);

    // 处理器拿到的是解析后的消息
    let calls = handler.calls.lock().await;
    match &calls[0] {
        TaskMessage::GenerateContent(msg) => {
            assert_eq!(msg.job_id, "j1");
            assert_eq!(msg.topic, "细胞分裂");
        }
        other => panic!("意外的消息变体: {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_task_type_rejects_without_invoking_any_handler() {
    let handler = MockHandler::new(TaskType::GenerateContent, vec![]);
    let mut dispatcher = TaskDispatcher::new();
    dispatcher.register(handler.clone());

    let payload = json!({
        "taskType": "PUBLISH_COURSE",
        "jobId": "j1",
        "topic": "t",
        "sourceBlobNames": ["a.pdf"]
    });
    let outcome = dispatcher.dispatch(&payload).await;

    assert_eq!(outcome, DispatchOutcome::Reject);
    assert_eq!(handler.call_count().await, 0);
}

#[tokio::test]
async fn test_malformed_payload_rejects() {
    let dispatcher = TaskDispatcher::new();
    // 缺少taskType
    let outcome = dispatcher.dispatch(&json!({"jobId": "j2"})).await;
    assert_eq!(outcome, DispatchOutcome::Reject);
}

#[tokio::test]
async fn test_missing_handler_registration_rejects() {
    // 只注册了内容生成，产品制作消息无处可去
    let handler = MockHandler::new(TaskType::GenerateContent, vec![]);
    let mut dispatcher = TaskDispatcher::new();
    dispatcher.register(handler.clone());

    let payload = json!({
        "taskType": 1,
        "jobId": "j3",
        "jobType": 0,
        "contentBlobName": "content/j3.json"
    });
    let outcome = dispatcher.dispatch(&payload).await;

    assert_eq!(outcome, DispatchOutcome::Reject);
    assert_eq!(handler.call_count().await, 0);
}

#[tokio::test]
async fn test_handler_reported_failure_retries() {
    let handler = MockHandler::new(TaskType::GenerateContent, vec![Ok(false)]);
    let mut dispatcher = TaskDispatcher::new();
    dispatcher.register(handler.clone());

    let outcome = dispatcher.dispatch(&generate_content_payload()).await;

    assert_eq!(outcome, DispatchOutcome::Retry);
    assert_eq!(handler.call_count().await, 1);
}

#[tokio::test]
async fn test_handler_error_rejects() {
    let handler = MockHandler::new(
        TaskType::GenerateContent,
        vec![Err(WorkerError::TaskExecution("下游拒绝".to_string()))],
    );
    let mut dispatcher = TaskDispatcher::new();
    dispatcher.register(handler.clone());

    let outcome = dispatcher.dispatch(&generate_content_payload()).await;

    assert_eq!(outcome, DispatchOutcome::Reject);
    assert_eq!(handler.call_count().await, 1);
}

#[tokio::test]
async fn test_dispatch_routes_by_task_type() {
    let content_handler = MockHandler::new(TaskType::GenerateContent, vec![Ok(true)]);
    let product_handler = MockHandler::new(TaskType::CreateProduct, vec![Ok(true)]);
    let mut dispatcher = TaskDispatcher::new();
    dispatcher.register(content_handler.clone());
    dispatcher.register(product_handler.clone());
    assert_eq!(dispatcher.handler_count(), 2);

    let payload = json!({
        "taskType": "CREATE_PRODUCT",
        "jobId": "j4",
        "jobType": "VIDEO_LESSON",
        "contentBlobName": "content/j4.json"
    });
    let outcome = dispatcher.dispatch(&payload).await;

    assert_eq!(outcome, DispatchOutcome::Completed);
    assert_eq!(content_handler.call_count().await, 0);
    assert_eq!(product_handler.call_count().await, 1);
}
