use async_trait::async_trait;
use lessonforge_core::{TaskHandler, TaskMessage, TaskType, WorkerError, WorkerResult};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{info, warn};

/// 内容生成任务处理器
///
/// 实际的检索、LLM编排和课件产出在内容生成服务内完成，
/// 这里只负责投递任务并把HTTP结果折叠成处理结论：
/// 2xx成功，4xx视为任务被永久拒绝，其余（5xx、网络错误）可重试。
pub struct GenerateContentHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl GenerateContentHandler {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/internal/jobs/generate", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TaskHandler for GenerateContentHandler {
    fn task_type(&self) -> TaskType {
        TaskType::GenerateContent
    }

    async fn handle(&self, message: &TaskMessage) -> WorkerResult<bool> {
        let TaskMessage::GenerateContent(message) = message else {
            return Err(WorkerError::Internal(
                "消息类型与处理器不匹配".to_string(),
            ));
        };

        info!(
            "投递内容生成任务: job_id={}, topic={}, sources={}",
            message.job_id,
            message.topic,
            message.source_blob_names.len()
        );

        let body = json!({
            "jobId": message.job_id,
            "topic": message.topic,
            "sourceBlobNames": message.source_blob_names,
        });
        relay_job(&self.client, &self.endpoint, &message.job_id, body).await
    }
}

/// 产品制作任务处理器
///
/// 把渲染任务投递给媒体服务，由其下载课件内容、合成语音并编码
/// 音频或视频成品。
pub struct CreateProductHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl CreateProductHandler {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/internal/jobs/render", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl TaskHandler for CreateProductHandler {
    fn task_type(&self) -> TaskType {
        TaskType::CreateProduct
    }

    async fn handle(&self, message: &TaskMessage) -> WorkerResult<bool> {
        let TaskMessage::CreateProduct(message) = message else {
            return Err(WorkerError::Internal(
                "消息类型与处理器不匹配".to_string(),
            ));
        };

        info!(
            "投递产品制作任务: job_id={}, job_type={}, content={}",
            message.job_id,
            message.job_type.name(),
            message.content_blob_name
        );

        let body = json!({
            "jobId": message.job_id,
            "jobType": message.job_type.name(),
            "contentBlobName": message.content_blob_name,
            "voiceConfig": message.voice_config,
        });
        relay_job(&self.client, &self.endpoint, &message.job_id, body).await
    }
}

/// 投递任务到协作服务并把HTTP结果映射成处理结论
async fn relay_job(
    client: &reqwest::Client,
    endpoint: &str,
    job_id: &str,
    body: serde_json::Value,
) -> WorkerResult<bool> {
    let response = match client.post(endpoint).json(&body).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("调用协作服务失败, 等待重试: job_id={job_id}, error={e}");
            return Ok(false);
        }
    };

    let status = response.status();
    if status.is_success() {
        return Ok(true);
    }
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        // 协作服务明确拒绝了任务，重投同样会被拒绝
        return Err(WorkerError::TaskExecution(format!(
            "协作服务拒绝任务: job_id={job_id}, status={status}"
        )));
    }

    warn!("协作服务暂时不可用, 等待重试: job_id={job_id}, status={status}");
    Ok(false)
}
