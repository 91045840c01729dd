use serde_json::{Map, Value};

use crate::errors::{WorkerError, WorkerResult};

/// 任务类型枚举
///
/// 与非Rust侧生产者互通：wire上既接受整数编码也接受名称
/// （大小写不敏感），其余一律视为解析失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    GenerateContent,
    CreateProduct,
}

impl TaskType {
    /// 整数编码（wire格式）
    pub fn code(&self) -> i64 {
        match self {
            TaskType::GenerateContent => 0,
            TaskType::CreateProduct => 1,
        }
    }

    /// 名称（wire格式）
    pub fn name(&self) -> &'static str {
        match self {
            TaskType::GenerateContent => "GENERATE_CONTENT",
            TaskType::CreateProduct => "CREATE_PRODUCT",
        }
    }

    /// 从wire值解析：先尝试整数编码，再尝试名称匹配
    pub fn from_value(value: &Value) -> WorkerResult<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(TaskType::GenerateContent),
                Some(1) => Ok(TaskType::CreateProduct),
                _ => Err(WorkerError::invalid_message(format!(
                    "未知的taskType编码: {n}"
                ))),
            },
            Value::String(s) => {
                if s.eq_ignore_ascii_case("GENERATE_CONTENT") {
                    Ok(TaskType::GenerateContent)
                } else if s.eq_ignore_ascii_case("CREATE_PRODUCT") {
                    Ok(TaskType::CreateProduct)
                } else {
                    Err(WorkerError::invalid_message(format!(
                        "未知的taskType名称: {s}"
                    )))
                }
            }
            other => Err(WorkerError::invalid_message(format!(
                "taskType必须是整数或字符串, 实际为: {other}"
            ))),
        }
    }
}

/// 产品类型枚举，决定由哪个下游渲染服务产出最终制品
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    AudioLesson,
    VideoLesson,
}

impl JobType {
    pub fn code(&self) -> i64 {
        match self {
            JobType::AudioLesson => 0,
            JobType::VideoLesson => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobType::AudioLesson => "AUDIO_LESSON",
            JobType::VideoLesson => "VIDEO_LESSON",
        }
    }

    /// 与TaskType相同的双重解析规则
    pub fn from_value(value: &Value) -> WorkerResult<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(JobType::AudioLesson),
                Some(1) => Ok(JobType::VideoLesson),
                _ => Err(WorkerError::invalid_message(format!(
                    "未知的jobType编码: {n}"
                ))),
            },
            Value::String(s) => {
                if s.eq_ignore_ascii_case("AUDIO_LESSON") {
                    Ok(JobType::AudioLesson)
                } else if s.eq_ignore_ascii_case("VIDEO_LESSON") {
                    Ok(JobType::VideoLesson)
                } else {
                    Err(WorkerError::invalid_message(format!(
                        "未知的jobType名称: {s}"
                    )))
                }
            }
            other => Err(WorkerError::invalid_message(format!(
                "jobType必须是整数或字符串, 实际为: {other}"
            ))),
        }
    }
}

/// 内容生成任务消息
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateContentMessage {
    pub job_id: String,
    pub topic: String,
    pub source_blob_names: Vec<String>,
}

/// 产品制作任务消息
#[derive(Debug, Clone, PartialEq)]
pub struct CreateProductMessage {
    pub job_id: String,
    pub content_blob_name: String,
    pub job_type: JobType,
    /// 透传给下游渲染服务的语音配置
    pub voice_config: Option<Map<String, Value>>,
}

/// 任务消息信封
///
/// 从解码后的wire载荷构造一次，不可变，处理结束后即丢弃。
/// 重试计数不在消息体内，而是作为broker消息头随消息传递。
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessage {
    GenerateContent(GenerateContentMessage),
    CreateProduct(CreateProductMessage),
}

impl TaskMessage {
    /// 解析并校验wire载荷
    ///
    /// 纯函数，无副作用。taskType缺失或不可识别、必填字段缺失或为空、
    /// jobType不可识别，均返回校验错误。
    pub fn parse(payload: &Value) -> WorkerResult<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| WorkerError::invalid_message("消息体必须是JSON对象"))?;

        let task_type_value = object
            .get("taskType")
            .ok_or_else(|| WorkerError::invalid_message("缺少taskType字段"))?;
        let task_type = TaskType::from_value(task_type_value)?;

        let job_id = required_string(object, "jobId")?;

        match task_type {
            TaskType::GenerateContent => {
                let topic = required_string(object, "topic")?;
                let source_blob_names = required_string_list(object, "sourceBlobNames")?;
                Ok(TaskMessage::GenerateContent(GenerateContentMessage {
                    job_id,
                    topic,
                    source_blob_names,
                }))
            }
            TaskType::CreateProduct => {
                let content_blob_name = required_string(object, "contentBlobName")?;
                let job_type_value = object
                    .get("jobType")
                    .ok_or_else(|| WorkerError::invalid_message("缺少jobType字段"))?;
                let job_type = JobType::from_value(job_type_value)?;
                let voice_config = match object.get("voiceConfig") {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(map)) => Some(map.clone()),
                    Some(other) => {
                        return Err(WorkerError::invalid_message(format!(
                            "voiceConfig必须是JSON对象, 实际为: {other}"
                        )))
                    }
                };
                Ok(TaskMessage::CreateProduct(CreateProductMessage {
                    job_id,
                    content_blob_name,
                    job_type,
                    voice_config,
                }))
            }
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            TaskMessage::GenerateContent(msg) => &msg.job_id,
            TaskMessage::CreateProduct(msg) => &msg.job_id,
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskMessage::GenerateContent(_) => TaskType::GenerateContent,
            TaskMessage::CreateProduct(_) => TaskType::CreateProduct,
        }
    }
}

/// 取必填的非空字符串字段
fn required_string(object: &Map<String, Value>, key: &str) -> WorkerResult<String> {
    match object.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(WorkerError::invalid_message(format!("{key}字段不能为空"))),
        Some(other) => Err(WorkerError::invalid_message(format!(
            "{key}字段必须是字符串, 实际为: {other}"
        ))),
        None => Err(WorkerError::invalid_message(format!("缺少{key}字段"))),
    }
}

/// 取必填的非空字符串数组字段，元素也不允许为空
fn required_string_list(object: &Map<String, Value>, key: &str) -> WorkerResult<Vec<String>> {
    let values = match object.get(key) {
        Some(Value::Array(values)) => values,
        Some(other) => {
            return Err(WorkerError::invalid_message(format!(
                "{key}字段必须是数组, 实际为: {other}"
            )))
        }
        None => return Err(WorkerError::invalid_message(format!("缺少{key}字段"))),
    };

    if values.is_empty() {
        return Err(WorkerError::invalid_message(format!("{key}字段不能为空")));
    }

    let mut items = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::String(s) if !s.is_empty() => items.push(s.clone()),
            other => {
                return Err(WorkerError::invalid_message(format!(
                    "{key}的元素必须是非空字符串, 实际为: {other}"
                )))
            }
        }
    }
    Ok(items)
}
