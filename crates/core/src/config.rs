use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub message_queue: MessageQueueConfig,
    pub worker: WorkerConfig,
    pub services: ServicesConfig,
}

/// 消息队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueueConfig {
    pub url: String,
    pub task_exchange: String,
    pub task_queue: String,
    pub task_routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
    /// 每通道未确认消息上限（QoS），与worker并发上限相互独立
    pub prefetch_count: u16,
    pub max_retries: i32,
    pub connection_timeout_seconds: u64,
}

/// Worker配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// 并发处理任务数上限
    pub max_concurrent_tasks: usize,
    /// 关闭时等待在途任务完成的宽限期
    pub shutdown_grace_seconds: u64,
    pub dlq_monitor_enabled: bool,
    pub dlq_check_interval_seconds: u64,
    pub dlq_alert_threshold: u32,
}

/// 下游协作服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub content_service_url: String,
    pub media_service_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            task_exchange: "lesson.tasks".to_string(),
            task_queue: "lesson_tasks".to_string(),
            task_routing_key: "lesson.task".to_string(),
            dead_letter_exchange: "lesson.tasks.dlx".to_string(),
            dead_letter_queue: "lesson_tasks_dead".to_string(),
            dead_letter_routing_key: "lesson.task.dead".to_string(),
            prefetch_count: 8,
            max_retries: 3,
            connection_timeout_seconds: 30,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            max_concurrent_tasks: 2,
            shutdown_grace_seconds: 30,
            dlq_monitor_enabled: true,
            dlq_check_interval_seconds: 60,
            dlq_alert_threshold: 10,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            content_service_url: "http://localhost:8081".to_string(),
            media_service_url: "http://localhost:8082".to_string(),
            request_timeout_seconds: 300,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            message_queue: MessageQueueConfig::default(),
            worker: WorkerConfig::default(),
            services: ServicesConfig::default(),
        }
    }
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    format!("lessonforge-worker-{host}")
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序：
    /// 1. 默认配置
    /// 2. 配置文件（TOML格式）
    /// 3. 环境变量覆盖（前缀: LESSONFORGE_）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = toml::to_string(&AppConfig::default()).context("序列化默认配置失败")?;
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(&defaults, FileFormat::Toml));

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/worker.toml",
                "worker.toml",
                "/etc/lessonforge/worker.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LESSONFORGE")
                .separator("_")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置有效性
    pub fn validate(&self) -> Result<()> {
        self.message_queue
            .validate()
            .context("消息队列配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.services.validate().context("协作服务配置验证失败")?;
        Ok(())
    }
}

impl MessageQueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("RabbitMQ URL不能为空"));
        }
        if !self.url.starts_with("amqp://") && !self.url.starts_with("amqps://") {
            return Err(anyhow::anyhow!("RabbitMQ URL必须是AMQP格式"));
        }
        for (name, value) in [
            ("task_exchange", &self.task_exchange),
            ("task_queue", &self.task_queue),
            ("task_routing_key", &self.task_routing_key),
            ("dead_letter_exchange", &self.dead_letter_exchange),
            ("dead_letter_queue", &self.dead_letter_queue),
            ("dead_letter_routing_key", &self.dead_letter_routing_key),
        ] {
            if value.is_empty() {
                return Err(anyhow::anyhow!("{name}不能为空"));
            }
        }
        if self.prefetch_count == 0 {
            return Err(anyhow::anyhow!("prefetch_count必须大于0"));
        }
        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能为负数"));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("worker_id不能为空"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }
        if self.shutdown_grace_seconds == 0 {
            return Err(anyhow::anyhow!("关闭宽限期必须大于0"));
        }
        if self.dlq_monitor_enabled && self.dlq_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("死信监控间隔必须大于0"));
        }
        Ok(())
    }
}

impl ServicesConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("content_service_url", &self.content_service_url),
            ("media_service_url", &self.media_service_url),
        ] {
            if url.is_empty() {
                return Err(anyhow::anyhow!("{name}不能为空"));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!("{name}必须是HTTP(S)地址"));
            }
        }
        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("请求超时时间必须大于0"));
        }
        Ok(())
    }
}
