use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use lessonforge_core::{AppConfig, QueueTransport};
use lessonforge_infrastructure::RabbitMqWorkQueue;
use lessonforge_worker::{
    CreateProductHandler, GenerateContentHandler, WorkerServiceBuilder,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("lessonforge-worker")
        .version("1.0.0")
        .about("AI课程生成后台的任务队列Worker")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径, 缺省时按默认路径查找"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID, 覆盖配置文件中的值"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let worker_id = matches.get_one::<String>("worker-id");
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    // 初始化日志系统
    init_logging(log_level, log_format)?;

    info!("启动lessonforge任务队列Worker");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    // 加载配置
    let mut config =
        AppConfig::load(config_path.map(String::as_str)).context("加载配置失败")?;
    if let Some(id) = worker_id {
        config.worker.worker_id = id.clone();
    }
    info!("Worker ID: {}", config.worker.worker_id);

    // 顶层兜底：任何错误都记录完整上下文，且尽力走过优雅关闭路径
    if let Err(e) = run(config).await {
        error!("Worker异常退出: {e:#}");
        return Err(e);
    }
    Ok(())
}

/// 组合根：构造共享依赖、装配各组件并驱动启动/关闭
async fn run(config: AppConfig) -> Result<()> {
    // 共享HTTP客户端，构造一次后注入各处理器
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.services.request_timeout_seconds))
        .build()
        .context("构建HTTP客户端失败")?;

    let transport = Arc::new(
        RabbitMqWorkQueue::new(
            config.message_queue.clone(),
            Duration::from_secs(config.worker.shutdown_grace_seconds),
        )
        .await
        .context("初始化消息队列失败")?,
    );

    let service = WorkerServiceBuilder::new(
        config.worker.clone(),
        Arc::clone(&transport) as Arc<dyn QueueTransport>,
    )
    .register_handler(Arc::new(GenerateContentHandler::new(
        http_client.clone(),
        &config.services.content_service_url,
    )))
    .register_handler(Arc::new(CreateProductHandler::new(
        http_client,
        &config.services.media_service_url,
    )))
    .build();

    if let Err(e) = service.start().await {
        // 启动失败也要释放broker连接
        let _ = transport.stop().await;
        return Err(e).context("启动Worker服务失败");
    }

    // 等待关闭信号
    wait_for_shutdown_signal().await;
    info!("收到关闭信号, 开始优雅关闭...");

    // 宽限期之外再留一点余量给连接关闭
    let shutdown_budget = Duration::from_secs(config.worker.shutdown_grace_seconds + 10);
    match tokio::time::timeout(shutdown_budget, service.stop()).await {
        Ok(Ok(())) => info!("Worker已优雅关闭"),
        Ok(Err(e)) => error!("关闭Worker时发生错误: {e}"),
        Err(_) => warn!("关闭Worker超时, 强制退出"),
    }

    info!("lessonforge任务队列Worker已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 等待关闭信号，SIGINT和SIGTERM都触发同一条优雅关闭路径
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
