use std::sync::Arc;

use async_trait::async_trait;
use lessonforge_core::{
    DispatchOutcome, MessageHandler, QueueTransport, TaskHandler, WorkerConfig, WorkerError,
    WorkerResult,
};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::dispatcher::TaskDispatcher;

/// 以计数信号量限制并发处理数的消息处理器包装
///
/// 传输层按prefetch接收消息，这里控制同时真正处理的数量：
/// 两个上限保护的是不同资源，各自独立配置。
pub struct ConcurrencyGatedHandler {
    inner: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
}

impl ConcurrencyGatedHandler {
    pub fn new(inner: Arc<dyn MessageHandler>, max_concurrent_tasks: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks)),
        }
    }

    /// 当前可用的并发额度
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl MessageHandler for ConcurrencyGatedHandler {
    async fn handle(&self, payload: Value) -> DispatchOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // 信号量已关闭，只会发生在关闭竞争中
                warn!("并发信号量已关闭, 消息等待重试");
                return DispatchOutcome::Retry;
            }
        };
        self.inner.handle(payload).await
    }
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    config: WorkerConfig,
    transport: Arc<dyn QueueTransport>,
    dispatcher: TaskDispatcher,
}

impl WorkerServiceBuilder {
    pub fn new(config: WorkerConfig, transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            config,
            transport,
            dispatcher: TaskDispatcher::new(),
        }
    }

    /// 注册任务处理器
    pub fn register_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.dispatcher.register(handler);
        self
    }

    pub fn build(self) -> WorkerService {
        let gated = ConcurrencyGatedHandler::new(
            Arc::new(self.dispatcher),
            self.config.max_concurrent_tasks,
        );
        WorkerService {
            config: self.config,
            transport: self.transport,
            handler: Arc::new(gated),
            is_running: RwLock::new(false),
            shutdown_tx: RwLock::new(None),
            dlq_monitor: Mutex::new(None),
        }
    }
}

/// Worker生命周期控制器
///
/// 对外的进程行为都在这里：启动传输层消费、限制并发、
/// 可选的死信队列深度监控，以及幂等的优雅关闭。
pub struct WorkerService {
    config: WorkerConfig,
    transport: Arc<dyn QueueTransport>,
    handler: Arc<ConcurrencyGatedHandler>,
    is_running: RwLock<bool>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
    dlq_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerService {
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// 启动Worker服务
    pub async fn start(&self) -> WorkerResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(WorkerError::Internal("Worker服务已在运行".to_string()));
        }

        info!(
            "启动Worker服务: {}, 最大并发任务数: {}",
            self.config.worker_id, self.config.max_concurrent_tasks
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.transport.start(Arc::clone(&self.handler) as Arc<dyn MessageHandler>).await?;

        if self.config.dlq_monitor_enabled {
            let monitor = tokio::spawn(dlq_monitor_loop(
                Arc::clone(&self.transport),
                self.config.dlq_check_interval_seconds,
                self.config.dlq_alert_threshold,
                shutdown_rx,
            ));
            *self.dlq_monitor.lock().await = Some(monitor);
        }
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        *is_running = true;
        info!("Worker服务 {} 启动完成", self.config.worker_id);
        Ok(())
    }

    /// 停止Worker服务
    ///
    /// 幂等：关闭进行中或已完成时再次调用是no-op。
    /// 等价于收到一次关闭信号，供嵌入和测试使用。
    pub async fn stop(&self) -> WorkerResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            debug!("Worker服务未在运行, 忽略停止请求");
            return Ok(());
        }

        info!("停止Worker服务: {}", self.config.worker_id);

        if let Some(shutdown_tx) = self.shutdown_tx.write().await.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(monitor) = self.dlq_monitor.lock().await.take() {
            if monitor.await.is_err() {
                warn!("死信监控任务未正常退出");
            }
        }

        self.transport.stop().await?;

        *is_running = false;
        info!("Worker服务 {} 已停止", self.config.worker_id);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}

/// 周期性记录死信队列深度，超过告警阈值时输出警告
///
/// 纯观测，不做任何自动恢复动作。
async fn dlq_monitor_loop(
    transport: Arc<dyn QueueTransport>,
    check_interval_seconds: u64,
    alert_threshold: u32,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_secs(check_interval_seconds));
    // 首次tick立即触发，跳过
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("死信监控退出");
                break;
            }
            _ = ticker.tick() => {
                match transport.dead_letter_info().await {
                    Ok(info) if info.message_count >= alert_threshold => {
                        warn!(
                            "死信队列积压 {} 条消息, 超过告警阈值 {}, 请人工介入",
                            info.message_count, alert_threshold
                        );
                    }
                    Ok(info) => {
                        debug!("死信队列深度: {}", info.message_count);
                    }
                    Err(e) => {
                        error!("查询死信队列深度失败: {e}");
                    }
                }
            }
        }
    }
}
