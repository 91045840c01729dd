use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use lessonforge_core::{
    DeadLetterInfo, DispatchOutcome, MessageHandler, MessageQueueConfig, QueueTransport,
    WorkerError, WorkerResult,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 重试计数消息头
///
/// 重试计数由客户端自行维护：重试时以递增后的头重新发布一条
/// 消息体完全相同的新消息，而不是走broker原生的requeue路径，
/// 因为broker不为我们跟踪投递次数。
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// RabbitMQ任务队列传输层
///
/// 连接生命周期内的状态机：未连接 -> 已连接 -> 消费中 -> 排空 -> 已关闭。
/// 连接和拓扑声明在构造时完成，`start`开始消费，`stop`排空并关闭。
pub struct RabbitMqWorkQueue {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
    config: MessageQueueConfig,
    shutdown_grace: Duration,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
    /// 在途消息处理任务，按delivery tag跟踪，关闭时据此排空
    in_flight: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

/// 消费循环共享的上下文
struct ConsumerContext {
    channel: Arc<Mutex<Channel>>,
    config: MessageQueueConfig,
    handler: Arc<dyn MessageHandler>,
    in_flight: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl RabbitMqWorkQueue {
    /// 连接RabbitMQ并声明全部拓扑
    pub async fn new(
        config: MessageQueueConfig,
        shutdown_grace: Duration,
    ) -> WorkerResult<Self> {
        let connection = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            Connection::connect(&config.url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| WorkerError::MessageQueue(format!("连接RabbitMQ超时: {}", config.url)))?
        .map_err(|e| WorkerError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("创建通道失败: {e}")))?;

        // prefetch限制broker推给本通道的未确认消息数，
        // 与worker侧的并发信号量互补：前者保护broker和网络，后者保护本机资源
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("设置QoS失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        declare_topology(&channel, &config).await?;

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            config,
            shutdown_grace,
            consumer_handle: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// 获取连接状态
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl QueueTransport for RabbitMqWorkQueue {
    async fn start(&self, handler: Arc<dyn MessageHandler>) -> WorkerResult<()> {
        let mut consumer_handle = self.consumer_handle.lock().await;
        if consumer_handle.is_some() {
            return Err(WorkerError::Internal("消费循环已在运行".to_string()));
        }

        let consumer = {
            let channel = self.channel.lock().await;
            channel
                .basic_consume(
                    &self.config.task_queue,
                    &format!("{}-consumer", self.config.task_queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| WorkerError::MessageQueue(format!("创建消费者失败: {e}")))?
        };

        let context = ConsumerContext {
            channel: Arc::clone(&self.channel),
            config: self.config.clone(),
            handler,
            in_flight: Arc::clone(&self.in_flight),
        };
        *consumer_handle = Some(tokio::spawn(consume_loop(consumer, context)));

        info!("开始消费队列: {}", self.config.task_queue);
        Ok(())
    }

    async fn stop(&self) -> WorkerResult<()> {
        // 先取消消费循环，不再接收新消息
        if let Some(handle) = self.consumer_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
            info!("消费循环已停止");
        }

        // 给在途任务一段宽限期完成，超时的任务被中止，
        // 其消息保持未确认，broker之后会重新投递（at-least-once的边界情形，
        // 下游处理器必须容忍重复投递）
        let drained: Vec<(u64, JoinHandle<()>)> =
            self.in_flight.lock().await.drain().collect();
        if !drained.is_empty() {
            info!("等待 {} 个在途消息处理任务完成", drained.len());
        }
        let deadline = Instant::now() + self.shutdown_grace;
        for (delivery_tag, handle) in drained {
            let remaining = deadline.duration_since(Instant::now());
            let abort_handle = handle.abort_handle();
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("在途消息处理超出宽限期, 中止任务: delivery_tag={delivery_tag}");
                abort_handle.abort();
            }
        }

        {
            let channel = self.channel.lock().await;
            if let Err(e) = channel.close(200, "正常关闭").await {
                debug!("关闭通道失败: {e}");
            }
        }
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }

    async fn dead_letter_info(&self) -> WorkerResult<DeadLetterInfo> {
        let channel = self.channel.lock().await;
        let queue = channel
            .queue_declare(
                &self.config.dead_letter_queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorkerError::MessageQueue(format!("查询死信队列失败: {e}")))?;

        Ok(DeadLetterInfo {
            message_count: queue.message_count(),
        })
    }

    async fn requeue_dead_letters(&self, limit: u32) -> WorkerResult<u32> {
        let channel = self.channel.lock().await;
        let mut moved = 0u32;

        while moved < limit {
            let message = channel
                .basic_get(&self.config.dead_letter_queue, BasicGetOptions::default())
                .await
                .map_err(|e| WorkerError::MessageQueue(format!("读取死信消息失败: {e}")))?;
            let Some(message) = message else {
                break;
            };

            // 以清零的重试计数重新投入主交换机
            let publish = channel
                .basic_publish(
                    &self.config.task_exchange,
                    &self.config.task_routing_key,
                    BasicPublishOptions::default(),
                    &message.delivery.data,
                    BasicProperties::default()
                        .with_delivery_mode(2)
                        .with_headers(retry_headers(0)),
                )
                .await;
            match publish {
                Ok(confirm) => {
                    confirm.await.map_err(|e| {
                        WorkerError::MessageQueue(format!("死信重新投递确认失败: {e}"))
                    })?;
                    message
                        .delivery
                        .acker
                        .ack(BasicAckOptions::default())
                        .await
                        .map_err(|e| {
                            WorkerError::MessageQueue(format!("确认死信消息失败: {e}"))
                        })?;
                    moved += 1;
                }
                Err(e) => {
                    // 投递失败时把消息放回死信队列，避免丢失
                    let _ = message
                        .delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await;
                    return Err(WorkerError::MessageQueue(format!(
                        "重新发布死信消息失败: {e}"
                    )));
                }
            }
        }

        info!("已从死信队列重新投递 {moved} 条消息");
        Ok(moved)
    }
}

/// 声明主交换机/队列和死信交换机/队列
async fn declare_topology(channel: &Channel, config: &MessageQueueConfig) -> WorkerResult<()> {
    channel
        .exchange_declare(
            &config.dead_letter_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("声明死信交换机失败: {e}")))?;

    channel
        .queue_declare(
            &config.dead_letter_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("声明死信队列失败: {e}")))?;

    channel
        .queue_bind(
            &config.dead_letter_queue,
            &config.dead_letter_exchange,
            &config.dead_letter_routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("绑定死信队列失败: {e}")))?;

    channel
        .exchange_declare(
            &config.task_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("声明任务交换机失败: {e}")))?;

    // 主队列指向死信交换机，被拒绝或重试耗尽的消息由broker路由过去
    let mut queue_args = FieldTable::default();
    queue_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(config.dead_letter_exchange.as_str().into()),
    );
    queue_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(config.dead_letter_routing_key.as_str().into()),
    );
    channel
        .queue_declare(
            &config.task_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            queue_args,
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("声明任务队列失败: {e}")))?;

    channel
        .queue_bind(
            &config.task_queue,
            &config.task_exchange,
            &config.task_routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("绑定任务队列失败: {e}")))?;

    debug!(
        "队列拓扑声明完成: {} -> {} (DLX: {})",
        config.task_exchange, config.task_queue, config.dead_letter_exchange
    );
    Ok(())
}

/// 消费循环：每条消息派生一个独立的处理任务
async fn consume_loop(mut consumer: Consumer, context: ConsumerContext) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("接收消息失败: {e}");
                continue;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        let task = tokio::spawn(handle_delivery(
            delivery,
            Arc::clone(&context.channel),
            context.config.clone(),
            Arc::clone(&context.handler),
        ));

        let mut in_flight = context.in_flight.lock().await;
        // 回收已结束的处理任务句柄
        in_flight.retain(|_, handle| !handle.is_finished());
        in_flight.insert(delivery_tag, task);
    }
}

/// 单条消息的处置：ack、重试重发或转入死信队列
///
/// 所有错误都在此处收口，绝不向消费循环传播。
async fn handle_delivery(
    delivery: Delivery,
    channel: Arc<Mutex<Channel>>,
    config: MessageQueueConfig,
    handler: Arc<dyn MessageHandler>,
) {
    let payload: Value = match serde_json::from_slice(&delivery.data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("消息体不是合法JSON, 转入死信队列: {e}");
            nack_to_dead_letter(&delivery).await;
            return;
        }
    };

    let retry_count = retry_count_from_properties(&delivery.properties);
    if retry_count >= config.max_retries {
        warn!(
            "消息重试次数 {} 已达上限 {}, 转入死信队列",
            retry_count, config.max_retries
        );
        nack_to_dead_letter(&delivery).await;
        return;
    }

    // 处理器panic视为bug，与Reject同样处置
    let outcome = AssertUnwindSafe(handler.handle(payload)).catch_unwind().await;
    match outcome {
        Ok(DispatchOutcome::Completed) => {
            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                error!("确认消息失败: {e}");
            }
        }
        Ok(DispatchOutcome::Retry) => {
            match publish_retry(&channel, &config, &delivery.data, retry_count + 1).await {
                Ok(()) => {
                    debug!("消息已以重试计数 {} 重新发布", retry_count + 1);
                    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                        error!("确认原消息失败: {e}");
                    }
                }
                Err(e) => {
                    // 重发失败则退回原消息，交给broker原生重投，计数不变
                    error!("重新发布重试消息失败: {e}");
                    if let Err(e) = delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await
                    {
                        error!("退回消息失败: {e}");
                    }
                }
            }
        }
        Ok(DispatchOutcome::Reject) => {
            nack_to_dead_letter(&delivery).await;
        }
        Err(_) => {
            error!("消息处理器panic, 转入死信队列");
            nack_to_dead_letter(&delivery).await;
        }
    }
}

/// 拒绝且不退回，由broker的死信路由接管
async fn nack_to_dead_letter(delivery: &Delivery) {
    if let Err(e) = delivery
        .acker
        .nack(BasicNackOptions {
            requeue: false,
            ..Default::default()
        })
        .await
    {
        error!("拒绝消息失败: {e}");
    }
}

/// 发布一条消息体相同、重试计数递增的新消息到主交换机
async fn publish_retry(
    channel: &Arc<Mutex<Channel>>,
    config: &MessageQueueConfig,
    body: &[u8],
    retry_count: i32,
) -> WorkerResult<()> {
    let channel = channel.lock().await;
    let confirm = channel
        .basic_publish(
            &config.task_exchange,
            &config.task_routing_key,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_headers(retry_headers(retry_count)),
        )
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("发布重试消息失败: {e}")))?;

    confirm
        .await
        .map_err(|e| WorkerError::MessageQueue(format!("重试消息发布确认失败: {e}")))?;
    Ok(())
}

/// 从消息头读取重试计数，缺失时为0
fn retry_count_from_properties(properties: &BasicProperties) -> i32 {
    let Some(headers) = properties.headers().as_ref() else {
        return 0;
    };
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == RETRY_COUNT_HEADER)
        .and_then(|(_, value)| amqp_value_as_i32(value))
        .unwrap_or(0)
}

fn amqp_value_as_i32(value: &AMQPValue) -> Option<i32> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i32::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i32::from(*v)),
        AMQPValue::ShortInt(v) => Some(i32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i32::from(*v)),
        AMQPValue::LongInt(v) => Some(*v),
        AMQPValue::LongUInt(v) => i32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => i32::try_from(*v).ok(),
        _ => None,
    }
}

fn retry_headers(retry_count: i32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(RETRY_COUNT_HEADER),
        AMQPValue::LongInt(retry_count),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_count_defaults_to_zero() {
        let properties = BasicProperties::default();
        assert_eq!(retry_count_from_properties(&properties), 0);

        // 有headers但没有重试计数字段
        let properties = BasicProperties::default().with_headers(FieldTable::default());
        assert_eq!(retry_count_from_properties(&properties), 0);
    }

    #[test]
    fn test_retry_headers_round_trip() {
        for count in [0, 1, 2, 7] {
            let properties = BasicProperties::default().with_headers(retry_headers(count));
            assert_eq!(retry_count_from_properties(&properties), count);
        }
    }

    #[test]
    fn test_retry_count_accepts_foreign_integer_widths() {
        // 非Rust侧生产者可能以不同的整数宽度写入该头
        let cases = [
            (AMQPValue::ShortShortInt(2), 2),
            (AMQPValue::ShortInt(3), 3),
            (AMQPValue::LongInt(4), 4),
            (AMQPValue::LongLongInt(5), 5),
            (AMQPValue::LongUInt(6), 6),
        ];
        for (value, expected) in cases {
            let mut headers = FieldTable::default();
            headers.insert(ShortString::from(RETRY_COUNT_HEADER), value);
            let properties = BasicProperties::default().with_headers(headers);
            assert_eq!(retry_count_from_properties(&properties), expected);
        }
    }

    #[test]
    fn test_non_numeric_retry_header_is_treated_as_zero() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongString("three".into()),
        );
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(retry_count_from_properties(&properties), 0);
    }
}
