//! 推送队列拓扑与入队出队
//!
//! 负责在进程启动时把 broker 的 exchange/队列/绑定收敛到既定状态（幂等），
//! 并提供入队、重试入队、队列统计和消费者创建。
//!
//! 重试延迟通过消息级 TTL 实现：重试队列的 DLX 指回主 exchange，
//! 消息过期即被 broker 重新投回主队列。该耦合是延迟机制的核心，
//! 改动重试队列的死信配置会直接破坏重投递。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lapin::ExchangeKind;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use tracing::{info, warn};

use push_shared::amqp::AmqpClient;
use push_shared::config::{QueueConfig, RetryConfig};
use push_shared::error::PushError;

use crate::message::PushMessage;
use crate::models::PushNotification;

// ---------------------------------------------------------------------------
// 队列与 exchange 名称
// ---------------------------------------------------------------------------

/// 集中管理所有队列/exchange 名称，防止字符串散落导致拼写不一致。
/// 这些名称是与网关协作方的线上契约，不可改动。
pub mod names {
    /// 主 exchange
    pub const PUSH_EXCHANGE: &str = "push_exchange";
    /// 主推送队列
    pub const PUSH_QUEUE: &str = "push_notifications";
    /// 重试队列（路由键与队列名相同）
    pub const RETRY_QUEUE: &str = "push_retries";
    /// 死信 exchange
    pub const DEAD_LETTER_EXCHANGE: &str = "push_dlx";
    /// 死信队列
    pub const DEAD_LETTER_QUEUE: &str = "push_dead_letters";
    /// 死信路由键
    pub const DEAD_LETTER_KEY: &str = "dead_letter";
    /// 网关 exchange（归网关所有，此处仅防御性声明）
    pub const GATEWAY_EXCHANGE: &str = "notifications.direct";
    /// 网关推送队列
    pub const GATEWAY_QUEUE: &str = "push.queue";
    /// 网关路由键
    pub const GATEWAY_KEY: &str = "push";
}

/// 死信队列消息保留时长：7 天
const DEAD_LETTER_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// RetryRoute — 重试路由决策
// ---------------------------------------------------------------------------

/// 重试入队的路由结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRoute {
    /// 发布到重试队列，携带给定的消息级 TTL
    Delay(Duration),
    /// 超过最大重试次数，直接进入死信
    DeadLetter,
}

impl RetryRoute {
    /// 为第 `retry_count` 次重试（已完成 +1）计算路由
    ///
    /// 线性退避：延迟 = retry_count × backoff。retry_count 从 1 起，
    /// 因此延迟恒为正且随次数单调不减；超过 max_retries 进入死信。
    pub fn decide(retry_count: u32, config: &RetryConfig) -> Self {
        if retry_count > config.max_retries {
            Self::DeadLetter
        } else {
            Self::Delay(config.backoff() * retry_count)
        }
    }

    /// 推进一次重试：retry_count 严格 +1，随后计算路由
    ///
    /// 死信路由下计数也已 +1，但消息随后不再流转，无需回退。
    pub fn advance(message: &mut PushMessage, config: &RetryConfig) -> Self {
        message.retry_count += 1;
        Self::decide(message.retry_count, config)
    }
}

// ---------------------------------------------------------------------------
// PushQueue trait — 调度服务依赖的队列端口
// ---------------------------------------------------------------------------

/// 调度服务对队列的依赖面
///
/// 抽出 trait 便于在单元测试中用 mock 验证入队行为，而无需 broker。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushQueue: Send + Sync {
    /// 将通知与 token 列表包装为 retry_count=0 的消息发布到主队列
    async fn enqueue_push(
        &self,
        notification: PushNotification,
        device_tokens: Vec<String>,
    ) -> Result<(), PushError>;

    /// 重试入队：retry_count +1 后按路由决策发布到重试队列或死信
    async fn enqueue_retry(&self, message: PushMessage) -> Result<RetryRoute, PushError>;

    /// 各队列当前消息数（尽力而为，单个队列探测失败记 0）
    async fn queue_stats(&self) -> HashMap<String, u32>;
}

// ---------------------------------------------------------------------------
// AmqpPushQueue — 基于 RabbitMQ 的实现
// ---------------------------------------------------------------------------

/// RabbitMQ 推送队列
pub struct AmqpPushQueue {
    client: AmqpClient,
    config: QueueConfig,
}

impl AmqpPushQueue {
    /// 声明全部拓扑并构造队列实例
    ///
    /// 所有声明幂等，每次进程启动都会执行一遍；已存在的兼容资源无副作用。
    pub async fn new(client: AmqpClient, config: QueueConfig) -> Result<Self, PushError> {
        // 死信与主 exchange
        client
            .ensure_exchange(names::DEAD_LETTER_EXCHANGE, ExchangeKind::Direct)
            .await?;
        client
            .ensure_exchange(names::PUSH_EXCHANGE, ExchangeKind::Direct)
            .await?;

        // 死信队列：保留 7 天供排查
        let mut dlq_args = FieldTable::default();
        dlq_args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(DEAD_LETTER_TTL_MS),
        );
        client.ensure_queue(names::DEAD_LETTER_QUEUE, dlq_args).await?;
        client
            .bind_queue(
                names::DEAD_LETTER_QUEUE,
                names::DEAD_LETTER_EXCHANGE,
                names::DEAD_LETTER_KEY,
            )
            .await?;

        // 重试队列：过期消息经 DLX 投回主 exchange/主队列，构成延迟重投递
        let mut retry_args = FieldTable::default();
        retry_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(names::PUSH_EXCHANGE.into()),
        );
        retry_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(names::PUSH_QUEUE.into()),
        );
        client.ensure_queue(names::RETRY_QUEUE, retry_args).await?;
        client
            .bind_queue(names::RETRY_QUEUE, names::PUSH_EXCHANGE, names::RETRY_QUEUE)
            .await?;

        // 主队列：被拒绝/过期的消息进死信 exchange
        let mut push_args = FieldTable::default();
        push_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(names::DEAD_LETTER_EXCHANGE.into()),
        );
        push_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(names::DEAD_LETTER_KEY.into()),
        );
        client.ensure_queue(names::PUSH_QUEUE, push_args).await?;
        client
            .bind_queue(names::PUSH_QUEUE, names::PUSH_EXCHANGE, names::PUSH_QUEUE)
            .await?;

        // 网关 exchange/队列：归网关所有，防御性声明保证本服务先启动也能消费
        client
            .ensure_exchange(names::GATEWAY_EXCHANGE, ExchangeKind::Direct)
            .await?;
        client
            .ensure_queue(names::GATEWAY_QUEUE, FieldTable::default())
            .await?;
        client
            .bind_queue(names::GATEWAY_QUEUE, names::GATEWAY_EXCHANGE, names::GATEWAY_KEY)
            .await?;

        info!(
            exchange = names::PUSH_EXCHANGE,
            queue = names::PUSH_QUEUE,
            "推送队列拓扑已就绪"
        );

        Ok(Self { client, config })
    }

    /// 主队列消费者（prefetch 受限）
    pub async fn consume_push(&self) -> Result<lapin::Consumer, PushError> {
        self.client
            .create_consumer(names::PUSH_QUEUE, "push-worker", self.config.prefetch_count)
            .await
    }

    /// 网关队列消费者（prefetch 受限）
    pub async fn consume_gateway(&self) -> Result<lapin::Consumer, PushError> {
        self.client
            .create_consumer(names::GATEWAY_QUEUE, "gateway-worker", self.config.prefetch_count)
            .await
    }

    /// 底层客户端（就绪探针用）
    pub fn client(&self) -> &AmqpClient {
        &self.client
    }
}

#[async_trait]
impl PushQueue for AmqpPushQueue {
    async fn enqueue_push(
        &self,
        notification: PushNotification,
        device_tokens: Vec<String>,
    ) -> Result<(), PushError> {
        let device_count = device_tokens.len();
        let message = PushMessage::new(notification, device_tokens);

        self.client
            .publish_json(names::PUSH_EXCHANGE, names::PUSH_QUEUE, &message)
            .await?;

        info!(
            device_count,
            title = %message.notification.title,
            "推送消息已入队"
        );
        Ok(())
    }

    async fn enqueue_retry(&self, mut message: PushMessage) -> Result<RetryRoute, PushError> {
        let route = RetryRoute::advance(&mut message, &self.config.retry);
        match route {
            RetryRoute::DeadLetter => {
                warn!(
                    retry_count = message.retry_count,
                    max_retries = self.config.retry.max_retries,
                    notification_id = %message.notification.id,
                    "消息超过最大重试次数，移入死信队列"
                );
                self.client
                    .publish_json(names::DEAD_LETTER_EXCHANGE, names::DEAD_LETTER_KEY, &message)
                    .await?;
            }
            RetryRoute::Delay(delay) => {
                info!(
                    retry_count = message.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    notification_id = %message.notification.id,
                    "消息进入延迟重试队列"
                );
                self.client
                    .publish_json_with_ttl(names::PUSH_EXCHANGE, names::RETRY_QUEUE, &message, delay)
                    .await?;
            }
        }

        Ok(route)
    }

    async fn queue_stats(&self) -> HashMap<String, u32> {
        let mut stats = HashMap::new();

        for queue in [names::PUSH_QUEUE, names::RETRY_QUEUE, names::DEAD_LETTER_QUEUE] {
            let count = match self.client.queue_length(queue).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(queue, error = %e, "查询队列长度失败，按 0 计");
                    0
                }
            };
            stats.insert(queue.to_string(), count);
        }

        stats
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
