//! AMQP 基础设施封装
//!
//! 将 lapin 的底层 API 封装为业务友好的声明/发布/消费抽象，
//! 统一消息序列化、错误映射和幂等声明语义，避免各服务重复编写样板代码。
//!
//! 声明操作（exchange/queue/bind）对已存在且参数兼容的资源是无副作用的，
//! 因此可以在每次进程启动时安全地重复执行；参数不兼容时 broker 会关闭
//! 通道并返回错误，由调用方决定是否终止启动。

use std::sync::Arc;
use std::time::Duration;

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::AmqpConfig;
use crate::error::PushError;

/// AMQP 消息投递模式：持久化
///
/// 队列本身声明为 durable，消息也必须持久化，否则 broker 重启会丢消息。
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// 将 TTL 转换为 AMQP `expiration` 属性要求的毫秒字符串
pub fn ttl_millis_string(ttl: Duration) -> String {
    ttl.as_millis().to_string()
}

/// 面向业务的 AMQP 客户端
///
/// 持有一条连接和一个共享的发布通道。lapin 的 `Channel` 内部已做并发保护，
/// 克隆本结构即可在 HTTP 发布路径和消费循环之间共享；每个消费者会另建
/// 独立通道以隔离 QoS 设置和通道级错误。
#[derive(Clone)]
pub struct AmqpClient {
    conn: Arc<Connection>,
    channel: Channel,
}

impl AmqpClient {
    /// 建立连接并打开发布通道
    pub async fn connect(config: &AmqpConfig) -> Result<Self, PushError> {
        let conn = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| PushError::Amqp(format!("连接 RabbitMQ 失败: {e}")))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| PushError::Amqp(format!("打开通道失败: {e}")))?;

        info!("已连接 RabbitMQ");

        Ok(Self {
            conn: Arc::new(conn),
            channel,
        })
    }

    /// 幂等声明一个 durable exchange
    ///
    /// 已存在且 kind 兼容时为无操作；kind 不兼容时 broker 返回错误。
    pub async fn ensure_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), PushError> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PushError::Amqp(format!("声明 exchange {name} 失败: {e}")))?;

        debug!(exchange = name, "exchange 已声明");
        Ok(())
    }

    /// 幂等声明一个 durable、非独占、非自动删除的队列
    ///
    /// `args` 用于设置死信目标、消息 TTL 等扩展参数。
    pub async fn ensure_queue(&self, name: &str, args: FieldTable) -> Result<(), PushError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| PushError::Amqp(format!("声明队列 {name} 失败: {e}")))?;

        debug!(queue = name, "队列已声明");
        Ok(())
    }

    /// 幂等绑定队列到 exchange
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PushError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                PushError::Amqp(format!("绑定队列 {queue} 到 {exchange} 失败: {e}"))
            })?;

        debug!(queue, exchange, routing_key, "队列绑定完成");
        Ok(())
    }

    /// 将值序列化为 JSON 后以持久化模式发布
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn publish_json<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<(), PushError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| PushError::Amqp(format!("序列化失败: {e}")))?;

        self.publish_raw(exchange, routing_key, &payload, None).await
    }

    /// 发布带有消息级 TTL 的 JSON 消息
    ///
    /// TTL 到期后消息由所在队列的 DLX 接管——配合重试队列的死信配置，
    /// 即为延迟重投递机制。不使用 `x-delay` 头，避免依赖 broker 插件。
    pub async fn publish_json_with_ttl<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), PushError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| PushError::Amqp(format!("序列化失败: {e}")))?;

        self.publish_raw(exchange, routing_key, &payload, Some(ttl))
            .await
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), PushError> {
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        if let Some(ttl) = ttl {
            properties = properties.with_expiration(ttl_millis_string(ttl).into());
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| PushError::Amqp(format!("发布消息失败: {e}")))?
            .await
            .map_err(|e| PushError::Amqp(format!("消息确认失败: {e}")))?;

        debug!(exchange, routing_key, bytes = payload.len(), "消息已发布");
        Ok(())
    }

    /// 查询队列当前消息数
    ///
    /// 使用 passive 声明探测。队列不存在时 broker 会关闭声明所在的通道，
    /// 因此这里临时开通道，避免污染共享的发布通道。
    pub async fn queue_length(&self, name: &str) -> Result<u32, PushError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| PushError::Amqp(format!("打开探测通道失败: {e}")))?;

        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PushError::Amqp(format!("探测队列 {name} 失败: {e}")))?;

        let count = queue.message_count();
        let _ = channel.close(200, "inspect done").await;
        Ok(count)
    }

    /// 创建一个 prefetch 受限的消费者
    ///
    /// 每个消费者独占一条通道：QoS 是通道级设置，且消费处理中的通道错误
    /// 不应影响发布路径。
    pub async fn create_consumer(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch_count: u16,
    ) -> Result<Consumer, PushError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| PushError::Amqp(format!("打开消费通道失败: {e}")))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| PushError::Amqp(format!("设置 QoS 失败: {e}")))?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                // 手动确认：at-least-once 语义的前提
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PushError::Amqp(format!("注册消费者 {consumer_tag} 失败: {e}")))?;

        info!(queue, consumer_tag, prefetch_count, "消费者已注册");
        Ok(consumer)
    }

    /// 连接是否存活（就绪探针用）
    pub fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    /// 关闭连接
    pub async fn close(&self) {
        if let Err(e) = self.conn.close(200, "shutdown").await {
            debug!(error = %e, "关闭 AMQP 连接时出错");
        } else {
            info!("AMQP 连接已关闭");
        }
    }
}
