//! 推送调度服务
//!
//! `PushDispatcher` 是业务核心：HTTP 入口把请求解析为设备 token 并入队，
//! 两个消费循环把队列消息投递到 FCM 或翻译转发。
//!
//! 消费处理函数不直接操作 broker 确认，而是返回 `Disposition`，
//! 由消费循环统一执行 ack/nack。业务逻辑因此可以在无 broker 的
//! 单元测试中用 mock 完整验证。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use push_shared::config::QueueConfig;
use push_shared::error::PushError;

use crate::fcm::{FcmClient, SendSummary};
use crate::message::{GatewayMessage, PushMessage};
use crate::models::{BulkPushRequest, NotificationStatus, PushNotification, SendPushRequest};
use crate::queue::{PushQueue, RetryRoute};
use crate::repository::DeviceRepository;

// ---------------------------------------------------------------------------
// Disposition — 消息处置结果
// ---------------------------------------------------------------------------

/// 消费处理函数对一条消息的处置决定
///
/// 由消费循环翻译为 broker 操作：`Ack` 确认；`NackRequeue` 拒绝并原地重投
/// （瞬时基础设施故障）；`NackDrop` 拒绝且不重投（消息已另行路由或不可修复）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    NackRequeue,
    NackDrop,
}

/// 批量推送结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkPushOutcome {
    /// 成功入队的用户数
    pub enqueued: usize,
    /// 请求的用户总数
    pub total: usize,
}

// ---------------------------------------------------------------------------
// PushDispatcher
// ---------------------------------------------------------------------------

/// 推送调度器
///
/// 持有三个协作者的 trait 对象：设备目录、FCM 客户端、推送队列。
pub struct PushDispatcher {
    devices: Arc<dyn DeviceRepository>,
    fcm: Arc<dyn FcmClient>,
    queue: Arc<dyn PushQueue>,
    config: QueueConfig,
}

impl PushDispatcher {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        fcm: Arc<dyn FcmClient>,
        queue: Arc<dyn PushQueue>,
        config: QueueConfig,
    ) -> Self {
        Self {
            devices,
            fcm,
            queue,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // 入队侧（HTTP 入口调用）
    // -----------------------------------------------------------------------

    /// 单用户推送：解析设备 token 后入队，入队成功即返回（不等待投递）
    ///
    /// 用户无活跃设备或平台过滤后无匹配设备均为错误，调用方据此返回 4xx。
    pub async fn send_push(&self, req: SendPushRequest) -> Result<(), PushError> {
        let devices = self.devices.get_by_user_id(&req.user_id).await?;
        if devices.is_empty() {
            return Err(PushError::NoDevices {
                user_id: req.user_id,
            });
        }

        let devices: Vec<_> = if req.platforms.is_empty() {
            devices
        } else {
            devices
                .into_iter()
                .filter(|d| req.platforms.contains(&d.platform))
                .collect()
        };
        if devices.is_empty() {
            return Err(PushError::NoMatchingPlatform {
                user_id: req.user_id,
                platforms: req.platforms.iter().map(|p| p.as_str().to_string()).collect(),
            });
        }

        let tokens: Vec<String> = devices.iter().map(|d| d.token.clone()).collect();
        let notification = PushNotification {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id,
            title: req.title,
            body: req.body,
            image: req.image,
            link: req.link,
            data: req.data,
            status: NotificationStatus::Queued,
        };

        info!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            device_count = tokens.len(),
            "推送请求已受理"
        );
        self.queue.enqueue_push(notification, tokens).await
    }

    /// 批量推送：逐用户入队，单个用户失败记录日志后跳过，不中断整批
    pub async fn send_bulk_push(&self, req: BulkPushRequest) -> BulkPushOutcome {
        let total = req.user_ids.len();
        let mut enqueued = 0;

        for user_id in req.user_ids {
            let single = SendPushRequest {
                user_id: user_id.clone(),
                title: req.title.clone(),
                body: req.body.clone(),
                image: None,
                link: None,
                data: req.data.clone(),
                platforms: Vec::new(),
            };
            match self.send_push(single).await {
                Ok(()) => enqueued += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "批量推送跳过该用户"),
            }
        }

        info!(enqueued, total, "批量推送入队完成");
        BulkPushOutcome { enqueued, total }
    }

    /// 直连投递：绕过队列立即调用 FCM，返回成败计数
    ///
    /// 仅供联调验证通道连通性使用，不经过重试管道。
    pub async fn send_direct(&self, req: SendPushRequest) -> Result<SendSummary, PushError> {
        let devices = self.devices.get_by_user_id(&req.user_id).await?;
        if devices.is_empty() {
            return Err(PushError::NoDevices {
                user_id: req.user_id,
            });
        }

        let tokens: Vec<String> = devices.iter().map(|d| d.token.clone()).collect();
        let notification = PushNotification {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id,
            title: req.title,
            body: req.body,
            image: req.image,
            link: req.link,
            data: req.data,
            status: NotificationStatus::Sending,
        };

        let summary = self.fcm.send_multiple(&tokens, &notification).await?;
        info!(
            notification_id = %notification.id,
            success_count = summary.success_count,
            failure_count = summary.failure_count,
            "直连投递完成"
        );
        Ok(summary)
    }

    /// 各队列当前消息数
    pub async fn queue_stats(&self) -> HashMap<String, u32> {
        self.queue.queue_stats().await
    }

    // -----------------------------------------------------------------------
    // 消费侧（队列循环调用）
    // -----------------------------------------------------------------------

    /// 处理网关队列消息：翻译为内部信封后转投主队列
    ///
    /// 不可解析/缺必填字段的消息永远无法修复，直接丢弃；
    /// 无可投递 token 的消息确认掉（业务性不可达，非基础设施故障）；
    /// 仅转投失败（broker 瞬时故障）时原地重投。
    pub async fn process_gateway_message(&self, payload: &[u8]) -> Disposition {
        let msg = match GatewayMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "网关消息不可解析，丢弃");
                return Disposition::NackDrop;
            }
        };

        let (title, body) = msg.title_body();
        let tokens = self.resolve_gateway_tokens(&msg).await;
        if tokens.is_empty() {
            let err = PushError::NoDeviceTokens {
                user_id: msg.user_id.clone(),
            };
            warn!(
                notification_id = %msg.notification_id,
                code = err.code(),
                error = %err,
                "网关消息无可投递 token，确认并跳过"
            );
            return Disposition::Ack;
        }

        let notification = PushNotification {
            id: msg.notification_id.clone(),
            user_id: msg.user_id.clone(),
            title,
            body,
            image: None,
            link: None,
            data: msg.data_map(),
            status: NotificationStatus::Queued,
        };

        match self.queue.enqueue_push(notification, tokens).await {
            Ok(()) => {
                debug!(notification_id = %msg.notification_id, "网关消息已转投主队列");
                Disposition::Ack
            }
            Err(e) => {
                error!(
                    notification_id = %msg.notification_id,
                    error = %e,
                    "网关消息转投失败，原地重投"
                );
                Disposition::NackRequeue
            }
        }
    }

    /// 网关消息的 token 解析：优先设备目录，目录无果时回退消息内嵌 token
    async fn resolve_gateway_tokens(&self, msg: &GatewayMessage) -> Vec<String> {
        let devices = match self.devices.get_by_user_id(&msg.user_id).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(
                    user_id = %msg.user_id,
                    error = %e,
                    "查询设备目录失败，回退到消息内嵌 token"
                );
                Vec::new()
            }
        };

        if devices.is_empty() {
            msg.push_token.clone().into_iter().collect()
        } else {
            devices.into_iter().map(|d| d.token).collect()
        }
    }

    /// 处理主队列消息：投递到 FCM
    ///
    /// 投递失败（FCM 不可达或全部 token 失败）时把消息递增计数后转入
    /// 重试路径，原消息不再重投——重试副本已在途，`NackDrop` 仅终结原副本。
    pub async fn process_push_from_queue(&self, payload: &[u8]) -> Disposition {
        let message = match PushMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "队列消息不可解析，丢弃");
                return Disposition::NackDrop;
            }
        };

        let tokens = if self.config.validation.enabled {
            self.validate_tokens(&message.device_tokens).await
        } else {
            message.device_tokens.clone()
        };
        if tokens.is_empty() {
            warn!(
                notification_id = %message.notification.id,
                "校验后无有效 token，转入重试"
            );
            self.escalate_retry(message).await;
            return Disposition::Ack;
        }

        let mut notification = message.notification.clone();
        notification.status = NotificationStatus::Sending;

        match self.fcm.send_multiple(&tokens, &notification).await {
            Ok(summary) if summary.is_total_failure() => {
                warn!(
                    notification_id = %message.notification.id,
                    failure_count = summary.failure_count,
                    "全部 token 投递失败，转入重试"
                );
                self.escalate_retry(message).await;
                Disposition::NackDrop
            }
            Ok(summary) => {
                info!(
                    notification_id = %message.notification.id,
                    success_count = summary.success_count,
                    failure_count = summary.failure_count,
                    "推送投递完成"
                );
                Disposition::Ack
            }
            Err(e) => {
                warn!(
                    notification_id = %message.notification.id,
                    error = %e,
                    "FCM 不可达，转入重试"
                );
                self.escalate_retry(message).await;
                Disposition::NackDrop
            }
        }
    }

    /// 逐个校验 token，剔除确认无效的；校验本身出错时保留该 token
    async fn validate_tokens(&self, tokens: &[String]) -> Vec<String> {
        let timeout = Duration::from_millis(self.config.validation.timeout_ms);
        let mut valid = Vec::with_capacity(tokens.len());

        for token in tokens {
            match self.fcm.validate_token(token, timeout).await {
                Ok(true) => valid.push(token.clone()),
                Ok(false) => debug!("token 校验未通过，剔除"),
                Err(e) => {
                    warn!(error = %e, "token 校验出错，保留该 token");
                    valid.push(token.clone());
                }
            }
        }

        valid
    }

    /// 把消息交给重试路径；入队失败只记日志，原消息由死信配置兜底
    async fn escalate_retry(&self, message: PushMessage) {
        let notification_id = message.notification.id.clone();
        match self.queue.enqueue_retry(message).await {
            Ok(RetryRoute::Delay(delay)) => {
                debug!(
                    notification_id = %notification_id,
                    delay_ms = delay.as_millis() as u64,
                    "消息已进入延迟重试"
                );
            }
            Ok(RetryRoute::DeadLetter) => {
                warn!(notification_id = %notification_id, "消息重试耗尽，已移入死信队列");
            }
            Err(e) => {
                error!(
                    notification_id = %notification_id,
                    error = %e,
                    "重试入队失败"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    use push_shared::config::ValidationConfig;

    use crate::fcm::{MockFcmClient, SendSummary};
    use crate::models::{Device, Platform};
    use crate::queue::MockPushQueue;
    use crate::repository::MockDeviceRepository;

    fn make_device(user_id: &str, token: &str, platform: Platform) -> Device {
        Device {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            token: token.to_string(),
            platform,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_message(retry_count: u32, tokens: &[&str]) -> PushMessage {
        PushMessage {
            notification: PushNotification {
                id: "n-001".to_string(),
                user_id: "u-001".to_string(),
                title: "标题".to_string(),
                body: "正文".to_string(),
                image: None,
                link: None,
                data: HashMap::new(),
                status: NotificationStatus::Queued,
            },
            device_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            retry_count,
        }
    }

    fn make_request(user_id: &str, platforms: Vec<Platform>) -> SendPushRequest {
        SendPushRequest {
            user_id: user_id.to_string(),
            title: "标题".to_string(),
            body: "正文".to_string(),
            image: None,
            link: None,
            data: HashMap::new(),
            platforms,
        }
    }

    fn dispatcher(
        devices: MockDeviceRepository,
        fcm: MockFcmClient,
        queue: MockPushQueue,
        config: QueueConfig,
    ) -> PushDispatcher {
        PushDispatcher::new(Arc::new(devices), Arc::new(fcm), Arc::new(queue), config)
    }

    // -- send_push ----------------------------------------------------------

    #[tokio::test]
    async fn test_send_push_enqueues_resolved_tokens() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_by_user_id().returning(|_| {
            Ok(vec![
                make_device("u-001", "tok-1", Platform::Ios),
                make_device("u-001", "tok-2", Platform::Android),
            ])
        });

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_push()
            .withf(|notification, tokens| {
                notification.user_id == "u-001"
                    && notification.status == NotificationStatus::Queued
                    && !notification.id.is_empty()
                    && tokens == &["tok-1".to_string(), "tok-2".to_string()]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        d.send_push(make_request("u-001", vec![])).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_push_no_devices_is_error() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_by_user_id().returning(|_| Ok(vec![]));

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let err = d.send_push(make_request("u-001", vec![])).await.unwrap_err();
        assert!(matches!(err, PushError::NoDevices { ref user_id } if user_id == "u-001"));
    }

    #[tokio::test]
    async fn test_send_push_platform_filter_narrows_tokens() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_by_user_id().returning(|_| {
            Ok(vec![
                make_device("u-001", "tok-ios", Platform::Ios),
                make_device("u-001", "tok-android", Platform::Android),
            ])
        });

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_push()
            .withf(|_, tokens| tokens == &["tok-ios".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        d.send_push(make_request("u-001", vec![Platform::Ios]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_push_platform_mismatch_is_error() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_by_user_id()
            .returning(|_| Ok(vec![make_device("u-001", "tok-android", Platform::Android)]));

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let err = d
            .send_push(make_request("u-001", vec![Platform::Ios]))
            .await
            .unwrap_err();
        match err {
            PushError::NoMatchingPlatform { user_id, platforms } => {
                assert_eq!(user_id, "u-001");
                assert_eq!(platforms, vec!["ios".to_string()]);
            }
            other => panic!("期望 NoMatchingPlatform，实际为 {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_push_repository_error_propagates() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_by_user_id()
            .returning(|_| Err(PushError::Database(sqlx::Error::RowNotFound)));

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let err = d.send_push(make_request("u-001", vec![])).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_direct_bypasses_queue() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_by_user_id()
            .returning(|_| Ok(vec![make_device("u-001", "tok-1", Platform::Ios)]));

        let mut fcm = MockFcmClient::new();
        fcm.expect_send_multiple()
            .withf(|tokens, notification| {
                tokens == ["tok-1".to_string()]
                    && notification.status == NotificationStatus::Sending
            })
            .times(1)
            .returning(|_, _| {
                Ok(SendSummary {
                    success_count: 1,
                    failure_count: 0,
                })
            });

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(devices, fcm, queue, QueueConfig::default());
        let summary = d.send_direct(make_request("u-001", vec![])).await.unwrap();
        assert_eq!(summary.success_count, 1);
    }

    // -- send_bulk_push -----------------------------------------------------

    #[tokio::test]
    async fn test_bulk_push_skips_failed_users() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_by_user_id()
            .withf(|uid| uid == "u-ok")
            .returning(|_| Ok(vec![make_device("u-ok", "tok-1", Platform::Ios)]));
        devices
            .expect_get_by_user_id()
            .withf(|uid| uid == "u-empty")
            .returning(|_| Ok(vec![]));
        devices
            .expect_get_by_user_id()
            .withf(|uid| uid == "u-err")
            .returning(|_| Err(PushError::Database(sqlx::Error::RowNotFound)));

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().times(1).returning(|_, _| Ok(()));

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let outcome = d
            .send_bulk_push(BulkPushRequest {
                user_ids: vec![
                    "u-ok".to_string(),
                    "u-empty".to_string(),
                    "u-err".to_string(),
                ],
                title: "标题".to_string(),
                body: "正文".to_string(),
                data: HashMap::new(),
            })
            .await;

        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.total, 3);
    }

    // -- process_gateway_message --------------------------------------------

    #[tokio::test]
    async fn test_gateway_malformed_is_nack_drop() {
        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(
            MockDeviceRepository::new(),
            MockFcmClient::new(),
            queue,
            QueueConfig::default(),
        );
        assert_eq!(
            d.process_gateway_message(b"not json").await,
            Disposition::NackDrop
        );
    }

    #[tokio::test]
    async fn test_gateway_missing_mandatory_is_nack_drop() {
        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(
            MockDeviceRepository::new(),
            MockFcmClient::new(),
            queue,
            QueueConfig::default(),
        );
        // 合法 JSON 但缺 user_id，同样不可修复
        assert_eq!(
            d.process_gateway_message(br#"{"notification_id":"n-001"}"#)
                .await,
            Disposition::NackDrop
        );
    }

    #[tokio::test]
    async fn test_gateway_no_tokens_acks_without_publish() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_by_user_id().returning(|_| Ok(vec![]));

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_push().never();

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let payload = br#"{"notification_id":"n-001","user_id":"u-001"}"#;
        assert_eq!(d.process_gateway_message(payload).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_gateway_uses_directory_tokens() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_by_user_id().returning(|_| {
            Ok(vec![
                make_device("u-001", "tok-1", Platform::Ios),
                make_device("u-001", "tok-2", Platform::Android),
            ])
        });

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_push()
            .withf(|notification, tokens| {
                notification.id == "n-001"
                    && notification.title == "主题"
                    && tokens == &["tok-1".to_string(), "tok-2".to_string()]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let payload = r#"{"notification_id":"n-001","user_id":"u-001","push_token":"tok-inline","template":{"subject":"主题","body":"内容"}}"#.as_bytes();
        assert_eq!(d.process_gateway_message(payload).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_gateway_falls_back_to_inline_token() {
        let mut devices = MockDeviceRepository::new();
        devices.expect_get_by_user_id().returning(|_| Ok(vec![]));

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_push()
            .withf(|_, tokens| tokens == &["tok-inline".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let payload = br#"{"notification_id":"n-001","user_id":"u-001","push_token":"tok-inline"}"#;
        assert_eq!(d.process_gateway_message(payload).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_gateway_enqueue_failure_is_nack_requeue() {
        let mut devices = MockDeviceRepository::new();
        devices
            .expect_get_by_user_id()
            .returning(|_| Ok(vec![make_device("u-001", "tok-1", Platform::Ios)]));

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_push()
            .returning(|_, _| Err(PushError::Amqp("connection reset".to_string())));

        let d = dispatcher(devices, MockFcmClient::new(), queue, QueueConfig::default());
        let payload = br#"{"notification_id":"n-001","user_id":"u-001"}"#;
        assert_eq!(
            d.process_gateway_message(payload).await,
            Disposition::NackRequeue
        );
    }

    // -- process_push_from_queue --------------------------------------------

    #[tokio::test]
    async fn test_queue_malformed_is_nack_drop() {
        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_retry().never();

        let mut fcm = MockFcmClient::new();
        fcm.expect_send_multiple().never();

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            QueueConfig::default(),
        );
        assert_eq!(
            d.process_push_from_queue(b"garbage").await,
            Disposition::NackDrop
        );
    }

    #[tokio::test]
    async fn test_queue_delivery_success_acks() {
        let mut fcm = MockFcmClient::new();
        fcm.expect_send_multiple()
            .withf(|tokens, notification| {
                tokens.len() == 2 && notification.status == NotificationStatus::Sending
            })
            .times(1)
            .returning(|tokens, _| {
                Ok(SendSummary {
                    success_count: tokens.len(),
                    failure_count: 0,
                })
            });

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_retry().never();

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            QueueConfig::default(),
        );
        let payload = make_message(0, &["tok-1", "tok-2"]).encode().unwrap();
        assert_eq!(d.process_push_from_queue(&payload).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_queue_partial_failure_acks_without_retry() {
        let mut fcm = MockFcmClient::new();
        fcm.expect_send_multiple().times(1).returning(|_, _| {
            Ok(SendSummary {
                success_count: 2,
                failure_count: 3,
            })
        });

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_retry().never();

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            QueueConfig::default(),
        );
        let payload = make_message(0, &["t1", "t2", "t3", "t4", "t5"]).encode().unwrap();
        assert_eq!(d.process_push_from_queue(&payload).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_queue_total_failure_escalates_exactly_once() {
        let mut fcm = MockFcmClient::new();
        fcm.expect_send_multiple().times(1).returning(|_, _| {
            Ok(SendSummary {
                success_count: 0,
                failure_count: 5,
            })
        });

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_retry()
            // 递增在队列实现内完成，调度器原样转交消息
            .withf(|message| message.retry_count == 2)
            .times(1)
            .returning(|_| Ok(RetryRoute::Delay(Duration::from_secs(15))));

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            QueueConfig::default(),
        );
        let payload = make_message(2, &["t1", "t2", "t3", "t4", "t5"]).encode().unwrap();
        assert_eq!(
            d.process_push_from_queue(&payload).await,
            Disposition::NackDrop
        );
    }

    #[tokio::test]
    async fn test_queue_transport_error_escalates_and_drops() {
        let mut fcm = MockFcmClient::new();
        fcm.expect_send_multiple().times(1).returning(|_, _| {
            Err(PushError::ExternalService {
                service: "fcm".to_string(),
                message: "unreachable".to_string(),
            })
        });

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_retry()
            .times(1)
            .returning(|_| Ok(RetryRoute::Delay(Duration::from_secs(5))));

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            QueueConfig::default(),
        );
        let payload = make_message(0, &["tok-1"]).encode().unwrap();
        assert_eq!(
            d.process_push_from_queue(&payload).await,
            Disposition::NackDrop
        );
    }

    // -- token 预校验 -------------------------------------------------------

    fn validation_enabled_config() -> QueueConfig {
        QueueConfig {
            validation: ValidationConfig {
                enabled: true,
                timeout_ms: 100,
            },
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_validation_filters_invalid_tokens() {
        let mut fcm = MockFcmClient::new();
        fcm.expect_validate_token()
            .withf(|token, _| token == "tok-valid")
            .returning(|_, _| Ok(true));
        fcm.expect_validate_token()
            .withf(|token, _| token == "tok-invalid")
            .returning(|_, _| Ok(false));
        fcm.expect_send_multiple()
            .withf(|tokens, _| tokens == ["tok-valid".to_string()])
            .times(1)
            .returning(|_, _| {
                Ok(SendSummary {
                    success_count: 1,
                    failure_count: 0,
                })
            });

        let mut queue = MockPushQueue::new();
        queue.expect_enqueue_retry().never();

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            validation_enabled_config(),
        );
        let payload = make_message(0, &["tok-valid", "tok-invalid"]).encode().unwrap();
        assert_eq!(d.process_push_from_queue(&payload).await, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_validation_all_invalid_escalates_and_acks() {
        let mut fcm = MockFcmClient::new();
        fcm.expect_validate_token().returning(|_, _| Ok(false));
        fcm.expect_send_multiple().never();

        let mut queue = MockPushQueue::new();
        queue
            .expect_enqueue_retry()
            .times(1)
            .returning(|_| Ok(RetryRoute::Delay(Duration::from_secs(5))));

        let d = dispatcher(
            MockDeviceRepository::new(),
            fcm,
            queue,
            validation_enabled_config(),
        );
        let payload = make_message(0, &["tok-1", "tok-2"]).encode().unwrap();
        assert_eq!(d.process_push_from_queue(&payload).await, Disposition::Ack);
    }
}
