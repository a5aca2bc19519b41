//! FCM 投递客户端
//!
//! 通过 `FcmClient` trait 抽象投递行为：`HttpFcmClient` 调用真实的 FCM
//! HTTP 接口；`SimulatedFcmClient` 仅记录日志并报告成功，便于在无凭证的
//! 情况下验证整条消费管道。未来替换为官方 SDK 时只需实现同一 trait。
//!
//! 部分失败不是错误——按 token 计数上报；只有完全无法触达 FCM
//! （全部请求传输层失败）才返回错误。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use push_shared::config::FcmConfig;
use push_shared::error::PushError;

use crate::models::PushNotification;

/// FCM 缺省接入点
const DEFAULT_FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

/// 批量发送结果：按 token 的成败计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub success_count: usize,
    pub failure_count: usize,
}

impl SendSummary {
    /// 是否全部 token 都失败
    pub fn is_total_failure(&self) -> bool {
        self.success_count == 0 && self.failure_count > 0
    }
}

/// FCM 投递能力面
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FcmClient: Send + Sync {
    /// 向多个 token 发送同一通知，返回按 token 的成败计数
    ///
    /// 仅在传输层完全不可达时返回错误；单个 token 失败计入 failure_count。
    async fn send_multiple(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<SendSummary, PushError>;

    /// 校验单个 token 是否有效（dry-run），超时按无效处理
    async fn validate_token(&self, token: &str, timeout: Duration) -> Result<bool, PushError>;
}

// ---------------------------------------------------------------------------
// HttpFcmClient — 真实 HTTP 接入
// ---------------------------------------------------------------------------

/// 基于 reqwest 的 FCM HTTP 客户端
pub struct HttpFcmClient {
    http: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl HttpFcmClient {
    pub fn new(config: &FcmConfig) -> Result<Self, PushError> {
        let server_key = config
            .server_key
            .clone()
            .ok_or_else(|| PushError::Internal("FCM server_key 未配置".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PushError::Internal(format!("构建 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            http,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_FCM_ENDPOINT.to_string()),
            server_key,
        })
    }

    fn build_payload(token: &str, notification: &PushNotification, dry_run: bool) -> serde_json::Value {
        let mut message = json!({
            "to": token,
            "notification": {
                "title": notification.title,
                "body": notification.body,
            },
            "data": notification.data,
        });

        if let Some(image) = &notification.image {
            message["notification"]["image"] = json!(image);
        }
        if let Some(link) = &notification.link {
            message["notification"]["click_action"] = json!(link);
        }
        if dry_run {
            message["dry_run"] = json!(true);
        }

        message
    }

    /// 对单个 token 发送；Ok(true)=成功，Ok(false)=该 token 被 FCM 拒绝，
    /// Err=传输层失败
    async fn send_one(
        &self,
        token: &str,
        notification: &PushNotification,
        dry_run: bool,
    ) -> Result<bool, PushError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&Self::build_payload(token, notification, dry_run))
            .send()
            .await
            .map_err(|e| PushError::ExternalService {
                service: "fcm".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "FCM 返回非成功状态");
            return Ok(false);
        }

        // 响应体形如 {"success":1,"failure":0,...}
        let body: serde_json::Value =
            response.json().await.map_err(|e| PushError::ExternalService {
                service: "fcm".to_string(),
                message: format!("解析响应失败: {e}"),
            })?;

        Ok(body.get("success").and_then(|v| v.as_i64()).unwrap_or(0) > 0)
    }
}

#[async_trait]
impl FcmClient for HttpFcmClient {
    async fn send_multiple(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<SendSummary, PushError> {
        let sends = tokens.iter().map(|token| self.send_one(token, notification, false));
        let results = futures::future::join_all(sends).await;

        let mut summary = SendSummary {
            success_count: 0,
            failure_count: 0,
        };
        let mut transport_failures = 0usize;

        for result in results {
            match result {
                Ok(true) => summary.success_count += 1,
                Ok(false) => summary.failure_count += 1,
                Err(e) => {
                    warn!(error = %e, "FCM 请求传输失败");
                    summary.failure_count += 1;
                    transport_failures += 1;
                }
            }
        }

        // 全部请求在传输层失败：视为 FCM 完全不可达
        if !tokens.is_empty() && transport_failures == tokens.len() {
            return Err(PushError::ExternalService {
                service: "fcm".to_string(),
                message: "所有请求均无法触达 FCM".to_string(),
            });
        }

        Ok(summary)
    }

    async fn validate_token(&self, token: &str, timeout: Duration) -> Result<bool, PushError> {
        let probe = PushNotification {
            id: String::new(),
            user_id: String::new(),
            title: String::new(),
            body: String::new(),
            image: None,
            link: None,
            data: Default::default(),
            status: Default::default(),
        };

        match tokio::time::timeout(timeout, self.send_one(token, &probe, true)).await {
            Ok(Ok(valid)) => Ok(valid),
            Ok(Err(e)) => {
                debug!(error = %e, "token 校验请求失败，按无效处理");
                Ok(false)
            }
            Err(_) => {
                debug!("token 校验超时，按无效处理");
                Ok(false)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SimulatedFcmClient — 模拟发送器
// ---------------------------------------------------------------------------

/// 模拟 FCM 发送器
///
/// 未配置 server_key 时使用，仅记录日志并报告全部成功。
pub struct SimulatedFcmClient;

#[async_trait]
impl FcmClient for SimulatedFcmClient {
    async fn send_multiple(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<SendSummary, PushError> {
        info!(
            device_count = tokens.len(),
            notification_id = %notification.id,
            user_id = %notification.user_id,
            title = %notification.title,
            "模拟发送 FCM 推送通知"
        );

        Ok(SendSummary {
            success_count: tokens.len(),
            failure_count: 0,
        })
    }

    async fn validate_token(&self, _token: &str, _timeout: Duration) -> Result<bool, PushError> {
        Ok(true)
    }
}

/// 按配置选择真实或模拟客户端
pub fn build_fcm_client(config: &FcmConfig) -> Result<Box<dyn FcmClient>, PushError> {
    if config.server_key.is_some() {
        Ok(Box::new(HttpFcmClient::new(config)?))
    } else {
        warn!("FCM server_key 未配置，使用模拟发送器");
        Ok(Box::new(SimulatedFcmClient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationStatus;
    use std::collections::HashMap;

    fn make_notification() -> PushNotification {
        PushNotification {
            id: "n-001".to_string(),
            user_id: "u-001".to_string(),
            title: "标题".to_string(),
            body: "正文".to_string(),
            image: Some("https://example.com/a.png".to_string()),
            link: Some("https://example.com/open".to_string()),
            data: HashMap::from([("k".to_string(), "v".to_string())]),
            status: NotificationStatus::Queued,
        }
    }

    #[test]
    fn test_send_summary_total_failure() {
        assert!(
            SendSummary {
                success_count: 0,
                failure_count: 5
            }
            .is_total_failure()
        );
        assert!(
            !SendSummary {
                success_count: 2,
                failure_count: 3
            }
            .is_total_failure()
        );
        // 空 token 列表不算全失败
        assert!(
            !SendSummary {
                success_count: 0,
                failure_count: 0
            }
            .is_total_failure()
        );
    }

    #[test]
    fn test_build_payload_rich_fields() {
        let payload = HttpFcmClient::build_payload("tok-1", &make_notification(), false);
        assert_eq!(payload["to"], "tok-1");
        assert_eq!(payload["notification"]["title"], "标题");
        assert_eq!(payload["notification"]["image"], "https://example.com/a.png");
        assert_eq!(
            payload["notification"]["click_action"],
            "https://example.com/open"
        );
        assert_eq!(payload["data"]["k"], "v");
        assert!(payload.get("dry_run").is_none());
    }

    #[test]
    fn test_build_payload_dry_run() {
        let payload = HttpFcmClient::build_payload("tok-1", &make_notification(), true);
        assert_eq!(payload["dry_run"], true);
    }

    #[tokio::test]
    async fn test_simulated_client_reports_all_success() {
        let client = SimulatedFcmClient;
        let tokens = vec!["tok-1".to_string(), "tok-2".to_string()];

        let summary = client.send_multiple(&tokens, &make_notification()).await.unwrap();
        assert_eq!(summary.success_count, 2);
        assert_eq!(summary.failure_count, 0);

        assert!(
            client
                .validate_token("tok-1", Duration::from_millis(100))
                .await
                .unwrap()
        );
    }

    #[test]
    fn test_build_fcm_client_falls_back_to_simulated() {
        let config = FcmConfig::default();
        assert!(config.server_key.is_none());
        assert!(build_fcm_client(&config).is_ok());
    }
}
