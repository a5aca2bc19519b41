//! 队列消息编解码
//!
//! `PushMessage` 是内部管道的线格式信封；`GatewayMessage` 是网关投递的
//! 松散格式消息，采用两段式解码：先判定字节是否为合法 JSON（否则为
//! `Decode` 错误），再做 schema 校验（缺失必填字段为 `Validation` 错误）。
//! 两类错误都不可重试，与瞬时基础设施故障严格区分。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use push_shared::error::PushError;

use crate::models::PushNotification;

/// 缺省通知标题（网关消息未携带模板时使用）
pub const DEFAULT_TITLE: &str = "Notification";
/// 缺省通知正文
pub const DEFAULT_BODY: &str = "You have a new notification";

// ---------------------------------------------------------------------------
// PushMessage — 内部信封
// ---------------------------------------------------------------------------

/// 队列传输单元
///
/// 设备 token 在入队时解析并冗余携带，重试无需回查设备目录。
/// `retry_count` 每次重试入队严格 +1，超过上限后直接进入死信，不再递增。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub notification: PushNotification,
    pub device_tokens: Vec<String>,
    pub retry_count: u32,
}

impl PushMessage {
    /// 构造 retry_count 为 0 的新消息
    pub fn new(notification: PushNotification, device_tokens: Vec<String>) -> Self {
        Self {
            notification,
            device_tokens,
            retry_count: 0,
        }
    }

    /// 编码为 JSON 字节
    pub fn encode(&self) -> Result<Vec<u8>, PushError> {
        serde_json::to_vec(self).map_err(|e| PushError::Internal(format!("编码推送消息失败: {e}")))
    }

    /// 从 JSON 字节解码
    pub fn decode(payload: &[u8]) -> Result<Self, PushError> {
        serde_json::from_slice(payload).map_err(|e| PushError::Decode(format!("推送消息解码失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// GatewayMessage — 网关消息
// ---------------------------------------------------------------------------

/// 网关消息中的模板片段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayTemplate {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// 网关投递的通知消息
///
/// 只消费不生产。notification_id 与 user_id 为必填，其余字段缺省容忍；
/// 未知字段忽略。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub notification_id: String,
    pub user_id: String,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub template: Option<GatewayTemplate>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// 宽松形态：必填字段也先按可缺失解析，再统一做存在性校验，
/// 使「字节不是 JSON」与「缺字段」产生不同的错误类型。
#[derive(Debug, Deserialize)]
struct RawGatewayMessage {
    #[serde(default)]
    notification_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    push_token: Option<String>,
    #[serde(default)]
    template: Option<GatewayTemplate>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl GatewayMessage {
    /// 两段式解码
    ///
    /// - 字节不是合法 JSON 对象 → `PushError::Decode`
    /// - 缺失/空置 notification_id 或 user_id → `PushError::Validation`（指明字段名）
    pub fn decode(payload: &[u8]) -> Result<Self, PushError> {
        let raw: RawGatewayMessage = serde_json::from_slice(payload)
            .map_err(|e| PushError::Decode(format!("网关消息解码失败: {e}")))?;

        let notification_id = match raw.notification_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(PushError::Validation(
                    "网关消息缺少必填字段: notification_id".to_string(),
                ));
            }
        };

        let user_id = match raw.user_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(PushError::Validation(
                    "网关消息缺少必填字段: user_id".to_string(),
                ));
            }
        };

        Ok(Self {
            notification_id,
            user_id,
            push_token: raw.push_token.filter(|t| !t.is_empty()),
            template: raw.template,
            data: raw.data,
        })
    }

    /// 解析通知标题和正文
    ///
    /// 优先使用模板的 subject/body；模板缺失或字段为空时使用字面缺省值。
    pub fn title_body(&self) -> (String, String) {
        let mut title = DEFAULT_TITLE.to_string();
        let mut body = DEFAULT_BODY.to_string();

        if let Some(template) = &self.template {
            if !template.subject.is_empty() {
                title = template.subject.clone();
            }
            if !template.body.is_empty() {
                body = template.body.clone();
            }
        }

        (title, body)
    }

    /// 将网关携带的任意 JSON data 降为字符串映射
    ///
    /// FCM 的 data 负载只接受字符串值；非字符串值按 JSON 字面量渲染。
    pub fn data_map(&self) -> HashMap<String, String> {
        let Some(serde_json::Value::Object(map)) = &self.data else {
            return HashMap::new();
        };

        map.iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }
}
