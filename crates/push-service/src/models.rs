//! 推送服务数据模型
//!
//! 所有枚举都支持数据库（sqlx）和 JSON（serde）序列化。
//! `PushNotification` 是飞行中的投递单元，仅随队列消息传输，不落库。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 设备平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
        }
    }
}

/// 已注册设备
///
/// token 全局唯一；注销是软删除（is_active=false），token 记录保留。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub user_id: String,
    pub token: String,
    pub platform: Platform,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 通知投递状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    Queued,
    Sending,
    Sent,
    Failed,
    Delivered,
}

/// 推送通知（飞行中的投递单元）
///
/// 每次 dispatch 调用构造一份，设备 token 在入队时解析并随消息冗余携带，
/// 重试时无需再查库。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, String>,
    pub status: NotificationStatus,
}

// ---------------------------------------------------------------------------
// 请求 DTO
// ---------------------------------------------------------------------------

/// 单用户推送请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SendPushRequest {
    #[validate(length(min = 1, message = "user_id 不能为空"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "title 不能为空"))]
    pub title: String,
    #[validate(length(min = 1, message = "body 不能为空"))]
    pub body: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, String>,
    /// 可选平台过滤；为空表示推送到用户的全部活跃设备
    #[serde(default)]
    pub platforms: Vec<Platform>,
}

/// 批量推送请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BulkPushRequest {
    #[validate(length(min = 1, message = "user_ids 不能为空"))]
    pub user_ids: Vec<String>,
    #[validate(length(min = 1, message = "title 不能为空"))]
    pub title: String,
    #[validate(length(min = 1, message = "body 不能为空"))]
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// 设备注册请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterDeviceRequest {
    #[validate(length(min = 1, message = "user_id 不能为空"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "token 不能为空"))]
    pub token: String,
    pub platform: Platform,
}
