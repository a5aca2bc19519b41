//! HTTP 层错误类型
//!
//! 把领域错误翻译为 HTTP 响应：业务性失败（无设备、参数错误）返回 4xx
//! 并保留可读消息；基础设施失败统一 500，详细信息只进日志不出响应。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use push_shared::error::PushError;

/// 推送服务 API 错误
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("设备不存在: {0}")]
    DeviceNotFound(String),

    #[error(transparent)]
    Push(#[from] PushError),
}

impl ApiError {
    /// 返回对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            Self::Push(err) => match err {
                PushError::Validation(_) | PushError::Decode(_) => StatusCode::BAD_REQUEST,
                PushError::NoDevices { .. }
                | PushError::NoMatchingPlatform { .. }
                | PushError::NoDeviceTokens { .. } => StatusCode::NOT_FOUND,
                PushError::Database(_)
                | PushError::Migration(_)
                | PushError::Amqp(_)
                | PushError::ExternalService { .. }
                | PushError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// 返回错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::Push(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 系统级错误只返回通用提示，详细信息仅记录日志，防止信息泄露
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.error_code(), error = %self, "请求处理失败");
            "服务内部错误，请稍后重试".to_string()
        } else {
            self.to_string()
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
            "data": serde_json::Value::Null
        });

        (status, axum::Json(body)).into_response()
    }
}

/// 从 validator 错误转换
impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

/// HTTP 层 Result 类型别名
pub type Result<T> = std::result::Result<T, ApiError>;
