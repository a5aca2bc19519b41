//! 统一错误处理模块
//!
//! 定义推送平台共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 消费端依赖 `is_retryable` 区分瞬时故障（走重试管道）与永久失败（直接丢弃）。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum PushError {
    // ==================== 基础设施错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("AMQP 错误: {0}")]
    Amqp(String),

    // ==================== 消息解析错误 ====================
    #[error("消息解码失败: {0}")]
    Decode(String),

    #[error("消息校验失败: {0}")]
    Validation(String),

    // ==================== 业务逻辑错误 ====================
    #[error("用户没有已注册的设备: user_id={user_id}")]
    NoDevices { user_id: String },

    #[error("没有匹配指定平台的设备: user_id={user_id}, platforms={platforms:?}")]
    NoMatchingPlatform {
        user_id: String,
        platforms: Vec<String>,
    },

    #[error("没有可用的设备 token: user_id={user_id}")]
    NoDeviceTokens { user_id: String },

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, PushError>;

impl PushError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Amqp(_) => "AMQP_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NoDevices { .. } => "NO_DEVICES",
            Self::NoMatchingPlatform { .. } => "NO_MATCHING_PLATFORM",
            Self::NoDeviceTokens { .. } => "NO_DEVICE_TOKENS",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 解码/校验失败和无设备属于永久失败，重试只会重复同样的结果；
    /// 基础设施与外部服务故障视为瞬时，可交由重试管道处理。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Amqp(_) | Self::ExternalService { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = PushError::NoDevices {
            user_id: "u-001".to_string(),
        };
        assert_eq!(err.code(), "NO_DEVICES");

        let err = PushError::Decode("unexpected EOF".to_string());
        assert_eq!(err.code(), "DECODE_ERROR");

        let err = PushError::NoDeviceTokens {
            user_id: "u-001".to_string(),
        };
        assert_eq!(err.code(), "NO_DEVICE_TOKENS");

        let err = PushError::Migration(sqlx::Error::PoolClosed.into());
        assert_eq!(err.code(), "MIGRATION_ERROR");
    }

    #[test]
    fn test_is_retryable() {
        assert!(PushError::Amqp("connection reset".to_string()).is_retryable());
        assert!(
            PushError::ExternalService {
                service: "fcm".to_string(),
                message: "timeout".to_string(),
            }
            .is_retryable()
        );

        // 永久失败不可重试
        assert!(!PushError::Decode("bad json".to_string()).is_retryable());
        assert!(!PushError::Validation("missing user_id".to_string()).is_retryable());
        assert!(
            !PushError::NoDevices {
                user_id: "u-001".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_error_display() {
        let err = PushError::NoMatchingPlatform {
            user_id: "u-001".to_string(),
            platforms: vec!["ios".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "没有匹配指定平台的设备: user_id=u-001, platforms=[\"ios\"]"
        );
    }
}
