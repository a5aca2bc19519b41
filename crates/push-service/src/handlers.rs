//! HTTP API 处理器
//!
//! 推送入口是异步受理：请求解析为设备 token 并入队后立即返回 202，
//! 实际投递由消费循环完成。设备注册/注销与探针为同步语义。

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Serialize;
use validator::Validate;

use crate::error::{ApiError, Result};
use crate::models::{BulkPushRequest, Device, RegisterDeviceRequest, SendPushRequest};
use crate::state::AppState;

/// API 统一响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// 创建成功响应
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            message: "操作成功".to_string(),
            data: Some(data),
        }
    }

    /// 创建成功响应（自定义消息）
    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            message: message.into(),
            data: Some(data),
        }
    }
}

/// 批量推送结果 DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPushDto {
    pub enqueued: usize,
    pub total: usize,
}

/// 直连投递结果 DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSendDto {
    pub success_count: usize,
    pub failure_count: usize,
}

/// 注销结果 DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisteredDto {
    pub unregistered: bool,
}

// ---------------------------------------------------------------------------
// 推送
// ---------------------------------------------------------------------------

/// 单用户推送
///
/// POST /v1/push/send
///
/// 入队成功即返回 202，不等待投递结果。
pub async fn send_push(
    State(state): State<AppState>,
    Json(req): Json<SendPushRequest>,
) -> Result<(StatusCode, Json<ApiResponse<()>>)> {
    req.validate()?;
    state.dispatcher.send_push(req).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success_with_message((), "推送已受理")),
    ))
}

/// 批量推送
///
/// POST /v1/push/send-bulk
///
/// 逐用户入队，单个用户失败不中断整批；返回入队计数。
pub async fn send_bulk_push(
    State(state): State<AppState>,
    Json(req): Json<BulkPushRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BulkPushDto>>)> {
    req.validate()?;
    let outcome = state.dispatcher.send_bulk_push(req).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(BulkPushDto {
            enqueued: outcome.enqueued,
            total: outcome.total,
        })),
    ))
}

/// 直连投递（联调用）
///
/// POST /v1/push/test-direct
///
/// 绕过队列直接调用 FCM，同步返回成败计数。
pub async fn test_direct(
    State(state): State<AppState>,
    Json(req): Json<SendPushRequest>,
) -> Result<Json<ApiResponse<DirectSendDto>>> {
    req.validate()?;
    let summary = state.dispatcher.send_direct(req).await?;

    Ok(Json(ApiResponse::success(DirectSendDto {
        success_count: summary.success_count,
        failure_count: summary.failure_count,
    })))
}

/// 队列统计
///
/// GET /v1/queue/stats
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Json<ApiResponse<HashMap<String, u32>>> {
    let stats = state.dispatcher.queue_stats().await;
    Json(ApiResponse::success(stats))
}

// ---------------------------------------------------------------------------
// 设备目录
// ---------------------------------------------------------------------------

/// 注册设备
///
/// POST /v1/devices
///
/// token 冲突时复活原记录并更新归属，幂等。
pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Device>>)> {
    req.validate()?;
    let device = state.devices.register(req).await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(device))))
}

/// 注销设备（软删除）
///
/// DELETE /v1/devices/{token}
pub async fn unregister_device(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<UnregisteredDto>>> {
    let removed = state.devices.unregister(&token).await?;
    if !removed {
        return Err(ApiError::DeviceNotFound(token));
    }

    Ok(Json(ApiResponse::success(UnregisteredDto {
        unregistered: true,
    })))
}

/// 设备列表查询参数
#[derive(Debug, serde::Deserialize)]
pub struct ListDevicesQuery {
    pub user_id: String,
}

/// 查询用户的活跃设备
///
/// GET /v1/devices?user_id=
pub async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<ListDevicesQuery>,
) -> Result<Json<ApiResponse<Vec<Device>>>> {
    let devices = state
        .devices
        .get_by_user_id(&query.user_id)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ApiResponse::success(devices)))
}

// ---------------------------------------------------------------------------
// 探针
// ---------------------------------------------------------------------------

/// 存活探针：服务进程正常即返回 ok
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "push-service"
    }))
}

/// 就绪探针：检查数据库和 AMQP 连接是否可用
///
/// 就绪探针失败时编排系统会把实例移出流量端点。
pub async fn readiness_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = state.db.health_check().await.is_ok();
    let amqp_ok = state.amqp.is_connected();
    let all_ok = db_ok && amqp_ok;

    Json(serde_json::json!({
        "status": if all_ok { "ok" } else { "degraded" },
        "service": "push-service",
        "checks": {
            "database": if db_ok { "ok" } else { "fail" },
            "amqp": if amqp_ok { "ok" } else { "fail" }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("data");
        assert!(response.success);
        assert_eq!(response.code, "SUCCESS");
        assert_eq!(response.data, Some("data"));
    }

    #[test]
    fn test_api_response_serialization_camel_case() {
        let response = ApiResponse::success(BulkPushDto {
            enqueued: 2,
            total: 3,
        });
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"enqueued\":2"));
        assert!(json.contains("\"total\":3"));
    }

    #[test]
    fn test_direct_send_dto_camel_case() {
        let dto = DirectSendDto {
            success_count: 1,
            failure_count: 2,
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("\"successCount\":1"));
        assert!(json.contains("\"failureCount\":2"));
    }
}
