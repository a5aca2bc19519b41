//! 路由配置模块
//!
//! 定义所有 REST API 端点的路由映射

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::{handlers, state::AppState};

/// 构建推送相关的路由
fn push_routes() -> Router<AppState> {
    Router::new()
        .route("/push/send", post(handlers::send_push))
        .route("/push/send-bulk", post(handlers::send_bulk_push))
        .route("/push/test-direct", post(handlers::test_direct))
        .route("/queue/stats", get(handlers::queue_stats))
}

/// 构建设备目录路由
fn device_routes() -> Router<AppState> {
    Router::new()
        .route("/devices", post(handlers::register_device))
        .route("/devices", get(handlers::list_devices))
        .route("/devices/{token}", delete(handlers::unregister_device))
}

/// 构建完整的 API 路由
///
/// 返回全部业务 API 路由（不含 /v1 前缀，由调用方在 main.rs 中挂载）
pub fn api_routes() -> Router<AppState> {
    Router::new().merge(push_routes()).merge(device_routes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_construction() {
        let _push = push_routes();
        let _device = device_routes();
        let _api = api_routes();
    }
}
