//! 推送通知服务
//!
//! 提供推送受理 REST API，并运行两个队列消费循环：
//! 主队列（FCM 投递）与网关队列（消息翻译转投）。

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use push_service::consumer::run_consumer;
use push_service::fcm::build_fcm_client;
use push_service::queue::AmqpPushQueue;
use push_service::repository::{DeviceRepository, MIGRATOR, PgDeviceRepository};
use push_service::service::PushDispatcher;
use push_service::{handlers, routes, state::AppState};
use push_shared::amqp::AmqpClient;
use push_shared::config::AppConfig;
use push_shared::database::Database;
use push_shared::observability;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 统一加载配置：config/default.toml + config/{env}.toml + PUSH_ 环境变量
    let config = AppConfig::load("push-service").unwrap_or_default();

    observability::init(&config.observability)?;

    info!("Starting push-service on {}", config.server_addr());

    // 初始化基础设施
    let db = Database::connect(&config.database).await?;
    db.run_migrations(&MIGRATOR).await?;
    let amqp = AmqpClient::connect(&config.amqp).await?;

    // 声明队列拓扑（幂等），构造队列实例
    let queue = Arc::new(AmqpPushQueue::new(amqp.clone(), config.queue.clone()).await?);

    let fcm = Arc::from(build_fcm_client(&config.fcm)?);
    let devices: Arc<dyn DeviceRepository> = Arc::new(PgDeviceRepository::new(db.pool().clone()));

    let dispatcher = Arc::new(PushDispatcher::new(
        devices.clone(),
        fcm,
        queue.clone(),
        config.queue.clone(),
    ));

    // watch 通道广播关闭信号到所有消费循环
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 主队列消费循环：投递到 FCM
    let push_consumer = queue.consume_push().await?;
    let push_dispatcher = dispatcher.clone();
    let push_loop = tokio::spawn(run_consumer(
        push_consumer,
        shutdown_rx.clone(),
        "push-worker",
        move |payload| {
            let dispatcher = push_dispatcher.clone();
            async move { dispatcher.process_push_from_queue(&payload).await }
        },
    ));

    // 网关队列消费循环：翻译后转投主队列
    let gateway_consumer = queue.consume_gateway().await?;
    let gateway_dispatcher = dispatcher.clone();
    let gateway_loop = tokio::spawn(run_consumer(
        gateway_consumer,
        shutdown_rx,
        "gateway-worker",
        move |payload| {
            let dispatcher = gateway_dispatcher.clone();
            async move { dispatcher.process_gateway_message(&payload).await }
        },
    ));

    let state = AppState::new(dispatcher, devices, db.clone(), amqp.clone());

    let app = Router::new()
        .nest("/v1", routes::api_routes())
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    // 优雅关闭：收到 SIGTERM（编排系统停止实例）或 Ctrl+C 时，
    // 停止接收新连接并等待已有请求处理完毕
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP 已停，通知消费循环退出并限时等待在途消息处理完毕
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = push_loop.await;
        let _ = gateway_loop.await;
    };
    let drain_timeout = Duration::from_secs(config.server.shutdown_timeout_seconds);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        warn!(
            timeout_secs = config.server.shutdown_timeout_seconds,
            "消费循环未在限时内退出，强制关闭；未确认消息将由 broker 重投"
        );
    }

    amqp.close().await;
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// 监听关闭信号
///
/// 编排系统通过 SIGTERM 通知实例停止；本地开发通过 Ctrl+C。
/// 收到任一信号后返回，触发 axum 的优雅关闭流程。
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("注册 Ctrl+C 处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("注册 SIGTERM 处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
