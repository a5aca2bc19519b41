//! 应用状态定义
//!
//! 包含 Axum 路由共享的应用状态

use std::sync::Arc;

use push_shared::amqp::AmqpClient;
use push_shared::database::Database;

use crate::repository::DeviceRepository;
use crate::service::PushDispatcher;

/// Axum 应用共享状态
///
/// 调度器与设备仓储以 Arc 在 handler 间共享；
/// Database 与 AmqpClient 各保留一份用于就绪探针。
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<PushDispatcher>,
    pub devices: Arc<dyn DeviceRepository>,
    pub db: Database,
    pub amqp: AmqpClient,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<PushDispatcher>,
        devices: Arc<dyn DeviceRepository>,
        db: Database,
        amqp: AmqpClient,
    ) -> Self {
        Self {
            dispatcher,
            devices,
            db,
            amqp,
        }
    }
}
