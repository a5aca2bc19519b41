//! 共享库
//!
//! 包含推送平台各服务共用的配置、错误处理、数据库连接、AMQP 等基础设施代码。

pub mod amqp;
pub mod config;
pub mod database;
pub mod error;
pub mod observability;
