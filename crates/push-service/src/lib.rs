//! 推送服务
//!
//! 接收同步入队请求与网关异步消息，通过 RabbitMQ 队列解耦投递，
//! 由消费循环调用 FCM 完成实际推送。失败消息走延迟重试管道，
//! 超过最大重试次数后进入死信队列。

pub mod consumer;
pub mod error;
pub mod fcm;
pub mod handlers;
pub mod message;
pub mod models;
pub mod queue;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;
