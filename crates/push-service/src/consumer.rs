//! 队列消费循环
//!
//! 每个队列一个循环：从 broker 拉取投递，交给处理函数，按返回的
//! `Disposition` 统一执行 ack/nack。处理函数的任何失败都已折算进
//! `Disposition`，循环本身只在流结束或收到关闭信号时退出，从不 panic。
//!
//! 关闭采用 watch 通道广播：主进程翻转信号后循环停止拉取新消息，
//! 在途消息由 prefetch 上限约束，未确认的投递在连接关闭后由 broker 重投。

use std::future::Future;

use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::service::Disposition;

/// `Disposition` 对应的 nack requeue 标志；`Ack` 返回 None
fn requeue_flag(disposition: Disposition) -> Option<bool> {
    match disposition {
        Disposition::Ack => None,
        Disposition::NackRequeue => Some(true),
        Disposition::NackDrop => Some(false),
    }
}

/// 将处置决定翻译为 broker 确认操作
///
/// 确认操作失败（通常是连接已断开）只记录日志：消息未被确认，
/// broker 会在连接恢复后重投，重复投递由至少一次语义兜底。
async fn apply_disposition(acker: &Acker, disposition: Disposition, consumer: &str) {
    let result = match requeue_flag(disposition) {
        None => acker.ack(BasicAckOptions::default()).await,
        Some(requeue) => {
            acker
                .nack(BasicNackOptions {
                    requeue,
                    ..Default::default()
                })
                .await
        }
    };

    if let Err(e) = result {
        error!(consumer, ?disposition, error = %e, "消息确认操作失败");
    }
}

/// 运行一个消费循环直到收到关闭信号或投递流结束
///
/// `handler` 接收消息体并返回处置决定；逐条串行处理，
/// 未确认消息数由消费者的 prefetch 上限约束。
pub async fn run_consumer<F, Fut>(
    mut consumer: lapin::Consumer,
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    handler: F,
) where
    F: Fn(Vec<u8>) -> Fut,
    Fut: Future<Output = Disposition>,
{
    info!(consumer = name, "消费循环启动");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(consumer = name, "收到关闭信号，消费循环退出");
                    break;
                }
            }

            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let Delivery { data, acker, .. } = delivery;
                        let disposition = handler(data).await;
                        apply_disposition(&acker, disposition, name).await;
                    }
                    Some(Err(e)) => {
                        // 单次拉取失败不终止循环，连接级故障由流结束体现
                        error!(consumer = name, error = %e, "拉取投递失败");
                    }
                    None => {
                        warn!(consumer = name, "投递流已结束，消费循环退出");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_flag_mapping() {
        assert_eq!(requeue_flag(Disposition::Ack), None);
        assert_eq!(requeue_flag(Disposition::NackRequeue), Some(true));
        assert_eq!(requeue_flag(Disposition::NackDrop), Some(false));
    }
}
