//! 对账扫描
//!
//! 结算队列在内存里，进程崩溃时在途事件随之丢失，队列满时事件也会被
//! 主动丢弃。对账扫描周期性地把停留在非终态超过阈值的订单重新入队，
//! 让结算工作从订单表里重新推导出来，不依赖队列自身的持久性。
//!
//! 重复入队是安全的：存储层的终态守卫和账本幂等键保证重复结算是 no-op。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use bonus_shared::config::SettlementConfig;
use bonus_shared::error::Result;

use crate::models::OrderEvent;
use crate::queue::EventPublisher;
use crate::store::OrderStore;

/// 对账扫描任务
pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    publisher: EventPublisher,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        publisher: EventPublisher,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            orders,
            publisher,
            interval: Duration::from_secs(config.reconcile_interval_seconds),
            stale_after: chrono::Duration::seconds(config.stale_after_seconds as i64),
        }
    }

    /// 执行一轮扫描，返回重新入队的订单数
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.stale_after;
        let stuck = self.orders.list_unsettled(cutoff).await?;

        for order in &stuck {
            warn!(
                order_number = %order.number,
                status = ?order.status,
                uploaded_at = %order.uploaded_at,
                "订单长时间停留在非终态，重新入队"
            );
            // attempt 归零：对账入队被视为一轮全新的结算
            self.publisher.publish(OrderEvent::for_order(order));
        }

        Ok(stuck.len())
    }

    /// 周期扫描循环，直到收到关停信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_seconds = self.interval.as_secs(),
            stale_after_seconds = self.stale_after.num_seconds(),
            "对账扫描启动"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval 的第一个 tick 立即到期，跳过它避免启动瞬间就扫描
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("对账扫描收到关停信号");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "对账扫描重新入队订单"),
                        Err(err) => error!(error = %err, "对账扫描失败，等待下一轮"),
                    }
                }
            }
        }
    }
}
