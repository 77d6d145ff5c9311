//! 结算工作者
//!
//! 消费结算事件，调用积分计算网关，并把终态结果原子地写回订单与账本。
//! 瞬时故障走延迟重投递，重投递次数耗尽的订单判定为 Invalid。

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use bonus_shared::retry::BackoffPolicy;

use crate::error::SettlementError;
use crate::gateway::{AccrualGateway, AccrualStatus};
use crate::models::{LedgerEntry, OrderEvent, OrderStatus};
use crate::queue::{EventSubscriber, RepublishScheduler};
use crate::store::OrderStore;

/// 结算工作者
pub struct SettlementWorker {
    orders: Arc<dyn OrderStore>,
    gateway: Arc<dyn AccrualGateway>,
    scheduler: RepublishScheduler,
    backoff: BackoffPolicy,
    /// 重投递次数上限，达到后订单判定为 Invalid
    max_republish_count: u32,
}

impl SettlementWorker {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        gateway: Arc<dyn AccrualGateway>,
        scheduler: RepublishScheduler,
        backoff: BackoffPolicy,
        max_republish_count: u32,
    ) -> Self {
        Self {
            orders,
            gateway,
            scheduler,
            backoff,
            max_republish_count,
        }
    }

    /// 消费循环，直到队列关闭或收到关停信号
    pub async fn run(self, mut subscriber: EventSubscriber, mut shutdown: watch::Receiver<bool>) {
        info!("结算工作者启动");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("结算工作者收到关停信号");
                        break;
                    }
                }
                event = subscriber.recv() => {
                    match event {
                        Some(event) => {
                            let number = event.order_number.clone();
                            if let Err(err) = self.settle_one(event).await {
                                // 硬故障只记录，订单留在非终态等对账扫描
                                error!(order_number = %number, error = %err, "订单结算失败");
                            }
                        }
                        None => {
                            info!("结算队列已关闭，工作者退出");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// 处理单条结算事件
    ///
    /// 公开以便独立于消费循环测试：给定一个事件，走完一次完整的结算尝试。
    pub async fn settle_one(&self, event: OrderEvent) -> Result<(), SettlementError> {
        self.orders.mark_processing(event.order_id).await?;

        let reply = match self.gateway.lookup(&event.order_number).await {
            Ok(reply) => reply,
            Err(err) if err.is_transient() => {
                warn!(
                    order_number = %event.order_number,
                    attempt = event.attempt,
                    error = %err,
                    "计算服务瞬时故障"
                );
                return self.republish_or_invalidate(event).await;
            }
            Err(err) => return Err(err.into()),
        };

        match reply.status {
            AccrualStatus::Processed => {
                let accrual = reply.accrual.unwrap_or(Decimal::ZERO);
                let credit = if accrual > Decimal::ZERO {
                    Some(LedgerEntry::credit(
                        event.user_id,
                        event.order_number.clone(),
                        accrual,
                    ))
                } else {
                    None
                };

                let applied = self
                    .orders
                    .finalize(event.order_id, OrderStatus::Processed, Some(accrual), credit)
                    .await?;

                if applied {
                    info!(
                        order_number = %event.order_number,
                        accrual = %accrual,
                        "订单结算完成"
                    );
                } else {
                    // 重复事件撞上已终态的订单，幂等跳过
                    info!(order_number = %event.order_number, "订单已是终态，跳过重复结算");
                }
                Ok(())
            }
            AccrualStatus::Invalid => {
                self.orders
                    .finalize(event.order_id, OrderStatus::Invalid, None, None)
                    .await?;
                info!(order_number = %event.order_number, "订单被计算服务判定为无效");
                Ok(())
            }
            // 远端仍在处理中，视同瞬时状态延迟重试，不把中间状态写回本地
            AccrualStatus::Registered | AccrualStatus::Processing => {
                self.republish_or_invalidate(event).await
            }
        }
    }

    /// 瞬时故障：未达上限则登记延迟重投递，否则判定 Invalid
    async fn republish_or_invalidate(&self, event: OrderEvent) -> Result<(), SettlementError> {
        if event.attempt >= self.max_republish_count {
            warn!(
                order_number = %event.order_number,
                attempt = event.attempt,
                "重投递次数耗尽，订单判定为无效"
            );
            self.orders
                .finalize(event.order_id, OrderStatus::Invalid, None, None)
                .await?;
            return Ok(());
        }

        let delay = self.backoff.delay_for_attempt(event.attempt);
        self.scheduler.schedule(event.next_attempt(), delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mockall::predicate::eq;
    use uuid::Uuid;

    use bonus_shared::config::BackoffKind;

    use crate::gateway::{AccrualError, AccrualReply, MockAccrualGateway};
    use crate::queue;
    use crate::store::MockOrderStore;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            kind: BackoffKind::Linear,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    fn event(attempt: u32) -> OrderEvent {
        OrderEvent {
            order_id: Uuid::now_v7(),
            order_number: "12345678903".to_string(),
            user_id: Uuid::new_v4(),
            attempt,
        }
    }

    fn reply(status: AccrualStatus, accrual: Option<Decimal>) -> AccrualReply {
        AccrualReply {
            number: "12345678903".to_string(),
            status,
            accrual,
        }
    }

    fn worker(
        orders: MockOrderStore,
        gateway: MockAccrualGateway,
    ) -> (SettlementWorker, crate::queue::EventSubscriber) {
        let (publisher, subscriber) = queue::channel(8);
        let (scheduler, _driver) = crate::queue::SchedulerDriver::new(publisher);
        (
            SettlementWorker::new(
                Arc::new(orders),
                Arc::new(gateway),
                scheduler,
                fast_backoff(),
                3,
            ),
            subscriber,
        )
    }

    #[tokio::test]
    async fn test_processed_order_credits_ledger_once() {
        let ev = event(0);
        let order_id = ev.order_id;
        let user_id = ev.user_id;

        let mut orders = MockOrderStore::new();
        orders
            .expect_mark_processing()
            .with(eq(order_id))
            .times(1)
            .returning(|_| Ok(()));
        orders
            .expect_finalize()
            .withf(move |id, status, accrual, credit| {
                *id == order_id
                    && *status == OrderStatus::Processed
                    && *accrual == Some(Decimal::new(5055, 2))
                    && credit.as_ref().is_some_and(|c| {
                        c.user_id == user_id && c.amount == Decimal::new(5055, 2)
                    })
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .times(1)
            .returning(|_| Ok(reply(AccrualStatus::Processed, Some(Decimal::new(5055, 2)))));

        let (worker, _sub) = worker(orders, gateway);
        worker.settle_one(ev).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_accrual_writes_no_ledger_entry() {
        let ev = event(0);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        orders
            .expect_finalize()
            .withf(|_, status, accrual, credit| {
                *status == OrderStatus::Processed
                    && *accrual == Some(Decimal::ZERO)
                    && credit.is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Ok(reply(AccrualStatus::Processed, None)));

        let (worker, _sub) = worker(orders, gateway);
        worker.settle_one(ev).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_event_is_idempotent() {
        let ev = event(0);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        // 订单已是终态，存储层返回 false，工作者静默跳过
        orders
            .expect_finalize()
            .times(1)
            .returning(|_, _, _, _| Ok(false));

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Ok(reply(AccrualStatus::Processed, Some(Decimal::ONE))));

        let (worker, _sub) = worker(orders, gateway);
        worker.settle_one(ev).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_order_gets_no_accrual() {
        let ev = event(0);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        orders
            .expect_finalize()
            .withf(|_, status, accrual, credit| {
                *status == OrderStatus::Invalid && accrual.is_none() && credit.is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Ok(reply(AccrualStatus::Invalid, None)));

        let (worker, _sub) = worker(orders, gateway);
        worker.settle_one(ev).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_error_schedules_republish() {
        let ev = event(0);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        // 瞬时故障不 finalize
        orders.expect_finalize().times(0);

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Err(AccrualError::RateLimited));

        let (publisher, mut subscriber) = queue::channel(8);
        let (scheduler, driver) = crate::queue::SchedulerDriver::new(publisher);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver_handle = tokio::spawn(driver.run(shutdown_rx));

        let worker = SettlementWorker::new(
            Arc::new(orders),
            Arc::new(gateway),
            scheduler,
            fast_backoff(),
            3,
        );

        worker.settle_one(ev).await.unwrap();

        // 事件带着递增后的 attempt 回到队列
        let republished = subscriber.recv().await.unwrap();
        assert_eq!(republished.attempt, 1);

        shutdown_tx.send(true).unwrap();
        driver_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_processing_treated_as_transient() {
        let ev = event(0);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        // 中间状态不允许写回
        orders.expect_finalize().times(0);

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Ok(reply(AccrualStatus::Processing, None)));

        let (worker, _sub) = worker(orders, gateway);
        worker.settle_one(ev).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_republish_marks_invalid() {
        // attempt 已达上限
        let ev = event(3);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        orders
            .expect_finalize()
            .withf(|_, status, accrual, credit| {
                *status == OrderStatus::Invalid && accrual.is_none() && credit.is_none()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Err(AccrualError::RemoteInternal { status: 500 }));

        let (worker, _sub) = worker(orders, gateway);
        worker.settle_one(ev).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_order_event_never_reaches_gateway() {
        let ev = event(0);
        let order_id = ev.order_id;

        // 事件指向存储里不存在的订单：硬故障向上传播，不调用网关
        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(move |_| {
            Err(bonus_shared::error::BonusError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            })
        });
        orders.expect_finalize().times(0);

        let mut gateway = MockAccrualGateway::new();
        gateway.expect_lookup().times(0);

        let (worker, _sub) = worker(orders, gateway);
        let err = worker.settle_one(ev).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::Shared(bonus_shared::error::BonusError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_hard_error_propagates() {
        let ev = event(0);

        let mut orders = MockOrderStore::new();
        orders.expect_mark_processing().returning(|_| Ok(()));
        orders.expect_finalize().times(0);

        let mut gateway = MockAccrualGateway::new();
        gateway
            .expect_lookup()
            .returning(|_| Err(AccrualError::Decode("坏 JSON".to_string())));

        let (worker, _sub) = worker(orders, gateway);
        let err = worker.settle_one(ev).await.unwrap_err();
        assert!(matches!(err, SettlementError::Gateway(_)));
    }
}
