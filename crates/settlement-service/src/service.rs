//! 业务服务门面
//!
//! 聚合订单与账本两个存储能力，是 API 层唯一的依赖。
//! 订单上传在这里完成去重分类并触发异步结算，余额与提现
//! 直接委托给账本存储（原子性由存储层保证）。

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument};
use uuid::Uuid;

use bonus_shared::error::{BonusError, Result};

use crate::models::{Order, OrderEvent, UserBalance, Withdrawal};
use crate::queue::EventPublisher;
use crate::store::{LedgerStore, OrderStore};

/// 订单上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 新订单已登记并进入结算队列
    Accepted,
    /// 同一用户重复上传同一订单号，幂等返回
    AlreadyUploaded,
}

/// 业务服务门面
pub struct BonusService {
    orders: Arc<dyn OrderStore>,
    ledger: Arc<dyn LedgerStore>,
    publisher: EventPublisher,
}

impl BonusService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        ledger: Arc<dyn LedgerStore>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            orders,
            ledger,
            publisher,
        }
    }

    /// 上传订单
    ///
    /// 三种结局：新订单 Accepted，本人重复上传 AlreadyUploaded，
    /// 他人已占用该订单号则返回 OrderConflict。
    #[instrument(skip(self))]
    pub async fn submit_order(&self, user_id: Uuid, number: &str) -> Result<SubmitOutcome> {
        validate_order_number(number)?;

        if let Some(existing) = self.orders.find_by_number(number).await? {
            return classify_duplicate(&existing, user_id, number);
        }

        let order = Order::new(user_id, number);
        match self.orders.insert(&order).await {
            Ok(()) => {}
            Err(BonusError::AlreadyExists { .. }) => {
                // 与并发上传撞车，重新读出来分类
                let existing = self.orders.find_by_number(number).await?.ok_or_else(|| {
                    BonusError::Internal(format!("订单 {} 插入冲突后读取不到", number))
                })?;
                return classify_duplicate(&existing, user_id, number);
            }
            Err(err) => return Err(err),
        }

        info!(order_number = number, "新订单已登记，进入结算队列");
        self.publisher.publish(OrderEvent::for_order(&order));

        Ok(SubmitOutcome::Accepted)
    }

    /// 用户的订单列表，按上传时间倒序
    pub async fn orders(&self, user_id: Uuid) -> Result<Vec<Order>> {
        self.orders.list_for_user(user_id).await
    }

    /// 用户余额：当前可用余额与累计提现
    pub async fn balance(&self, user_id: Uuid) -> Result<UserBalance> {
        let current = self.ledger.current_balance(user_id).await?;
        let withdrawn = self.ledger.withdrawn(user_id).await?;
        Ok(UserBalance { current, withdrawn })
    }

    /// 提现：从余额中扣减 amount，挂在 order_number 名下
    #[instrument(skip(self))]
    pub async fn withdraw(&self, user_id: Uuid, order_number: &str, amount: Decimal) -> Result<()> {
        validate_order_number(order_number)?;
        if amount <= Decimal::ZERO {
            return Err(BonusError::Validation(format!(
                "提现金额必须为正数，收到 {}",
                amount
            )));
        }

        self.ledger.withdraw(user_id, order_number, amount).await?;
        info!(order_number, amount = %amount, "提现成功");
        Ok(())
    }

    /// 用户的提现记录，按时间倒序
    pub async fn withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>> {
        self.ledger.withdrawals(user_id).await
    }
}

fn classify_duplicate(existing: &Order, user_id: Uuid, number: &str) -> Result<SubmitOutcome> {
    if existing.user_id == user_id {
        Ok(SubmitOutcome::AlreadyUploaded)
    } else {
        Err(BonusError::OrderConflict {
            number: number.to_string(),
        })
    }
}

fn validate_order_number(number: &str) -> Result<()> {
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BonusError::Validation(format!(
            "订单号必须是非空数字串，收到 {:?}",
            number
        )));
    }
    Ok(())
}
