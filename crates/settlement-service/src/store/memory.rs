//! 内存存储实现
//!
//! 所有状态在一把互斥锁之下，天然满足存储层的两条原子性约定。
//! 用于单元/集成测试，也支撑无数据库的本地运行演练。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use bonus_shared::error::{BonusError, Result};

use super::{LedgerStore, OrderStore};
use crate::models::{LedgerEntry, Order, OrderStatus, Withdrawal};

#[derive(Default)]
struct Inner {
    orders: HashMap<Uuid, Order>,
    /// 订单号 -> 订单 id，承担订单号全局唯一约束
    by_number: HashMap<String, Uuid>,
    entries: Vec<LedgerEntry>,
}

impl Inner {
    fn balance(&self, user_id: Uuid) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.amount)
            .sum()
    }

    /// (user_id, order_number, 符号) 幂等键检查
    fn has_entry(&self, entry: &LedgerEntry) -> bool {
        self.entries.iter().any(|e| {
            e.user_id == entry.user_id
                && e.order_number == entry.order_number
                && e.amount.is_sign_positive() == entry.amount.is_sign_positive()
        })
    }

    fn push_entry(&mut self, entry: LedgerEntry) -> Result<()> {
        if self.has_entry(&entry) {
            return Err(BonusError::AlreadyExists {
                entity: "LedgerEntry".to_string(),
                key: entry.order_number,
            });
        }
        self.entries.push(entry);
        Ok(())
    }
}

/// 内存存储，同时实现订单存储与账本存储
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn find_by_number(&self, number: &str) -> Result<Option<Order>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_number
            .get(number)
            .and_then(|id| inner.orders.get(id))
            .cloned())
    }

    async fn insert(&self, order: &Order) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.by_number.contains_key(&order.number) {
            return Err(BonusError::AlreadyExists {
                entity: "Order".to_string(),
                key: order.number.clone(),
            });
        }
        inner.by_number.insert(order.number.clone(), order.id);
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn mark_processing(&self, order_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(order) = inner.orders.get_mut(&order_id) else {
            return Err(BonusError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            });
        };
        if order.status == OrderStatus::Registered {
            order.status = OrderStatus::Processing;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        accrual: Option<Decimal>,
        credit: Option<LedgerEntry>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();

        let Some(order) = inner.orders.get_mut(&order_id) else {
            return Err(BonusError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            });
        };

        if order.status.is_terminal() {
            return Ok(false);
        }

        order.status = status;
        order.accrual = accrual;

        if let Some(entry) = credit {
            // 终态守卫已拦截重复结算，这里容忍幂等键冲突作为兜底
            if !inner.has_entry(&entry) {
                inner.entries.push(entry);
            }
        }

        Ok(true)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(orders)
    }

    async fn list_unsettled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .orders
            .values()
            .filter(|o| !o.status.is_terminal() && o.uploaded_at < cutoff)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(orders)
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        self.inner.lock().push_entry(entry.clone())
    }

    async fn current_balance(&self, user_id: Uuid) -> Result<Decimal> {
        Ok(self.inner.lock().balance(user_id))
    }

    async fn withdrawn(&self, user_id: Uuid) -> Result<Decimal> {
        let inner = self.inner.lock();
        let total: Decimal = inner
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.amount < Decimal::ZERO)
            .map(|e| e.amount)
            .sum();
        Ok(-total)
    }

    async fn withdraw(&self, user_id: Uuid, order_number: &str, amount: Decimal) -> Result<()> {
        // 检查和写入在同一把锁内，并发提现不可能都通过只够一笔的余额
        let mut inner = self.inner.lock();

        let available = inner.balance(user_id);
        if available < amount {
            return Err(BonusError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        inner.push_entry(LedgerEntry::debit(user_id, order_number, amount))
    }

    async fn withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>> {
        let inner = self.inner.lock();
        let mut withdrawals: Vec<Withdrawal> = inner
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.amount < Decimal::ZERO)
            .map(|e| Withdrawal {
                order_number: e.order_number.clone(),
                amount: -e.amount,
                processed_at: e.created_at,
            })
            .collect();
        withdrawals.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(withdrawals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    #[tokio::test]
    async fn test_order_number_unique() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        store.insert(&Order::new(user, "123")).await.unwrap();

        let err = store.insert(&Order::new(user, "123")).await.unwrap_err();
        assert!(matches!(err, BonusError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_balance_derived_from_entries() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        store
            .append(&LedgerEntry::credit(user, "1", dec(5055)))
            .await
            .unwrap();
        store
            .append(&LedgerEntry::debit(user, "2", dec(2000)))
            .await
            .unwrap();

        assert_eq!(store.current_balance(user).await.unwrap(), dec(3055));
        assert_eq!(store.withdrawn(user).await.unwrap(), dec(2000));
    }

    #[tokio::test]
    async fn test_append_idempotency_key() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        store
            .append(&LedgerEntry::credit(user, "1", dec(100)))
            .await
            .unwrap();

        // 同一订单的第二次入账被幂等键拦截
        let err = store
            .append(&LedgerEntry::credit(user, "1", dec(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, BonusError::AlreadyExists { .. }));

        // 但同一订单号上的提现（符号不同）是允许的
        store
            .append(&LedgerEntry::debit(user, "1", dec(50)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_withdraw_insufficient_leaves_ledger_untouched() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        store
            .append(&LedgerEntry::credit(user, "1", dec(3055)))
            .await
            .unwrap();

        let err = store.withdraw(user, "2", dec(4000)).await.unwrap_err();
        assert!(matches!(err, BonusError::InsufficientFunds { .. }));

        // 余额不变，没有产生提现记录
        assert_eq!(store.current_balance(user).await.unwrap(), dec(3055));
        assert!(store.withdrawals(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_idempotent() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let order = Order::new(user, "123");
        store.insert(&order).await.unwrap();

        let applied = store
            .finalize(
                order.id,
                OrderStatus::Processed,
                Some(dec(5055)),
                Some(LedgerEntry::credit(user, "123", dec(5055))),
            )
            .await
            .unwrap();
        assert!(applied);

        // 第二次 finalize 是 no-op，不产生第二条入账
        let applied = store
            .finalize(
                order.id,
                OrderStatus::Processed,
                Some(dec(5055)),
                Some(LedgerEntry::credit(user, "123", dec(5055))),
            )
            .await
            .unwrap();
        assert!(!applied);

        assert_eq!(store.current_balance(user).await.unwrap(), dec(5055));
    }

    #[tokio::test]
    async fn test_mark_processing_unknown_order_not_found() {
        let store = InMemoryStore::new();

        let err = store.mark_processing(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BonusError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_status_monotonic() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let order = Order::new(user, "123");
        store.insert(&order).await.unwrap();

        store
            .finalize(order.id, OrderStatus::Invalid, None, None)
            .await
            .unwrap();

        // 终态之后 mark_processing 与 finalize 都不再生效
        store.mark_processing(order.id).await.unwrap();
        let applied = store
            .finalize(order.id, OrderStatus::Processed, Some(dec(100)), None)
            .await
            .unwrap();
        assert!(!applied);

        let found = store.find_by_number("123").await.unwrap().unwrap();
        assert_eq!(found.status, OrderStatus::Invalid);
        assert!(found.accrual.is_none());
    }

    #[tokio::test]
    async fn test_list_unsettled_filters_terminal_and_fresh() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();

        let mut stale = Order::new(user, "1");
        stale.uploaded_at = Utc::now() - chrono::Duration::minutes(10);
        store.insert(&stale).await.unwrap();

        let fresh = Order::new(user, "2");
        store.insert(&fresh).await.unwrap();

        let mut done = Order::new(user, "3");
        done.uploaded_at = Utc::now() - chrono::Duration::minutes(10);
        store.insert(&done).await.unwrap();
        store
            .finalize(done.id, OrderStatus::Processed, Some(dec(1)), None)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let stuck = store.list_unsettled(cutoff).await.unwrap();

        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].number, "1");
    }
}
