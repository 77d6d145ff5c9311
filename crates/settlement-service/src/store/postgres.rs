//! PostgreSQL 存储实现
//!
//! 表结构见仓库根目录的 schema.sql。两条原子性约定的落地方式：
//! - `finalize` 在单个事务里完成订单终态更新和账本入账，终态守卫
//!   （只更新非终态行）加上账本的幂等唯一键，双保险拦截重复入账；
//! - `withdraw` 在事务内先取用户粒度的 advisory lock 再做检查加写入，
//!   同一用户的并发提现被串行化，不同用户互不阻塞。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use bonus_shared::error::{BonusError, Result};

use super::{LedgerStore, OrderStore};
use crate::models::{LedgerEntry, Order, OrderStatus, Withdrawal};

/// 唯一约束冲突判定
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// PgOrderStore
// ---------------------------------------------------------------------------

/// 订单存储（PostgreSQL）
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn find_by_number(&self, number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, number, status, accrual, uploaded_at
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn insert(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, number, status, accrual, uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(&order.number)
        .bind(order.status)
        .bind(order.accrual)
        .bind(order.uploaded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BonusError::AlreadyExists {
                    entity: "Order".to_string(),
                    key: order.number.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn mark_processing(&self, order_id: Uuid) -> Result<()> {
        // 只允许 Registered -> Processing，其余状态保持原样
        let updated = sqlx::query(
            r#"
            UPDATE orders SET status = $2
            WHERE id = $1 AND status = $3
            "#,
        )
        .bind(order_id)
        .bind(OrderStatus::Processing)
        .bind(OrderStatus::Registered)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // 没更新到行：区分"订单不在 Registered"（正常 no-op）和"订单不存在"
            let exists = sqlx::query_scalar::<_, bool>(
                r#"SELECT EXISTS(SELECT 1 FROM orders WHERE id = $1)"#,
            )
            .bind(order_id)
            .fetch_one(&self.pool)
            .await?;

            if !exists {
                return Err(BonusError::NotFound {
                    entity: "Order".to_string(),
                    id: order_id.to_string(),
                });
            }
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
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE orders SET status = $2, accrual = $3
            WHERE id = $1 AND status IN ($4, $5)
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(accrual)
        .bind(OrderStatus::Registered)
        .bind(OrderStatus::Processing)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // 订单已是终态：幂等 no-op，不触碰账本
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(entry) = credit {
            // 终态守卫已经拦截了重复入账，ON CONFLICT 是针对幂等键的兜底
            sqlx::query(
                r#"
                INSERT INTO ledger_entries (user_id, order_number, amount, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(entry.user_id)
            .bind(&entry.order_number)
            .bind(entry.amount)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, number, status, accrual, uploaded_at
            FROM orders
            WHERE user_id = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn list_unsettled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, number, status, accrual, uploaded_at
            FROM orders
            WHERE status IN ($1, $2) AND uploaded_at < $3
            ORDER BY uploaded_at ASC
            "#,
        )
        .bind(OrderStatus::Registered)
        .bind(OrderStatus::Processing)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}

// ---------------------------------------------------------------------------
// PgLedgerStore
// ---------------------------------------------------------------------------

/// 账本存储（PostgreSQL）
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (user_id, order_number, amount, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.order_number)
        .bind(entry.amount)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BonusError::AlreadyExists {
                    entity: "LedgerEntry".to_string(),
                    key: entry.order_number.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn current_balance(&self, user_id: Uuid) -> Result<Decimal> {
        let balance = sqlx::query_scalar::<_, Decimal>(
            r#"SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }

    async fn withdrawn(&self, user_id: Uuid) -> Result<Decimal> {
        let withdrawn = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(-SUM(amount), 0)
            FROM ledger_entries
            WHERE user_id = $1 AND amount < 0
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(withdrawn)
    }

    async fn withdraw(&self, user_id: Uuid, order_number: &str, amount: Decimal) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // 用户粒度的事务级 advisory lock：同一用户的检查-写入被串行化，
        // 锁在事务结束时自动释放
        sqlx::query(r#"SELECT pg_advisory_xact_lock(hashtextextended($1::text, 0))"#)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let available = sqlx::query_scalar::<_, Decimal>(
            r#"SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        if available < amount {
            tx.rollback().await?;
            return Err(BonusError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (user_id, order_number, amount, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(order_number)
        .bind(-amount)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BonusError::AlreadyExists {
                    entity: "LedgerEntry".to_string(),
                    key: order_number.to_string(),
                }
            } else {
                BonusError::from(e)
            }
        })?;

        tx.commit().await?;
        Ok(())
    }

    async fn withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>> {
        let withdrawals = sqlx::query_as::<_, Withdrawal>(
            r#"
            SELECT order_number, -amount AS amount, created_at AS processed_at
            FROM ledger_entries
            WHERE user_id = $1 AND amount < 0
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(withdrawals)
    }
}
