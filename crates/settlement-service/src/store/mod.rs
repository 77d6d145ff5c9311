//! 存储层
//!
//! 以窄接口（capability trait）的方式定义订单存储与账本存储，
//! 结算工作者和余额服务依赖抽象而非具体实现，便于替换与 mock 测试。
//!
//! 两个关键的原子性约定由实现方保证：
//! - `OrderStore::finalize`：订单终态写入和账本入账是一个单元，不允许出现
//!   "订单已 Processed 但没有对应入账"（或反之）的中间状态；
//! - `LedgerStore::withdraw`：余额检查和扣减流水写入在同一串行化边界内执行，
//!   并发提现不可能同时通过只够一笔的余额检查。

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{PgLedgerStore, PgOrderStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use bonus_shared::error::Result;

use crate::models::{LedgerEntry, Order, OrderStatus, Withdrawal};

/// 订单存储接口
///
/// 订单状态只能前进；除注册（insert）外，只有结算工作者会调用写方法。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 按订单号查找，订单号全局唯一
    async fn find_by_number(&self, number: &str) -> Result<Option<Order>>;

    /// 登记新订单；订单号已存在时返回 `AlreadyExists`
    async fn insert(&self, order: &Order) -> Result<()>;

    /// 乐观地进入 Processing 状态；只对 Registered 生效，其余状态下是 no-op。
    /// 订单不存在时返回 `NotFound`，与 `finalize` 的约定一致。
    async fn mark_processing(&self, order_id: Uuid) -> Result<()>;

    /// 终态写入单元：订单状态 + accrual + 可选的入账流水，原子生效。
    ///
    /// 订单已处于终态时不做任何写入并返回 `false`（幂等 no-op），
    /// 保证对同一订单重复结算永远不会产生第二条入账。
    async fn finalize(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        accrual: Option<Decimal>,
        credit: Option<LedgerEntry>,
    ) -> Result<bool>;

    /// 用户的全部订单，按上传时间倒序
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Order>>;

    /// 在 cutoff 之前上传、仍停留在非终态的订单（对账扫描的输入）
    async fn list_unsettled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Order>>;
}

/// 账本存储接口
///
/// 流水只追加，余额和累计提现永远是聚合查询的结果。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 追加一条流水；(user_id, order_number, 符号) 冲突时返回 `AlreadyExists`
    async fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// 当前余额 = 全部流水金额之和
    async fn current_balance(&self, user_id: Uuid) -> Result<Decimal>;

    /// 累计提现 = 负数流水之和取反
    async fn withdrawn(&self, user_id: Uuid) -> Result<Decimal>;

    /// 受守卫的提现：余额不足时返回 `InsufficientFunds` 且不产生任何写入。
    /// amount 传入正的扣减额度。
    async fn withdraw(&self, user_id: Uuid, order_number: &str, amount: Decimal) -> Result<()>;

    /// 提现记录读模型，按时间倒序
    async fn withdrawals(&self, user_id: Uuid) -> Result<Vec<Withdrawal>>;
}
