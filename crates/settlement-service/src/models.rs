//! 领域模型
//!
//! 结算管道涉及三类数据：订单（有生命周期状态）、账本流水（只追加、带符号的
//! 金额记录）和结算事件（进程内瞬时消息）。余额和累计提现从不单独存储，
//! 永远由账本流水推导，保证两者不会与产生它们的流水漂移。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 订单生命周期状态
///
/// 状态只能前进：Registered -> Processing -> {Processed, Invalid}。
/// Processed 和 Invalid 是终态，之后不再有任何状态或账本写入。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已登记，等待结算
    #[default]
    Registered,
    /// 结算工作者已开始处理（乐观标记，让中间态可观测）
    Processing,
    /// 终态：积分系统判定无效，或重投递次数耗尽
    Invalid,
    /// 终态：积分已计算完成
    Processed,
}

impl OrderStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Invalid)
    }
}

/// 订单
///
/// `number` 是全局唯一的业务键，一个订单号永远只属于一个用户。
/// `accrual` 只在进入 Processed 时写入一次。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub number: String,
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// 新建一个待结算订单
    pub fn new(user_id: Uuid, number: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            number: number.into(),
            status: OrderStatus::Registered,
            accrual: None,
            uploaded_at: Utc::now(),
        }
    }
}

/// 账本流水
///
/// 不可变、只追加。金额带符号：正数为结算积分入账，负数为提现扣减。
/// (user_id, order_number, 符号) 作为幂等键，拦截对同一订单的重复入账
/// 和对同一提现请求的重复扣减。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// 结算入账流水（正金额）
    pub fn credit(user_id: Uuid, order_number: impl Into<String>, amount: Decimal) -> Self {
        Self {
            user_id,
            order_number: order_number.into(),
            amount,
            created_at: Utc::now(),
        }
    }

    /// 提现扣减流水（负金额，amount 传入正的扣减额度）
    pub fn debit(user_id: Uuid, order_number: impl Into<String>, amount: Decimal) -> Self {
        Self {
            user_id,
            order_number: order_number.into(),
            amount: -amount,
            created_at: Utc::now(),
        }
    }
}

/// 结算事件
///
/// 进程内的瞬时消息，不落盘；进程崩溃时在途事件随之丢失，
/// 由对账扫描从订单表里重新推导出待结算的工作。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    /// 第几次投递，首次为 0，每次重投递加一
    pub attempt: u32,
}

impl OrderEvent {
    pub fn for_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            order_number: order.number.clone(),
            user_id: order.user_id,
            attempt: 0,
        }
    }

    /// 生成下一次投递的事件副本
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// 提现记录（读模型）
///
/// 由负数账本流水物化而来，金额取反后对外展示为正数。
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Withdrawal {
    pub order_number: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// 用户余额（派生值，永不落盘）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserBalance {
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}
