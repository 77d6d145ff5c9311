//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use rust_decimal::Decimal;
use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum BonusError {
    // ==================== 基础设施错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 领域冲突 ====================
    // 这一组是预期内的业务结果，返回给调用方处理，不作为系统错误记录。
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("记录已存在: {entity} {key}")]
    AlreadyExists { entity: String, key: String },

    #[error("订单号已被其他用户占用: {number}")]
    OrderConflict { number: String },

    #[error("积分余额不足: 需要 {requested}, 当前 {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    // ==================== 队列错误 ====================
    /// 结算队列的消费端已关闭，通常只在进程退出阶段出现
    #[error("结算队列已关闭")]
    QueueClosed,

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("外部服务超时: {service}")]
    ExternalServiceTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, BonusError>;

impl BonusError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::OrderConflict { .. } => "ORDER_CONFLICT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalServiceTimeout { .. } => "EXTERNAL_SERVICE_TIMEOUT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误（基础设施层瞬时故障）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::ExternalServiceTimeout { .. }
        )
    }

    /// 是否为领域冲突（预期内的业务结果，不按错误级别记录日志）
    pub fn is_domain_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. }
                | Self::OrderConflict { .. }
                | Self::InsufficientFunds { .. }
        )
    }
}
