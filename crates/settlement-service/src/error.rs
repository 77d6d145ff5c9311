//! 结算服务错误类型

use thiserror::Error;

use bonus_shared::error::BonusError;

use crate::gateway::AccrualError;

/// 结算管道内部错误
///
/// 网关错误在工作者层面已按瞬时/硬故障分流，走到这里的都是硬故障。
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("计算服务网关错误: {0}")]
    Gateway(#[from] AccrualError),

    #[error(transparent)]
    Shared(#[from] BonusError),
}
