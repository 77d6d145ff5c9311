//! 重试与退避策略
//!
//! 结算管道里有两处用到退避：网关客户端对纯传输故障的原地重试，
//! 以及结算工作者对瞬时业务故障的延迟重投递。两者共享同一套
//! 退避时间计算，区别只在于等待发生在哪里。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::BackoffKind;

// ---------------------------------------------------------------------------
// BackoffPolicy — 退避时间计算
// ---------------------------------------------------------------------------

/// 退避策略
///
/// 只要求等待时间随 attempt 单调不减：线性适合上游按固定节奏恢复的场景
/// （原始需求的默认），指数适合故障可能持续较久、需要快速拉开间隔的场景。
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    /// 基准等待时间
    pub base_delay: Duration,
    /// 等待时间上限
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Linear,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// 计算第 N 次重试前的等待时间（attempt 从 0 开始）
    ///
    /// 线性: base * (attempt + 1)；指数: base * 2^attempt。
    /// 结果不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            BackoffKind::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy — 原地重试配置
// ---------------------------------------------------------------------------

/// 原地重试策略：退避 + 次数上限
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy {
                kind: BackoffKind::Exponential,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

impl RetryPolicy {
    /// attempt 表示已经失败的次数，当 attempt < max_retries 时继续重试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// retry_with_policy — 带重试的异步执行器
// ---------------------------------------------------------------------------

/// 带重试的异步执行器
///
/// 仅在操作返回可重试错误时才重试；业务错误直接向上传播，
/// 由调用方通过 `is_retryable` 闭包控制。
pub async fn retry_with_policy<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if !policy.should_retry(attempt) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %err,
                        "已达最大重试次数，放弃重试"
                    );
                    return Err(err);
                }

                let delay = policy.backoff.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
