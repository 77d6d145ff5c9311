//! 积分计算网关
//!
//! 封装对外部 accrual 服务的 HTTP 访问。网关只负责把远端的
//! 应答和故障翻译成结构化的结果，重投递决策交给结算工作者。

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use bonus_shared::config::{AccrualConfig, BackoffKind};
use bonus_shared::retry::{retry_with_policy, BackoffPolicy, RetryPolicy};

/// 远端订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

/// accrual 服务的应答体
#[derive(Debug, Clone, Deserialize)]
pub struct AccrualReply {
    #[serde(rename = "order")]
    pub number: String,
    pub status: AccrualStatus,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
}

/// 网关错误
///
/// `is_transient` 为真的变体会触发结算事件的延迟重投递，
/// 其余变体直接向上传播，由工作者记录后丢弃该事件。
#[derive(Debug, Error)]
pub enum AccrualError {
    /// 204：订单尚未被计算服务登记
    #[error("订单 {number} 尚未在计算服务登记")]
    OrderNotRegistered { number: String },

    /// 429：计算服务限流
    #[error("计算服务请求被限流")]
    RateLimited,

    /// 5xx：计算服务内部错误
    #[error("计算服务内部错误: HTTP {status}")]
    RemoteInternal { status: u16 },

    /// 传输层故障（连接失败、超时）
    #[error("计算服务传输故障: {0}")]
    Transport(String),

    /// 应答体解析失败
    #[error("计算服务应答解析失败: {0}")]
    Decode(String),

    /// 协议之外的状态码
    #[error("计算服务返回预期外的状态码: HTTP {status}")]
    Unexpected { status: u16 },
}

impl AccrualError {
    /// 是否属于瞬时故障，值得延迟重投递后再试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::OrderNotRegistered { .. }
                | Self::RateLimited
                | Self::RemoteInternal { .. }
                | Self::Transport(_)
        )
    }
}

/// 积分计算网关能力
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualGateway: Send + Sync {
    /// 查询订单的积分计算结果
    async fn lookup(&self, number: &str) -> Result<AccrualReply, AccrualError>;
}

/// 基于 HTTP 的网关实现
///
/// 协议：GET {base_url}/api/orders/{number}
/// - 200 带 JSON 应答体
/// - 204 订单未登记
/// - 429 限流
/// - 5xx 远端内部错误
pub struct HttpAccrualGateway {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpAccrualGateway {
    pub fn new(config: &AccrualConfig) -> Result<Self, AccrualError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| AccrualError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy {
                max_retries: config.transport_retries,
                backoff: BackoffPolicy {
                    kind: BackoffKind::Exponential,
                    base_delay: Duration::from_millis(200),
                    max_delay: Duration::from_secs(5),
                },
            },
        })
    }

    async fn fetch(&self, number: &str) -> Result<AccrualReply, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AccrualError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(order_number = number, status = status.as_u16(), "计算服务应答");

        match status.as_u16() {
            200 => response
                .json::<AccrualReply>()
                .await
                .map_err(|e| AccrualError::Decode(e.to_string())),
            204 => Err(AccrualError::OrderNotRegistered {
                number: number.to_string(),
            }),
            429 => Err(AccrualError::RateLimited),
            code if (500..600).contains(&code) => Err(AccrualError::RemoteInternal { status: code }),
            code => Err(AccrualError::Unexpected { status: code }),
        }
    }
}

#[async_trait]
impl AccrualGateway for HttpAccrualGateway {
    async fn lookup(&self, number: &str) -> Result<AccrualReply, AccrualError> {
        // 只有纯传输故障在此处原地重试，业务层的瞬时状态交给重投递
        retry_with_policy(
            &self.retry,
            "accrual_lookup",
            |e: &AccrualError| matches!(e, AccrualError::Transport(_)),
            || self.fetch(number),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AccrualError::OrderNotRegistered {
            number: "1".to_string()
        }
        .is_transient());
        assert!(AccrualError::RateLimited.is_transient());
        assert!(AccrualError::RemoteInternal { status: 500 }.is_transient());
        assert!(AccrualError::Transport("超时".to_string()).is_transient());

        assert!(!AccrualError::Decode("坏 JSON".to_string()).is_transient());
        assert!(!AccrualError::Unexpected { status: 418 }.is_transient());
    }

    #[test]
    fn test_reply_deserialize() {
        let reply: AccrualReply =
            serde_json::from_str(r#"{"order":"12345678903","status":"PROCESSED","accrual":50.55}"#)
                .unwrap();
        assert_eq!(reply.number, "12345678903");
        assert_eq!(reply.status, AccrualStatus::Processed);
        assert_eq!(reply.accrual, Some(Decimal::new(5055, 2)));
    }

    #[test]
    fn test_reply_deserialize_without_accrual() {
        let reply: AccrualReply =
            serde_json::from_str(r#"{"order":"12345678903","status":"INVALID"}"#).unwrap();
        assert_eq!(reply.status, AccrualStatus::Invalid);
        assert!(reply.accrual.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let gateway = HttpAccrualGateway::new(&AccrualConfig {
            base_url: "http://localhost:8081/".to_string(),
            ..AccrualConfig::default()
        })
        .unwrap();
        assert_eq!(gateway.base_url, "http://localhost:8081");
    }
}
