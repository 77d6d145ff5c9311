//! HTTP API 层
//!
//! 只做 DTO 映射和状态码翻译，全部业务行为都在 `BonusService` 门面里。
//! 用户身份由上游网关注入的 `X-User-Id` 头传递，本服务不做认证。

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use bonus_shared::error::BonusError;

use crate::models::{Order, OrderStatus, UserBalance, Withdrawal};
use crate::service::{BonusService, SubmitOutcome};

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BonusService>,
}

impl AppState {
    pub fn new(service: Arc<BonusService>) -> Self {
        Self { service }
    }
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/user/orders", post(submit_order).get(list_orders))
        .route("/api/user/balance", get(balance))
        .route("/api/user/balance/withdraw", post(withdraw))
        .route("/api/user/withdrawals", get(withdrawals))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// 错误映射
// ---------------------------------------------------------------------------

/// API 层错误
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("缺少或非法的用户标识")]
    Unauthorized,

    #[error(transparent)]
    Domain(#[from] BonusError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Domain(err) => match err {
                BonusError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BonusError::NotFound { .. } => StatusCode::NOT_FOUND,
                BonusError::AlreadyExists { .. } | BonusError::OrderConflict { .. } => {
                    StatusCode::CONFLICT
                }
                BonusError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Domain(err) => err.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 基础设施错误只返回通用提示，详细信息记录日志；
        // 领域冲突是预期内的业务结果，原样返回且不按错误级别记日志
        let message = match &self {
            Self::Domain(err) if !err.is_domain_conflict() && status.is_server_error() => {
                tracing::error!(error = %err, "请求处理失败");
                "服务内部错误，请稍后重试".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "code": self.error_code(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

/// 从上游网关注入的头里取出用户标识
fn user_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or(ApiError::Unauthorized)
}

// ---------------------------------------------------------------------------
// DTO
// ---------------------------------------------------------------------------

/// 订单视图
#[derive(Debug, Serialize)]
struct OrderDto {
    number: String,
    status: OrderStatus,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    accrual: Option<Decimal>,
    uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderDto {
    fn from(order: Order) -> Self {
        Self {
            number: order.number,
            status: order.status,
            accrual: order.accrual,
            uploaded_at: order.uploaded_at,
        }
    }
}

/// 提现请求体
#[derive(Debug, Deserialize)]
struct WithdrawRequest {
    order: String,
    #[serde(with = "rust_decimal::serde::float")]
    sum: Decimal,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/user/orders
///
/// 202 新订单已进入结算队列；200 本人重复上传；409 订单号已被他人占用。
async fn submit_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let user = user_id(&headers)?;
    let number = body.trim();

    match state.service.submit_order(user, number).await? {
        SubmitOutcome::Accepted => Ok(StatusCode::ACCEPTED),
        SubmitOutcome::AlreadyUploaded => Ok(StatusCode::OK),
    }
}

/// GET /api/user/orders，空列表返回 204
async fn list_orders(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let orders = state.service.orders(user).await?;

    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let dtos: Vec<OrderDto> = orders.into_iter().map(OrderDto::from).collect();
    Ok(Json(dtos).into_response())
}

/// GET /api/user/balance
async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserBalance>, ApiError> {
    let user = user_id(&headers)?;
    Ok(Json(state.service.balance(user).await?))
}

/// POST /api/user/balance/withdraw，余额不足返回 402
async fn withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<WithdrawRequest>,
) -> Result<StatusCode, ApiError> {
    let user = user_id(&headers)?;
    state
        .service
        .withdraw(user, &request.order, request.sum)
        .await?;
    Ok(StatusCode::OK)
}

/// GET /api/user/withdrawals，空列表返回 204
async fn withdrawals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let withdrawals: Vec<Withdrawal> = state.service.withdrawals(user).await?;

    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    Ok(Json(withdrawals).into_response())
}

async fn health() -> &'static str {
    "ok"
}
