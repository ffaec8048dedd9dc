//! Payment confirmation and order cancellation.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{Money, OrderId};
use coordination::{DedupCache, LockService};
use domain::Order;
use ledger::Ledger;
use saga::{ConfirmPayment, FailureMode, PaymentProvider, PaymentReceipt};
use serde::{Deserialize, Serialize};

use super::Member;
use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Rollback,
    Cancel,
}

impl From<OnFailure> for FailureMode {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::Rollback => FailureMode::Rollback,
            OnFailure::Cancel => FailureMode::Cancel,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub amount: Money,
    pub payment_key: String,
    #[serde(default)]
    pub on_failure: OnFailure,
}

#[derive(Debug, Deserialize)]
pub struct CancelOrderRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub status: String,
    pub total_amount: Money,
    pub discount_amount: Money,
    pub payable_amount: Money,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            status: order.status.as_str().to_string(),
            total_amount: order.total_amount,
            discount_amount: order.discount_amount,
            payable_amount: order.payable_amount(),
        }
    }
}

// -- Handlers --

/// POST /orders/{id}/confirm
#[tracing::instrument(skip(state, req))]
pub async fn confirm<L, C, K, P>(
    State(state): State<Arc<AppState<L, C, K, P>>>,
    Path(order_id): Path<OrderId>,
    Member(member_id): Member,
    Json(req): Json<ConfirmPaymentRequest>,
) -> Result<Json<PaymentReceipt>, ApiError>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    if req.payment_key.trim().is_empty() {
        return Err(ApiError::bad_request("INVALID_PAYMENT_KEY", "payment_key is required"));
    }

    let command = ConfirmPayment {
        order_id,
        member_id,
        amount: req.amount,
        provider: state.saga.gateway().provider().name().to_string(),
        payment_key: req.payment_key,
        on_failure: req.on_failure.into(),
    };
    let receipt = state.saga.confirm_payment(command).await?;
    Ok(Json(receipt))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel<L, C, K, P>(
    State(state): State<Arc<AppState<L, C, K, P>>>,
    Path(order_id): Path<OrderId>,
    Member(member_id): Member,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<OrderResponse>, ApiError>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    let reason = req.reason.unwrap_or_else(|| "cancelled by member".to_string());
    let order = state.saga.cancel_order(order_id, member_id, &reason).await?;
    Ok(Json(order.into()))
}
