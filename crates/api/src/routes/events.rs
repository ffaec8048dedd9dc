//! Event coupon claims.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::EventId;
use coordination::{DedupCache, LockService};
use issuance::IssuanceOutcome;
use ledger::Ledger;
use saga::PaymentProvider;

use super::Member;
use super::coupons::outcome_status;
use crate::AppState;
use crate::error::ApiError;

/// POST /events/{id}/coupon
#[tracing::instrument(skip(state))]
pub async fn claim<L, C, K, P>(
    State(state): State<Arc<AppState<L, C, K, P>>>,
    Path(event_id): Path<EventId>,
    Member(member_id): Member,
) -> Result<(StatusCode, Json<IssuanceOutcome>), ApiError>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    let outcome = state.events.claim(event_id, member_id).await?;
    Ok((outcome_status(&outcome), Json(outcome)))
}
