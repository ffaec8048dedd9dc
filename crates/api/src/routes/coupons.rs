//! Direct coupon issuance.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::CouponId;
use coordination::{DedupCache, LockService};
use issuance::IssuanceOutcome;
use ledger::Ledger;
use saga::PaymentProvider;

use super::Member;
use crate::AppState;
use crate::error::ApiError;

/// Status for an issuance outcome: 201 when a unit was issued, 200 when the
/// member already held one.
pub(crate) fn outcome_status(outcome: &IssuanceOutcome) -> StatusCode {
    if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    }
}

/// POST /coupons/{id}/issue
#[tracing::instrument(skip(state))]
pub async fn issue<L, C, K, P>(
    State(state): State<Arc<AppState<L, C, K, P>>>,
    Path(coupon_id): Path<CouponId>,
    Member(member_id): Member,
) -> Result<(StatusCode, Json<IssuanceOutcome>), ApiError>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    let outcome = state.events.guard().issue(member_id, coupon_id).await?;
    Ok((outcome_status(&outcome), Json(outcome)))
}
