//! Route handlers.

pub mod coupons;
pub mod events;
pub mod health;
pub mod metrics;
pub mod orders;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::MemberId;

use crate::error::ApiError;

/// Header carrying the already authenticated member id.
pub const MEMBER_HEADER: &str = "x-member-id";

/// Caller identity taken from [`MEMBER_HEADER`].
#[derive(Debug, Clone, Copy)]
pub struct Member(pub MemberId);

impl<S: Send + Sync> FromRequestParts<S> for Member {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(MEMBER_HEADER)
            .ok_or_else(|| ApiError::bad_request("MISSING_MEMBER_ID", "X-Member-Id header is required"))?;
        raw.to_str()
            .ok()
            .and_then(|v| v.trim().parse::<MemberId>().ok())
            .map(Member)
            .ok_or_else(|| ApiError::bad_request("INVALID_MEMBER_ID", "X-Member-Id must be a numeric id"))
    }
}
