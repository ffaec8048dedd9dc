//! HTTP surface for coupon issuance and order fulfillment.
//!
//! Handlers only extract the caller and the path, then hand off to the
//! issuance guard, the event coupon service or the fulfillment saga. Errors
//! leave as their stable code with an HTTP status derived from the error class.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use coordination::{AdmissionGate, DedupCache, LockService};
use issuance::{CouponIssuanceGuard, EventCouponService, EventStatusSweeper};
use ledger::Ledger;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    FulfillmentSaga, InMemoryCatalog, PaymentGateway, PaymentProvider, PaymentReconciler,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<L, C, K, P> {
    /// Event claims; its guard serves direct coupon issuance.
    pub events: EventCouponService<L, C, K>,
    pub saga: Arc<FulfillmentSaga<L, P, InMemoryCatalog>>,
}

impl<L, C, K, P> AppState<L, C, K, P>
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    /// Wires every component over one ledger.
    pub fn new(config: &Config, ledger: L, cache: C, locks: K, provider: P) -> Self {
        let guard =
            CouponIssuanceGuard::new(ledger.clone(), cache, locks).with_config(config.issuance());
        let events = EventCouponService::new(guard, AdmissionGate::new(config.gate_hold));
        let gateway = PaymentGateway::new(provider).with_policy(config.retry_policy());
        let saga = Arc::new(FulfillmentSaga::new(ledger, gateway, InMemoryCatalog::new()));
        Self { events, saga }
    }

    /// Starts the event status sweeper and the stale payment reconciler.
    pub fn spawn_background(
        &self,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let sweeper =
            EventStatusSweeper::new(self.saga.ledger().clone(), config.event_sweep_interval);
        let reconciler = PaymentReconciler::new(self.saga.clone(), config.reconciler());
        vec![
            sweeper.spawn(shutdown.clone()),
            reconciler.spawn(shutdown),
        ]
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<L, C, K, P>(
    state: Arc<AppState<L, C, K, P>>,
    metrics_handle: PrometheusHandle,
) -> Router
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/coupons/{id}/issue", post(routes::coupons::issue::<L, C, K, P>))
        .route("/events/{id}/coupon", post(routes::events::claim::<L, C, K, P>))
        .route("/orders/{id}/confirm", post(routes::orders::confirm::<L, C, K, P>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<L, C, K, P>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
