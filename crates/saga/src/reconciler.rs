//! Background recovery for payments stuck in PENDING.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ledger::Ledger;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::catalog::CatalogReader;
use crate::coordinator::{FailureMode, FulfillmentSaga};
use crate::error::Result;
use crate::gateway::PaymentProvider;

const RECONCILER_ACTOR: &str = "reconciler";
const STALE_REASON: &str = "payment confirmation timed out";

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// A PENDING payment older than this is considered abandoned.
    pub stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Compensates orders whose saga died between completion and settlement.
///
/// The provider is asked to cancel first so a late approval cannot charge the
/// member for an order that has been rolled back.
pub struct PaymentReconciler<L, P, C> {
    saga: Arc<FulfillmentSaga<L, P, C>>,
    config: ReconcilerConfig,
}

impl<L, P, C> PaymentReconciler<L, P, C>
where
    L: Ledger,
    P: PaymentProvider,
    C: CatalogReader,
{
    pub fn new(saga: Arc<FulfillmentSaga<L, P, C>>, config: ReconcilerConfig) -> Self {
        Self { saga, config }
    }

    /// Runs one pass. Returns the number of orders compensated.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let stale = self.saga.ledger().stale_pending_payments(cutoff).await?;

        let mut compensated = 0;
        for payment in stale {
            if let Err(e) = self
                .saga
                .gateway()
                .cancel(&payment.payment_key, STALE_REASON)
                .await
            {
                tracing::warn!(payment_id = %payment.id, error = %e, "Provider cancel failed for stale payment");
            }

            match self
                .saga
                .run_compensation(payment.order_id, STALE_REASON, FailureMode::Rollback, RECONCILER_ACTOR)
                .await
            {
                Ok(true) => compensated += 1,
                Ok(false) => {}
                Err(e) => {
                    metrics::counter!("saga_manual_intervention_total").increment(1);
                    tracing::error!(
                        order_id = %payment.order_id,
                        payment_id = %payment.id,
                        error = %e,
                        "Stale payment could not be compensated"
                    );
                }
            }
        }

        if compensated > 0 {
            tracing::info!(compensated, "Stale payments reconciled");
        }
        Ok(compensated)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(error = %e, "Payment reconciliation failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Payment reconciler stopped");
                        break;
                    }
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
