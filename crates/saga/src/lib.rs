//! Order fulfillment saga.
//!
//! Confirming a payment runs as:
//!
//! 1. One ledger transaction that completes the order, deducts stock, consumes
//!    the order's coupon and records a PENDING payment.
//! 2. A call to the payment provider through [`PaymentGateway`], with retries
//!    for transient failures.
//! 3. Either approval of the payment, or one compensating transaction that
//!    undoes step 1 and marks the payment FAILED.
//!
//! [`PaymentReconciler`] compensates payments left PENDING by a crash between
//! steps 1 and 3.

pub mod catalog;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod reconciler;

pub use catalog::{CatalogReader, InMemoryCatalog};
pub use coordinator::{ConfirmPayment, FailureMode, FulfillmentSaga, PaymentReceipt};
pub use error::{Result, SagaError, Shortfall};
pub use gateway::{
    ConfirmRequest, GatewayError, HttpPaymentProvider, InMemoryPaymentProvider, PaymentGateway,
    PaymentProvider, ProviderError, ProviderResponse, Receipt, RetryPolicy,
};
pub use reconciler::{PaymentReconciler, ReconcilerConfig};
