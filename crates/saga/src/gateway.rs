//! Payment gateway adapter.
//!
//! [`PaymentProvider`] is the raw provider API. [`PaymentGateway`] wraps a
//! provider with response validation, failure classification and a bounded
//! retry policy. Only transient failures are retried.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, OrderId};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status the provider reports for an approved payment.
const APPROVED_STATUS: &str = "DONE";

/// Body of a confirmation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub payment_key: String,
    pub order_id: OrderId,
    pub amount: Money,
}

/// Provider's answer to a confirmation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub payment_key: String,
    pub status: String,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_amount: Option<Money>,
}

impl ProviderResponse {
    /// An approved response for `request`.
    pub fn approved(request: &ConfirmRequest, approved_at: DateTime<Utc>) -> Self {
        Self {
            payment_key: request.payment_key.clone(),
            status: APPROVED_STATUS.to_string(),
            approved_at: Some(approved_at),
            total_amount: Some(request.amount),
        }
    }
}

/// Raw provider failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider request timed out")]
    Timeout,

    #[error("Provider transport error: {0}")]
    Transport(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Classified gateway failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Worth retrying: timeout, transport failure, 408, 429 or 5xx.
    #[error("Payment provider temporarily failed: {0}")]
    Retryable(String),

    /// The provider rejected the payment or answered with garbage.
    #[error("Payment rejected: {0}")]
    Terminal(String),

    #[error("Payment provider still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Retryable(_))
    }
}

impl From<ProviderError> for GatewayError {
    fn from(e: ProviderError) -> Self {
        let retryable = match &e {
            ProviderError::Timeout | ProviderError::Transport(_) => true,
            ProviderError::Status { status, .. } => {
                let status = *status;
                status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || (500..600).contains(&status)
            }
            ProviderError::InvalidResponse(_) => false,
        };
        if retryable {
            GatewayError::Retryable(e.to_string())
        } else {
            GatewayError::Terminal(e.to_string())
        }
    }
}

/// A validated approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub transaction_id: String,
    pub approved_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync + 'static {
    /// Provider name recorded on payments.
    fn name(&self) -> &str;

    async fn confirm(&self, request: &ConfirmRequest) -> Result<ProviderResponse, ProviderError>;

    async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), ProviderError>;
}

/// Exponential backoff budget for provider calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Provider wrapped with validation and retries.
pub struct PaymentGateway<P> {
    provider: P,
    policy: RetryPolicy,
}

impl<P: PaymentProvider> PaymentGateway<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Confirms a payment, retrying transient failures per the policy.
    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn confirm(&self, request: &ConfirmRequest) -> Result<Receipt, GatewayError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match self.provider.confirm(request).await {
                Ok(response) => validate(request, response),
                Err(e) => Err(GatewayError::from(e)),
            };

            match outcome {
                Ok(receipt) => {
                    metrics::counter!("payment_gateway_attempts_total", "outcome" => "approved")
                        .increment(1);
                    return Ok(receipt);
                }
                Err(GatewayError::Retryable(reason)) => {
                    metrics::counter!("payment_gateway_attempts_total", "outcome" => "retryable")
                        .increment(1);
                    if attempt >= max_attempts {
                        tracing::error!(attempt, %reason, "Payment confirmation retries exhausted");
                        return Err(GatewayError::Exhausted {
                            attempts: attempt,
                            last: reason,
                        });
                    }
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Payment confirmation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::counter!("payment_gateway_attempts_total", "outcome" => "rejected")
                        .increment(1);
                    tracing::warn!(error = %e, "Payment confirmation rejected");
                    return Err(e);
                }
            }
        }
    }

    /// Cancels an approved payment at the provider. Not retried.
    pub async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), GatewayError> {
        self.provider
            .cancel(payment_key, reason)
            .await
            .map_err(GatewayError::from)
    }
}

fn validate(request: &ConfirmRequest, response: ProviderResponse) -> Result<Receipt, GatewayError> {
    if response.payment_key.trim().is_empty() {
        return Err(GatewayError::Terminal("response without payment key".to_string()));
    }
    if response.status != APPROVED_STATUS {
        return Err(GatewayError::Terminal(format!(
            "payment status {}",
            response.status
        )));
    }
    if let Some(total) = response.total_amount
        && total != request.amount
    {
        return Err(GatewayError::Terminal(format!(
            "approved amount {total} differs from requested {}",
            request.amount
        )));
    }
    Ok(Receipt {
        transaction_id: response.payment_key,
        approved_at: response.approved_at.unwrap_or_else(Utc::now),
    })
}

/// Provider speaking the Toss-style REST API with Basic auth.
#[derive(Clone)]
pub struct HttpPaymentProvider {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl HttpPaymentProvider {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    fn map_send_error(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(e.to_string())
        }
    }

    async fn status_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ProviderError::Status { status, body }
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    fn name(&self) -> &str {
        "toss"
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/payments/confirm", self.base_url))
            .basic_auth(&self.secret_key, Some(""))
            .json(request)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        response
            .json::<ProviderResponse>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    async fn cancel(&self, payment_key: &str, reason: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .post(format!("{}/v1/payments/{payment_key}/cancel", self.base_url))
            .basic_auth(&self.secret_key, Some(""))
            .json(&serde_json::json!({ "cancelReason": reason }))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    confirms: VecDeque<Result<ProviderResponse, ProviderError>>,
    confirm_calls: usize,
    cancelled: Vec<String>,
    fail_cancel: bool,
    confirm_delay: Option<Duration>,
}

/// Scripted provider for tests. Approves by default; queued outcomes are
/// consumed one per confirm call.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentProvider {
    state: Arc<Mutex<ScriptedState>>,
}

impl InMemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the outcome of the next unscripted confirm call.
    pub fn push_confirm(&self, outcome: Result<ProviderResponse, ProviderError>) {
        self.state().confirms.push_back(outcome);
    }

    /// Queues `times` consecutive confirm failures.
    pub fn fail_next(&self, error: ProviderError, times: usize) {
        let mut state = self.state();
        for _ in 0..times {
            state.confirms.push_back(Err(error.clone()));
        }
    }

    pub fn set_fail_cancel(&self, fail: bool) {
        self.state().fail_cancel = fail;
    }

    /// Makes every confirm call take `delay` before answering.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.state().confirm_delay = Some(delay);
    }

    pub fn confirm_calls(&self) -> usize {
        self.state().confirm_calls
    }

    /// Payment keys cancelled so far.
    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<ProviderResponse, ProviderError> {
        let delay = self.state().confirm_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.confirm_calls += 1;
        state
            .confirms
            .pop_front()
            .unwrap_or_else(|| Ok(ProviderResponse::approved(request, Utc::now())))
    }

    async fn cancel(&self, payment_key: &str, _reason: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        if state.fail_cancel {
            return Err(ProviderError::Status {
                status: 400,
                body: "cancel rejected".to_string(),
            });
        }
        state.cancelled.push(payment_key.to_string());
        Ok(())
    }
}
