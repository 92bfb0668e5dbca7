//! Refund settlement state machine.
//!
//! PENDING -> INITIATED -> PAID | FAILED; FAILED -> INITIATED (bounded
//! retry); PENDING|FAILED -> CANCELLED. PAID and CANCELLED are terminal.
//! Every transition is precondition-guarded inside the store so concurrent
//! operations cannot both win the same transition.

use crate::dtos::{CancelRefundRequest, CollectCashRequest, CreateRefundRequest};
use crate::models::{
    AttemptStatus, AuditEvent, FormStatus, PaymentAttempt, Refund, RefundMethod, RefundStatus,
};
use crate::services::currency::CurrencyService;
use crate::services::metrics::{
    PROVIDER_CALL_DURATION, REFUNDS_TOTAL, REFUND_AMOUNT_TOTAL, SERVICE_GAIN_TOTAL,
};
use crate::services::notify::{NotificationSink, RefundPaidNotice};
use crate::services::providers::{
    sanitize_details, ProviderOutcome, ProviderRegistry, ProviderRequest,
};
use crate::services::store::{CashCollection, Store};
use crate::services::audit;
use chrono::{Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use std::sync::Arc;
use taxfree_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Settlement tuning copied onto each refund at creation time.
#[derive(Debug, Clone)]
pub struct SettlementSettings {
    pub max_retries: i32,
    /// Fixed backoff between a failure and the next automatic retry.
    pub retry_backoff: Duration,
    pub provider_timeout: std::time::Duration,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::minutes(15),
            provider_timeout: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct SettlementService {
    store: Arc<dyn Store>,
    currencies: CurrencyService,
    providers: ProviderRegistry,
    notifier: Arc<dyn NotificationSink>,
    settings: SettlementSettings,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn Store>,
        providers: ProviderRegistry,
        notifier: Arc<dyn NotificationSink>,
        settings: SettlementSettings,
    ) -> Self {
        Self {
            currencies: CurrencyService::new(store.clone()),
            store,
            providers,
            notifier,
            settings,
        }
    }

    /// Create a PENDING refund from a validated form. The form's frozen
    /// figures are authoritative; nothing is recomputed from the invoice.
    #[instrument(skip(self, request), fields(form_id = %request.form_id))]
    pub async fn create_refund(&self, request: &CreateRefundRequest) -> Result<Refund, AppError> {
        request.validate()?;

        let method = RefundMethod::from_str(&request.method).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("unknown refund method '{}'", request.method))
        })?;

        let form = self.store.form(request.form_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("form {} not found", request.form_id))
        })?;
        if form.status() != FormStatus::Validated {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "refunds require a customs-validated form; form {} is '{}'",
                form.form_id,
                form.status
            )));
        }
        if let Some(existing) = self.store.refund_for_form(form.form_id).await? {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "refund {} already exists for form {}",
                existing.refund_id,
                form.form_id
            )));
        }

        let snapshot = form
            .snapshot()
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("corrupt rule snapshot: {}", e)))?;
        if !snapshot.allows_method(method) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "refund method '{}' is not allowed by the ruleset this form was issued under",
                method.as_str()
            )));
        }

        let currency = self
            .currencies
            .payout_currency(request.payout_currency.as_deref())
            .await?;

        let gross_amount = form.vat_amount;
        let operator_fee = form.operator_fee;
        let net_amount = gross_amount - operator_fee;
        debug_assert_eq!(net_amount, form.refund_amount);
        let payout_amount = currency.convert_from_base(net_amount);

        let now = Utc::now();
        let refund = Refund {
            refund_id: Uuid::new_v4(),
            form_id: form.form_id,
            gross_amount,
            operator_fee,
            net_amount,
            method: method.as_str().to_string(),
            payment_details: request.payment_details.clone(),
            status: RefundStatus::Pending.as_str().to_string(),
            payout_currency: currency.code.clone(),
            exchange_rate_applied: currency.exchange_rate,
            payout_amount,
            actual_payout_amount: None,
            service_gain: None,
            service_gain_cdf: None,
            cash_collected: false,
            cash_collected_utc: None,
            cash_collected_by: None,
            retry_count: 0,
            max_retries: self.settings.max_retries,
            next_retry_at: None,
            cancelled_reason: None,
            cancelled_by: None,
            cancelled_utc: None,
            initiated_utc: None,
            paid_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        self.store.insert_refund(&refund).await?;

        REFUNDS_TOTAL
            .with_label_values(&[method.as_str(), "pending"])
            .inc();
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "refund_created",
                "refund",
                refund.refund_id,
                &request.requested_by,
                json!({
                    "form_id": form.form_id,
                    "net_amount": net_amount,
                    "payout_currency": currency.code,
                    "payout_amount": payout_amount,
                    "exchange_rate": currency.exchange_rate,
                }),
            ),
        )
        .await;

        info!(
            refund_id = %refund.refund_id,
            method = method.as_str(),
            payout_amount = %payout_amount,
            payout_currency = %refund.payout_currency,
            "Refund created"
        );
        Ok(refund)
    }

    /// Claim a PENDING or FAILED refund and run it through its payment
    /// provider. No provider error, timeout, or panic-adjacent failure
    /// crosses this boundary: every failure path lands in a FAILED attempt
    /// and a FAILED refund with a scheduled retry.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn process_refund(&self, refund_id: Uuid) -> Result<Refund, AppError> {
        let current = self.store.refund(refund_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("refund {} not found", refund_id))
        })?;
        let method = current.method().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "refund {} carries unknown method '{}'",
                current.refund_id,
                current.method
            ))
        })?;
        // Resolve the provider before claiming: a missing provider is a
        // configuration error and must not strand the refund in INITIATED.
        let provider = self.providers.get(method)?;

        let now = Utc::now();
        let refund = self
            .store
            .claim_refund_for_processing(refund_id, now)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "refund {} is not awaiting processing",
                    refund_id
                ))
            })?;

        let request = ProviderRequest {
            reference: refund.refund_id.to_string(),
            amount: refund.payout_amount,
            currency: refund.payout_currency.clone(),
            details: refund.payment_details.clone(),
        };

        let attempt = PaymentAttempt {
            attempt_id: Uuid::new_v4(),
            refund_id: refund.refund_id,
            provider: provider.name().to_string(),
            request_payload: json!({
                "reference": request.reference,
                "amount": request.amount,
                "currency": request.currency,
                "details": sanitize_details(&request.details),
            }),
            response_payload: None,
            status: AttemptStatus::Pending.as_str().to_string(),
            error_code: None,
            error_message: None,
            started_utc: now,
            completed_utc: None,
        };
        self.store.insert_payment_attempt(&attempt).await?;

        let timer = PROVIDER_CALL_DURATION
            .with_label_values(&[provider.name()])
            .start_timer();
        let outcome = match tokio::time::timeout(
            self.settings.provider_timeout,
            provider.process_payment(&request),
        )
        .await
        {
            Err(_) => Err(AppError::provider(
                "TIMEOUT",
                "payment provider call timed out",
            )),
            Ok(result) => result,
        };
        timer.observe_duration();

        match outcome {
            Ok(outcome) if outcome.success => {
                self.complete_success(&refund, method, attempt.attempt_id, outcome)
                    .await
            }
            Ok(outcome) => {
                let code = outcome
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "DECLINED".to_string());
                let message = outcome
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "payment declined".to_string());
                self.complete_failure(
                    &refund,
                    method,
                    attempt.attempt_id,
                    Some(outcome.response),
                    code,
                    message,
                )
                .await
            }
            Err(e) => {
                let (code, message) = match &e {
                    AppError::Provider { code, message } => (code.clone(), message.clone()),
                    other => ("PROVIDER_ERROR".to_string(), other.to_string()),
                };
                self.complete_failure(&refund, method, attempt.attempt_id, None, code, message)
                    .await
            }
        }
    }

    async fn complete_success(
        &self,
        refund: &Refund,
        method: RefundMethod,
        attempt_id: Uuid,
        outcome: ProviderOutcome,
    ) -> Result<Refund, AppError> {
        let now = Utc::now();
        self.store
            .complete_payment_attempt(
                attempt_id,
                AttemptStatus::Succeeded,
                Some(outcome.response),
                None,
                None,
                now,
            )
            .await?;

        if method == RefundMethod::Cash {
            // The cashier is now authorized to count out money; the refund
            // stays INITIATED until collection reconciles the hand-over.
            REFUNDS_TOTAL
                .with_label_values(&[method.as_str(), "initiated"])
                .inc();
            audit::record(
                self.store.as_ref(),
                AuditEvent::new(
                    "refund_initiated",
                    "refund",
                    refund.refund_id,
                    "settlement",
                    json!({ "awaiting": "cash_collection" }),
                ),
            )
            .await;
            return self.reload(refund.refund_id).await;
        }

        let paid = self
            .store
            .mark_refund_paid(refund.refund_id, refund.form_id, now)
            .await?;
        if !paid {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "refund {} left INITIATED before payment completion",
                refund.refund_id
            )));
        }

        REFUNDS_TOTAL
            .with_label_values(&[method.as_str(), "paid"])
            .inc();
        REFUND_AMOUNT_TOTAL
            .with_label_values(&[refund.payout_currency.as_str()])
            .inc_by(to_metric(refund.payout_amount));

        self.notify_paid(refund).await;
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "refund_paid",
                "refund",
                refund.refund_id,
                "settlement",
                json!({ "payout_amount": refund.payout_amount, "currency": refund.payout_currency }),
            ),
        )
        .await;

        info!(refund_id = %refund.refund_id, "Refund paid");
        self.reload(refund.refund_id).await
    }

    async fn complete_failure(
        &self,
        refund: &Refund,
        method: RefundMethod,
        attempt_id: Uuid,
        response: Option<serde_json::Value>,
        code: String,
        message: String,
    ) -> Result<Refund, AppError> {
        let now = Utc::now();
        self.store
            .complete_payment_attempt(
                attempt_id,
                AttemptStatus::Failed,
                response,
                Some(code.clone()),
                Some(message.clone()),
                now,
            )
            .await?;

        let next_retry_at = now + self.settings.retry_backoff;
        self.store
            .mark_refund_failed(refund.refund_id, next_retry_at, now)
            .await?;

        REFUNDS_TOTAL
            .with_label_values(&[method.as_str(), "failed"])
            .inc();
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "refund_failed",
                "refund",
                refund.refund_id,
                "settlement",
                json!({ "error_code": code, "error_message": message, "next_retry_at": next_retry_at }),
            ),
        )
        .await;

        warn!(
            refund_id = %refund.refund_id,
            error_code = %code,
            error_message = %message,
            "Refund payment failed; retry scheduled"
        );
        Err(AppError::Provider { code, message })
    }

    /// Reconcile a cash hand-over. Over-payment is rejected before any
    /// state changes; the shortfall becomes the service gain.
    #[instrument(skip(self, request), fields(refund_id = %request.refund_id))]
    pub async fn collect_cash(&self, request: &CollectCashRequest) -> Result<Refund, AppError> {
        request.validate()?;

        let refund = self.store.refund(request.refund_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("refund {} not found", request.refund_id))
        })?;

        if refund.method() != Some(RefundMethod::Cash) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "refund {} uses method '{}'; only cash refunds are collected at the desk",
                refund.refund_id,
                refund.method
            )));
        }
        if refund.status() != RefundStatus::Initiated {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "refund {} is not awaiting cash collection (status: {})",
                refund.refund_id,
                refund.status
            )));
        }

        let expected = refund.expected_cash_amount();
        let actual = request.actual_amount.unwrap_or(expected);
        if actual < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "actual payout amount cannot be negative"
            )));
        }
        if actual > expected {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "actual payout {} exceeds the expected payout {}",
                actual,
                expected
            )));
        }

        let service_gain = expected - actual;
        if service_gain < Decimal::ZERO {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "negative service gain {} for refund {}",
                service_gain,
                refund.refund_id
            )));
        }
        let service_gain_cdf = if refund.exchange_rate_applied == Decimal::ONE {
            service_gain
        } else {
            (service_gain / refund.exchange_rate_applied)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        };

        let now = Utc::now();
        let collected = self
            .store
            .record_cash_collection(&CashCollection {
                refund_id: refund.refund_id,
                form_id: refund.form_id,
                actual_payout_amount: actual,
                service_gain,
                service_gain_cdf,
                collected_by: request.collected_by.clone(),
                collected_utc: now,
            })
            .await?;
        if !collected {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "refund {} was collected concurrently",
                refund.refund_id
            )));
        }

        REFUNDS_TOTAL.with_label_values(&["cash", "paid"]).inc();
        REFUND_AMOUNT_TOTAL
            .with_label_values(&[refund.payout_currency.as_str()])
            .inc_by(to_metric(actual));
        if service_gain > Decimal::ZERO {
            SERVICE_GAIN_TOTAL
                .with_label_values(&[refund.payout_currency.as_str()])
                .inc_by(to_metric(service_gain));
        }

        self.notify_paid(&refund).await;
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "cash_collected",
                "refund",
                refund.refund_id,
                &request.collected_by,
                json!({
                    "expected": expected,
                    "actual": actual,
                    "service_gain": service_gain,
                    "service_gain_cdf": service_gain_cdf,
                }),
            ),
        )
        .await;

        info!(
            refund_id = %refund.refund_id,
            actual = %actual,
            service_gain = %service_gain,
            "Cash collected"
        );
        self.reload(refund.refund_id).await
    }

    /// Manual retry of a FAILED refund with budget remaining.
    #[instrument(skip(self), fields(refund_id = %refund_id))]
    pub async fn retry_refund(&self, refund_id: Uuid) -> Result<Refund, AppError> {
        let refund = self.store.refund(refund_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("refund {} not found", refund_id))
        })?;
        if !refund.can_retry() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "refund {} cannot be retried (status: {}, retries: {}/{})",
                refund.refund_id,
                refund.status,
                refund.retry_count,
                refund.max_retries
            )));
        }
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "refund_retried",
                "refund",
                refund.refund_id,
                "settlement",
                json!({ "retry_count": refund.retry_count }),
            ),
        )
        .await;
        self.process_refund(refund_id).await
    }

    /// Cancel a refund that has not been paid. Terminal.
    #[instrument(skip(self, request), fields(refund_id = %request.refund_id))]
    pub async fn cancel_refund(&self, request: &CancelRefundRequest) -> Result<Refund, AppError> {
        request.validate()?;

        let refund = self.store.refund(request.refund_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("refund {} not found", request.refund_id))
        })?;
        let status = refund.status();
        if !matches!(status, RefundStatus::Pending | RefundStatus::Failed) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "refund {} cannot be cancelled from status '{}'",
                refund.refund_id,
                refund.status
            )));
        }

        let now = Utc::now();
        let cancelled = self
            .store
            .cancel_refund(
                refund.refund_id,
                &request.reason,
                &request.cancelled_by,
                now,
            )
            .await?;
        if !cancelled {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "refund {} changed status concurrently",
                refund.refund_id
            )));
        }

        REFUNDS_TOTAL
            .with_label_values(&[refund.method.as_str(), "cancelled"])
            .inc();
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "refund_cancelled",
                "refund",
                refund.refund_id,
                &request.cancelled_by,
                json!({ "reason": request.reason }),
            ),
        )
        .await;

        info!(refund_id = %refund.refund_id, reason = %request.reason, "Refund cancelled");
        self.reload(refund.refund_id).await
    }

    async fn notify_paid(&self, refund: &Refund) {
        let notice = match self.store.form(refund.form_id).await {
            Ok(Some(form)) => RefundPaidNotice {
                refund_id: refund.refund_id,
                traveler_id: form.traveler_id,
                amount: refund.payout_amount,
                currency: refund.payout_currency.clone(),
                method: refund.method.clone(),
            },
            Ok(None) | Err(_) => {
                warn!(refund_id = %refund.refund_id, "Could not load form for paid notification");
                return;
            }
        };
        let sink = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.refund_paid(&notice).await {
                warn!(refund_id = %notice.refund_id, error = %e, "Refund paid notification failed");
            }
        });
    }

    async fn reload(&self, refund_id: Uuid) -> Result<Refund, AppError> {
        self.store
            .refund(refund_id)
            .await?
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("refund vanished mid-update")))
    }
}

fn to_metric(amount: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    amount.to_f64().unwrap_or(0.0)
}
