//! Persistence seam for the engine and settlement state machine.
//!
//! Implemented by the Postgres [`Database`](super::Database) in production
//! and by an in-memory store in the test harness. Methods that change a
//! refund's status are conditional: the precondition travels into the
//! store and is re-verified against the current row inside the same
//! transaction, so two concurrent callers cannot both win a transition
//! meant to accept one.

use crate::models::{
    AttemptStatus, AuditEvent, Currency, ExchangeRateHistory, FormStatus, Merchant,
    PaymentAttempt, Refund, RiskRule, RuleSet, SaleInvoice, SaleItem, TaxFreeForm, Traveler,
};
use crate::services::engine::ItemEligibility;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use taxfree_core::error::AppError;
use uuid::Uuid;

/// Everything written when a cashier counts out a cash refund. Applied as
/// one atomic step together with the form's transition to REFUNDED.
#[derive(Debug, Clone)]
pub struct CashCollection {
    pub refund_id: Uuid,
    pub form_id: Uuid,
    pub actual_payout_amount: Decimal,
    pub service_gain: Decimal,
    pub service_gain_cdf: Decimal,
    pub collected_by: String,
    pub collected_utc: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- rule configuration ---

    async fn active_rule_set(&self) -> Result<Option<RuleSet>, AppError>;
    async fn rule_set(&self, rule_set_id: Uuid) -> Result<Option<RuleSet>, AppError>;
    async fn insert_rule_set(&self, ruleset: &RuleSet) -> Result<(), AppError>;
    /// Deactivate-all then activate-one as a single atomic transition.
    async fn activate_rule_set(&self, rule_set_id: Uuid, actor: &str) -> Result<RuleSet, AppError>;
    async fn risk_rules(&self, rule_set_id: Uuid) -> Result<Vec<RiskRule>, AppError>;
    /// Rejects rules whose comparison value is incompatible with the
    /// operator; evaluation never sees an ill-typed rule.
    async fn insert_risk_rule(&self, rule: &RiskRule) -> Result<(), AppError>;

    // --- merchants, travelers, sales ---

    async fn merchant(&self, merchant_id: Uuid) -> Result<Option<Merchant>, AppError>;
    async fn traveler(&self, traveler_id: Uuid) -> Result<Option<Traveler>, AppError>;
    async fn invoice(&self, invoice_id: Uuid) -> Result<Option<SaleInvoice>, AppError>;
    async fn invoice_items(&self, invoice_id: Uuid) -> Result<Vec<SaleItem>, AppError>;

    // --- tax-free forms ---

    async fn form(&self, form_id: Uuid) -> Result<Option<TaxFreeForm>, AppError>;
    async fn form_for_invoice(&self, invoice_id: Uuid) -> Result<Option<TaxFreeForm>, AppError>;
    /// Forms created for a traveler at or after `since`.
    async fn count_recent_forms(
        &self,
        traveler_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError>;
    /// Insert the form and rewrite the items' eligibility flags in one
    /// transaction. Price and VAT columns are left untouched.
    async fn create_form(
        &self,
        form: &TaxFreeForm,
        item_flags: &[ItemEligibility],
    ) -> Result<(), AppError>;
    /// Guarded status transition; returns false when the current status is
    /// not in `from`.
    async fn transition_form(
        &self,
        form_id: Uuid,
        from: &[FormStatus],
        to: FormStatus,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    // --- refunds ---

    async fn refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError>;
    async fn refund_for_form(&self, form_id: Uuid) -> Result<Option<Refund>, AppError>;
    async fn insert_refund(&self, refund: &Refund) -> Result<(), AppError>;
    /// PENDING|FAILED -> INITIATED. Returns the claimed refund, or `None`
    /// when another caller already owns it or the status disallows it.
    async fn claim_refund_for_processing(
        &self,
        refund_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Refund>, AppError>;
    /// INITIATED -> PAID plus the form's transition to REFUNDED, atomically.
    async fn mark_refund_paid(
        &self,
        refund_id: Uuid,
        form_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    /// INITIATED -> FAILED; increments the retry count and schedules the
    /// next attempt.
    async fn mark_refund_failed(
        &self,
        refund_id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    /// INITIATED + not yet collected -> PAID with reconciliation figures,
    /// plus the form's transition to REFUNDED, atomically.
    async fn record_cash_collection(&self, collection: &CashCollection) -> Result<bool, AppError>;
    /// PENDING|FAILED -> CANCELLED (terminal).
    async fn cancel_refund(
        &self,
        refund_id: Uuid,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    /// FAILED refunds with retry budget left whose next_retry_at elapsed.
    async fn refunds_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Refund>, AppError>;

    // --- payment attempts (append-only) ---

    async fn insert_payment_attempt(&self, attempt: &PaymentAttempt) -> Result<(), AppError>;
    async fn complete_payment_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        response: Option<Value>,
        error_code: Option<String>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;
    async fn payment_attempts(&self, refund_id: Uuid) -> Result<Vec<PaymentAttempt>, AppError>;

    // --- currencies ---

    async fn currency(&self, code: &str) -> Result<Option<Currency>, AppError>;
    async fn base_currency(&self) -> Result<Option<Currency>, AppError>;
    async fn insert_currency(&self, currency: &Currency) -> Result<(), AppError>;
    /// Clear the base flag everywhere, set it on `code` and force its rate
    /// to exactly 1, in one transaction; a history row is appended when the
    /// forced rate differs from the stored one.
    async fn set_base_currency(&self, code: &str, actor: &str) -> Result<Currency, AppError>;
    /// Rate update plus its history row in one transaction.
    async fn update_exchange_rate(
        &self,
        code: &str,
        new_rate: Decimal,
        actor: &str,
        reason: &str,
    ) -> Result<Currency, AppError>;
    async fn rate_history(&self, code: &str) -> Result<Vec<ExchangeRateHistory>, AppError>;

    // --- audit (append-only, best-effort at call sites) ---

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), AppError>;
}
