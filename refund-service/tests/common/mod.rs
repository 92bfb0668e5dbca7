//! Shared test harness: in-memory store, scriptable payment provider, and
//! seeded entities.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use refund_service::dtos::{CreateFormRequest, CreateRefundRequest, ValidateFormRequest};
use refund_service::models::{
    AttemptStatus, AuditEvent, Currency, ExchangeRateHistory, FormStatus, Merchant,
    PaymentAttempt, Refund, RefundMethod, RiskRule, RuleSet, SaleInvoice, SaleItem, TaxFreeForm,
    Traveler,
};
use refund_service::services::engine::ItemEligibility;
use refund_service::services::notify::{NotificationSink, RefundPaidNotice};
use refund_service::services::providers::{
    CashDeskProvider, PaymentProvider, ProviderOutcome, ProviderRegistry, ProviderRequest,
};
use refund_service::services::store::{CashCollection, Store};
use refund_service::services::{
    CurrencyService, FormService, RetrySweep, RuleService, SettlementService, SettlementSettings,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use taxfree_core::error::AppError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStore {
    rule_sets: Mutex<Vec<RuleSet>>,
    risk_rules: Mutex<Vec<RiskRule>>,
    merchants: Mutex<HashMap<Uuid, Merchant>>,
    travelers: Mutex<HashMap<Uuid, Traveler>>,
    invoices: Mutex<HashMap<Uuid, SaleInvoice>>,
    items: Mutex<Vec<SaleItem>>,
    forms: Mutex<HashMap<Uuid, TaxFreeForm>>,
    refunds: Mutex<HashMap<Uuid, Refund>>,
    attempts: Mutex<Vec<PaymentAttempt>>,
    currencies: Mutex<HashMap<String, Currency>>,
    history: Mutex<Vec<ExchangeRateHistory>>,
    audits: Mutex<Vec<AuditEvent>>,
    /// When set, audit appends fail; transitions must still succeed.
    pub fail_audit: AtomicBool,
}

impl InMemoryStore {
    pub fn seed_merchant(&self, merchant: Merchant) {
        self.merchants
            .lock()
            .unwrap()
            .insert(merchant.merchant_id, merchant);
    }

    pub fn seed_traveler(&self, traveler: Traveler) {
        self.travelers
            .lock()
            .unwrap()
            .insert(traveler.traveler_id, traveler);
    }

    pub fn seed_invoice(&self, invoice: SaleInvoice, items: Vec<SaleItem>) {
        self.invoices
            .lock()
            .unwrap()
            .insert(invoice.invoice_id, invoice);
        self.items.lock().unwrap().extend(items);
    }

    pub fn seed_rule_set(&self, ruleset: RuleSet) {
        self.rule_sets.lock().unwrap().push(ruleset);
    }

    pub fn seed_currency(&self, currency: Currency) {
        self.currencies
            .lock()
            .unwrap()
            .insert(currency.code.clone(), currency);
    }

    pub fn item(&self, item_id: Uuid) -> SaleItem {
        self.items
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.item_id == item_id)
            .cloned()
            .expect("item not seeded")
    }

    pub fn audits(&self) -> Vec<AuditEvent> {
        self.audits.lock().unwrap().clone()
    }

    pub fn attempts_snapshot(&self) -> Vec<PaymentAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    /// Force a failed refund to be due for retry right now.
    pub fn force_retry_due(&self, refund_id: Uuid) {
        let mut refunds = self.refunds.lock().unwrap();
        let refund = refunds.get_mut(&refund_id).expect("refund not found");
        refund.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
    }

    /// Backdate a form so the trailing-window queries see it as older.
    pub fn backdate_form(&self, form_id: Uuid, created_utc: DateTime<Utc>) {
        let mut forms = self.forms.lock().unwrap();
        forms.get_mut(&form_id).expect("form not found").created_utc = created_utc;
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn active_rule_set(&self) -> Result<Option<RuleSet>, AppError> {
        Ok(self
            .rule_sets
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.is_active)
            .cloned())
    }

    async fn rule_set(&self, rule_set_id: Uuid) -> Result<Option<RuleSet>, AppError> {
        Ok(self
            .rule_sets
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.rule_set_id == rule_set_id)
            .cloned())
    }

    async fn insert_rule_set(&self, ruleset: &RuleSet) -> Result<(), AppError> {
        let mut rule_sets = self.rule_sets.lock().unwrap();
        if rule_sets.iter().any(|r| r.version == ruleset.version) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "ruleset version '{}' already exists",
                ruleset.version
            )));
        }
        rule_sets.push(ruleset.clone());
        Ok(())
    }

    async fn activate_rule_set(&self, rule_set_id: Uuid, actor: &str) -> Result<RuleSet, AppError> {
        let mut rule_sets = self.rule_sets.lock().unwrap();
        if !rule_sets.iter().any(|r| r.rule_set_id == rule_set_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "ruleset {} not found",
                rule_set_id
            )));
        }
        for ruleset in rule_sets.iter_mut() {
            ruleset.is_active = ruleset.rule_set_id == rule_set_id;
            if ruleset.is_active {
                ruleset.activated_utc = Some(Utc::now());
                ruleset.activated_by = Some(actor.to_string());
            }
        }
        Ok(rule_sets
            .iter()
            .find(|r| r.rule_set_id == rule_set_id)
            .cloned()
            .unwrap())
    }

    async fn risk_rules(&self, rule_set_id: Uuid) -> Result<Vec<RiskRule>, AppError> {
        Ok(self
            .risk_rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.rule_set_id == rule_set_id)
            .cloned()
            .collect())
    }

    async fn insert_risk_rule(&self, rule: &RiskRule) -> Result<(), AppError> {
        rule.validate_value()
            .map_err(|reason| AppError::BadRequest(anyhow::anyhow!(reason)))?;
        self.risk_rules.lock().unwrap().push(rule.clone());
        Ok(())
    }

    async fn merchant(&self, merchant_id: Uuid) -> Result<Option<Merchant>, AppError> {
        Ok(self.merchants.lock().unwrap().get(&merchant_id).cloned())
    }

    async fn traveler(&self, traveler_id: Uuid) -> Result<Option<Traveler>, AppError> {
        Ok(self.travelers.lock().unwrap().get(&traveler_id).cloned())
    }

    async fn invoice(&self, invoice_id: Uuid) -> Result<Option<SaleInvoice>, AppError> {
        Ok(self.invoices.lock().unwrap().get(&invoice_id).cloned())
    }

    async fn invoice_items(&self, invoice_id: Uuid) -> Result<Vec<SaleItem>, AppError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn form(&self, form_id: Uuid) -> Result<Option<TaxFreeForm>, AppError> {
        Ok(self.forms.lock().unwrap().get(&form_id).cloned())
    }

    async fn form_for_invoice(&self, invoice_id: Uuid) -> Result<Option<TaxFreeForm>, AppError> {
        Ok(self
            .forms
            .lock()
            .unwrap()
            .values()
            .find(|f| f.invoice_id == invoice_id)
            .cloned())
    }

    async fn count_recent_forms(
        &self,
        traveler_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        Ok(self
            .forms
            .lock()
            .unwrap()
            .values()
            .filter(|f| f.traveler_id == traveler_id && f.created_utc >= since)
            .count() as i64)
    }

    async fn create_form(
        &self,
        form: &TaxFreeForm,
        item_flags: &[ItemEligibility],
    ) -> Result<(), AppError> {
        let mut forms = self.forms.lock().unwrap();
        if forms.values().any(|f| f.invoice_id == form.invoice_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "invoice {} already has a tax-free form",
                form.invoice_id
            )));
        }
        forms.insert(form.form_id, form.clone());
        let mut items = self.items.lock().unwrap();
        for flag in item_flags {
            if let Some(item) = items.iter_mut().find(|i| i.item_id == flag.item_id) {
                item.is_eligible = flag.is_eligible;
                item.ineligibility_reason = flag.ineligibility_reason.clone();
            }
        }
        Ok(())
    }

    async fn transition_form(
        &self,
        form_id: Uuid,
        from: &[FormStatus],
        to: FormStatus,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut forms = self.forms.lock().unwrap();
        let form = match forms.get_mut(&form_id) {
            Some(form) => form,
            None => return Ok(false),
        };
        if !from.contains(&form.status()) {
            return Ok(false);
        }
        form.status = to.as_str().to_string();
        if to == FormStatus::Validated {
            form.validated_utc = Some(now);
            form.validated_by = actor.map(|a| a.to_string());
        }
        Ok(true)
    }

    async fn refund(&self, refund_id: Uuid) -> Result<Option<Refund>, AppError> {
        Ok(self.refunds.lock().unwrap().get(&refund_id).cloned())
    }

    async fn refund_for_form(&self, form_id: Uuid) -> Result<Option<Refund>, AppError> {
        Ok(self
            .refunds
            .lock()
            .unwrap()
            .values()
            .find(|r| r.form_id == form_id)
            .cloned())
    }

    async fn insert_refund(&self, refund: &Refund) -> Result<(), AppError> {
        let mut refunds = self.refunds.lock().unwrap();
        if refunds.values().any(|r| r.form_id == refund.form_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "a refund already exists for form {}",
                refund.form_id
            )));
        }
        refunds.insert(refund.refund_id, refund.clone());
        Ok(())
    }

    async fn claim_refund_for_processing(
        &self,
        refund_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Refund>, AppError> {
        let mut refunds = self.refunds.lock().unwrap();
        let refund = match refunds.get_mut(&refund_id) {
            Some(refund) => refund,
            None => return Ok(None),
        };
        match refund.status.as_str() {
            "pending" | "failed" => {
                refund.status = "initiated".to_string();
                refund.initiated_utc = Some(now);
                refund.updated_utc = now;
                Ok(Some(refund.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_refund_paid(
        &self,
        refund_id: Uuid,
        form_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut refunds = self.refunds.lock().unwrap();
        let refund = match refunds.get_mut(&refund_id) {
            Some(refund) if refund.status == "initiated" => refund,
            _ => return Ok(false),
        };
        refund.status = "paid".to_string();
        refund.paid_utc = Some(now);
        refund.updated_utc = now;
        if let Some(form) = self.forms.lock().unwrap().get_mut(&form_id) {
            form.status = "refunded".to_string();
        }
        Ok(true)
    }

    async fn mark_refund_failed(
        &self,
        refund_id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut refunds = self.refunds.lock().unwrap();
        let refund = match refunds.get_mut(&refund_id) {
            Some(refund) if refund.status == "initiated" => refund,
            _ => return Ok(false),
        };
        refund.status = "failed".to_string();
        refund.retry_count += 1;
        refund.next_retry_at = Some(next_retry_at);
        refund.updated_utc = now;
        Ok(true)
    }

    async fn record_cash_collection(&self, collection: &CashCollection) -> Result<bool, AppError> {
        let mut refunds = self.refunds.lock().unwrap();
        let refund = match refunds.get_mut(&collection.refund_id) {
            Some(refund) if refund.status == "initiated" && !refund.cash_collected => refund,
            _ => return Ok(false),
        };
        refund.status = "paid".to_string();
        refund.actual_payout_amount = Some(collection.actual_payout_amount);
        refund.service_gain = Some(collection.service_gain);
        refund.service_gain_cdf = Some(collection.service_gain_cdf);
        refund.cash_collected = true;
        refund.cash_collected_utc = Some(collection.collected_utc);
        refund.cash_collected_by = Some(collection.collected_by.clone());
        refund.paid_utc = Some(collection.collected_utc);
        refund.updated_utc = collection.collected_utc;
        if let Some(form) = self.forms.lock().unwrap().get_mut(&collection.form_id) {
            form.status = "refunded".to_string();
        }
        Ok(true)
    }

    async fn cancel_refund(
        &self,
        refund_id: Uuid,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut refunds = self.refunds.lock().unwrap();
        let refund = match refunds.get_mut(&refund_id) {
            Some(refund) if matches!(refund.status.as_str(), "pending" | "failed") => refund,
            _ => return Ok(false),
        };
        refund.status = "cancelled".to_string();
        refund.cancelled_reason = Some(reason.to_string());
        refund.cancelled_by = Some(actor.to_string());
        refund.cancelled_utc = Some(now);
        refund.updated_utc = now;
        Ok(true)
    }

    async fn refunds_due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<Refund>, AppError> {
        Ok(self
            .refunds
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.status == "failed"
                    && r.retry_count < r.max_retries
                    && r.next_retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn insert_payment_attempt(&self, attempt: &PaymentAttempt) -> Result<(), AppError> {
        self.attempts.lock().unwrap().push(attempt.clone());
        Ok(())
    }

    async fn complete_payment_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        response: Option<Value>,
        error_code: Option<String>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts
            .iter_mut()
            .find(|a| a.attempt_id == attempt_id && a.completed_utc.is_none())
            .ok_or_else(|| {
                AppError::Conflict(anyhow::anyhow!(
                    "payment attempt {} is already completed",
                    attempt_id
                ))
            })?;
        attempt.status = status.as_str().to_string();
        attempt.response_payload = response;
        attempt.error_code = error_code;
        attempt.error_message = error_message;
        attempt.completed_utc = Some(now);
        Ok(())
    }

    async fn payment_attempts(&self, refund_id: Uuid) -> Result<Vec<PaymentAttempt>, AppError> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.refund_id == refund_id)
            .cloned()
            .collect())
    }

    async fn currency(&self, code: &str) -> Result<Option<Currency>, AppError> {
        Ok(self.currencies.lock().unwrap().get(code).cloned())
    }

    async fn base_currency(&self) -> Result<Option<Currency>, AppError> {
        Ok(self
            .currencies
            .lock()
            .unwrap()
            .values()
            .find(|c| c.is_base_currency)
            .cloned())
    }

    async fn insert_currency(&self, currency: &Currency) -> Result<(), AppError> {
        let mut currencies = self.currencies.lock().unwrap();
        if currencies.contains_key(&currency.code) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "currency '{}' already exists",
                currency.code
            )));
        }
        currencies.insert(currency.code.clone(), currency.clone());
        Ok(())
    }

    async fn set_base_currency(&self, code: &str, actor: &str) -> Result<Currency, AppError> {
        let mut currencies = self.currencies.lock().unwrap();
        let old_rate = match currencies.get(code) {
            Some(currency) => currency.exchange_rate,
            None => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "currency '{}' does not exist",
                    code
                )))
            }
        };
        let now = Utc::now();
        for currency in currencies.values_mut() {
            currency.is_base_currency = currency.code == code;
            if currency.is_base_currency {
                currency.exchange_rate = Decimal::ONE;
                currency.updated_utc = now;
            }
        }
        if old_rate != Decimal::ONE {
            self.history.lock().unwrap().push(ExchangeRateHistory {
                history_id: Uuid::new_v4(),
                currency_code: code.to_string(),
                old_rate,
                new_rate: Decimal::ONE,
                changed_by: actor.to_string(),
                reason: "base currency change".to_string(),
                created_utc: now,
            });
        }
        Ok(currencies.get(code).cloned().unwrap())
    }

    async fn update_exchange_rate(
        &self,
        code: &str,
        new_rate: Decimal,
        actor: &str,
        reason: &str,
    ) -> Result<Currency, AppError> {
        let mut currencies = self.currencies.lock().unwrap();
        let currency = currencies.get_mut(code).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("currency '{}' does not exist", code))
        })?;
        let old_rate = currency.exchange_rate;
        let now = Utc::now();
        currency.exchange_rate = new_rate;
        currency.updated_utc = now;
        let updated = currency.clone();
        self.history.lock().unwrap().push(ExchangeRateHistory {
            history_id: Uuid::new_v4(),
            currency_code: code.to_string(),
            old_rate,
            new_rate,
            changed_by: actor.to_string(),
            reason: reason.to_string(),
            created_utc: now,
        });
        Ok(updated)
    }

    async fn rate_history(&self, code: &str) -> Result<Vec<ExchangeRateHistory>, AppError> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.currency_code == code)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), AppError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "audit store unavailable"
            )));
        }
        self.audits.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scriptable payment provider
// ---------------------------------------------------------------------------

/// Pops scripted outcomes in order; defaults to success when the script is
/// empty. An optional delay simulates a slow provider for timeout tests.
pub struct MockProvider {
    script: Mutex<VecDeque<Result<ProviderOutcome, AppError>>>,
    pub delay: Mutex<Option<std::time::Duration>>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: Result<ProviderOutcome, AppError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_decline(&self, code: &str, message: &str) {
        self.push(Ok(ProviderOutcome::failed(code, message, json!({}))));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn process_payment(&self, request: &ProviderRequest) -> Result<ProviderOutcome, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(ProviderOutcome::succeeded(
                json!({ "reference": request.reference, "status": "paid" }),
                Some(request.reference.clone()),
                Some(Uuid::new_v4().to_string()),
            )),
        }
    }
}

/// Records paid notices; optionally fails to prove delivery failures never
/// roll back a PAID refund.
#[derive(Default)]
pub struct CountingNotifier {
    pub notices: Mutex<Vec<RefundPaidNotice>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl NotificationSink for CountingNotifier {
    async fn refund_paid(&self, notice: &RefundPaidNotice) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::InternalError(anyhow::anyhow!("sink down")));
        }
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Seeded application harness
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub forms: FormService,
    pub rules: RuleService,
    pub settlement: Arc<SettlementService>,
    pub currencies: CurrencyService,
    pub sweep: RetrySweep,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<CountingNotifier>,
    pub merchant_id: Uuid,
    pub traveler_id: Uuid,
    pub rule_set_id: Uuid,
}

pub fn default_rule_set() -> RuleSet {
    RuleSet {
        rule_set_id: Uuid::new_v4(),
        version: "1.0.0".to_string(),
        min_purchase_amount: dec!(50000),
        min_age: 16,
        purchase_window_days: 30,
        exit_deadline_months: 3,
        eligible_residence_countries: vec![],
        excluded_residence_countries: vec!["CD".to_string()],
        excluded_categories: vec!["services".to_string()],
        vat_rates: sqlx::types::Json(
            [("general".to_string(), dec!(16))].into_iter().collect(),
        ),
        default_vat_rate: dec!(16),
        fee_percentage: dec!(15),
        fixed_fee: dec!(0),
        min_operator_fee: dec!(5000),
        refund_methods: vec!["cash".to_string(), "mobile_money".to_string()],
        risk_score_threshold: 50,
        high_value_threshold: dec!(1000000),
        is_active: true,
        activated_utc: Some(Utc::now()),
        activated_by: Some("ops".to_string()),
        created_utc: Utc::now(),
    }
}

pub fn currency(code: &str, rate: Decimal, is_base: bool, is_active: bool) -> Currency {
    let now = Utc::now();
    Currency {
        code: code.to_string(),
        name: code.to_string(),
        symbol: String::new(),
        exchange_rate: rate,
        is_base_currency: is_base,
        is_active,
        created_utc: now,
        updated_utc: now,
    }
}

impl TestApp {
    pub fn spawn() -> Self {
        let store = Arc::new(InMemoryStore::default());

        let ruleset = default_rule_set();
        let rule_set_id = ruleset.rule_set_id;
        store.seed_rule_set(ruleset);

        store.seed_currency(currency("CDF", dec!(1), true, true));
        store.seed_currency(currency("USD", dec!(0.000350), false, true));
        store.seed_currency(currency("EUR", dec!(0.000320), false, false));

        let merchant_id = Uuid::new_v4();
        store.seed_merchant(Merchant {
            merchant_id,
            name: "Kin Duty Free".to_string(),
            status: "approved".to_string(),
            created_utc: Utc::now(),
        });

        let traveler_id = Uuid::new_v4();
        let (passport_hash, passport_last4) = Traveler::digest_passport_number("AO1234567");
        store.seed_traveler(Traveler {
            traveler_id,
            full_name: "Joao M.".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1985, 6, 1).unwrap(),
            nationality: "AO".to_string(),
            residence_country: "AO".to_string(),
            passport_country: "AO".to_string(),
            passport_last4,
            passport_hash,
            created_utc: Utc::now(),
        });

        let provider = Arc::new(MockProvider::new());
        let mut registry = ProviderRegistry::new();
        registry.register(RefundMethod::Cash, Arc::new(CashDeskProvider::new()));
        registry.register(RefundMethod::MobileMoney, provider.clone());

        let notifier = Arc::new(CountingNotifier::default());
        let dyn_store: Arc<dyn Store> = store.clone();
        let settlement = Arc::new(SettlementService::new(
            dyn_store.clone(),
            registry,
            notifier.clone(),
            SettlementSettings {
                max_retries: 3,
                retry_backoff: chrono::Duration::minutes(15),
                provider_timeout: std::time::Duration::from_millis(200),
            },
        ));

        Self {
            forms: FormService::new(dyn_store.clone()),
            rules: RuleService::new(dyn_store.clone()),
            currencies: CurrencyService::new(dyn_store.clone()),
            sweep: RetrySweep::new(dyn_store, settlement.clone()),
            settlement,
            store,
            provider,
            notifier,
            merchant_id,
            traveler_id,
            rule_set_id,
        }
    }

    /// Seed an invoice with (category, line_total, vat_amount) items.
    pub fn seed_invoice(&self, lines: &[(&str, Decimal, Decimal)]) -> SaleInvoice {
        let invoice_id = Uuid::new_v4();
        let total: Decimal = lines.iter().map(|(_, line_total, _)| *line_total).sum();
        let invoice = SaleInvoice {
            invoice_id,
            merchant_id: self.merchant_id,
            traveler_id: self.traveler_id,
            invoice_number: format!("INV-{}", &invoice_id.to_string()[..8]),
            total_amount: total,
            is_cancelled: false,
            issued_utc: Utc::now(),
            created_utc: Utc::now(),
        };
        let items = lines
            .iter()
            .map(|(category, line_total, vat_amount)| SaleItem {
                item_id: Uuid::new_v4(),
                invoice_id,
                category: category.to_string(),
                description: format!("{} goods", category),
                quantity: dec!(1),
                unit_price: *line_total,
                vat_rate: dec!(16),
                line_total: *line_total,
                vat_amount: *vat_amount,
                is_eligible: true,
                ineligibility_reason: None,
            })
            .collect();
        self.store.seed_invoice(invoice.clone(), items);
        invoice
    }

    /// The worked example: 100,000 CDF eligible, 16,000 VAT.
    pub fn seed_standard_invoice(&self) -> SaleInvoice {
        self.seed_invoice(&[("general", dec!(100000), dec!(16000))])
    }

    pub async fn issued_form(&self) -> TaxFreeForm {
        let invoice = self.seed_standard_invoice();
        self.forms
            .create_form(&CreateFormRequest {
                invoice_id: invoice.invoice_id,
                requested_by: "merchant".to_string(),
            })
            .await
            .expect("form creation failed")
    }

    pub async fn validated_form(&self) -> TaxFreeForm {
        let form = self.issued_form().await;
        self.forms
            .mark_validated(&ValidateFormRequest {
                form_id: form.form_id,
                validated_by: "customs".to_string(),
            })
            .await
            .expect("form validation failed")
    }

    pub async fn refund_for(
        &self,
        form_id: Uuid,
        method: &str,
        payout_currency: Option<&str>,
    ) -> Refund {
        self.settlement
            .create_refund(&CreateRefundRequest {
                form_id,
                method: method.to_string(),
                payment_details: json!({ "phone_number": "+243811234567" }),
                payout_currency: payout_currency.map(|c| c.to_string()),
                requested_by: "ops".to_string(),
            })
            .await
            .expect("refund creation failed")
    }
}

/// Let spawned fire-and-forget tasks (notifications) run.
pub async fn drain_background_tasks() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
