//! Tax-free form issuance and validation.
//!
//! Orchestrates the pure engine over persisted entities: loads the active
//! ruleset and the sale, runs eligibility/pricing/risk, freezes the rule
//! snapshot, and persists the form together with the per-item eligibility
//! flags in one transaction.

use crate::dtos::{CreateFormRequest, ValidateFormRequest};
use crate::models::{AuditEvent, FormStatus, RuleSnapshot, TaxFreeForm};
use crate::services::metrics::FORMS_TOTAL;
use crate::services::{audit, engine, risk, store::Store};
use chrono::{Duration, Months, Utc};
use serde_json::json;
use std::sync::Arc;
use taxfree_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct FormService {
    store: Arc<dyn Store>,
}

impl FormService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Evaluate an invoice against the active ruleset and issue a tax-free
    /// form. Every violated eligibility rule is reported at once; nothing
    /// is persisted for an ineligible claim.
    #[instrument(skip(self, request), fields(invoice_id = %request.invoice_id))]
    pub async fn create_form(&self, request: &CreateFormRequest) -> Result<TaxFreeForm, AppError> {
        request.validate()?;

        let ruleset = self
            .store
            .active_rule_set()
            .await?
            .ok_or_else(|| AppError::Configuration(anyhow::anyhow!("no active ruleset")))?;

        let invoice = self
            .store
            .invoice(request.invoice_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("invoice {} not found", request.invoice_id))
            })?;
        let items = self.store.invoice_items(invoice.invoice_id).await?;
        let traveler = self
            .store
            .traveler(invoice.traveler_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("traveler {} not found", invoice.traveler_id))
            })?;
        let merchant = self
            .store
            .merchant(invoice.merchant_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("merchant {} not found", invoice.merchant_id))
            })?;
        let has_existing_form = self
            .store
            .form_for_invoice(invoice.invoice_id)
            .await?
            .is_some();

        let now = Utc::now();
        let input = engine::EligibilityInput {
            invoice: &invoice,
            items: &items,
            traveler: &traveler,
            merchant: &merchant,
            has_existing_form,
        };

        let report = engine::evaluate(&input, &ruleset, now);
        if !report.eligible {
            FORMS_TOTAL.with_label_values(&["rejected"]).inc();
            warn!(
                invoice_id = %invoice.invoice_id,
                reasons = ?report.reasons,
                "Form creation refused"
            );
            return Err(AppError::Ineligible(report.reasons));
        }

        let pricing = engine::compute(&items, &ruleset);

        let since = now - Duration::days(risk::FREQUENT_TRAVELER_WINDOW_DAYS);
        // The form being created counts toward the trailing window total.
        let recent_forms = self
            .store
            .count_recent_forms(traveler.traveler_id, since)
            .await?
            + 1;
        let context = risk::build_context(&invoice, &items, &traveler);
        let rules = self.store.risk_rules(ruleset.rule_set_id).await?;
        let assessment = risk::assess(
            &rules,
            &context,
            pricing.eligible_amount,
            recent_forms,
            &ruleset,
        );

        let expires_at = now
            .checked_add_months(Months::new(ruleset.exit_deadline_months as u32))
            .ok_or_else(|| anyhow::anyhow!("expiry timestamp out of range"))?;

        let snapshot = RuleSnapshot::from_rule_set(&ruleset);
        let form = TaxFreeForm {
            form_id: Uuid::new_v4(),
            invoice_id: invoice.invoice_id,
            traveler_id: traveler.traveler_id,
            merchant_id: merchant.merchant_id,
            eligible_amount: pricing.eligible_amount,
            vat_amount: pricing.vat_amount,
            operator_fee: pricing.operator_fee,
            refund_amount: pricing.refund_amount,
            rule_snapshot: serde_json::to_value(&snapshot)
                .map_err(|e| AppError::InternalError(e.into()))?,
            risk_score: assessment.score,
            risk_flags: assessment.flags.clone(),
            requires_control: assessment.requires_control,
            status: FormStatus::Issued.as_str().to_string(),
            expires_at,
            created_utc: now,
            validated_utc: None,
            validated_by: None,
        };

        let item_flags = engine::item_eligibility(&items, &ruleset);
        self.store.create_form(&form, &item_flags).await?;

        FORMS_TOTAL.with_label_values(&["issued"]).inc();
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "form_issued",
                "tax_free_form",
                form.form_id,
                &request.requested_by,
                json!({
                    "invoice_id": invoice.invoice_id,
                    "refund_amount": form.refund_amount,
                    "risk_score": form.risk_score,
                    "requires_control": form.requires_control,
                }),
            ),
        )
        .await;

        info!(
            form_id = %form.form_id,
            invoice_id = %invoice.invoice_id,
            refund_amount = %form.refund_amount,
            risk_score = form.risk_score,
            requires_control = form.requires_control,
            "Tax-free form issued"
        );

        Ok(form)
    }

    /// Record the customs exit validation. Allowed only once, from ISSUED,
    /// before the exit deadline.
    #[instrument(skip(self, request), fields(form_id = %request.form_id))]
    pub async fn mark_validated(&self, request: &ValidateFormRequest) -> Result<TaxFreeForm, AppError> {
        request.validate()?;

        let form = self.store.form(request.form_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("form {} not found", request.form_id))
        })?;

        let now = Utc::now();
        if form.is_expired_at(now) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "form expired on {}; customs validation is no longer possible",
                form.expires_at
            )));
        }

        let transitioned = self
            .store
            .transition_form(
                form.form_id,
                &[FormStatus::Issued],
                FormStatus::Validated,
                Some(&request.validated_by),
                now,
            )
            .await?;
        if !transitioned {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "form {} is not awaiting validation (status: {})",
                form.form_id,
                form.status
            )));
        }

        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "form_validated",
                "tax_free_form",
                form.form_id,
                &request.validated_by,
                json!({ "invoice_id": form.invoice_id }),
            ),
        )
        .await;

        self.store
            .form(form.form_id)
            .await?
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("form vanished mid-update")))
    }
}
