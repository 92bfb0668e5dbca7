//! Eligibility and pricing engine.
//!
//! Pure functions over (invoice, items, traveler, merchant, ruleset). No
//! persistence access: the active ruleset is an explicit argument, the
//! caller supplies everything the decision needs, and concurrent invocation
//! is safe by construction.

use crate::models::{Merchant, RuleSet, SaleInvoice, SaleItem, Traveler};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use uuid::Uuid;

/// Everything the eligibility decision reads.
#[derive(Debug)]
pub struct EligibilityInput<'a> {
    pub invoice: &'a SaleInvoice,
    pub items: &'a [SaleItem],
    pub traveler: &'a Traveler,
    pub merchant: &'a Merchant,
    /// Whether a form already exists for this invoice (one-to-one is
    /// enforced here at the business layer, not only by the schema).
    pub has_existing_form: bool,
}

/// Outcome of the eligibility checks. All checks run independently and
/// every violated rule lands in `reasons` — a caller sees the full set of
/// violations at once, never just the first.
#[derive(Debug, Clone, Serialize)]
pub struct EligibilityReport {
    pub eligible: bool,
    pub reasons: Vec<String>,
}

/// Monetary breakdown for an eligible claim.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricingBreakdown {
    pub eligible_amount: Decimal,
    pub vat_amount: Decimal,
    pub operator_fee: Decimal,
    pub refund_amount: Decimal,
}

/// Per-item eligibility verdict, persisted alongside the form in the same
/// transaction. Price and VAT fields are never touched by this update.
#[derive(Debug, Clone, Serialize)]
pub struct ItemEligibility {
    pub item_id: Uuid,
    pub is_eligible: bool,
    pub ineligibility_reason: Option<String>,
}

fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn qualifying_items<'a>(
    items: &'a [SaleItem],
    ruleset: &'a RuleSet,
) -> impl Iterator<Item = &'a SaleItem> {
    items
        .iter()
        .filter(|item| !ruleset.excludes_category(&item.category) && item.is_eligible)
}

/// Sum of line totals and VAT over the qualifying item set, plus the fee
/// and net refund derived from them.
pub fn compute(items: &[SaleItem], ruleset: &RuleSet) -> PricingBreakdown {
    let mut eligible_amount = Decimal::ZERO;
    let mut vat_amount = Decimal::ZERO;
    for item in qualifying_items(items, ruleset) {
        eligible_amount += item.line_total;
        // The item's own stored rate is authoritative; the ruleset's
        // category table is a sale-entry default only.
        vat_amount += item.vat_amount;
    }
    let operator_fee = operator_fee(vat_amount, ruleset);
    PricingBreakdown {
        eligible_amount,
        vat_amount,
        operator_fee,
        refund_amount: vat_amount - operator_fee,
    }
}

/// `max(vat × pct/100 + fixed, floor)`, rounded to 2 decimal places with
/// standard rounding. The floor dominates the formula.
pub fn operator_fee(vat_amount: Decimal, ruleset: &RuleSet) -> Decimal {
    let computed =
        round_money(vat_amount * ruleset.fee_percentage / Decimal::from(100) + ruleset.fixed_fee);
    computed.max(ruleset.min_operator_fee)
}

/// Run every eligibility check and accumulate the violations.
pub fn evaluate(
    input: &EligibilityInput<'_>,
    ruleset: &RuleSet,
    now: DateTime<Utc>,
) -> EligibilityReport {
    let mut reasons = Vec::new();
    let pricing = compute(input.items, ruleset);

    if pricing.eligible_amount < ruleset.min_purchase_amount {
        reasons.push(format!(
            "eligible amount {} is below the minimum purchase amount {}",
            pricing.eligible_amount, ruleset.min_purchase_amount
        ));
    }

    let age = input.traveler.age_on(now.date_naive());
    if age < ruleset.min_age {
        reasons.push(format!(
            "traveler age {} is below the minimum age {}",
            age, ruleset.min_age
        ));
    }

    let residence = input.traveler.residence_country.as_str();
    if !ruleset.excluded_residence_countries.is_empty()
        && ruleset
            .excluded_residence_countries
            .iter()
            .any(|c| c == residence)
    {
        reasons.push(format!(
            "residence country {} is excluded from the refund program",
            residence
        ));
    }
    if !ruleset.eligible_residence_countries.is_empty()
        && !ruleset
            .eligible_residence_countries
            .iter()
            .any(|c| c == residence)
    {
        reasons.push(format!(
            "residence country {} is not in the eligible country list",
            residence
        ));
    }

    if !input.merchant.can_create_forms() {
        reasons.push(format!(
            "merchant '{}' is not approved for form creation (status: {})",
            input.merchant.name, input.merchant.status
        ));
    }

    if input.invoice.is_cancelled {
        reasons.push("invoice is cancelled".to_string());
    }

    if input.has_existing_form {
        reasons.push("invoice already has a tax-free form".to_string());
    }

    if ruleset.purchase_window_days > 0 {
        let window_end =
            input.invoice.issued_utc + Duration::days(ruleset.purchase_window_days as i64);
        if now > window_end {
            reasons.push(format!(
                "purchase window of {} days has elapsed since the sale",
                ruleset.purchase_window_days
            ));
        }
    }

    if pricing.refund_amount <= Decimal::ZERO {
        reasons.push(format!(
            "operator fee {} consumes the VAT amount {}; nothing left to refund",
            pricing.operator_fee, pricing.vat_amount
        ));
    }

    EligibilityReport {
        eligible: reasons.is_empty(),
        reasons,
    }
}

/// Per-item verdicts against the ruleset's excluded-category list.
pub fn item_eligibility(items: &[SaleItem], ruleset: &RuleSet) -> Vec<ItemEligibility> {
    items
        .iter()
        .map(|item| {
            if ruleset.excludes_category(&item.category) {
                ItemEligibility {
                    item_id: item.item_id,
                    is_eligible: false,
                    ineligibility_reason: Some(format!(
                        "category '{}' is excluded from tax-free sales",
                        item.category
                    )),
                }
            } else {
                ItemEligibility {
                    item_id: item.item_id,
                    is_eligible: true,
                    ineligibility_reason: None,
                }
            }
        })
        .collect()
}
