//! Versioned rule configuration and risk rule models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Versioned bundle of eligibility, pricing and risk parameters.
///
/// At most one ruleset is active at a time; activation deactivates all
/// others in the same transaction. Once a ruleset has produced a form its
/// fields are append/copy-only — issued forms keep their own frozen
/// [`RuleSnapshot`] and never read back from this row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RuleSet {
    pub rule_set_id: Uuid,
    /// Semantic version string, unique across rulesets.
    pub version: String,
    pub min_purchase_amount: Decimal,
    pub min_age: i32,
    /// Days between sale and form creation during which a claim may be filed.
    pub purchase_window_days: i32,
    /// Months after form creation before the form expires unvalidated.
    pub exit_deadline_months: i32,
    /// Empty list means no restriction from this list.
    pub eligible_residence_countries: Vec<String>,
    pub excluded_residence_countries: Vec<String>,
    pub excluded_categories: Vec<String>,
    /// Advisory per-category VAT rates used as sale-entry defaults. The
    /// item's stored rate is authoritative at pricing time.
    pub vat_rates: sqlx::types::Json<BTreeMap<String, Decimal>>,
    pub default_vat_rate: Decimal,
    pub fee_percentage: Decimal,
    pub fixed_fee: Decimal,
    pub min_operator_fee: Decimal,
    pub refund_methods: Vec<String>,
    pub risk_score_threshold: i32,
    pub high_value_threshold: Decimal,
    pub is_active: bool,
    pub activated_utc: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl RuleSet {
    pub fn excludes_category(&self, category: &str) -> bool {
        self.excluded_categories.iter().any(|c| c == category)
    }
}

/// Frozen copy of the pricing-relevant ruleset fields, captured into each
/// form at creation time. Later ruleset edits or re-activations never change
/// the meaning of an already-issued form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub rule_set_version: String,
    pub min_purchase_amount: Decimal,
    pub excluded_categories: Vec<String>,
    pub default_vat_rate: Decimal,
    pub fee_percentage: Decimal,
    pub fixed_fee: Decimal,
    pub min_operator_fee: Decimal,
    pub refund_methods: Vec<String>,
    pub risk_score_threshold: i32,
    pub high_value_threshold: Decimal,
    pub exit_deadline_months: i32,
}

impl RuleSnapshot {
    pub fn from_rule_set(ruleset: &RuleSet) -> Self {
        Self {
            rule_set_version: ruleset.version.clone(),
            min_purchase_amount: ruleset.min_purchase_amount,
            excluded_categories: ruleset.excluded_categories.clone(),
            default_vat_rate: ruleset.default_vat_rate,
            fee_percentage: ruleset.fee_percentage,
            fixed_fee: ruleset.fixed_fee,
            min_operator_fee: ruleset.min_operator_fee,
            refund_methods: ruleset.refund_methods.clone(),
            risk_score_threshold: ruleset.risk_score_threshold,
            high_value_threshold: ruleset.high_value_threshold,
            exit_deadline_months: ruleset.exit_deadline_months,
        }
    }

    pub fn allows_method(&self, method: super::RefundMethod) -> bool {
        self.refund_methods.iter().any(|m| m == method.as_str())
    }
}

/// Closed set of predicate operators for configurable risk rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

impl RiskOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }

    /// Returns `None` for anything outside the closed operator set.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "equals" => Some(Self::Equals),
            "not_equals" => Some(Self::NotEquals),
            "greater_than" => Some(Self::GreaterThan),
            "less_than" => Some(Self::LessThan),
            "in" => Some(Self::In),
            "not_in" => Some(Self::NotIn),
            _ => None,
        }
    }
}

/// A single configurable risk predicate belonging to one ruleset.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RiskRule {
    pub risk_rule_id: Uuid,
    pub rule_set_id: Uuid,
    pub name: String,
    /// Key into the evaluation context map.
    pub field: String,
    pub operator: String,
    /// Comparison value: number, string, or list depending on the operator.
    pub value: Value,
    pub score_impact: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl RiskRule {
    pub fn operator(&self) -> Option<RiskOperator> {
        RiskOperator::from_str(&self.operator)
    }

    /// Validate the comparison value's type against the operator. Runs at
    /// rule-save time so evaluation never sees an ill-typed rule.
    pub fn validate_value(&self) -> Result<(), String> {
        let operator = match self.operator() {
            Some(op) => operator_ok(op, &self.value),
            None => return Err(format!("unknown operator '{}'", self.operator)),
        };
        if operator {
            Ok(())
        } else {
            Err(format!(
                "operator '{}' is incompatible with value {}",
                self.operator, self.value
            ))
        }
    }
}

fn operator_ok(operator: RiskOperator, value: &Value) -> bool {
    match operator {
        RiskOperator::Equals | RiskOperator::NotEquals => {
            value.is_number() || value.is_string() || value.is_boolean()
        }
        RiskOperator::GreaterThan | RiskOperator::LessThan => {
            value.is_number() || value.as_str().map(|s| s.parse::<f64>().is_ok()).unwrap_or(false)
        }
        RiskOperator::In | RiskOperator::NotIn => value.is_array(),
    }
}
