//! Risk scoring: configurable predicates plus two built-in checks.

use crate::models::{RiskOperator, RiskRule, RuleSet, SaleInvoice, SaleItem, Traveler};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

pub const HIGH_VALUE_FLAG: &str = "HIGH_VALUE";
pub const FREQUENT_TRAVELER_FLAG: &str = "FREQUENT_TRAVELER";

const HIGH_VALUE_SCORE: i32 = 20;
const FREQUENT_TRAVELER_SCORE: i32 = 15;

/// Trailing window and form count for the frequent-traveler check.
pub const FREQUENT_TRAVELER_WINDOW_DAYS: i64 = 7;
pub const FREQUENT_TRAVELER_FORM_COUNT: i64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub score: i32,
    pub flags: Vec<String>,
    pub requires_control: bool,
}

/// Flat evaluation context the configurable predicates read from.
pub fn build_context(
    invoice: &SaleInvoice,
    items: &[SaleItem],
    traveler: &Traveler,
) -> HashMap<String, Value> {
    let mut context = HashMap::new();
    context.insert(
        "amount".to_string(),
        json!(invoice.total_amount.to_f64().unwrap_or(0.0)),
    );
    context.insert(
        "residence_country".to_string(),
        json!(traveler.residence_country),
    );
    context.insert("nationality".to_string(), json!(traveler.nationality));
    context.insert(
        "passport_country".to_string(),
        json!(traveler.passport_country),
    );
    context.insert(
        "merchant_id".to_string(),
        json!(invoice.merchant_id.to_string()),
    );
    context.insert("item_count".to_string(), json!(items.len()));
    context
}

/// Evaluate one predicate against the context. A missing field, an unknown
/// operator, or a numeric comparison with a non-coercible operand is a
/// non-match, never an error: a misconfigured rule scores 0.
pub fn evaluate_rule(rule: &RiskRule, context: &HashMap<String, Value>) -> bool {
    if !rule.is_active {
        return false;
    }
    let operator = match rule.operator() {
        Some(op) => op,
        None => return false,
    };
    let actual = match context.get(&rule.field) {
        Some(value) => value,
        None => return false,
    };
    match operator {
        RiskOperator::Equals => values_equal(actual, &rule.value),
        RiskOperator::NotEquals => !values_equal(actual, &rule.value),
        RiskOperator::GreaterThan => match (coerce_f64(actual), coerce_f64(&rule.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        RiskOperator::LessThan => match (coerce_f64(actual), coerce_f64(&rule.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        RiskOperator::In => rule
            .value
            .as_array()
            .map(|list| list.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(false),
        RiskOperator::NotIn => rule
            .value
            .as_array()
            .map(|list| !list.iter().any(|v| values_equal(actual, v)))
            .unwrap_or(false),
    }
}

/// Exact equality, with numbers compared numerically so an integer-typed
/// context value matches a float-typed rule value.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn coerce_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
}

/// Accumulate configured rule impacts and the two built-in checks; rules
/// only ever add to the running total.
pub fn assess(
    rules: &[RiskRule],
    context: &HashMap<String, Value>,
    eligible_amount: Decimal,
    recent_form_count: i64,
    ruleset: &RuleSet,
) -> RiskAssessment {
    let mut score = 0;
    let mut flags = Vec::new();

    for rule in rules.iter().filter(|r| r.is_active) {
        if evaluate_rule(rule, context) {
            score += rule.score_impact;
            flags.push(rule.name.clone());
        }
    }

    if eligible_amount >= ruleset.high_value_threshold {
        score += HIGH_VALUE_SCORE;
        flags.push(HIGH_VALUE_FLAG.to_string());
    }

    if recent_form_count >= FREQUENT_TRAVELER_FORM_COUNT {
        score += FREQUENT_TRAVELER_SCORE;
        flags.push(FREQUENT_TRAVELER_FLAG.to_string());
    }

    // Two independently thresholded signals: either one alone forces a
    // physical control.
    let requires_control =
        score >= ruleset.risk_score_threshold || eligible_amount >= ruleset.high_value_threshold;

    RiskAssessment {
        score,
        flags,
        requires_control,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn ruleset() -> RuleSet {
        RuleSet {
            rule_set_id: Uuid::new_v4(),
            version: "1.0.0".to_string(),
            min_purchase_amount: dec!(50000),
            min_age: 16,
            purchase_window_days: 30,
            exit_deadline_months: 3,
            eligible_residence_countries: vec![],
            excluded_residence_countries: vec![],
            excluded_categories: vec![],
            vat_rates: sqlx::types::Json(BTreeMap::new()),
            default_vat_rate: dec!(16),
            fee_percentage: dec!(15),
            fixed_fee: dec!(0),
            min_operator_fee: dec!(5000),
            refund_methods: vec!["cash".to_string()],
            risk_score_threshold: 50,
            high_value_threshold: dec!(1000000),
            is_active: true,
            activated_utc: None,
            activated_by: None,
            created_utc: Utc::now(),
        }
    }

    fn rule(field: &str, operator: &str, value: Value, impact: i32) -> RiskRule {
        RiskRule {
            risk_rule_id: Uuid::new_v4(),
            rule_set_id: Uuid::new_v4(),
            name: format!("{}_{}", field, operator),
            field: field.to_string(),
            operator: operator.to_string(),
            value,
            score_impact: impact,
            is_active: true,
            created_utc: Utc::now(),
        }
    }

    fn context_with_amount(amount: f64) -> HashMap<String, Value> {
        HashMap::from([
            ("amount".to_string(), json!(amount)),
            ("residence_country".to_string(), json!("AO")),
            ("nationality".to_string(), json!("AO")),
            ("item_count".to_string(), json!(4)),
        ])
    }

    #[test]
    fn equals_and_not_equals_compare_exactly() {
        let ctx = context_with_amount(1000.0);
        assert!(evaluate_rule(&rule("residence_country", "equals", json!("AO"), 5), &ctx));
        assert!(!evaluate_rule(&rule("residence_country", "equals", json!("CD"), 5), &ctx));
        assert!(evaluate_rule(&rule("residence_country", "not_equals", json!("CD"), 5), &ctx));
    }

    #[test]
    fn numeric_equality_crosses_integer_and_float_typing() {
        let ctx = HashMap::from([("item_count".to_string(), json!(4))]);
        assert!(evaluate_rule(&rule("item_count", "equals", json!(4.0), 5), &ctx));
    }

    #[test]
    fn ordering_operators_coerce_to_float() {
        let ctx = context_with_amount(750000.0);
        assert!(evaluate_rule(&rule("amount", "greater_than", json!(500000), 10), &ctx));
        assert!(evaluate_rule(&rule("amount", "greater_than", json!("500000"), 10), &ctx));
        assert!(!evaluate_rule(&rule("amount", "less_than", json!(500000), 10), &ctx));
    }

    #[test]
    fn non_coercible_operand_is_a_non_match() {
        let ctx = HashMap::from([("residence_country".to_string(), json!("AO"))]);
        assert!(!evaluate_rule(
            &rule("residence_country", "greater_than", json!(10), 10),
            &ctx
        ));
    }

    #[test]
    fn missing_field_scores_zero() {
        let ctx = context_with_amount(1000.0);
        assert!(!evaluate_rule(&rule("card_bin", "equals", json!("4111"), 10), &ctx));
    }

    #[test]
    fn membership_tests_list_inclusion() {
        let ctx = context_with_amount(1000.0);
        assert!(evaluate_rule(
            &rule("residence_country", "in", json!(["AO", "ZM"]), 10),
            &ctx
        ));
        assert!(evaluate_rule(
            &rule("residence_country", "not_in", json!(["CD", "CG"]), 10),
            &ctx
        ));
        assert!(!evaluate_rule(
            &rule("residence_country", "in", json!(["CD"]), 10),
            &ctx
        ));
    }

    #[test]
    fn inactive_rules_never_match() {
        let ctx = context_with_amount(1000.0);
        let mut r = rule("residence_country", "equals", json!("AO"), 10);
        r.is_active = false;
        assert!(!evaluate_rule(&r, &ctx));
    }

    #[test]
    fn score_accumulates_rules_and_builtins() {
        let rs = ruleset();
        let ctx = context_with_amount(1200000.0);
        let rules = vec![
            rule("amount", "greater_than", json!(500000), 25),
            rule("residence_country", "equals", json!("AO"), 10),
            rule("nationality", "equals", json!("CD"), 40), // does not match
        ];
        let assessment = assess(&rules, &ctx, dec!(1200000), 3, &rs);
        // 25 + 10 + HIGH_VALUE 20 + FREQUENT_TRAVELER 15
        assert_eq!(assessment.score, 70);
        assert!(assessment.flags.contains(&HIGH_VALUE_FLAG.to_string()));
        assert!(assessment.flags.contains(&FREQUENT_TRAVELER_FLAG.to_string()));
        assert!(assessment.requires_control);
    }

    #[test]
    fn exactly_at_high_value_threshold_forces_control() {
        let rs = ruleset();
        let ctx = context_with_amount(1000000.0);
        let assessment = assess(&[], &ctx, dec!(1000000), 0, &rs);
        assert_eq!(assessment.score, HIGH_VALUE_SCORE);
        assert!(assessment.score < rs.risk_score_threshold);
        assert!(assessment.requires_control);
    }

    #[test]
    fn two_forms_in_window_do_not_trip_the_frequency_check() {
        let rs = ruleset();
        let ctx = context_with_amount(100000.0);
        let assessment = assess(&[], &ctx, dec!(100000), 2, &rs);
        assert_eq!(assessment.score, 0);
        assert!(!assessment.requires_control);
        assert!(assessment.flags.is_empty());
    }
}
