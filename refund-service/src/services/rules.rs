//! Ruleset administration.

use crate::models::{AuditEvent, RiskRule, RuleSet};
use crate::services::{audit, store::Store};
use serde_json::json;
use std::sync::Arc;
use taxfree_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct RuleService {
    store: Arc<dyn Store>,
}

impl RuleService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Register a new (inactive) ruleset version.
    #[instrument(skip(self, ruleset), fields(version = %ruleset.version))]
    pub async fn create_rule_set(&self, ruleset: &RuleSet) -> Result<(), AppError> {
        if ruleset.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "rulesets are created inactive; use activation to switch versions"
            )));
        }
        self.store.insert_rule_set(ruleset).await
    }

    /// Switch the active ruleset. Deactivate-all plus activate-one is a
    /// single atomic transition inside the store.
    #[instrument(skip(self), fields(rule_set_id = %rule_set_id, actor = %actor))]
    pub async fn activate(&self, rule_set_id: Uuid, actor: &str) -> Result<RuleSet, AppError> {
        let previous = self.store.active_rule_set().await?;
        let activated = self.store.activate_rule_set(rule_set_id, actor).await?;

        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "rule_set_activated",
                "rule_set",
                activated.rule_set_id,
                actor,
                json!({
                    "version": activated.version,
                    "previous_version": previous.map(|p| p.version),
                }),
            ),
        )
        .await;

        info!(version = %activated.version, "Ruleset activated");
        Ok(activated)
    }

    /// Save a risk rule; the comparison value's type is checked against the
    /// operator here, not at evaluation time.
    #[instrument(skip(self, rule), fields(name = %rule.name))]
    pub async fn add_risk_rule(&self, rule: &RiskRule) -> Result<(), AppError> {
        self.store.insert_risk_rule(rule).await?;
        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "risk_rule_added",
                "risk_rule",
                rule.risk_rule_id,
                "ops",
                json!({ "field": rule.field, "operator": rule.operator, "impact": rule.score_impact }),
            ),
        )
        .await;
        Ok(())
    }
}
