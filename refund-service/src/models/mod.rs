//! Domain models for refund-service.

mod currency;
mod form;
mod refund;
mod ruleset;
mod sale;
mod traveler;

pub use currency::{Currency, ExchangeRateHistory};
pub use form::{FormStatus, TaxFreeForm};
pub use refund::{
    AttemptStatus, PaymentAttempt, Refund, RefundMethod, RefundStatus,
};
pub use ruleset::{RiskOperator, RiskRule, RuleSet, RuleSnapshot};
pub use sale::{Merchant, MerchantStatus, SaleInvoice, SaleItem};
pub use traveler::Traveler;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Structured audit record emitted for every state transition. Appended
/// best-effort; a failed write never blocks the underlying transition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub detail: Value,
    pub created_utc: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: impl ToString,
        actor: &str,
        detail: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            detail,
            created_utc: Utc::now(),
        }
    }
}
