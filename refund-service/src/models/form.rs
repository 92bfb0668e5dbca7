//! Tax-free form model: the engine's output artifact.

use super::RuleSnapshot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormStatus {
    Issued,
    Validated,
    Refunded,
    Expired,
}

impl FormStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Validated => "validated",
            Self::Refunded => "refunded",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "validated" => Self::Validated,
            "refunded" => Self::Refunded,
            "expired" => Self::Expired,
            _ => Self::Issued,
        }
    }
}

/// One tax-free form per invoice. Monetary fields and the rule snapshot are
/// frozen at creation; only the status and validation timestamps change
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaxFreeForm {
    pub form_id: Uuid,
    pub invoice_id: Uuid,
    pub traveler_id: Uuid,
    pub merchant_id: Uuid,
    pub eligible_amount: Decimal,
    pub vat_amount: Decimal,
    pub operator_fee: Decimal,
    /// VAT amount minus operator fee.
    pub refund_amount: Decimal,
    pub rule_snapshot: Value,
    pub risk_score: i32,
    pub risk_flags: Vec<String>,
    pub requires_control: bool,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub validated_utc: Option<DateTime<Utc>>,
    pub validated_by: Option<String>,
}

impl TaxFreeForm {
    pub fn status(&self) -> FormStatus {
        FormStatus::from_str(&self.status)
    }

    /// Decode the frozen rule snapshot captured at creation time.
    pub fn snapshot(&self) -> Result<RuleSnapshot, serde_json::Error> {
        serde_json::from_value(self.rule_snapshot.clone())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
