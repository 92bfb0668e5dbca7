//! Refund and payment attempt models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStatus {
    Pending,
    Initiated,
    Paid,
    Failed,
    Cancelled,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initiated => "initiated",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "initiated" => Self::Initiated,
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundMethod {
    Cash,
    MobileMoney,
    BankTransfer,
}

impl RefundMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::MobileMoney => "mobile_money",
            Self::BankTransfer => "bank_transfer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "cash" => Some(Self::Cash),
            "mobile_money" => Some(Self::MobileMoney),
            "bank_transfer" => Some(Self::BankTransfer),
            _ => None,
        }
    }
}

/// A refund owed against a validated form. Monetary figures are copied from
/// the form at creation, never recomputed from the invoice. The exchange
/// rate is frozen at creation so later rate changes leave the payout intact.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Refund {
    pub refund_id: Uuid,
    pub form_id: Uuid,
    /// Equals the form's VAT amount.
    pub gross_amount: Decimal,
    pub operator_fee: Decimal,
    /// gross_amount - operator_fee.
    pub net_amount: Decimal,
    pub method: String,
    /// Payout destination details (e.g. mobile money subscriber number).
    pub payment_details: Value,
    pub status: String,
    pub payout_currency: String,
    /// 1 CDF = this many units of the payout currency.
    pub exchange_rate_applied: Decimal,
    /// Net amount converted into the payout currency.
    pub payout_amount: Decimal,
    pub actual_payout_amount: Option<Decimal>,
    /// payout_amount - actual_payout_amount, in payout currency. Never
    /// negative under correct reconciliation.
    pub service_gain: Option<Decimal>,
    pub service_gain_cdf: Option<Decimal>,
    pub cash_collected: bool,
    pub cash_collected_utc: Option<DateTime<Utc>>,
    pub cash_collected_by: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub initiated_utc: Option<DateTime<Utc>>,
    pub paid_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Refund {
    pub fn status(&self) -> RefundStatus {
        RefundStatus::from_str(&self.status)
    }

    pub fn method(&self) -> Option<RefundMethod> {
        RefundMethod::from_str(&self.method)
    }

    /// A refund may be retried only while FAILED with budget remaining.
    pub fn can_retry(&self) -> bool {
        self.status() == RefundStatus::Failed && self.retry_count < self.max_retries
    }

    /// Cash owed to the traveler at the counter, in payout currency.
    pub fn expected_cash_amount(&self) -> Decimal {
        self.payout_amount
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Append-only audit of one payment provider call. A retry creates a new
/// attempt; completed attempts are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentAttempt {
    pub attempt_id: Uuid,
    pub refund_id: Uuid,
    pub provider: String,
    /// Sanitized copy: account/card/phone digits reduced to last 4.
    pub request_payload: Value,
    pub response_payload: Option<Value>,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}
