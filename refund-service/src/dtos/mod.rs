//! Operation inputs, validated at the service boundary.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateFormRequest {
    pub invoice_id: Uuid,
    #[validate(length(min = 1, message = "requested_by is required"))]
    pub requested_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ValidateFormRequest {
    pub form_id: Uuid,
    #[validate(length(min = 1, message = "validated_by is required"))]
    pub validated_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRefundRequest {
    pub form_id: Uuid,
    #[validate(length(min = 1, message = "method is required"))]
    pub method: String,
    /// Payout destination details, e.g. `{"phone_number": "+243..."}`.
    #[serde(default)]
    pub payment_details: Value,
    /// ISO 4217 code; the base currency when omitted.
    #[validate(length(equal = 3, message = "payout_currency must be a 3-letter code"))]
    pub payout_currency: Option<String>,
    #[validate(length(min = 1, message = "requested_by is required"))]
    pub requested_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CollectCashRequest {
    pub refund_id: Uuid,
    /// Amount physically handed over; the full expected payout when omitted.
    pub actual_amount: Option<Decimal>,
    #[validate(length(min = 1, message = "collected_by is required"))]
    pub collected_by: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CancelRefundRequest {
    pub refund_id: Uuid,
    #[validate(length(min = 1, message = "reason is required"))]
    pub reason: String,
    #[validate(length(min = 1, message = "cancelled_by is required"))]
    pub cancelled_by: String,
}
