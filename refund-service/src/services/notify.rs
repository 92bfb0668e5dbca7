//! Notification sink for refund lifecycle events.
//!
//! Delivery is fire-and-forget: a sink failure is logged and never rolls
//! back the refund state that triggered it.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use taxfree_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct RefundPaidNotice {
    pub refund_id: Uuid,
    pub traveler_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn refund_paid(&self, notice: &RefundPaidNotice) -> Result<(), AppError>;
}

/// Default sink: emits the event into the structured log stream, where the
/// (out-of-scope) notification relay picks it up.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn refund_paid(&self, notice: &RefundPaidNotice) -> Result<(), AppError> {
        tracing::info!(
            refund_id = %notice.refund_id,
            traveler_id = %notice.traveler_id,
            amount = %notice.amount,
            currency = %notice.currency,
            method = %notice.method,
            event = "refund_paid",
            "Refund paid notification"
        );
        Ok(())
    }
}
