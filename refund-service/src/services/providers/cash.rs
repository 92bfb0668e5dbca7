//! Cash desk provider.
//!
//! "Success" here authorizes the cashier to count out money; it does not
//! mean money changed hands. The refund stays INITIATED until the distinct
//! collection step reconciles the amount actually disbursed.

use super::{PaymentProvider, ProviderOutcome, ProviderRequest};
use async_trait::async_trait;
use serde_json::json;
use taxfree_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct CashDeskProvider;

impl CashDeskProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PaymentProvider for CashDeskProvider {
    fn name(&self) -> &'static str {
        "cash_desk"
    }

    async fn process_payment(&self, request: &ProviderRequest) -> Result<ProviderOutcome, AppError> {
        let authorization_id = Uuid::new_v4().to_string();
        tracing::info!(
            reference = %request.reference,
            amount = %request.amount,
            currency = %request.currency,
            authorization_id = %authorization_id,
            "Cash payout authorized for collection"
        );
        Ok(ProviderOutcome::succeeded(
            json!({
                "authorized_amount": request.amount.to_string(),
                "currency": request.currency,
                "authorization_id": authorization_id,
            }),
            Some(request.reference.clone()),
            Some(authorization_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn authorization_always_succeeds_and_echoes_the_amount() {
        let provider = CashDeskProvider::new();
        let outcome = provider
            .process_payment(&ProviderRequest {
                reference: "ref-1".to_string(),
                amount: dec!(11000),
                currency: "CDF".to_string(),
                details: json!({}),
            })
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.response["authorized_amount"], json!("11000"));
    }
}
