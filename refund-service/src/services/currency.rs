//! Currency administration and payout currency resolution.

use crate::models::{AuditEvent, Currency};
use crate::services::{audit, store::Store};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use taxfree_core::error::AppError;
use tracing::instrument;

#[derive(Clone)]
pub struct CurrencyService {
    store: Arc<dyn Store>,
}

impl CurrencyService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve the currency a new refund pays out in. `None` falls back to
    /// the base currency; a missing or disabled currency blocks the
    /// operation outright.
    pub async fn payout_currency(&self, code: Option<&str>) -> Result<Currency, AppError> {
        match code {
            None => self
                .store
                .base_currency()
                .await?
                .ok_or_else(|| AppError::Configuration(anyhow::anyhow!("no base currency configured"))),
            Some(code) => {
                let currency = self.store.currency(code).await?.ok_or_else(|| {
                    AppError::Configuration(anyhow::anyhow!("currency '{}' does not exist", code))
                })?;
                if !currency.is_active {
                    return Err(AppError::Configuration(anyhow::anyhow!(
                        "currency '{}' is disabled for new payouts",
                        code
                    )));
                }
                Ok(currency)
            }
        }
    }

    /// Register a new quoted currency. The base flag is only ever assigned
    /// through [`set_base_currency`](Self::set_base_currency).
    #[instrument(skip(self, currency), fields(code = %currency.code))]
    pub async fn register_currency(&self, currency: &Currency, actor: &str) -> Result<(), AppError> {
        if currency.is_base_currency {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "new currencies are registered quoted; promote to base separately"
            )));
        }
        if currency.exchange_rate <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "exchange rate must be positive, got {}",
                currency.exchange_rate
            )));
        }
        self.store.insert_currency(currency).await?;

        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "currency_registered",
                "currency",
                &currency.code,
                actor,
                json!({ "rate": currency.exchange_rate, "active": currency.is_active }),
            ),
        )
        .await;

        tracing::info!(code = %currency.code, rate = %currency.exchange_rate, "Currency registered");
        Ok(())
    }

    /// Promote a currency to base. The flag swap and the forced rate of
    /// exactly 1 happen in one transaction inside the store.
    #[instrument(skip(self), fields(code = %code, actor = %actor))]
    pub async fn set_base_currency(&self, code: &str, actor: &str) -> Result<Currency, AppError> {
        let existing = self.store.currency(code).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("currency '{}' does not exist", code))
        })?;
        if !existing.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "cannot promote disabled currency '{}' to base",
                code
            )));
        }

        let updated = self.store.set_base_currency(code, actor).await?;

        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "currency_base_changed",
                "currency",
                code,
                actor,
                json!({ "old_rate": existing.exchange_rate, "new_rate": updated.exchange_rate }),
            ),
        )
        .await;

        tracing::info!(code = %code, "Base currency changed");
        Ok(updated)
    }

    /// Change a quoted currency's exchange rate. The update and its history
    /// row are one atomic unit; an unrecorded rate change is a correctness
    /// bug.
    #[instrument(skip(self), fields(code = %code, actor = %actor))]
    pub async fn update_exchange_rate(
        &self,
        code: &str,
        new_rate: Decimal,
        actor: &str,
        reason: &str,
    ) -> Result<Currency, AppError> {
        if new_rate <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "exchange rate must be positive, got {}",
                new_rate
            )));
        }
        let existing = self.store.currency(code).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("currency '{}' does not exist", code))
        })?;
        if existing.is_base_currency {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "the base currency rate is fixed at 1"
            )));
        }

        let updated = self
            .store
            .update_exchange_rate(code, new_rate, actor, reason)
            .await?;

        audit::record(
            self.store.as_ref(),
            AuditEvent::new(
                "currency_rate_changed",
                "currency",
                code,
                actor,
                json!({
                    "old_rate": existing.exchange_rate,
                    "new_rate": new_rate,
                    "reason": reason,
                }),
            ),
        )
        .await;

        tracing::info!(
            code = %code,
            old_rate = %existing.exchange_rate,
            new_rate = %new_rate,
            "Exchange rate updated"
        );
        Ok(updated)
    }
}
