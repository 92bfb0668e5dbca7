//! Currency and exchange rate models.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A payout currency quoted against the base currency (CDF).
///
/// Exactly one currency carries `is_base_currency = true` and its rate is
/// always exactly 1. Rates are stored with 6 fractional digits as
/// "1 unit of base currency = `exchange_rate` units of this currency".
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Currency {
    pub code: String,
    pub name: String,
    pub symbol: String,
    pub exchange_rate: Decimal,
    pub is_base_currency: bool,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Currency {
    /// Base-currency amount -> this currency, rounded to 2 decimal places.
    pub fn convert_from_base(&self, amount: Decimal) -> Decimal {
        if self.is_base_currency {
            amount
        } else {
            (amount * self.exchange_rate)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        }
    }

    /// This currency -> base-currency amount, rounded to 2 decimal places.
    pub fn convert_to_base(&self, amount: Decimal) -> Decimal {
        if self.is_base_currency {
            amount
        } else {
            (amount / self.exchange_rate)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        }
    }
}

/// Append-only log of exchange rate transitions. Never edited or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExchangeRateHistory {
    pub history_id: Uuid,
    pub currency_code: String,
    pub old_rate: Decimal,
    pub new_rate: Decimal,
    pub changed_by: String,
    pub reason: String,
    pub created_utc: DateTime<Utc>,
}
