//! Merchant and sale models.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Merchant approval state. Only approved merchants may originate forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantStatus {
    Pending,
    Approved,
    Suspended,
}

impl MerchantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Suspended => "suspended",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "suspended" => Self::Suspended,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Merchant {
    pub merchant_id: Uuid,
    pub name: String,
    pub status: String,
    pub created_utc: DateTime<Utc>,
}

impl Merchant {
    pub fn status(&self) -> MerchantStatus {
        MerchantStatus::from_str(&self.status)
    }

    pub fn can_create_forms(&self) -> bool {
        self.status() == MerchantStatus::Approved
    }
}

/// A recorded cross-border retail sale.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SaleInvoice {
    pub invoice_id: Uuid,
    pub merchant_id: Uuid,
    pub traveler_id: Uuid,
    pub invoice_number: String,
    pub total_amount: Decimal,
    pub is_cancelled: bool,
    pub issued_utc: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
}

/// A single invoice line. `line_total` and `vat_amount` are computed once at
/// sale entry from the item's own stored rate; the engine rewrites only the
/// eligibility flag and reason, never the price or VAT fields.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SaleItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub category: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Percentage, e.g. 16 for 16%.
    pub vat_rate: Decimal,
    pub line_total: Decimal,
    pub vat_amount: Decimal,
    pub is_eligible: bool,
    pub ineligibility_reason: Option<String>,
}

impl SaleItem {
    /// Line total and VAT for a quantity/price/rate triple, both rounded to
    /// 2 decimal places with standard (midpoint-away-from-zero) rounding.
    pub fn compute_amounts(
        quantity: Decimal,
        unit_price: Decimal,
        vat_rate: Decimal,
    ) -> (Decimal, Decimal) {
        let line_total = (quantity * unit_price)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let vat_amount = (line_total * vat_rate / Decimal::from(100))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        (line_total, vat_amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn line_amounts_follow_quantity_price_then_rate() {
        let (total, vat) = SaleItem::compute_amounts(dec!(3), dec!(25000), dec!(16));
        assert_eq!(total, dec!(75000.00));
        assert_eq!(vat, dec!(12000.00));
    }

    #[test]
    fn vat_rounding_is_standard_not_truncation() {
        // 10.01 * 16% = 1.6016 -> 1.60; 10.03 * 16% = 1.6048 -> 1.60;
        // 10.04 * 5% = 0.502 -> 0.50; 12.50 * 7% = 0.875 -> 0.88 (midpoint up).
        let (_, vat) = SaleItem::compute_amounts(dec!(1), dec!(12.50), dec!(7));
        assert_eq!(vat, dec!(0.88));
    }

    #[test]
    fn merchant_form_creation_requires_approval() {
        let mut merchant = Merchant {
            merchant_id: Uuid::new_v4(),
            name: "Kin Market".to_string(),
            status: "pending".to_string(),
            created_utc: Utc::now(),
        };
        assert!(!merchant.can_create_forms());
        merchant.status = "approved".to_string();
        assert!(merchant.can_create_forms());
        merchant.status = "suspended".to_string();
        assert!(!merchant.can_create_forms());
    }
}
