//! Traveler identity model.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Traveler identity as used for eligibility decisions.
///
/// The passport number is never stored in cleartext: only the last 4
/// characters plus a SHA-256 digest of the full value are kept, enough to
/// verify a presented passport without retaining it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Traveler {
    pub traveler_id: Uuid,
    pub full_name: String,
    pub date_of_birth: NaiveDate,
    /// ISO 3166-1 alpha-2 code.
    pub nationality: String,
    pub residence_country: String,
    pub passport_country: String,
    pub passport_last4: String,
    pub passport_hash: String,
    pub created_utc: DateTime<Utc>,
}

impl Traveler {
    /// Calendar-aware age: the birthday itself counts, the day before the
    /// birthday does not. Not a naive day count divided by 365.
    pub fn age_on(&self, date: NaiveDate) -> i32 {
        let mut age = date.year() - self.date_of_birth.year();
        if (date.month(), date.day()) < (self.date_of_birth.month(), self.date_of_birth.day()) {
            age -= 1;
        }
        age
    }

    /// Split a raw passport number into its stored representation.
    pub fn digest_passport_number(number: &str) -> (String, String) {
        let digest = hex::encode(Sha256::digest(number.as_bytes()));
        let last4 = if number.len() > 4 {
            number[number.len() - 4..].to_string()
        } else {
            number.to_string()
        };
        (digest, last4)
    }

    /// Verify a presented passport number against the stored digest.
    pub fn passport_matches(&self, number: &str) -> bool {
        hex::encode(Sha256::digest(number.as_bytes())) == self.passport_hash
    }
}
