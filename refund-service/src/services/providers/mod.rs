//! Payment provider contracts and payload sanitization.

mod cash;
mod mobile_money;

pub use cash::CashDeskProvider;
pub use mobile_money::{MobileMoneyClient, MobileMoneyConfig};

use crate::models::RefundMethod;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use taxfree_core::error::AppError;

/// What the settlement state machine hands a provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Stable reference for the refund, passed through to the provider.
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub details: Value,
}

/// Opaque provider verdict. The engine assumes nothing about a provider's
/// error taxonomy beyond the success flag and the code/message strings.
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub success: bool,
    pub provider_request_id: Option<String>,
    pub provider_response_id: Option<String>,
    pub response: Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ProviderOutcome {
    pub fn succeeded(response: Value, request_id: Option<String>, response_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_request_id: request_id,
            provider_response_id: response_id,
            response,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(code: &str, message: &str, response: Value) -> Self {
        Self {
            success: false,
            provider_request_id: None,
            provider_response_id: None,
            response,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// A declined payment is a successful call with `success = false`; an
    /// `Err` means the call itself could not complete. The settlement layer
    /// treats both as a failed attempt.
    async fn process_payment(&self, request: &ProviderRequest) -> Result<ProviderOutcome, AppError>;
}

/// Providers keyed by refund method. A method without a registered provider
/// is a configuration error, surfaced before any state changes.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<RefundMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: RefundMethod, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(method, provider);
    }

    pub fn get(&self, method: RefundMethod) -> Result<Arc<dyn PaymentProvider>, AppError> {
        self.providers.get(&method).cloned().ok_or_else(|| {
            AppError::Configuration(anyhow::anyhow!(
                "no payment provider registered for method '{}'",
                method.as_str()
            ))
        })
    }
}

const SENSITIVE_KEYS: &[&str] = &[
    "phone_number",
    "msisdn",
    "account_number",
    "iban",
    "card_number",
];

/// Mask sensitive payout details down to their last 4 characters, for
/// storage on payment attempts. Applied recursively to nested objects.
pub fn sanitize_details(details: &Value) -> Value {
    match details {
        Value::Object(map) => {
            let mut sanitized = Map::new();
            for (key, value) in map {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    sanitized.insert(key.clone(), json!(mask(value)));
                } else {
                    sanitized.insert(key.clone(), sanitize_details(value));
                }
            }
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_details).collect()),
        other => other.clone(),
    }
}

fn mask(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if raw.len() <= 4 {
        "*".repeat(raw.len())
    } else {
        format!("{}{}", "*".repeat(raw.len() - 4), &raw[raw.len() - 4..])
    }
}
