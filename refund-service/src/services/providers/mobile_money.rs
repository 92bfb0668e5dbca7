//! Mobile money disbursement client.
//!
//! Implements the aggregator's Disbursements API for payout initiation and
//! HMAC signature verification for its status callbacks.

use super::{PaymentProvider, ProviderOutcome, ProviderRequest};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use taxfree_core::error::AppError;

#[derive(Debug, Deserialize, Clone)]
pub struct MobileMoneyConfig {
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default = "empty_secret")]
    pub key_secret: Secret<String>,
    #[serde(default = "empty_secret")]
    pub callback_secret: Secret<String>,
}

fn empty_secret() -> Secret<String> {
    Secret::new(String::new())
}

impl Default for MobileMoneyConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            key_id: String::new(),
            key_secret: empty_secret(),
            callback_secret: empty_secret(),
        }
    }
}

/// Client for the mobile money aggregator API.
#[derive(Clone)]
pub struct MobileMoneyClient {
    client: Client,
    config: MobileMoneyConfig,
}

/// Request to create a disbursement.
#[derive(Debug, Serialize)]
struct DisbursementRequest {
    /// Our refund reference, echoed back in callbacks.
    reference: String,
    /// Amount as a decimal string, e.g. "3.85".
    amount: String,
    currency: String,
    /// Subscriber number in international format.
    msisdn: String,
}

/// Response from disbursement creation.
#[derive(Debug, Deserialize)]
struct Disbursement {
    id: String,
    reference: String,
    status: String,
}

/// Aggregator API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    description: String,
}

impl MobileMoneyClient {
    pub fn new(config: MobileMoneyConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Whether credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }

    async fn disburse(&self, request: &ProviderRequest) -> Result<ProviderOutcome, AppError> {
        let msisdn = match request.details.get("phone_number").and_then(|v| v.as_str()) {
            Some(number) => number.to_string(),
            None => {
                return Ok(ProviderOutcome::failed(
                    "INVALID_DETAILS",
                    "payment details are missing 'phone_number'",
                    json!({}),
                ))
            }
        };

        let body = DisbursementRequest {
            reference: request.reference.clone(),
            amount: request.amount.to_string(),
            currency: request.currency.clone(),
            msisdn,
        };

        let url = format!("{}/disbursements", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::provider("NETWORK", e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::provider("NETWORK", e.to_string()))?;

        tracing::debug!(status = %status, body = %text, "Disbursement response");

        if status.is_success() {
            let disbursement: Disbursement = serde_json::from_str(&text)
                .map_err(|e| AppError::provider("MALFORMED_RESPONSE", e.to_string()))?;
            tracing::info!(
                disbursement_id = %disbursement.id,
                reference = %disbursement.reference,
                status = %disbursement.status,
                "Mobile money disbursement created"
            );
            Ok(ProviderOutcome::succeeded(
                serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text })),
                Some(disbursement.reference),
                Some(disbursement.id),
            ))
        } else {
            let error: ApiError = serde_json::from_str(&text).unwrap_or_else(|_| ApiError {
                code: "UNKNOWN".to_string(),
                description: text.clone(),
            });
            tracing::warn!(
                code = %error.code,
                description = %error.description,
                "Mobile money disbursement declined"
            );
            Ok(ProviderOutcome::failed(
                &error.code,
                &error.description,
                serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text })),
            ))
        }
    }

    /// Verify a status callback: `HMAC-SHA256(request_body, callback_secret)`.
    pub fn verify_callback_signature(&self, body: &str, signature: &str) -> bool {
        let expected = compute_signature(body, self.config.callback_secret.expose_secret());
        let is_valid = expected == signature;
        if !is_valid {
            tracing::warn!("Mobile money callback signature verification failed");
        }
        is_valid
    }
}

fn compute_signature(payload: &str, secret: &str) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl PaymentProvider for MobileMoneyClient {
    fn name(&self) -> &'static str {
        "mobile_money"
    }

    async fn process_payment(&self, request: &ProviderRequest) -> Result<ProviderOutcome, AppError> {
        if !self.is_configured() {
            return Err(AppError::Configuration(anyhow::anyhow!(
                "mobile money credentials not configured"
            )));
        }
        self.disburse(request).await
    }
}
