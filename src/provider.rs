// =============================================================================
// PAYMENT PROVIDER HTTP CLIENT
// =============================================================================
// Raw calls to the PVit API:
// - renew-secret: form encoded, asks the provider to push a new secret key
// - rest: direct (RESTFUL) transaction
// - link: hosted payment link
//
// Transaction calls carry the current secret in `X-Secret` and ask for JSON
// webhooks with `X-Callback-MediaType`. Non-2xx responses become gateway
// errors carrying the provider's body as detail.
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};
use crate::secret::SecretRenewer;

/// Provider-documented maximum field lengths (characters)
pub const AGENT_MAX_LEN: usize = 15;
pub const PRODUCT_MAX_LEN: usize = 15;
pub const REFERENCE_MAX_LEN: usize = 15;
pub const CUSTOMER_ACCOUNT_MAX_LEN: usize = 20;
pub const FREE_INFO_MAX_LEN: usize = 15;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Cut `value` to at most `max` characters (not bytes).
pub fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

// -----------------------------------------------------------------------------
// WIRE TYPES
// -----------------------------------------------------------------------------

/// Body of a direct transaction
#[derive(Debug, Clone, Serialize)]
pub struct RestTransactionPayload {
    pub agent: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    pub reference: String,
    pub service: &'static str,
    pub callback_url_code: String,
    pub customer_account_number: String,
    pub merchant_operation_account_code: String,
    pub transaction_type: &'static str,
    pub owner_charge: String,
    pub owner_charge_operator: String,
    pub free_info: String,
}

/// Body of a payment link request
#[derive(Debug, Clone, Serialize)]
pub struct PaymentLinkPayload {
    pub agent: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub product: String,
    pub reference: String,
    pub service: String,
    pub callback_url_code: String,
    pub customer_account_number: String,
    pub merchant_operation_account_code: String,
    pub transaction_type: &'static str,
    pub owner_charge: String,
    pub operator_owner_charge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_info: Option<String>,
    pub failed_redirection_url_code: String,
    pub success_redirection_url_code: String,
}

/// The parts of a provider answer we use. Everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderResponse {
    /// String or number depending on the endpoint
    #[serde(default)]
    pub transaction_id: Option<Value>,
    #[serde(default)]
    pub payment_link: Option<String>,
}

impl ProviderResponse {
    pub fn transaction_id(&self) -> Option<String> {
        match &self.transaction_id {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }
    }
}

// -----------------------------------------------------------------------------
// CLIENT
// -----------------------------------------------------------------------------
pub struct ProviderClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    #[tracing::instrument(skip(self, secret, payload), fields(reference = %payload.reference))]
    pub async fn send_rest(
        &self,
        secret: &str,
        payload: &RestTransactionPayload,
    ) -> AppResult<ProviderResponse> {
        self.post_json(&self.config.rest_path, secret, payload).await
    }

    #[tracing::instrument(skip(self, secret, payload), fields(reference = %payload.reference))]
    pub async fn send_link(
        &self,
        secret: &str,
        payload: &PaymentLinkPayload,
    ) -> AppResult<ProviderResponse> {
        self.post_json(&self.config.link_path, secret, payload).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    async fn post_json<P: Serialize + Sync>(
        &self,
        path: &str,
        secret: &str,
        payload: &P,
    ) -> AppResult<ProviderResponse> {
        let response = self
            .http
            .post(self.url(path))
            .header("X-Secret", secret)
            .header("X-Callback-MediaType", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), body = %body, "Provider rejected the request");
            return Err(rejection(status.as_u16(), body));
        }

        if body.trim().is_empty() {
            return Ok(ProviderResponse::default());
        }

        serde_json::from_str(&body).map_err(|err| AppError::Gateway {
            message: format!("Unreadable provider response: {}", err),
            detail: Some(Value::String(body)),
            reference: None,
        })
    }
}

/// Provider body as detail: JSON when it parses, raw text otherwise
fn rejection(status: u16, body: String) -> AppError {
    let detail = match serde_json::from_str::<Value>(&body) {
        Ok(json) => Some(json),
        Err(_) if body.trim().is_empty() => None,
        Err(_) => Some(Value::String(body)),
    };

    AppError::Gateway {
        message: format!("Payment provider responded with status {}", status),
        detail,
        reference: None,
    }
}

#[async_trait]
impl SecretRenewer for ProviderClient {
    async fn request_secret_renewal(&self) -> AppResult<()> {
        let form = [
            ("operationAccountCode", self.config.account_id.as_str()),
            ("receptionUrlCode", self.config.secret_callback_code.as_str()),
            ("password", self.config.password.as_str()),
        ];

        let response = self
            .http
            .post(self.url(&self.config.renew_path))
            .form(&form[..])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(rejection(status.as_u16(), body));
        }

        Ok(())
    }
}
