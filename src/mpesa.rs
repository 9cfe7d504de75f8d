use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

/// Daraja (M-Pesa) credentials and endpoints, read from the environment.
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    pub timeout_secs: u64,
}

impl MpesaConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("MPESA_BASE_URL")
            .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string());
        let consumer_key = std::env::var("MPESA_CONSUMER_KEY")?;
        let consumer_secret = std::env::var("MPESA_CONSUMER_SECRET")?;
        let shortcode = std::env::var("MPESA_SHORTCODE")?;
        let passkey = std::env::var("MPESA_PASSKEY")?;
        let callback_url = std::env::var("MPESA_CALLBACK_URL")?;
        let timeout_secs = std::env::var("MPESA_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(30);
        Ok(Self {
            base_url,
            consumer_key,
            consumer_secret,
            shortcode,
            passkey,
            callback_url,
            timeout_secs,
        })
    }
}

/// Thin client for the OAuth token and STK push endpoints. Request/response
/// only; the order row carries all durable payment state.
#[derive(Clone)]
pub struct MpesaClient {
    config: MpesaConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct StkPushRequest<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: &'static str,
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: &'a str,
    #[serde(rename = "PartyB")]
    party_b: &'a str,
    #[serde(rename = "PhoneNumber")]
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    #[serde(rename = "AccountReference")]
    account_reference: &'a str,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "ResponseCode")]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    response_description: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// Acknowledgment of an accepted push request. Settlement is reported later
/// through the asynchronous callback.
#[derive(Debug, Clone)]
pub struct StkPushAck {
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub customer_message: Option<String>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }

    /// Fetch a bearer token with Basic auth over consumer key/secret.
    pub async fn access_token(&self) -> AppResult<String> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(|e| AppError::GatewayUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "access token request failed");
            return Err(AppError::GatewayUnavailable(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: AccessTokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::GatewayUnavailable(e.to_string()))?;

        Ok(token.access_token)
    }

    /// Send an STK push for `amount` to `phone`, tagged with the order
    /// reference the callback will echo back.
    pub async fn stk_push(
        &self,
        token: &str,
        amount: u64,
        phone: &str,
        reference: &str,
        description: &str,
    ) -> AppResult<StkPushAck> {
        let timestamp = format_timestamp(Utc::now());
        // The password is timestamp-bound, so it must be derived per request.
        let password = stk_password(&self.config.shortcode, &self.config.passkey, &timestamp);

        let body = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount,
            party_a: phone,
            party_b: &self.config.shortcode,
            phone_number: phone,
            callback_url: &self.config.callback_url,
            account_reference: reference,
            transaction_desc: description,
        };

        let url = format!("{}/stkpush/v1/processrequest", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::GatewayUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let parsed: Option<StkPushResponse> = response.json().await.ok();
            let message = parsed
                .and_then(|r| r.error_message)
                .unwrap_or_else(|| format!("push endpoint returned {status}"));
            return Err(AppError::GatewayRejected(message));
        }

        let parsed: StkPushResponse = response
            .json()
            .await
            .map_err(|e| AppError::GatewayUnavailable(e.to_string()))?;

        match parsed.response_code.as_deref() {
            Some("0") => Ok(StkPushAck {
                checkout_request_id: parsed.checkout_request_id,
                merchant_request_id: parsed.merchant_request_id,
                customer_message: parsed.customer_message,
            }),
            _ => {
                let message = parsed
                    .error_message
                    .or(parsed.response_description)
                    .unwrap_or_else(|| "push request not accepted".to_string());
                Err(AppError::GatewayRejected(message))
            }
        }
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// Daraja STK password: base64(shortcode || passkey || timestamp).
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{shortcode}{passkey}{timestamp}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn stk_password_matches_known_vector() {
        let password = stk_password(
            "174379",
            "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919",
            "20240806143000",
        );
        assert_eq!(
            password,
            "MTc0Mzc5YmZiMjc5ZjlhYTliZGJjZjE1OGU5N2RkNzFhNDY3Y2QyZTBjODkzMDU5YjEwZjc4ZTZiNzJhZGExZWQyYzkxOTIwMjQwODA2MTQzMDAw"
        );
    }

    #[test]
    fn timestamp_is_compact_utc() {
        let at = Utc.with_ymd_and_hms(2024, 8, 6, 14, 30, 0).unwrap();
        assert_eq!(format_timestamp(at), "20240806143000");
    }
}
