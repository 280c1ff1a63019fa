//! SMS channel over the Africa's Talking messaging API.

use reqwest::{header, Client};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};
use url::Url;

use rollcall_common::{Error, Result};

use crate::http;

const LIVE_ENDPOINT: &str = "https://api.africastalking.com/version1/messaging";
const SANDBOX_ENDPOINT: &str = "https://api.sandbox.africastalking.com/version1/messaging";

/// Africa's Talking credentials.
#[derive(Clone)]
pub struct SmsConfig {
    pub username: String,
    pub api_key: String,
}

impl SmsConfig {
    /// Messaging endpoint for this account. The `sandbox` username
    /// targets the sandbox environment.
    pub fn endpoint(&self) -> Result<Url> {
        let endpoint = if self.username == "sandbox" {
            SANDBOX_ENDPOINT
        } else {
            LIVE_ENDPOINT
        };
        Url::parse(endpoint).map_err(|e| Error::Config(format!("Invalid SMS endpoint: {}", e)))
    }
}

impl fmt::Debug for SmsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmsConfig")
            .field("username", &self.username)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(rename = "SMSMessageData")]
    data: MessageData,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Recipients", default)]
    recipients: Vec<Recipient>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    number: String,
    status: String,
}

/// Sends text messages.
pub struct SmsSender {
    http: Client,
    config: SmsConfig,
    endpoint: Url,
}

impl SmsSender {
    /// Create a sender for an account.
    pub fn new(config: SmsConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        Ok(Self {
            http: http::client()?,
            config,
            endpoint,
        })
    }

    /// Send one message to one number.
    pub async fn send(&self, to: &str, message: &str) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .header("apiKey", &self.config.api_key)
            .header(header::ACCEPT, "application/json")
            .form(&[
                ("username", self.config.username.as_str()),
                ("to", to),
                ("message", message),
            ])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to send SMS: {}", e)))?;

        let response = http::ensure_success(response, "SMS send").await?;
        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse SMS response: {}", e)))?;

        debug!("SMS gateway: {}", body.data.message);
        for recipient in body.data.recipients {
            if recipient.status != "Success" {
                warn!(
                    "SMS to {} not accepted: {}",
                    recipient.number, recipient.status
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(username: &str) -> SmsConfig {
        SmsConfig {
            username: username.to_string(),
            api_key: "at-secret".to_string(),
        }
    }

    #[test]
    fn test_sandbox_endpoint() {
        assert_eq!(
            config("sandbox").endpoint().unwrap().host_str(),
            Some("api.sandbox.africastalking.com")
        );
        assert_eq!(
            config("rollcall").endpoint().unwrap().host_str(),
            Some("api.africastalking.com")
        );
    }

    #[test]
    fn test_debug_hides_api_key() {
        assert!(!format!("{:?}", config("rollcall")).contains("at-secret"));
    }

    #[test]
    fn test_parse_gateway_response() {
        let json = r#"{"SMSMessageData":{"Message":"Sent to 1/1 Total Cost: KES 0.8000",
            "Recipients":[{"statusCode":101,"number":"+254711000000","status":"Success",
            "cost":"KES 0.8000","messageId":"ATPid_1"}]}}"#;
        let parsed: SendResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.recipients.len(), 1);
        assert_eq!(parsed.data.recipients[0].status, "Success");
    }
}
