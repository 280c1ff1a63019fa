//! Email channel over the Resend API.

use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use url::Url;

use rollcall_common::{Error, Result};

use crate::http;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// Sender address used when none is configured.
pub const DEFAULT_FROM_EMAIL: &str = "noreply@yourevent.com";

/// Resend credentials and sender address.
#[derive(Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_key", &"[REDACTED]")
            .field("from", &self.from)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Sends transactional email.
pub struct EmailSender {
    http: Client,
    config: EmailConfig,
    endpoint: Url,
}

impl EmailSender {
    /// Create a sender.
    pub fn new(config: EmailConfig) -> Result<Self> {
        let endpoint = Url::parse(RESEND_ENDPOINT)
            .map_err(|e| Error::Config(format!("Invalid email endpoint: {}", e)))?;
        Ok(Self {
            http: http::client()?,
            config,
            endpoint,
        })
    }

    /// Send one HTML email to one recipient.
    pub async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let request = SendRequest {
            from: &self.config.from,
            to: [to],
            subject,
            html,
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.config.api_key),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to send email: {}", e)))?;

        let response = http::ensure_success(response, "Email send").await?;
        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse email response: {}", e)))?;

        debug!("Email accepted with id {}", body.id);
        Ok(())
    }
}
