//! Shared HTTP plumbing for the delivery channels.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use rollcall_common::{Error, Result};

/// Build the HTTP client used by a channel.
pub(crate) fn client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("Rollcall/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Turn a non-success response into an error.
///
/// Server errors and rate limiting are `Network` so the retry executor
/// tries again; rejected credentials are `Config`; any other client error
/// is `Validation`.
pub(crate) async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body, what))
}

fn status_error(status: StatusCode, body: &str, what: &str) -> Error {
    let message = format!("{} failed: {} - {}", what, status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Network(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Error::Config(message)
    } else {
        Error::Validation(message)
    }
}
