use std::time::Duration;

use reqwest::{Client, StatusCode};
use sluice_core::error::AppError;
use sluice_core::traits::Upstream;
use url::Url;

/// Upstream client using reqwest.
///
/// One GET per call, no retries. Failures are classified so the retry layer
/// can tell a flaky network from a request that will never succeed.
#[derive(Clone)]
pub struct ReqwestUpstream {
    client: Client,
    bearer_token: Option<String>,
    timeout_secs: u64,
}

impl ReqwestUpstream {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent(concat!("Sluice/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            bearer_token: None,
            timeout_secs,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

impl Upstream for ReqwestUpstream {
    async fn fetch(&self, url: &str) -> Result<serde_json::Value, AppError> {
        validate_url(url)?;

        let mut request = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_send_error(url, &e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, status = status.as_u16(), "Upstream returned error status");
            return Err(classify_status(url, status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::TransientUpstream {
                url: url.to_string(),
                status_code: Some(status.as_u16()),
                message: format!("Failed to read response body: {e}"),
            })?;

        serde_json::from_slice(&body)
            .map_err(|e| AppError::malformed_payload(url, format!("Invalid JSON body: {e}")))
    }
}

/// Map a failed round trip to a transient or permanent failure.
///
/// A request that cannot be built, or a redirect chain that cannot be
/// followed, fails the same way on every attempt.
fn classify_send_error(url: &str, e: &reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_builder() || e.is_redirect() {
        return AppError::PermanentUpstream {
            url: url.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
            message: format!("Malformed request: {e}"),
        };
    }

    let message = if e.is_timeout() {
        format!("Request timed out after {timeout_secs}s")
    } else if e.is_connect() {
        format!("Connection failed: {e}")
    } else {
        e.to_string()
    };
    AppError::TransientUpstream {
        url: url.to_string(),
        status_code: None,
        message,
    }
}

/// Map a non-success status to a transient or permanent failure.
///
/// Rate limiting, request timeouts and server errors are transient; every
/// other status is permanent.
pub fn classify_status(url: &str, status: StatusCode) -> AppError {
    let code = status.as_u16();
    let message = format!("HTTP {code}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AppError::TransientUpstream {
            url: url.to_string(),
            status_code: Some(code),
            message,
        }
    } else {
        AppError::PermanentUpstream {
            url: url.to_string(),
            status_code: Some(code),
            message,
        }
    }
}

/// Only absolute `http`/`https` URLs with a host are requested.
fn validate_url(url: &str) -> Result<(), AppError> {
    let invalid = |message: String| AppError::PermanentUpstream {
        url: url.to_string(),
        status_code: None,
        message,
    };

    let parsed = Url::parse(url).map_err(|e| invalid(format!("Invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(invalid(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(invalid("URL has no host".to_string()));
    }
    Ok(())
}
