//! Code prober: one apply round-trip per code plus its reset.
//!
//! [`CodeProber`] is the seam between the batch/scheduler core and the
//! network. [`HttpProber`] is the production implementation; tests plug in
//! scripted probers.

use crate::config::EndpointConfig;
use crate::credential::Credential;
use crate::error::{GuardError, Result};
use crate::http;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Raw outcome of one apply request. Ephemeral, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// The probed code.
    pub code: String,
    /// HTTP status, absent when the request never completed.
    pub status: Option<u16>,
    /// Parsed JSON body, absent when missing or not JSON.
    pub body: Option<serde_json::Value>,
    /// Transport failure description, if the request failed.
    pub transport_error: Option<String>,
}

impl ProbeResult {
    /// A completed HTTP exchange.
    pub fn response(
        code: impl Into<String>,
        status: u16,
        body: Option<serde_json::Value>,
    ) -> Self {
        Self {
            code: code.into(),
            status: Some(status),
            body,
            transport_error: None,
        }
    }

    /// A request that failed before a status was received.
    pub fn transport_failure(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status: None,
            body: None,
            transport_error: Some(error.into()),
        }
    }
}

/// Remote apply/reset contract. Implementations must be cheap to share.
#[async_trait]
pub trait CodeProber: Send + Sync {
    /// Apply `code` to the remote cart and return the raw outcome.
    ///
    /// Never fails: transport problems are reported inside the result.
    async fn apply(&self, code: &str, credential: &Credential) -> ProbeResult;

    /// Undo a previous apply for `code`. Assumed idempotent.
    async fn reset(&self, code: &str, credential: &Credential) -> Result<()>;

    /// Apply used by credential validation. Defaults to [`apply`](Self::apply).
    async fn validation_probe(&self, code: &str, credential: &Credential) -> ProbeResult {
        self.apply(code, credential).await
    }
}

/// [`CodeProber`] backed by the remote HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    endpoint: EndpointConfig,
}

impl HttpProber {
    /// Build a prober for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: EndpointConfig) -> Result<Self> {
        let client = http::build_client(&endpoint)?;
        Ok(Self { client, endpoint })
    }

    async fn post_apply(
        &self,
        code: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> ProbeResult {
        let cookie = match http::cookie_header(credential) {
            Ok(cookie) => cookie,
            Err(e) => return ProbeResult::transport_failure(code, e.to_string()),
        };

        debug!(code, "applying code");
        let response = self
            .client
            .post(self.endpoint.apply_url())
            .header(reqwest::header::COOKIE, cookie)
            .json(&http::voucher_body(code, &self.endpoint.client_type))
            .timeout(timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(code, "apply request failed: {e}");
                return ProbeResult::transport_failure(code, e.to_string());
            }
        };

        let status = response.status().as_u16();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                debug!(code, status, "failed reading apply body: {e}");
                return ProbeResult::response(code, status, None);
            }
        };

        let body = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(body) => Some(body),
            Err(e) => {
                debug!(code, status, "apply body is not JSON: {e}");
                None
            }
        };
        debug!(code, status, "apply response received");
        ProbeResult::response(code, status, body)
    }
}

#[async_trait]
impl CodeProber for HttpProber {
    async fn apply(&self, code: &str, credential: &Credential) -> ProbeResult {
        let timeout = Duration::from_secs(self.endpoint.probe_timeout_secs);
        self.post_apply(code, credential, timeout).await
    }

    async fn reset(&self, code: &str, credential: &Credential) -> Result<()> {
        let cookie = http::cookie_header(credential)?;
        let response = self
            .client
            .post(self.endpoint.reset_url())
            .header(reqwest::header::COOKIE, cookie)
            .json(&http::voucher_body(code, &self.endpoint.client_type))
            .timeout(Duration::from_secs(self.endpoint.reset_timeout_secs))
            .send()
            .await
            .map_err(|e| GuardError::Transport(format!("reset of {code} failed: {e}")))?;

        debug!(code, status = response.status().as_u16(), "reset sent");
        Ok(())
    }

    async fn validation_probe(&self, code: &str, credential: &Credential) -> ProbeResult {
        let timeout = Duration::from_secs(self.endpoint.validate_timeout_secs);
        self.post_apply(code, credential, timeout).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn response_constructor_sets_status() {
        let result = ProbeResult::response("SVH001", 200, None);
        assert_eq!(result.status, Some(200));
        assert!(result.transport_error.is_none());
    }

    #[test]
    fn transport_failure_has_no_status() {
        let result = ProbeResult::transport_failure("SVH001", "timed out");
        assert_eq!(result.status, None);
        assert_eq!(result.body, None);
        assert_eq!(result.transport_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn http_prober_builds_with_defaults() {
        assert!(HttpProber::new(EndpointConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_failure() {
        let endpoint = EndpointConfig {
            base_url: "http://127.0.0.1:1".to_owned(),
            probe_timeout_secs: 2,
            ..Default::default()
        };
        let prober = HttpProber::new(endpoint).unwrap();
        let result = prober.apply("SVH001", &Credential::new("sid=1")).await;
        assert!(result.status.is_none());
        assert!(result.transport_error.is_some());
    }
}
