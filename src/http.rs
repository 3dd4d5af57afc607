//! Shared HTTP client for talking to the remote cart endpoint.
//!
//! Builds a [`reqwest::Client`] that looks like the mobile web shop: the
//! endpoint rejects requests that do not carry the browser hints below.

use crate::config::EndpointConfig;
use crate::credential::Credential;
use crate::error::GuardError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// Static browser hints sent with every request.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "application/json"),
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"142\", \"Google Chrome\";v=\"142\", \"Not_A Brand\";v=\"99\"",
    ),
    ("sec-ch-ua-mobile", "?1"),
    ("sec-ch-ua-platform", "\"Android\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
];

/// Build a [`reqwest::Client`] configured for the remote endpoint.
///
/// The client carries the browser hints, origin/referer derived from
/// `base_url`, the tenant header and the configured User-Agent. Timeouts are
/// applied per request since apply, reset and validation differ.
///
/// # Errors
///
/// Returns [`GuardError::Config`] if a configured header value is not valid
/// header text, or [`GuardError::Transport`] if the client cannot be built.
pub fn build_client(endpoint: &EndpointConfig) -> Result<reqwest::Client, GuardError> {
    reqwest::Client::builder()
        .default_headers(default_headers(endpoint)?)
        .user_agent(endpoint.user_agent.clone())
        .gzip(true)
        .brotli(true)
        .build()
        .map_err(|e| GuardError::Transport(format!("failed to build HTTP client: {e}")))
}

/// Headers shared by every request to `endpoint`.
pub fn default_headers(endpoint: &EndpointConfig) -> Result<HeaderMap, GuardError> {
    let mut headers = HeaderMap::new();
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }

    let origin = endpoint.base_url.trim_end_matches('/');
    insert_dynamic(&mut headers, "origin", origin)?;
    insert_dynamic(&mut headers, "referer", &format!("{origin}/cart"))?;
    insert_dynamic(&mut headers, "x-tenant-id", &endpoint.tenant_id)?;
    Ok(headers)
}

fn insert_dynamic(
    headers: &mut HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), GuardError> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| GuardError::Config(format!("invalid value for header {name}: {e}")))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// The `cookie` header value for `credential`, marked sensitive so it is
/// never printed by reqwest's debug output.
pub fn cookie_header(credential: &Credential) -> Result<HeaderValue, GuardError> {
    let mut value = HeaderValue::from_str(credential.expose())
        .map_err(|e| GuardError::Input(format!("credential is not valid header text: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

/// JSON body shared by the apply and reset operations.
pub fn voucher_body(code: &str, client_type: &str) -> serde_json::Value {
    serde_json::json!({
        "voucherId": code,
        "device": {
            "client_type": client_type
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_headers_derive_origin_and_referer() {
        let endpoint = EndpointConfig {
            base_url: "https://shop.example/".to_owned(),
            ..Default::default()
        };
        let headers = default_headers(&endpoint).unwrap();
        assert_eq!(headers["origin"], "https://shop.example");
        assert_eq!(headers["referer"], "https://shop.example/cart");
        assert_eq!(headers["x-tenant-id"], "SHEIN");
        assert_eq!(headers["accept"], "application/json");
    }

    #[test]
    fn build_client_with_default_config() {
        assert!(build_client(&EndpointConfig::default()).is_ok());
    }

    #[test]
    fn invalid_tenant_rejected() {
        let endpoint = EndpointConfig {
            tenant_id: "bad\nvalue".to_owned(),
            ..Default::default()
        };
        let err = default_headers(&endpoint).unwrap_err();
        assert!(err.to_string().contains("x-tenant-id"));
    }

    #[test]
    fn cookie_header_is_sensitive() {
        let credential = Credential::new("session=abc; cart=1");
        let value = cookie_header(&credential).unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value, "session=abc; cart=1");
    }

    #[test]
    fn voucher_body_shape() {
        let body = voucher_body("SVH001", "mobile_web");
        assert_eq!(body["voucherId"], "SVH001");
        assert_eq!(body["device"]["client_type"], "mobile_web");
    }
}
