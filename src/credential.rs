//! Credential handling: the opaque cookie blob and its validation probe.
//!
//! The blob is bearer material. It is never parsed beyond the input adapter
//! in [`parse_credential_input`] and never logged.

use crate::classifier::has_unauthorized_marker;
use crate::config::CredentialConfig;
use crate::prober::CodeProber;
use tracing::{debug, info};

/// Opaque credential blob attached to every outbound probe.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw credential string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw credential, for placing on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    /// Whether the credential is blank.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(<{} chars>)", self.len())
    }
}

/// Normalise pasted credential input into a `name=value; ...` cookie string.
///
/// Accepts a raw `Cookie` header, a JSON array of `{"name", "value"}`
/// objects (browser extension exports) or a flat JSON object. Anything that
/// is not JSON is trimmed and passed through untouched.
pub fn parse_credential_input(raw: &str) -> Credential {
    let trimmed = raw.trim();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
        return Credential::new(trimmed);
    };

    let pairs: Vec<String> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?;
                let value = item.get("value")?;
                Some(format!("{name}={}", scalar_text(value)))
            })
            .collect(),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(name, value)| format!("{name}={}", scalar_text(value)))
            .collect(),
        _ => return Credential::new(trimmed),
    };
    Credential::new(pairs.join("; "))
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outcome of a credential validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    /// Whether the endpoint accepted the credential.
    pub ok: bool,
    /// Human-readable explanation.
    pub message: String,
}

impl CredentialCheck {
    fn accepted(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }

    /// Whether the check failed before any network call.
    pub fn is_too_short(&self) -> bool {
        !self.ok && self.message.starts_with(TOO_SHORT_PREFIX)
    }
}

const TOO_SHORT_PREFIX: &str = "credential too short";

/// Confirms a credential passes the endpoint's authentication gate.
///
/// Issues one apply probe with a sentinel code that is not expected to
/// exist. Reaching business-rule validation at all proves authentication
/// passed, so 2xx and the configured business-error statuses count as valid.
#[derive(Debug, Clone)]
pub struct CredentialValidator {
    config: CredentialConfig,
}

impl CredentialValidator {
    /// Create a validator from configuration.
    pub fn new(config: CredentialConfig) -> Self {
        Self { config }
    }

    /// Validate `credential` against the endpoint behind `prober`.
    ///
    /// Makes at most one network call and no session changes. The sentinel
    /// probe is not followed by a reset.
    pub async fn validate(
        &self,
        prober: &dyn CodeProber,
        credential: &Credential,
    ) -> CredentialCheck {
        if credential.is_empty() || credential.len() < self.config.min_length {
            return CredentialCheck::rejected(format!(
                "{TOO_SHORT_PREFIX} ({} chars, need at least {})",
                credential.len(),
                self.config.min_length
            ));
        }

        let result = prober
            .validation_probe(&self.config.sentinel_code, credential)
            .await;

        if let Some(err) = result.transport_error {
            debug!("credential validation probe failed: {err}");
            return CredentialCheck::rejected(format!("connection error: {err}"));
        }

        let Some(status) = result.status else {
            return CredentialCheck::rejected("connection error: no response status");
        };

        if status == 401 || status == 403 {
            return CredentialCheck::rejected(format!(
                "authentication failed ({status}): access denied"
            ));
        }

        let reached_business_logic = (200..300).contains(&status)
            || self.config.accepted_error_statuses.contains(&status);
        if !reached_business_logic {
            return CredentialCheck::rejected(format!("unexpected status code: {status}"));
        }

        match result.body {
            Some(body) if has_unauthorized_marker(&body) => {
                CredentialCheck::rejected("unauthorized: login required or session expired")
            }
            Some(_) => {
                info!(status, "credential validated");
                CredentialCheck::accepted("credential validated")
            }
            None => {
                info!(status, "credential accepted without JSON body");
                CredentialCheck::accepted("credential working (non-JSON response)")
            }
        }
    }
}
