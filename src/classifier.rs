//! Response classifier: `(status, body) -> Verdict`.
//!
//! The endpoint wraps authentication failures, business-rule failures and
//! successes alike in a 200 envelope, so the status alone decides very
//! little. Every field of the body is treated as optional.
//!
//! # Decision order
//!
//! First match wins:
//!
//! 1. an error entry typed `UnauthorizedError` (any status)
//! 2. status 401
//! 3. status 2xx: no error list, empty error list, keyword scan of the error
//!    entries, success payload under `data`
//! 4. status >= 400
//! 5. anything else is undetermined

use crate::prober::ProbeResult;
use serde_json::Value;

/// Error entry `type` that marks an authentication failure.
pub const UNAUTHORIZED_ERROR_TYPE: &str = "UnauthorizedError";

/// Message fragments that mark the code itself as unusable.
const REJECTION_KEYWORDS: &[&str] = &[
    "not applicable",
    "not valid",
    "expired",
    "invalid",
    "cannot be used",
    "does not exist",
    "unavailable",
    "not found",
];

/// Message fragments that blame the cart rather than the code.
const ENVIRONMENTAL_KEYWORDS: &[&str] = &["minimum", "cart"];

/// Keys under `data` that indicate the code was applied.
const SUCCESS_DATA_KEYS: &[&str] = &["voucher", "discount", "voucherId"];

/// Taxonomy bucket a verdict belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictBucket {
    /// The code is usable.
    Accepted,
    /// The credential was refused; the verdict says nothing about the code.
    Authentication,
    /// The endpoint rejected the code for a business reason.
    BusinessRule,
    /// Non-success HTTP status without a more specific signal.
    HttpError,
    /// The request never completed.
    Transport,
    /// The response shape matched no rule.
    Undetermined,
}

/// Binary accept/reject decision with an advisory reason.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Verdict {
    /// Whether the code is considered valid.
    pub is_valid: bool,
    /// Short human-readable reason.
    pub reason: String,
    /// Bucket the reason maps to.
    pub bucket: VerdictBucket,
}

impl Verdict {
    /// An accepting verdict.
    pub fn accepted(reason: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            reason: reason.into(),
            bucket: VerdictBucket::Accepted,
        }
    }

    /// A rejecting verdict in `bucket`.
    pub fn rejected(bucket: VerdictBucket, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            reason: reason.into(),
            bucket,
        }
    }

    /// Whether this verdict stems from an authentication failure.
    pub fn is_auth_error(&self) -> bool {
        self.bucket == VerdictBucket::Authentication
    }
}

/// Classify a raw probe outcome, turning transport failures into
/// connection-error verdicts.
pub fn classify_probe(result: &ProbeResult) -> Verdict {
    if result.status.is_none()
        && let Some(err) = &result.transport_error
    {
        return Verdict::rejected(VerdictBucket::Transport, format!("connection error: {err}"));
    }
    classify(result.status, result.body.as_ref())
}

/// Classify an HTTP status and optional JSON body. Pure and total.
pub fn classify(status: Option<u16>, body: Option<&Value>) -> Verdict {
    if let Some(body) = body
        && has_unauthorized_marker(body)
    {
        return Verdict::rejected(
            VerdictBucket::Authentication,
            "authentication error: credential expired or invalid",
        );
    }

    if status == Some(401) {
        return Verdict::rejected(VerdictBucket::Authentication, "authentication failed");
    }

    let Some(body) = body else {
        return match status {
            Some(code) if code >= 400 => http_error(code),
            Some(_) => Verdict::rejected(VerdictBucket::Undetermined, "no response data"),
            None => undetermined(),
        };
    };

    match status {
        Some(code) if (200..300).contains(&code) => classify_success(body),
        Some(code) if code >= 400 => http_error(code),
        _ => undetermined(),
    }
}

fn classify_success(body: &Value) -> Verdict {
    let Some(errors) = error_entries(body) else {
        return Verdict::accepted("success, no error reported");
    };
    if errors.is_empty() {
        return Verdict::accepted("success, empty error list");
    }

    let mut environmental: Option<String> = None;
    for entry in errors {
        let message = entry
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        if REJECTION_KEYWORDS.iter().any(|kw| message.contains(kw)) {
            return Verdict::rejected(VerdictBucket::BusinessRule, message);
        }
        if environmental.is_none() && ENVIRONMENTAL_KEYWORDS.iter().any(|kw| message.contains(kw))
        {
            environmental = Some(message);
        }
    }

    if let Some(message) = environmental {
        return Verdict::accepted(format!("valid, but {message}"));
    }

    if has_success_data(body) {
        return Verdict::accepted("applied");
    }

    undetermined()
}

/// Whether `body` carries an error entry typed [`UNAUTHORIZED_ERROR_TYPE`].
pub fn has_unauthorized_marker(body: &Value) -> bool {
    error_entries(body).is_some_and(|errors| {
        errors.iter().any(|entry| {
            entry.get("type").and_then(Value::as_str) == Some(UNAUTHORIZED_ERROR_TYPE)
        })
    })
}

/// The error list, or `None` when the body has no `errorMessage` field.
///
/// A present but malformed `errorMessage` counts as an empty list.
fn error_entries(body: &Value) -> Option<&[Value]> {
    let envelope = body.get("errorMessage")?;
    Some(
        envelope
            .get("errors")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
    )
}

fn has_success_data(body: &Value) -> bool {
    body.get("data")
        .and_then(Value::as_object)
        .is_some_and(|data| SUCCESS_DATA_KEYS.iter().any(|key| data.contains_key(*key)))
}

fn http_error(status: u16) -> Verdict {
    Verdict::rejected(VerdictBucket::HttpError, format!("http error {status}"))
}

fn undetermined() -> Verdict {
    Verdict::rejected(VerdictBucket::Undetermined, "undetermined")
}
