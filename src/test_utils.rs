//! Shared test utilities used across the batch, scheduler and service tests.

use crate::credential::Credential;
use crate::error::{GuardError, Result};
use crate::prober::{CodeProber, ProbeResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory [`CodeProber`] with per-code canned responses.
///
/// Codes without a script get a bare `200 {}` response. Every apply and
/// reset call is recorded in order.
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, Script>>,
    applied: Mutex<Vec<String>>,
    resets: Mutex<Vec<String>>,
    fail_resets: bool,
}

#[derive(Clone)]
enum Script {
    Respond(u16, Option<Value>),
    Fail(String),
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to `code` with `status` and `body`.
    pub fn respond(self, code: &str, status: u16, body: Option<Value>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code.to_owned(), Script::Respond(status, body));
        self
    }

    /// Answer `code` with a rejection-keyword error entry.
    pub fn reject(self, code: &str, message: &str) -> Self {
        self.respond(code, 200, Some(error_body("VoucherError", message)))
    }

    /// Answer `code` with an authorization-error envelope.
    pub fn unauthorized(self, code: &str) -> Self {
        self.respond(code, 200, Some(error_body("UnauthorizedError", "login")))
    }

    /// Fail `code` at the transport level.
    pub fn fail(self, code: &str, error: &str) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code.to_owned(), Script::Fail(error.to_owned()));
        self
    }

    /// Make every reset call fail.
    pub fn failing_resets(mut self) -> Self {
        self.fail_resets = true;
        self
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn resets(&self) -> Vec<String> {
        self.resets.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CodeProber for ScriptedProber {
    async fn apply(&self, code: &str, _credential: &Credential) -> ProbeResult {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(code.to_owned());
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(code)
            .cloned();
        match script {
            Some(Script::Respond(status, body)) => ProbeResult::response(code, status, body),
            Some(Script::Fail(error)) => ProbeResult::transport_failure(code, error),
            None => ProbeResult::response(code, 200, Some(json!({}))),
        }
    }

    async fn reset(&self, code: &str, _credential: &Credential) -> Result<()> {
        self.resets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(code.to_owned());
        if self.fail_resets {
            return Err(GuardError::Transport(format!("reset of {code} refused")));
        }
        Ok(())
    }
}

/// A one-entry error envelope.
pub fn error_body(kind: &str, message: &str) -> Value {
    json!({"errorMessage": {"errors": [{"type": kind, "message": message}]}})
}

/// A credential long enough to pass the length gate.
pub fn long_credential() -> Credential {
    Credential::new(format!("session={}", "a".repeat(120)))
}

/// Owned code list from string literals.
pub fn codes(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}
