//! Configuration for the guard service.
//!
//! Every table carries serde defaults, so a partial TOML file (or none at
//! all) yields a working configuration.

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`WatchConfig::interval_secs`].
pub const ENV_CHECK_INTERVAL: &str = "VOUCHER_GUARD_CHECK_INTERVAL";

/// Upper bound for [`WatchConfig::interval_secs`] and
/// [`WatchConfig::error_backoff_secs`] (one week).
pub const MAX_PAUSE_SECS: u64 = 7 * 24 * 60 * 60;

/// Environment variable overriding [`GuardConfig::debug_verdicts`].
pub const ENV_DEBUG: &str = "VOUCHER_GUARD_DEBUG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Log every per-code verdict after each pass.
    pub debug_verdicts: bool,
    /// Remote endpoint settings.
    pub endpoint: EndpointConfig,
    /// Credential validation settings.
    pub credential: CredentialConfig,
    /// Batch pacing and progress cadence.
    pub batch: BatchConfig,
    /// Continuous watch cadence.
    pub watch: WatchConfig,
}

/// Remote endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Scheme and host of the remote shop, without trailing slash.
    pub base_url: String,
    /// Path of the apply operation.
    pub apply_path: String,
    /// Path of the reset (undo) operation.
    pub reset_path: String,
    /// Value sent as `device.client_type` in every request body.
    pub client_type: String,
    /// Value of the `x-tenant-id` header.
    pub tenant_id: String,
    /// User-Agent header.
    pub user_agent: String,
    /// Timeout for one apply request.
    pub probe_timeout_secs: u64,
    /// Timeout for one reset request.
    pub reset_timeout_secs: u64,
    /// Timeout for the credential validation probe.
    pub validate_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.sheinindia.in".to_owned(),
            apply_path: "/api/cart/apply-voucher".to_owned(),
            reset_path: "/api/cart/reset-voucher".to_owned(),
            client_type: "mobile_web".to_owned(),
            tenant_id: "SHEIN".to_owned(),
            user_agent: "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36".to_owned(),
            probe_timeout_secs: 60,
            reset_timeout_secs: 30,
            validate_timeout_secs: 30,
        }
    }
}

impl EndpointConfig {
    /// Full URL of the apply operation.
    pub fn apply_url(&self) -> String {
        join_url(&self.base_url, &self.apply_path)
    }

    /// Full URL of the reset operation.
    pub fn reset_url(&self) -> String {
        join_url(&self.base_url, &self.reset_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Credential validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Credentials shorter than this are rejected without a network call.
    pub min_length: usize,
    /// Code used for the validation probe; expected not to exist remotely.
    pub sentinel_code: String,
    /// Non-2xx statuses that still prove the credential passed authentication
    /// (business-rule errors).
    pub accepted_error_statuses: Vec<u16>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            min_length: 100,
            sentinel_code: "TESTCODE123".to_owned(),
            accepted_error_statuses: vec![400, 422],
        }
    }
}

/// Batch runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Courtesy delay after every code, in milliseconds.
    pub code_delay_ms: u64,
    /// Emit a progress event every N codes (and always on the last one).
    pub progress_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            code_delay_ms: 2000,
            progress_every: 3,
        }
    }
}

impl BatchConfig {
    /// Inter-code delay as a [`Duration`].
    pub fn code_delay(&self) -> Duration {
        Duration::from_millis(self.code_delay_ms)
    }
}

/// Watch scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Sleep between two cycles.
    pub interval_secs: u64,
    /// Sleep after a failed iteration.
    pub error_backoff_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: 480,
            error_backoff_secs: 30,
        }
    }
}

impl WatchConfig {
    /// Inter-cycle sleep as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Backoff after an iteration error as a [`Duration`].
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl GuardConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| GuardError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| GuardError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voucher-guard/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config)
                .join("voucher-guard")
                .join("config.toml")
        } else if let Some(config) = dirs::config_dir() {
            config.join("voucher-guard").join("config.toml")
        } else {
            PathBuf::from("/tmp/voucher-guard/config.toml")
        }
    }

    /// Apply the supported environment overrides.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(ENV_CHECK_INTERVAL) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.watch.interval_secs = secs,
                Err(e) => tracing::warn!("ignoring {ENV_CHECK_INTERVAL}={raw:?}: {e}"),
            }
        }
        if let Ok(raw) = std::env::var(ENV_DEBUG) {
            self.debug_verdicts = raw.trim().eq_ignore_ascii_case("true");
        }
    }

    /// Validates this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.base_url.trim().is_empty() {
            return Err(GuardError::Config("endpoint.base_url must not be empty".into()));
        }
        url::Url::parse(&self.endpoint.base_url)
            .map_err(|e| GuardError::Config(format!("endpoint.base_url is invalid: {e}")))?;
        if self.endpoint.probe_timeout_secs == 0
            || self.endpoint.reset_timeout_secs == 0
            || self.endpoint.validate_timeout_secs == 0
        {
            return Err(GuardError::Config(
                "endpoint timeouts must be greater than 0".into(),
            ));
        }
        if self.credential.min_length == 0 {
            return Err(GuardError::Config(
                "credential.min_length must be greater than 0".into(),
            ));
        }
        if self.credential.sentinel_code.trim().is_empty() {
            return Err(GuardError::Config(
                "credential.sentinel_code must not be empty".into(),
            ));
        }
        if self.batch.progress_every == 0 {
            return Err(GuardError::Config(
                "batch.progress_every must be greater than 0".into(),
            ));
        }
        for (field, secs) in [
            ("watch.interval_secs", self.watch.interval_secs),
            ("watch.error_backoff_secs", self.watch.error_backoff_secs),
        ] {
            if !(1..=MAX_PAUSE_SECS).contains(&secs) {
                return Err(GuardError::Config(format!(
                    "{field} must be between 1 and {MAX_PAUSE_SECS}, got {secs}"
                )));
            }
        }
        Ok(())
    }
}
