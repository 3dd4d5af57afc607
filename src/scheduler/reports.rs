//! Watch reports, terminal artifacts and the optional reporting hook.

use crate::batch::BatchOutcome;
use crate::error::Result;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Summary of one completed watch cycle. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// 1-based, strictly increasing within a watch.
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub auth_error_count: usize,
    /// When the next cycle is scheduled to start.
    pub next_run_at: DateTime<Utc>,
}

/// Closing report of a watch, emitted after the final pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalReport {
    /// Regular cycles completed before cancellation, excluding the final pass.
    pub cycles_completed: u64,
    /// Accepted codes of the final pass, in input order.
    pub accepted: Vec<String>,
    /// Rejected codes of the final pass, in input order.
    pub rejected: Vec<String>,
    pub auth_error_count: usize,
    pub message: String,
    pub stopped_at: DateTime<Utc>,
    /// Set when the final pass did not complete.
    pub error: Option<String>,
}

impl FinalReport {
    pub(crate) fn from_outcome(cycles_completed: u64, outcome: BatchOutcome) -> Self {
        let message = format!(
            "watch stopped after {cycles_completed} cycle(s); final pass: {} accepted, {} rejected",
            outcome.accepted.len(),
            outcome.rejected.len()
        );
        Self {
            cycles_completed,
            accepted: outcome.accepted,
            rejected: outcome.rejected,
            auth_error_count: outcome.auth_error_count,
            message,
            stopped_at: Utc::now(),
            error: None,
        }
    }

    pub(crate) fn failed(cycles_completed: u64, error: String) -> Self {
        Self {
            cycles_completed,
            accepted: Vec::new(),
            rejected: Vec::new(),
            auth_error_count: 0,
            message: format!("watch stopped after {cycles_completed} cycle(s); final pass failed"),
            stopped_at: Utc::now(),
            error: Some(error),
        }
    }

    /// The terminal artifacts of this report.
    pub fn artifacts(&self) -> Artifacts {
        Artifacts {
            accepted: self.accepted.clone(),
            rejected: self.rejected.clone(),
        }
    }
}

/// Ordered accepted and rejected code lists for handoff to a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

/// File name of the accepted-code artifact.
pub const ACCEPTED_FILE: &str = "accepted.txt";
/// File name of the rejected-code artifact.
pub const REJECTED_FILE: &str = "rejected.txt";

impl Artifacts {
    /// Newline-joined accepted codes.
    pub fn render_accepted(&self) -> String {
        render(&self.accepted)
    }

    /// Newline-joined rejected codes.
    pub fn render_rejected(&self) -> String {
        render(&self.rejected)
    }

    /// Write both lists into `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or a file cannot be written.
    pub fn write_to_dir(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let accepted = dir.join(ACCEPTED_FILE);
        let rejected = dir.join(REJECTED_FILE);
        std::fs::write(&accepted, self.render_accepted())?;
        std::fs::write(&rejected, self.render_rejected())?;
        Ok((accepted, rejected))
    }
}

impl From<&BatchOutcome> for Artifacts {
    fn from(outcome: &BatchOutcome) -> Self {
        Self {
            accepted: outcome.accepted.clone(),
            rejected: outcome.rejected.clone(),
        }
    }
}

fn render(codes: &[String]) -> String {
    if codes.is_empty() {
        return String::new();
    }
    let mut text = codes.join("\n");
    text.push('\n');
    text
}

/// Observer called after every completed pass with the full verdict list.
pub trait ReportHook: Send + Sync {
    fn on_pass(&self, session_id: &SessionId, outcome: &BatchOutcome);
}

/// Logs every per-code verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugVerdictHook;

impl ReportHook for DebugVerdictHook {
    fn on_pass(&self, session_id: &SessionId, outcome: &BatchOutcome) {
        for entry in &outcome.verdicts {
            info!(
                session = %session_id,
                code = %entry.code,
                valid = entry.verdict.is_valid,
                bucket = ?entry.verdict.bucket,
                "verdict: {}",
                entry.verdict.reason
            );
        }
    }
}
