//! Batch runner: one sequential pass of probe, classify, reset over a code list.
//!
//! Codes are processed strictly in input order. A fixed courtesy delay is
//! awaited after every code; that delay is the only point where a pass
//! observes cancellation, so an in-flight probe always completes.

use crate::classifier::{Verdict, VerdictBucket, classify_probe};
use crate::config::BatchConfig;
use crate::credential::Credential;
use crate::error::Result;
use crate::prober::{CodeProber, ProbeResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maps a raw probe outcome to a verdict.
pub type VerdictFn = Box<dyn Fn(&ProbeResult) -> Verdict + Send + Sync>;

/// Best-effort progress sink. Errors are logged and otherwise ignored.
pub type ProgressSink<'a> = &'a (dyn Fn(BatchProgress) -> Result<()> + Send + Sync);

/// Running tallies reported while a pass is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Codes processed so far.
    pub processed: usize,
    /// Codes in the pass.
    pub total: usize,
    /// Accepted so far.
    pub accepted: usize,
    /// Rejected so far.
    pub rejected: usize,
}

/// Verdict recorded for one code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVerdict {
    pub code: String,
    pub verdict: Verdict,
}

/// Result of a completed pass.
///
/// `accepted` and `rejected` together hold every input code exactly once,
/// each in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Codes judged valid.
    pub accepted: Vec<String>,
    /// Codes judged invalid.
    pub rejected: Vec<String>,
    /// Codes whose verdict fell in the authentication bucket.
    pub auth_error_count: usize,
    /// Codes whose probe never completed.
    pub transport_error_count: usize,
    /// Per-code verdicts in input order.
    pub verdicts: Vec<CodeVerdict>,
}

impl BatchOutcome {
    /// Whether the credential should be re-validated before trusting this pass.
    pub fn auth_suspect(&self) -> bool {
        self.auth_error_count > 0
    }

    /// Whether every probe of a non-empty pass failed at the transport level.
    pub fn all_transport_failed(&self) -> bool {
        !self.verdicts.is_empty() && self.transport_error_count == self.verdicts.len()
    }

    /// Number of codes in the pass.
    pub fn total(&self) -> usize {
        self.verdicts.len()
    }

    fn record(&mut self, code: &str, verdict: Verdict) {
        if verdict.is_valid {
            self.accepted.push(code.to_owned());
        } else {
            self.rejected.push(code.to_owned());
        }
        match verdict.bucket {
            VerdictBucket::Authentication => self.auth_error_count += 1,
            VerdictBucket::Transport => self.transport_error_count += 1,
            _ => {}
        }
        self.verdicts.push(CodeVerdict {
            code: code.to_owned(),
            verdict,
        });
    }

    fn progress(&self, total: usize) -> BatchProgress {
        BatchProgress {
            processed: self.verdicts.len(),
            total,
            accepted: self.accepted.len(),
            rejected: self.rejected.len(),
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRun {
    /// Every code was processed.
    Completed(BatchOutcome),
    /// Cancellation was observed at an inter-code delay; partial results
    /// are dropped.
    Cancelled {
        /// Codes processed before cancellation was observed.
        processed: usize,
    },
}

/// Drives a [`CodeProber`] and the classifier over a code list.
pub struct BatchRunner {
    prober: Arc<dyn CodeProber>,
    delay: Duration,
    progress_every: usize,
    classifier: VerdictFn,
}

impl BatchRunner {
    /// Create a runner with the default classifier.
    pub fn new(prober: Arc<dyn CodeProber>, config: &BatchConfig) -> Self {
        Self {
            prober,
            delay: config.code_delay(),
            progress_every: config.progress_every.max(1),
            classifier: Box::new(classify_probe),
        }
    }

    /// Replace the classifier.
    pub fn with_classifier(mut self, classifier: VerdictFn) -> Self {
        self.classifier = classifier;
        self
    }

    /// The prober this runner drives.
    pub fn prober(&self) -> &Arc<dyn CodeProber> {
        &self.prober
    }

    /// Run a pass that cannot be cancelled.
    pub async fn run_to_completion(
        &self,
        codes: &[String],
        credential: &Credential,
        on_progress: ProgressSink<'_>,
    ) -> BatchOutcome {
        let never = CancellationToken::new();
        match self.run(codes, credential, on_progress, &never).await {
            BatchRun::Completed(outcome) => outcome,
            // The token is local and never cancelled.
            BatchRun::Cancelled { .. } => BatchOutcome::default(),
        }
    }

    /// Run one pass over `codes`.
    ///
    /// Each code is probed, classified and reset exactly once. Reset and
    /// progress failures are logged and never abort the pass.
    pub async fn run(
        &self,
        codes: &[String],
        credential: &Credential,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> BatchRun {
        let total = codes.len();
        let mut outcome = BatchOutcome::default();

        for (index, code) in codes.iter().enumerate() {
            let result = self.prober.apply(code, credential).await;
            let verdict = (self.classifier)(&result);
            debug!(
                code = %code,
                valid = verdict.is_valid,
                reason = %verdict.reason,
                "code classified"
            );

            if let Err(e) = self.prober.reset(code, credential).await {
                warn!(code = %code, "reset failed: {e}");
            }

            outcome.record(code, verdict);

            let processed = index + 1;
            if (processed % self.progress_every == 0 || processed == total)
                && let Err(e) = on_progress(outcome.progress(total))
            {
                warn!("progress report failed: {e}");
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    if processed < total {
                        debug!(processed, total, "pass cancelled");
                        return BatchRun::Cancelled { processed };
                    }
                }
                () = tokio::time::sleep(self.delay) => {}
            }
        }

        BatchRun::Completed(outcome)
    }
}
