//! Watch loop for one session.
//!
//! Each iteration runs a full batch pass, stores the results in the session,
//! emits a [`CycleReport`] and sleeps for the configured interval. The
//! inter-code delay and the inter-cycle sleep are the only points where
//! cancellation is observed. Once it is, the task runs exactly one final
//! uncancellable pass, emits a [`FinalReport`], clears the session's code
//! list and task handle, and exits.

use crate::batch::{BatchOutcome, BatchProgress, BatchRun, BatchRunner};
use crate::config::WatchConfig;
use crate::events::{EventSender, WatchEventKind, emit};
use crate::scheduler::reports::{CycleReport, FinalReport, ReportHook};
use crate::session::{SessionId, SessionStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How one iteration ended.
enum Iteration {
    Completed(BatchOutcome),
    Cancelled,
    Failed(String),
}

/// Background watch task bound to one session.
pub struct WatchTask {
    session_id: SessionId,
    store: Arc<SessionStore>,
    runner: Arc<BatchRunner>,
    config: WatchConfig,
    events: EventSender,
    hook: Option<Arc<dyn ReportHook>>,
    cancel: CancellationToken,
}

impl WatchTask {
    /// Create a task for `session_id`. `cancel` is the token stored in the
    /// session's task handle.
    pub fn new(
        session_id: SessionId,
        store: Arc<SessionStore>,
        runner: Arc<BatchRunner>,
        config: WatchConfig,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            store,
            runner,
            config,
            events,
            hook: None,
            cancel,
        }
    }

    /// Install a reporting hook called after every completed pass.
    pub fn with_hook(mut self, hook: Option<Arc<dyn ReportHook>>) -> Self {
        self.hook = hook;
        self
    }

    /// Run until cancelled, then perform the final pass.
    pub async fn run(self) {
        let id = self.session_id.clone();
        let mut cycles_completed: u64 = 0;

        loop {
            let iteration = self.iteration(self.cancel.clone()).await;
            let pause = match iteration {
                Iteration::Cancelled => break,
                Iteration::Completed(outcome) => {
                    cycles_completed += 1;
                    self.complete_cycle(cycles_completed, &outcome)
                }
                Iteration::Failed(message) => self.report_failure(cycles_completed, message),
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        info!(session = %id, cycles = cycles_completed, "watch stopping, running final pass");
        let report = match self.iteration(CancellationToken::new()).await {
            Iteration::Completed(outcome) => FinalReport::from_outcome(cycles_completed, outcome),
            Iteration::Failed(message) => {
                error!(session = %id, "final pass failed: {message}");
                FinalReport::failed(cycles_completed, message)
            }
            Iteration::Cancelled => {
                FinalReport::failed(cycles_completed, "final pass cancelled".to_owned())
            }
        };

        self.store.finish_watch(&id);
        info!(session = %id, cycles = cycles_completed, "watch stopped");
        emit(&self.events, &id, WatchEventKind::Stopped(report));
    }

    /// One full pass over the session's codes, isolated in its own task so a
    /// panic is caught at the iteration boundary.
    async fn iteration(&self, cancel: CancellationToken) -> Iteration {
        let id = self.session_id.clone();
        let codes = self.store.codes(&id);
        let Some(credential) = self.store.credential(&id) else {
            return Iteration::Failed("no validated credential".to_owned());
        };

        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        let pass_id = id.clone();
        let pass = tokio::spawn(async move {
            let sink = move |progress: BatchProgress| -> crate::error::Result<()> {
                emit(&events, &pass_id, WatchEventKind::Progress(progress));
                Ok(())
            };
            runner.run(&codes, &credential, &sink, &cancel).await
        });

        let outcome = match pass.await {
            Ok(BatchRun::Completed(outcome)) => outcome,
            Ok(BatchRun::Cancelled { processed }) => {
                info!(session = %id, processed, "pass interrupted by cancellation");
                return Iteration::Cancelled;
            }
            Err(e) => return Iteration::Failed(format!("pass aborted: {e}")),
        };

        self.store
            .record_results(&id, &outcome.accepted, &outcome.rejected);
        if let Some(hook) = &self.hook {
            hook.on_pass(&id, &outcome);
        }
        Iteration::Completed(outcome)
    }

    /// Emit the cycle report (and any follow-up signal); returns the pause
    /// before the next cycle.
    fn complete_cycle(&self, cycle: u64, outcome: &BatchOutcome) -> Duration {
        let id = &self.session_id;
        let failed = outcome.all_transport_failed();
        let pause = if failed {
            self.config.error_backoff()
        } else {
            self.config.interval()
        };
        let now = Utc::now();
        let next_run_at = resume_at(now, pause);

        info!(
            session = %id,
            cycle,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            "cycle completed"
        );
        emit(
            &self.events,
            id,
            WatchEventKind::CycleCompleted(CycleReport {
                cycle,
                timestamp: now,
                accepted_count: outcome.accepted.len(),
                rejected_count: outcome.rejected.len(),
                auth_error_count: outcome.auth_error_count,
                next_run_at,
            }),
        );

        if outcome.auth_suspect() {
            warn!(
                session = %id,
                cycle,
                count = outcome.auth_error_count,
                "authentication errors in cycle"
            );
            emit(
                &self.events,
                id,
                WatchEventKind::AuthSuspect {
                    cycle,
                    auth_error_count: outcome.auth_error_count,
                },
            );
        }

        if failed {
            emit(
                &self.events,
                id,
                WatchEventKind::IterationError {
                    cycle,
                    message: format!("all {} probes failed to connect", outcome.total()),
                    retry_at: next_run_at,
                },
            );
        }
        pause
    }

    fn report_failure(&self, cycles_completed: u64, message: String) -> Duration {
        let pause = self.config.error_backoff();
        warn!(session = %self.session_id, "watch iteration failed: {message}");
        emit(
            &self.events,
            &self.session_id,
            WatchEventKind::IterationError {
                cycle: cycles_completed + 1,
                message,
                retry_at: resume_at(Utc::now(), pause),
            },
        );
        pause
    }
}

/// Wall-clock time at which a pause started at `now` ends, saturating at
/// the latest representable instant.
fn resume_at(now: DateTime<Utc>, pause: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(pause)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
