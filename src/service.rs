//! Guard service: the inbound operations the transport layer calls.
//!
//! [`GuardService`] owns the session store, the batch runner and the event
//! stream. Request handlers call it directly; watch tasks receive clones of
//! the shared parts.

use crate::batch::{BatchOutcome, BatchProgress, BatchRunner};
use crate::codes::parse_codes;
use crate::config::GuardConfig;
use crate::credential::{CredentialCheck, CredentialValidator, parse_credential_input};
use crate::error::{GuardError, Result};
use crate::events::{EventReceiver, EventSender, WatchEventKind, emit};
use crate::prober::{CodeProber, HttpProber};
use crate::scheduler::{DebugVerdictHook, ReportHook, WatchTask};
use crate::session::{PendingInput, SessionId, SessionStatus, SessionStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What a routed text submission did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOutcome {
    /// The text was accepted as the session credential.
    CredentialStored(CredentialCheck),
    /// The text was checked as a code list in a single pass.
    Checked(BatchOutcome),
    /// The text started a watch over this many codes.
    WatchStarted { code_count: usize },
}

/// Facade over the session store, validator, batch runner and scheduler.
pub struct GuardService {
    config: GuardConfig,
    store: Arc<SessionStore>,
    runner: Arc<BatchRunner>,
    validator: CredentialValidator,
    events: EventSender,
    hook: Option<Arc<dyn ReportHook>>,
}

impl GuardService {
    /// Create a service driving `prober`. Returns the receiving end of the
    /// event stream.
    pub fn new(config: GuardConfig, prober: Arc<dyn CodeProber>) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(BatchRunner::new(prober, &config.batch));
        let hook: Option<Arc<dyn ReportHook>> = if config.debug_verdicts {
            Some(Arc::new(DebugVerdictHook))
        } else {
            None
        };
        let service = Self {
            validator: CredentialValidator::new(config.credential.clone()),
            config,
            store: Arc::new(SessionStore::new()),
            runner,
            events,
            hook,
        };
        (service, rx)
    }

    /// Validate `config` and create a service backed by the HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the HTTP client cannot be built.
    pub fn from_config(config: GuardConfig) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let prober = HttpProber::new(config.endpoint.clone())?;
        Ok(Self::new(config, Arc::new(prober)))
    }

    /// Replace the reporting hook.
    pub fn with_report_hook(mut self, hook: Arc<dyn ReportHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// The shared session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// The active configuration.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Validate and store a credential for `id`.
    ///
    /// Nothing is stored unless validation succeeds.
    ///
    /// # Errors
    ///
    /// [`GuardError::Input`] if the credential is too short (no network call
    /// is made), [`GuardError::CredentialRejected`] if the endpoint refused it.
    pub async fn set_credential(&self, id: &SessionId, raw: &str) -> Result<CredentialCheck> {
        let credential = parse_credential_input(raw);
        let check = self
            .validator
            .validate(self.runner.prober().as_ref(), &credential)
            .await;

        if check.is_too_short() {
            return Err(GuardError::Input(check.message));
        }
        if !check.ok {
            info!(session = %id, "credential rejected: {}", check.message);
            return Err(GuardError::CredentialRejected(check.message));
        }

        self.store.store_validated_credential(id, credential);
        info!(session = %id, "credential stored");
        Ok(check)
    }

    /// Parse and store the code list for `id`.
    ///
    /// # Errors
    ///
    /// [`GuardError::Input`] if no code survives parsing,
    /// [`GuardError::AlreadyWatching`] while a watch owns the session.
    pub fn submit_codes(&self, id: &SessionId, raw: &str) -> Result<Vec<String>> {
        let codes = parse_codes(raw);
        if codes.is_empty() {
            return Err(GuardError::Input("no codes found".into()));
        }
        self.store.set_codes(id, codes.clone())?;
        Ok(codes)
    }

    /// Run one pass over `codes` and record the result in the session.
    ///
    /// Emits progress events and a `CheckFinished` event.
    ///
    /// # Errors
    ///
    /// [`GuardError::Input`] for an empty list, [`GuardError::CredentialMissing`]
    /// without a validated credential, [`GuardError::AlreadyWatching`] while a
    /// watch or another check owns the session.
    pub async fn check_once(&self, id: &SessionId, codes: &[String]) -> Result<BatchOutcome> {
        if codes.is_empty() {
            return Err(GuardError::Input("no codes found".into()));
        }
        let claim = self.store.try_begin_check(id)?;

        info!(session = %id, codes = codes.len(), "single-pass check started");
        let events = self.events.clone();
        let sink = |progress: BatchProgress| -> Result<()> {
            emit(&events, id, WatchEventKind::Progress(progress));
            Ok(())
        };
        let outcome = self
            .runner
            .run_to_completion(codes, claim.credential(), &sink)
            .await;

        self.store
            .record_results(id, &outcome.accepted, &outcome.rejected);
        drop(claim);
        if let Some(hook) = &self.hook {
            hook.on_pass(id, &outcome);
        }
        if outcome.auth_suspect() {
            warn!(
                session = %id,
                count = outcome.auth_error_count,
                "authentication errors in check"
            );
        }
        emit(
            &self.events,
            id,
            WatchEventKind::CheckFinished(outcome.clone()),
        );
        Ok(outcome)
    }

    /// Start watching the session's stored code list.
    ///
    /// # Errors
    ///
    /// [`GuardError::AlreadyWatching`] if a task already runs for `id`,
    /// [`GuardError::CredentialMissing`] or [`GuardError::Input`] when the
    /// session is not ready. No task is created in any error case.
    pub fn start_watch(&self, id: &SessionId) -> Result<()> {
        let store = Arc::clone(&self.store);
        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        let hook = self.hook.clone();
        let config = self.config.watch.clone();
        let task_id = id.clone();

        self.store.try_start_watch(id, move |cancel| {
            let task =
                WatchTask::new(task_id, store, runner, config, events, cancel).with_hook(hook);
            tokio::spawn(task.run())
        })
    }

    /// Ask the watch task of `id` to stop after its final pass.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::NotWatching`] if no task is running.
    pub fn cancel_watch(&self, id: &SessionId) -> Result<()> {
        self.store.cancel_watch(id)
    }

    /// Route the next text submission for `id` to `pending`.
    pub fn expect_input(&self, id: &SessionId, pending: PendingInput) {
        self.store.set_pending(id, pending);
    }

    /// Dispatch `text` according to the session's pending-input marker.
    ///
    /// The marker is cleared only on success, so a failed submission can be
    /// retried.
    ///
    /// # Errors
    ///
    /// [`GuardError::NoPendingInput`] if nothing is expected, otherwise the
    /// error of the routed operation.
    pub async fn submit_text(&self, id: &SessionId, text: &str) -> Result<InputOutcome> {
        let outcome = match self.store.pending(id) {
            PendingInput::None => return Err(GuardError::NoPendingInput(id.to_string())),
            PendingInput::Credential => {
                InputOutcome::CredentialStored(self.set_credential(id, text).await?)
            }
            PendingInput::CheckCodes => {
                let codes = parse_codes(text);
                InputOutcome::Checked(self.check_once(id, &codes).await?)
            }
            PendingInput::WatchCodes => {
                let codes = self.submit_codes(id, text)?;
                self.start_watch(id)?;
                InputOutcome::WatchStarted {
                    code_count: codes.len(),
                }
            }
        };
        self.store.set_pending(id, PendingInput::None);
        Ok(outcome)
    }

    /// Snapshot of the session for `id`.
    pub fn status(&self, id: &SessionId) -> SessionStatus {
        self.store.status(id)
    }

    /// Number of running watch tasks across all sessions.
    pub fn active_watches(&self) -> usize {
        self.store.active_watch_count()
    }

    /// Cancel every watch and wait for their final passes.
    pub async fn shutdown(&self) {
        let handles = self.store.cancel_all();
        if !handles.is_empty() {
            info!(count = handles.len(), "waiting for watches to finish");
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("watch task ended abnormally: {e}");
            }
        }
    }
}
