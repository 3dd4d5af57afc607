//! Thread-safe per-user session store.
//!
//! Sessions are created lazily on first contact and live for the process
//! lifetime. The store is the only state shared between request handlers and
//! watch tasks; starting a watch is a compare-and-set on the session's task
//! handle, performed under the store lock together with the spawn, so a
//! session never has more than one watch task. A single-pass check claims
//! the session the same way, so checks and watches never overlap.

use crate::credential::Credential;
use crate::error::{GuardError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Opaque user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// The identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for SessionId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of input a session expects next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingInput {
    /// Nothing expected.
    #[default]
    None,
    /// A credential blob.
    Credential,
    /// A code list for a single pass.
    CheckCodes,
    /// A code list for a continuous watch.
    WatchCodes,
}

/// Handle of the running watch task.
struct WatchHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    started_at: DateTime<Utc>,
}

/// Per-user state.
#[derive(Default)]
pub struct Session {
    credential: Option<Credential>,
    credential_validated: bool,
    codes: Vec<String>,
    watch: Option<WatchHandle>,
    checking: bool,
    last_accepted: Vec<String>,
    last_rejected: Vec<String>,
    pending: PendingInput,
}

impl Session {
    /// Replace the credential. Clears the validated flag.
    pub fn replace_credential(&mut self, credential: Credential) {
        self.credential = Some(credential);
        self.credential_validated = false;
    }

    /// Mark the stored credential as validated.
    pub fn mark_validated(&mut self) {
        self.credential_validated = self.credential.is_some();
    }

    /// The stored credential, if it passed validation.
    pub fn validated_credential(&self) -> Option<&Credential> {
        self.credential
            .as_ref()
            .filter(|_| self.credential_validated)
    }

    /// Whether a watch task is active.
    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// Whether a watch or a single-pass check owns the session.
    fn is_busy(&self) -> bool {
        self.checking || self.is_watching()
    }
}

/// Exclusive claim on a session for one single-pass check.
///
/// Released on drop, including when the check unwinds.
pub struct CheckClaim<'a> {
    store: &'a SessionStore,
    id: SessionId,
    credential: Credential,
}

impl CheckClaim<'_> {
    /// The validated credential captured when the claim was taken.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

impl Drop for CheckClaim<'_> {
    fn drop(&mut self) {
        self.store
            .with_session(&self.id, |session| session.checking = false);
        debug!(session = %self.id, "check claim released");
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub watching: bool,
    /// A single-pass check is in flight.
    pub checking: bool,
    /// Set once cancellation was requested and the final pass is pending.
    pub stopping: bool,
    pub watch_started_at: Option<DateTime<Utc>>,
    pub credential_validated: bool,
    pub code_count: usize,
    pub last_accepted: usize,
    pub last_rejected: usize,
    pub pending: PendingInput,
}

/// Process-wide mapping from identity to session.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the session for `id`, creating it on first contact.
    ///
    /// `f` runs under the store lock and must not block.
    pub fn with_session<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session = %id, "session created");
            Session::default()
        });
        f(session)
    }

    /// Store a credential the validator accepted.
    pub fn store_validated_credential(&self, id: &SessionId, credential: Credential) {
        self.with_session(id, |session| {
            session.replace_credential(credential);
            session.mark_validated();
        });
    }

    /// The validated credential for `id`.
    pub fn credential(&self, id: &SessionId) -> Option<Credential> {
        self.with_session(id, |session| session.validated_credential().cloned())
    }

    /// The code list for `id`.
    pub fn codes(&self, id: &SessionId) -> Vec<String> {
        self.with_session(id, |session| session.codes.clone())
    }

    /// Replace the code list for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::AlreadyWatching`] while a watch owns the session.
    pub fn set_codes(&self, id: &SessionId, codes: Vec<String>) -> Result<()> {
        self.with_session(id, |session| {
            if session.is_watching() {
                return Err(GuardError::AlreadyWatching(id.to_string()));
            }
            session.codes = codes;
            Ok(())
        })
    }

    /// Record the result sets of the latest pass.
    pub fn record_results(&self, id: &SessionId, accepted: &[String], rejected: &[String]) {
        self.with_session(id, |session| {
            session.last_accepted = accepted.to_vec();
            session.last_rejected = rejected.to_vec();
        });
    }

    /// The latest accepted and rejected sets.
    pub fn last_results(&self, id: &SessionId) -> (Vec<String>, Vec<String>) {
        self.with_session(id, |session| {
            (session.last_accepted.clone(), session.last_rejected.clone())
        })
    }

    /// Atomically claim `id` for a single-pass check.
    ///
    /// # Errors
    ///
    /// [`GuardError::AlreadyWatching`] while a watch or another check owns
    /// the session, [`GuardError::CredentialMissing`] without a validated
    /// credential.
    pub fn try_begin_check(&self, id: &SessionId) -> Result<CheckClaim<'_>> {
        let credential = self.with_session(id, |session| {
            if session.is_busy() {
                return Err(GuardError::AlreadyWatching(id.to_string()));
            }
            let credential = session
                .validated_credential()
                .cloned()
                .ok_or_else(|| GuardError::CredentialMissing(id.to_string()))?;
            session.checking = true;
            Ok(credential)
        })?;
        Ok(CheckClaim {
            store: self,
            id: id.clone(),
            credential,
        })
    }

    /// Atomically transition `id` from idle to watching.
    ///
    /// Checks that no task is present, a validated credential exists and
    /// the code list is non-empty, then calls `spawn` with the new task's
    /// cancellation token and stores the returned handle, all under one lock.
    ///
    /// # Errors
    ///
    /// [`GuardError::AlreadyWatching`] (also while a check is in flight),
    /// [`GuardError::CredentialMissing`] or [`GuardError::Input`] for an
    /// empty code list. Nothing is spawned then.
    pub fn try_start_watch(
        &self,
        id: &SessionId,
        spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>,
    ) -> Result<()> {
        self.with_session(id, |session| {
            if session.is_busy() {
                return Err(GuardError::AlreadyWatching(id.to_string()));
            }
            if session.validated_credential().is_none() {
                return Err(GuardError::CredentialMissing(id.to_string()));
            }
            if session.codes.is_empty() {
                return Err(GuardError::Input("code list is empty".into()));
            }

            let cancel = CancellationToken::new();
            let task = spawn(cancel.clone());
            session.watch = Some(WatchHandle {
                cancel,
                task: Some(task),
                started_at: Utc::now(),
            });
            info!(session = %id, codes = session.codes.len(), "watch started");
            Ok(())
        })
    }

    /// Signal the watch task of `id` to stop.
    ///
    /// Idempotent while the task drains to its final pass.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::NotWatching`] if no task is present.
    pub fn cancel_watch(&self, id: &SessionId) -> Result<()> {
        self.with_session(id, |session| match &session.watch {
            Some(handle) => {
                if !handle.cancel.is_cancelled() {
                    info!(session = %id, "watch cancellation requested");
                    handle.cancel.cancel();
                }
                Ok(())
            }
            None => Err(GuardError::NotWatching(id.to_string())),
        })
    }

    /// Called by the watch task on exit: clears the code list and task handle.
    pub fn finish_watch(&self, id: &SessionId) {
        self.with_session(id, |session| {
            session.codes.clear();
            session.watch = None;
        });
    }

    /// Cancel every running watch and hand back the task handles.
    pub fn cancel_all(&self) -> Vec<JoinHandle<()>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .values_mut()
            .filter_map(|session| session.watch.as_mut())
            .filter_map(|handle| {
                handle.cancel.cancel();
                handle.task.take()
            })
            .collect()
    }

    /// Whether a watch task is active for `id`.
    pub fn is_watching(&self, id: &SessionId) -> bool {
        self.with_session(id, |session| session.is_watching())
    }

    /// Number of sessions with an active watch task.
    pub fn active_watch_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().filter(|s| s.is_watching()).count()
    }

    /// Number of known sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no session has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set what the session expects next.
    pub fn set_pending(&self, id: &SessionId, pending: PendingInput) {
        self.with_session(id, |session| session.pending = pending);
    }

    /// What the session expects next.
    pub fn pending(&self, id: &SessionId) -> PendingInput {
        self.with_session(id, |session| session.pending)
    }

    /// Snapshot of the session for `id`.
    pub fn status(&self, id: &SessionId) -> SessionStatus {
        self.with_session(id, |session| SessionStatus {
            session_id: id.clone(),
            watching: session.is_watching(),
            checking: session.checking,
            stopping: session
                .watch
                .as_ref()
                .is_some_and(|handle| handle.cancel.is_cancelled()),
            watch_started_at: session.watch.as_ref().map(|handle| handle.started_at),
            credential_validated: session.credential_validated,
            code_count: session.codes.len(),
            last_accepted: session.last_accepted.len(),
            last_rejected: session.last_rejected.len(),
            pending: session.pending,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_utils::{codes, long_credential};
    use std::sync::Arc;

    fn ready_store(id: &SessionId) -> SessionStore {
        let store = SessionStore::new();
        store.store_validated_credential(id, long_credential());
        store.set_codes(id, codes(&["A", "B"])).unwrap();
        store
    }

    fn idle_task(cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { cancel.cancelled().await })
    }

    #[test]
    fn session_id_conversions() {
        assert_eq!(SessionId::from(42_i64).as_str(), "42");
        assert_eq!(SessionId::from("alice").to_string(), "alice");
        assert_eq!(SessionId::from(String::from("x")), SessionId::from("x"));
    }

    #[test]
    fn sessions_are_created_lazily() {
        let store = SessionStore::new();
        assert!(store.is_empty());
        let status = store.status(&SessionId::from(1_i64));
        assert!(!status.watching);
        assert!(!status.credential_validated);
        assert_eq!(status.pending, PendingInput::None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn replacing_credential_clears_validated_flag() {
        let mut session = Session::default();
        session.replace_credential(long_credential());
        session.mark_validated();
        assert!(session.validated_credential().is_some());

        session.replace_credential(long_credential());
        assert!(session.validated_credential().is_none());
    }

    #[tokio::test]
    async fn start_requires_credential_and_codes() {
        let id = SessionId::from("s");
        let store = SessionStore::new();
        let err = store.try_start_watch(&id, idle_task).unwrap_err();
        assert!(matches!(err, GuardError::CredentialMissing(_)));

        store.store_validated_credential(&id, long_credential());
        let err = store.try_start_watch(&id, idle_task).unwrap_err();
        assert!(matches!(err, GuardError::Input(_)));
        assert_eq!(store.active_watch_count(), 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_spawning() {
        let id = SessionId::from("s");
        let store = ready_store(&id);
        store.try_start_watch(&id, idle_task).unwrap();

        let mut spawned = false;
        let err = store
            .try_start_watch(&id, |cancel| {
                spawned = true;
                idle_task(cancel)
            })
            .unwrap_err();
        assert!(matches!(err, GuardError::AlreadyWatching(_)));
        assert!(!spawned);
        assert_eq!(store.active_watch_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_create_at_most_one_task() {
        let id = SessionId::from("race");
        let store = Arc::new(ready_store(&id));
        let spawned = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let spawned = Arc::clone(&spawned);
                let id = id.clone();
                tokio::spawn(async move {
                    store.try_start_watch(&id, |cancel| {
                        spawned.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        idle_task(cancel)
                    })
                })
            })
            .collect();

        let mut ok = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(spawned.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.active_watch_count(), 1);
    }

    #[tokio::test]
    async fn cancel_and_finish_return_to_idle() {
        let id = SessionId::from("s");
        let store = ready_store(&id);
        assert!(matches!(
            store.cancel_watch(&id),
            Err(GuardError::NotWatching(_))
        ));

        store.try_start_watch(&id, idle_task).unwrap();
        store.cancel_watch(&id).unwrap();
        store.cancel_watch(&id).unwrap();
        assert!(store.status(&id).stopping);

        store.finish_watch(&id);
        let status = store.status(&id);
        assert!(!status.watching);
        assert_eq!(status.code_count, 0);
        assert!(store.try_start_watch(&id, idle_task).is_err());
    }

    #[tokio::test]
    async fn check_claim_excludes_watch_and_second_check() {
        let id = SessionId::from("s");
        let store = ready_store(&id);

        let claim = store.try_begin_check(&id).unwrap();
        assert!(store.status(&id).checking);
        assert!(matches!(
            store.try_begin_check(&id),
            Err(GuardError::AlreadyWatching(_))
        ));
        let mut spawned = false;
        let err = store
            .try_start_watch(&id, |cancel| {
                spawned = true;
                idle_task(cancel)
            })
            .unwrap_err();
        assert!(matches!(err, GuardError::AlreadyWatching(_)));
        assert!(!spawned);

        drop(claim);
        assert!(!store.status(&id).checking);
        store.try_start_watch(&id, idle_task).unwrap();
        assert!(matches!(
            store.try_begin_check(&id),
            Err(GuardError::AlreadyWatching(_))
        ));
    }

    #[test]
    fn check_claim_requires_credential() {
        let store = SessionStore::new();
        let id = SessionId::from("s");
        assert!(matches!(
            store.try_begin_check(&id),
            Err(GuardError::CredentialMissing(_))
        ));
        assert!(!store.status(&id).checking);
    }

    #[test]
    fn check_claim_is_released_on_unwind() {
        let id = SessionId::from("s");
        let store = ready_store(&id);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _claim = store.try_begin_check(&id).unwrap();
            panic!("check blew up");
        }));
        assert!(result.is_err());
        assert!(store.try_begin_check(&id).is_ok());
    }

    #[tokio::test]
    async fn codes_are_locked_while_watching() {
        let id = SessionId::from("s");
        let store = ready_store(&id);
        store.try_start_watch(&id, idle_task).unwrap();
        let err = store.set_codes(&id, codes(&["C"])).unwrap_err();
        assert!(matches!(err, GuardError::AlreadyWatching(_)));
        assert_eq!(store.codes(&id), codes(&["A", "B"]));
    }

    #[tokio::test]
    async fn cancel_all_signals_every_task() {
        let store = SessionStore::new();
        for name in ["a", "b"] {
            let id = SessionId::from(name);
            store.store_validated_credential(&id, long_credential());
            store.set_codes(&id, codes(&["A"])).unwrap();
            store.try_start_watch(&id, idle_task).unwrap();
        }
        let handles = store.cancel_all();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn results_and_pending_are_recorded() {
        let id = SessionId::from("s");
        let store = SessionStore::new();
        store.record_results(&id, &codes(&["A"]), &codes(&["B", "C"]));
        store.set_pending(&id, PendingInput::WatchCodes);

        let status = store.status(&id);
        assert_eq!((status.last_accepted, status.last_rejected), (1, 2));
        assert_eq!(store.pending(&id), PendingInput::WatchCodes);
        assert_eq!(store.last_results(&id).1, codes(&["B", "C"]));
    }
}
