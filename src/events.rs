//! Outbound events consumed by the notification transport.

use crate::batch::{BatchOutcome, BatchProgress};
use crate::scheduler::{CycleReport, FinalReport};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Sender half of the event stream.
pub type EventSender = mpsc::UnboundedSender<WatchEvent>;
/// Receiver half of the event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<WatchEvent>;

/// An event for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub session_id: SessionId,
    pub kind: WatchEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEventKind {
    /// Running tallies of the pass in progress.
    Progress(BatchProgress),
    /// A watch cycle completed.
    CycleCompleted(CycleReport),
    /// A pass saw authentication errors; the credential should be re-validated.
    AuthSuspect { cycle: u64, auth_error_count: usize },
    /// A watch iteration failed; the next one starts at `retry_at`.
    IterationError {
        cycle: u64,
        message: String,
        retry_at: DateTime<Utc>,
    },
    /// The watch stopped after its final pass.
    Stopped(FinalReport),
    /// A single-pass check finished.
    CheckFinished(BatchOutcome),
}

/// Send `kind` for `session_id`. A closed receiver is not an error.
pub(crate) fn emit(tx: &EventSender, session_id: &SessionId, kind: WatchEventKind) {
    let event = WatchEvent {
        session_id: session_id.clone(),
        kind,
    };
    if tx.send(event).is_err() {
        debug!(session = %session_id, "event receiver dropped");
    }
}
