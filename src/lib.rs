//! voucher-guard: a per-session background monitor for voucher codes.
//!
//! Each session holds a credential and a code list. The service probes every
//! code against the remote cart endpoint, classifies the response as
//! accepted or rejected, undoes the apply, and reports the tallies, either
//! once or on a fixed cadence until the watch is cancelled.
//!
//! # Architecture
//!
//! - **Prober** (`prober`): one apply + reset round-trip per code
//! - **Classifier** (`classifier`): pure `(status, body) -> Verdict`
//! - **Batch runner** (`batch`): ordered pass over a code list with progress
//! - **Scheduler** (`scheduler`): one cancellable watch task per session,
//!   with a final pass on cancellation
//! - **Session store** (`session`): per-user state and the one-task guard
//! - **Service** (`service`): the inbound operations, emitting [`WatchEvent`]s

pub mod batch;
pub mod classifier;
pub mod codes;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod http;
pub mod prober;
pub mod scheduler;
pub mod service;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;

pub use batch::{BatchOutcome, BatchProgress, BatchRunner};
pub use classifier::{Verdict, VerdictBucket, classify};
pub use config::GuardConfig;
pub use credential::{Credential, CredentialCheck};
pub use error::{GuardError, Result};
pub use events::{WatchEvent, WatchEventKind};
pub use prober::{CodeProber, HttpProber, ProbeResult};
pub use scheduler::{Artifacts, CycleReport, FinalReport};
pub use service::{GuardService, InputOutcome};
pub use session::{PendingInput, SessionId};
