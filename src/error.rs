//! Error types for voucher-guard.
//!
//! Per-code failures never show up here: they are folded into a
//! [`Verdict`](crate::classifier::Verdict) by the batch runner. These
//! variants cover what a caller can actually act on.

/// Top-level error type for the guard service.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Malformed or insufficient caller input (short credential, empty code list).
    #[error("input error: {0}")]
    Input(String),

    /// The remote endpoint refused the supplied credential.
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// No validated credential is stored for the session.
    #[error("no validated credential for session {0}")]
    CredentialMissing(String),

    /// Network or transport failure talking to the remote endpoint.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// A watch task is already running for the session.
    #[error("session {0} is already being watched")]
    AlreadyWatching(String),

    /// No watch task is running for the session.
    #[error("session {0} is not being watched")]
    NotWatching(String),

    /// Text was submitted while the session expected no input.
    #[error("session {0} is not waiting for input")]
    NoPendingInput(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GuardError>;
