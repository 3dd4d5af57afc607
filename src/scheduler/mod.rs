//! Protection scheduler: one cancellable, repeating watch task per session.
//!
//! - `runner`: the watch loop (IDLE, RUNNING, STOPPING, IDLE)
//! - `reports`: cycle/final reports, terminal artifacts and reporting hooks

pub mod reports;
pub mod runner;

pub use reports::{
    ACCEPTED_FILE, Artifacts, CycleReport, DebugVerdictHook, FinalReport, REJECTED_FILE,
    ReportHook,
};
pub use runner::WatchTask;
