//! Step execution and the persisted session it drives.

pub mod handlers;
pub mod report;
pub mod retry;
pub mod runner;
pub mod state;

pub use report::StatusReport;
pub use retry::RetryPolicy;
pub use runner::{Orchestrator, PlannedStep, RunMode, RunOutcome};
pub use state::{RunState, Session, StateStore};
