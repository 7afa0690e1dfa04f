//! Job lifecycle: manager, worker seam, cancellation and per-job logs

mod cancel;
mod error;
mod log;
mod manager;
mod runner;

pub use cancel::{CancelContext, CancelReason};
pub use error::JobError;
pub use log::{JobLog, tail};
pub use manager::{JobManager, RecoveryStats};
pub use runner::{JobContext, JobOutcome, JobRunner};
