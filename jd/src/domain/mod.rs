//! Domain types for JobDaemon
//!
//! Core domain types: Job and its lifecycle, plus ID helpers.

mod id;
mod job;

pub use id::{IdResolver, generate_id};
pub use job::{Job, JobFilter, JobStatus, JobUpdate, TransitionError};
