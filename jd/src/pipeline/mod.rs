//! Research pipeline job runner
//!
//! Each job repeatedly asks the model for a [`StepReport`], applies its side
//! effects (output files, knowledge store writes) and checkpoints, until the
//! report passes or a guard stops it.

mod config;
mod engine;
mod report;

pub use config::{DEFAULT_SYSTEM_PROMPT, PipelineJobConfig, PipelineSettings};
pub use engine::PipelineRunner;
pub use report::{FileOutput, ReportError, StepReport};
