//! hyperpipe - bounded-concurrency batch pipelines of external commands

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use crate::core::{
    ConfigResolver, Configuration, ExecutionStatus, Pipeline, PipelineError, PipelineResult,
    ProcessingMode, StageResult, UnitOutcome, WorkUnit,
};
pub use execution::{
    ExecutionEvent, JobOrchestrator, PipelineController, ProcessLauncher, StageController,
    UnitLauncher,
};
