//! Error taxonomy for pipeline runs

use thiserror::Error;

/// Errors raised by the orchestration core
///
/// Unit failures are not errors; they are recorded as
/// [`UnitOutcome::Failed`](crate::core::unit::UnitOutcome) and counted.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required parameter is unresolved or malformed. Fatal before any stage runs.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stage's source produced no work units. Logged, never fatal.
    #[error("No work units for stage '{stage}': {reason}")]
    InputNotFound { stage: String, reason: String },

    /// An external termination request arrived while a stage was running.
    #[error("Interrupted while running stage '{stage}'")]
    Interrupted { stage: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
