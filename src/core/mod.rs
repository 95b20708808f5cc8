//! Core domain models for hyperpipe
//!
//! This module defines the pipeline definition, the layered configuration,
//! processing modes, work units and the results a run produces.

pub mod config;
pub mod definition;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod stage;
pub mod state;
pub mod template;
pub mod unit;

pub use config::{ConfigResolver, Configuration, Layer};
pub use error::{PipelineError, Result};
pub use mode::{ModeRule, ProcessingMode};
pub use pipeline::*;
pub use stage::*;
pub use state::*;
pub use unit::{UnitOutcome, WorkUnit};
