//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{ConfigCommand, HistoryCommand, RunCommand, StatusCommand, ValidateCommand};
use std::ffi::OsString;

/// Bounded-concurrency batch pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "hyperpipe")]
#[command(version)]
#[command(about = "Runs multi-stage batch pipelines of external commands", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Validate a pipeline definition
    Validate(ValidateCommand),

    /// Show the resolved configuration and where each value came from
    Config(ConfigCommand),

    /// Report which units are complete without running anything
    Status(StatusCommand),

    /// Show run history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
