//! CLI command definitions

use crate::core::config::{
    default_defaults_path, load_defaults_file, parse_override, ConfigResolver, RawLayer,
    STAGE_FLAG_PREFIX,
};
use crate::core::ProcessingMode;
use anyhow::Result;
use clap::Args;
use serde_yaml::Value;
use std::path::PathBuf;

/// Configuration overrides shared by every command that resolves a config
#[derive(Debug, Args, Clone, Default)]
pub struct ConfigArgs {
    /// Defaults file (default: <config dir>/hyperpipe/defaults.yaml if present)
    #[arg(long)]
    pub defaults: Option<PathBuf>,

    /// Parameter override (key=value), repeatable
    #[arg(long = "set", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Concurrency ceiling
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Pipeline-wide mode (full, split, both; aliases session, partitioned, union)
    #[arg(long)]
    pub mode: Option<ProcessingMode>,

    /// Re-run units whose outputs already exist
    #[arg(long)]
    pub force: bool,

    /// Keep running later stages after a stage has failures
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Disable a stage, repeatable
    #[arg(long = "disable", value_name = "STAGE")]
    pub disable: Vec<String>,
}

impl ConfigArgs {
    /// The explicit override layer
    pub fn overrides(&self) -> RawLayer {
        let mut layer: RawLayer = self
            .set
            .iter()
            .map(|(key, value)| parse_override(key, value))
            .collect();
        if let Some(jobs) = self.jobs {
            layer.insert("concurrency".to_string(), Value::from(jobs as u64));
        }
        if let Some(mode) = self.mode {
            layer.insert("mode".to_string(), Value::from(mode.as_str()));
        }
        if self.force {
            layer.insert("force".to_string(), Value::Bool(true));
        }
        if self.continue_on_failure {
            layer.insert("continue_on_failure".to_string(), Value::Bool(true));
        }
        for stage in &self.disable {
            layer.insert(format!("{}{}", STAGE_FLAG_PREFIX, stage), Value::Bool(false));
        }
        layer
    }

    /// Defaults layer: the named file, else the default location if it exists
    pub fn defaults_layer(&self) -> Result<RawLayer> {
        if let Some(path) = &self.defaults {
            return Ok(load_defaults_file(path)?);
        }
        match default_defaults_path() {
            Some(path) if path.exists() => Ok(load_defaults_file(&path)?),
            _ => Ok(RawLayer::new()),
        }
    }

    /// Resolver with all three layers populated
    pub fn resolver(&self) -> Result<ConfigResolver> {
        Ok(ConfigResolver::new()
            .with_defaults(self.defaults_layer()?)
            .with_overrides(self.overrides()))
    }
}

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the resolved configuration
#[derive(Debug, Args, Clone)]
pub struct ConfigCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Report completeness per stage
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].trim().is_empty() {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].trim().to_string(), parts[1].to_string()))
}
