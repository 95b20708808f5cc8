//! Processing modes and per-stage mode correction rules

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which session artifacts a stage produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Whole-session data only
    #[serde(alias = "session")]
    Full,
    /// Partitioned (split-half) data only
    #[serde(alias = "partitioned")]
    Split,
    /// Union of full and split artifacts
    #[serde(alias = "union")]
    Both,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Full => "full",
            ProcessingMode::Split => "split",
            ProcessingMode::Both => "both",
        }
    }

    pub fn includes_full(&self) -> bool {
        matches!(self, ProcessingMode::Full | ProcessingMode::Both)
    }

    pub fn includes_split(&self) -> bool {
        matches!(self, ProcessingMode::Split | ProcessingMode::Both)
    }
}

impl Default for ProcessingMode {
    fn default() -> Self {
        ProcessingMode::Both
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "session" => Ok(ProcessingMode::Full),
            "split" | "partitioned" => Ok(ProcessingMode::Split),
            "both" | "union" => Ok(ProcessingMode::Both),
            other => Err(format!(
                "unknown mode '{}' (expected full, split or both)",
                other
            )),
        }
    }
}

/// Forces a stage's effective mode when the pipeline runs in `when`
///
/// A stage whose outputs feed a later full-session consumer declares
/// `when: split, use: both` so it still produces the full-session artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRule {
    pub when: ProcessingMode,
    #[serde(rename = "use")]
    pub use_mode: ProcessingMode,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Resolve the effective mode from the pipeline-wide mode and a rule table.
///
/// The first matching rule wins; with no match the pipeline mode is kept.
pub fn resolve_effective_mode(pipeline_mode: ProcessingMode, rules: &[ModeRule]) -> ProcessingMode {
    rules
        .iter()
        .find(|rule| rule.when == pipeline_mode)
        .map(|rule| rule.use_mode)
        .unwrap_or(pipeline_mode)
}
