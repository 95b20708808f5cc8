//! Stage domain model

use crate::core::{
    config::Configuration,
    definition::{OutputsConfig, RangeBound, StageConfig},
    mode::{resolve_effective_mode, ModeRule, ProcessingMode},
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// A named pipeline step
#[derive(Debug, Clone)]
pub struct Stage {
    /// Unique stage identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Where work units come from
    pub source: UnitSource,

    /// Output templates per mode
    pub outputs: OutputsConfig,

    /// Processing command argv template
    pub command: Vec<String>,

    /// Extra environment for the command
    pub env: BTreeMap<String, String>,

    /// Mode correction table
    pub mode_rules: Vec<ModeRule>,

    /// Per-unit timeout
    pub timeout: Option<Duration>,

    /// Whether the batch gets a shared scratch directory
    pub scratch: bool,

    required: BTreeSet<String>,
}

/// Source descriptor for the enumerator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    /// File pattern over one directory
    Glob(String),
    /// Closed integer range `start..=end`
    Range {
        start: RangeBound,
        end: RangeBound,
        pad: usize,
    },
}

impl Stage {
    /// Create a stage from its YAML declaration
    pub fn from_config(config: &StageConfig) -> Self {
        let source = match (&config.source.glob, &config.source.range) {
            (Some(glob), _) => UnitSource::Glob(glob.clone()),
            (None, Some(range)) => UnitSource::Range {
                start: range.start.clone(),
                end: range.end.clone(),
                pad: range.pad,
            },
            // validate() rejects a stage without a source
            (None, None) => UnitSource::Range {
                start: RangeBound::Fixed(1),
                end: RangeBound::Fixed(0),
                pad: 0,
            },
        };

        Stage {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            source,
            outputs: config.outputs.clone(),
            command: config.command.clone(),
            env: config.env.clone(),
            mode_rules: config.mode_rules.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            scratch: config.scratch,
            required: config.required_parameters(),
        }
    }

    /// Mode the stage actually runs with under the given pipeline-wide mode
    pub fn effective_mode(&self, pipeline_mode: ProcessingMode) -> ProcessingMode {
        resolve_effective_mode(pipeline_mode, &self.mode_rules)
    }

    /// The rule that changed the mode, if any
    pub fn applied_rule(&self, pipeline_mode: ProcessingMode) -> Option<&ModeRule> {
        self.mode_rules
            .iter()
            .find(|rule| rule.when == pipeline_mode && rule.use_mode != pipeline_mode)
    }

    /// Whether the resolved configuration enables this stage
    pub fn is_enabled(&self, config: &Configuration) -> bool {
        config.stage_enabled(&self.id)
    }

    /// Configuration parameters referenced by the stage's templates
    pub fn required_parameters(&self) -> &BTreeSet<String> {
        &self.required
    }
}
