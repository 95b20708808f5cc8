//! Pipeline definition loaded from YAML

use crate::core::mode::{ModeRule, ProcessingMode};
use crate::core::template;
use crate::core::Pipeline;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Placeholders bound per unit rather than by the configuration
pub const UNIT_PLACEHOLDERS: &[&str] = &[
    "key", "index", "input", "mode", "stage", "scratch", "output", "outputs",
];

/// Top-level pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Pipeline's own default for the continuation policy
    #[serde(default)]
    pub continue_on_failure: Option<bool>,

    /// Stages, in execution order
    pub stages: Vec<StageConfig>,
}

/// Stage as declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Where the stage's work units come from
    pub source: SourceConfig,

    /// Expected outputs per unit, keyed by mode
    #[serde(default)]
    pub outputs: OutputsConfig,

    /// Processing command argv template
    pub command: Vec<String>,

    /// Extra environment for the command
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Mode correction table
    #[serde(default)]
    pub mode_rules: Vec<ModeRule>,

    /// Per-unit timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Create a shared scratch directory for the batch
    #[serde(default)]
    pub scratch: bool,
}

/// Exactly one of `glob` or `range`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// File pattern; the first `*` of the file name becomes the unit key
    #[serde(default)]
    pub glob: Option<String>,

    /// Closed integer range
    #[serde(default)]
    pub range: Option<RangeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    pub start: RangeBound,
    pub end: RangeBound,

    /// Zero-pad keys to this many digits
    #[serde(default)]
    pub pad: usize,
}

/// A literal integer or a template such as `"{{ parcels }}"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeBound {
    Fixed(i64),
    Template(String),
}

impl RangeBound {
    fn template(&self) -> Option<&str> {
        match self {
            RangeBound::Fixed(_) => None,
            RangeBound::Template(t) => Some(t),
        }
    }
}

/// Output templates selected by effective mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputsConfig {
    #[serde(default)]
    pub full: Vec<String>,

    #[serde(default)]
    pub split: Vec<String>,

    /// Produced in every mode
    #[serde(default)]
    pub always: Vec<String>,
}

impl OutputsConfig {
    /// Output templates for a mode: full, then split, then always
    pub fn for_mode(&self, mode: ProcessingMode) -> Vec<&str> {
        let mut templates = Vec::new();
        if mode.includes_full() {
            templates.extend(self.full.iter().map(String::as_str));
        }
        if mode.includes_split() {
            templates.extend(self.split.iter().map(String::as_str));
        }
        templates.extend(self.always.iter().map(String::as_str));
        templates
    }

    fn all(&self) -> impl Iterator<Item = &String> {
        self.full.iter().chain(&self.split).chain(&self.always)
    }
}

impl StageConfig {
    /// Every template string the stage renders
    pub fn templates(&self) -> Vec<&str> {
        let mut templates: Vec<&str> = Vec::new();
        if let Some(glob) = &self.source.glob {
            templates.push(glob);
        }
        if let Some(range) = &self.source.range {
            templates.extend(range.start.template());
            templates.extend(range.end.template());
        }
        templates.extend(self.outputs.all().map(String::as_str));
        templates.extend(self.command.iter().map(String::as_str));
        templates.extend(self.env.values().map(String::as_str));
        templates
    }

    /// Configuration parameters the stage needs (per-unit placeholders excluded)
    pub fn required_parameters(&self) -> BTreeSet<String> {
        self.templates()
            .into_iter()
            .flat_map(template::placeholders)
            .filter(|name| !UNIT_PLACEHOLDERS.contains(&name.as_str()))
            .collect()
    }
}

impl PipelineDefinition {
    /// Load a pipeline definition from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline definition from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                anyhow::bail!("Stage with empty id");
            }
            if !seen_ids.insert(&stage.id) {
                anyhow::bail!("Duplicate stage ID: {}", stage.id);
            }

            if stage.command.is_empty() || stage.command[0].trim().is_empty() {
                anyhow::bail!("Stage '{}' has an empty command", stage.id);
            }

            match (&stage.source.glob, &stage.source.range) {
                (Some(glob), None) => validate_glob(&stage.id, glob)?,
                (None, Some(_)) => {}
                (Some(_), Some(_)) => anyhow::bail!(
                    "Stage '{}' declares both a glob and a range source",
                    stage.id
                ),
                (None, None) => anyhow::bail!("Stage '{}' has no source", stage.id),
            }
        }

        Ok(())
    }

    /// Convert the definition to a Pipeline domain model
    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline::from_definition(self)
    }
}

fn validate_glob(stage_id: &str, glob: &str) -> Result<()> {
    let path = Path::new(glob);
    let file_part = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !file_part.contains('*') {
        anyhow::bail!(
            "Stage '{}' glob '{}' needs a '*' in its file name to derive unit keys",
            stage_id,
            glob
        );
    }
    if let Some(parent) = path.parent() {
        let parent = parent.to_string_lossy();
        if parent.contains('*') || parent.contains('?') {
            anyhow::bail!(
                "Stage '{}' glob '{}' may only use wildcards in its file name",
                stage_id,
                glob
            );
        }
    }
    Ok(())
}
